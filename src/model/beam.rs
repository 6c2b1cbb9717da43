//! Beam-search decoding.
//!
//! Maintains `beam_width` hypotheses per example over the extended
//! vocabulary. A hypothesis that emits the end token is frozen: it takes no
//! further expansions and keeps its pre-expansion recurrent state, but
//! keeps competing on its length-normalized score for the final ranking.

use ndarray::{Array3, ArrayView2};
use rand::Rng;

use crate::rnn::{LayerState, RnnStack};
use crate::vocab::TokenId;

use super::decoder::embed_step;
use super::output::Prepared;

/// Scalar knobs of one beam-search run.
pub struct BeamParams {
    pub beam_width: usize,
    pub length_penalty_weight: f32,
    pub max_iterations: usize,
    pub sos: TokenId,
    pub eos: TokenId,
}

/// `((5 + length) / 6) ^ weight`, the standard length normalizer.
pub fn length_penalty(length: usize, weight: f32) -> f32 {
    if weight == 0.0 {
        1.0
    } else {
        ((5.0 + length as f32) / 6.0).powf(weight)
    }
}

#[derive(Clone)]
struct Hypothesis {
    tokens: Vec<TokenId>,
    log_prob: f32,
    finished: bool,
}

impl Hypothesis {
    fn score(&self, extra_len: usize, log_prob: f32, weight: f32) -> f32 {
        log_prob / length_penalty(self.tokens.len() + extra_len, weight)
    }
}

struct Candidate {
    score: f32,
    log_prob: f32,
    parent: usize,
    /// `None` carries a frozen hypothesis forward unchanged.
    token: Option<TokenId>,
}

/// Run beam search over a prepared batch.
///
/// `initial_states` must already be tiled `beam_width`-fold; `embeddings`
/// is the extended table feeding predicted ids back in. Returns extended
/// ids `[beam_width, B, T]`, best beam first, short beams padded with eos.
pub fn beam_search<R: Rng>(
    decoder: &RnnStack,
    initial_states: Vec<LayerState>,
    prepared: &Prepared<'_>,
    embeddings: ArrayView2<f32>,
    batch: usize,
    params: &BeamParams,
    rng: &mut R,
) -> Array3<TokenId> {
    let k = params.beam_width;
    debug_assert!(k > 0);
    debug_assert_eq!(initial_states[0].batch(), batch * k);

    // Slot 0 seeds the search; the rest start unreachable so the first
    // expansion draws k distinct tokens from one distribution.
    let mut beams: Vec<Vec<Hypothesis>> = (0..batch)
        .map(|_| {
            (0..k)
                .map(|j| Hypothesis {
                    tokens: Vec::new(),
                    log_prob: if j == 0 { 0.0 } else { f32::NEG_INFINITY },
                    finished: false,
                })
                .collect()
        })
        .collect();
    let mut states = initial_states;

    for _ in 0..params.max_iterations {
        if beams.iter().flatten().all(|h| h.finished) {
            break;
        }

        // Feed each live hypothesis its previous token.
        let last_ids: Vec<TokenId> = beams
            .iter()
            .flat_map(|hyps| {
                hyps.iter()
                    .map(|h| *h.tokens.last().unwrap_or(&params.sos))
            })
            .collect();
        let inputs = embed_step(embeddings, &last_ids);

        let previous = states.clone();
        let out = decoder.step(inputs.view(), &mut states, false, rng);
        let log_probs = prepared.log_probs_tiled(out.view(), k);

        let mut next_states: Vec<LayerState> = states
            .iter()
            .map(|layer| LayerState::zeros(batch * k, layer.units()))
            .collect();

        for (b, hyps) in beams.iter_mut().enumerate() {
            let mut candidates: Vec<Candidate> = Vec::new();
            for (j, hyp) in hyps.iter().enumerate() {
                if hyp.finished {
                    candidates.push(Candidate {
                        score: hyp.score(0, hyp.log_prob, params.length_penalty_weight),
                        log_prob: hyp.log_prob,
                        parent: j,
                        token: None,
                    });
                    continue;
                }
                let row = log_probs.row(b * k + j);
                for (v, &lp) in row.iter().enumerate() {
                    let log_prob = hyp.log_prob + lp;
                    candidates.push(Candidate {
                        score: hyp.score(1, log_prob, params.length_penalty_weight),
                        log_prob,
                        parent: j,
                        token: Some(v as TokenId),
                    });
                }
            }
            candidates.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.parent.cmp(&b.parent))
                    .then_with(|| a.token.cmp(&b.token))
            });

            let mut selected = Vec::with_capacity(k);
            for cand in candidates.into_iter().take(k) {
                let parent = &hyps[cand.parent];
                let source_row = b * k + cand.parent;
                let target_row = b * k + selected.len();
                match cand.token {
                    Some(token) => {
                        let mut tokens = parent.tokens.clone();
                        tokens.push(token);
                        selected.push(Hypothesis {
                            tokens,
                            log_prob: cand.log_prob,
                            finished: token == params.eos,
                        });
                        copy_state_row(&mut next_states, &states, target_row, source_row);
                    }
                    None => {
                        selected.push(parent.clone());
                        // Frozen hypotheses are excluded from the update.
                        copy_state_row(&mut next_states, &previous, target_row, source_row);
                    }
                }
            }
            *hyps = selected;
        }
        states = next_states;
    }

    assemble(&beams, batch, k, params.eos)
}

fn copy_state_row(dst: &mut [LayerState], src: &[LayerState], dst_row: usize, src_row: usize) {
    for (d, s) in dst.iter_mut().zip(src) {
        d.cell.row_mut(dst_row).assign(&s.cell.row(src_row));
        d.hidden.row_mut(dst_row).assign(&s.hidden.row(src_row));
    }
}

/// Pack ragged hypotheses into `[k, B, T]`, eos-padded.
fn assemble(beams: &[Vec<Hypothesis>], batch: usize, k: usize, eos: TokenId) -> Array3<TokenId> {
    let max_len = beams
        .iter()
        .flatten()
        .map(|h| h.tokens.len())
        .max()
        .unwrap_or(0);
    let mut out = Array3::from_elem((k, batch, max_len), eos);
    for (b, hyps) in beams.iter().enumerate() {
        for (j, hyp) in hyps.iter().enumerate() {
            for (t, &id) in hyp.tokens.iter().enumerate() {
                out[[j, b, t]] = id;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnitType;
    use crate::model::decoder::{extended_embedding_table, tile_states};
    use crate::model::output::OutputProjection;
    use crate::rnn::build_stack;
    use ndarray::{Array1, Array3 as NdArray3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const V: usize = 5;
    const EOS: TokenId = 2;
    const SOS: TokenId = 1;
    const BATCH: usize = 2;
    const S_MAX: usize = 3;

    /// Projection whose eos logit is pushed far down so it is never chosen.
    fn rigged_projection(dec_units: usize, enc_units: usize) -> OutputProjection {
        let mut rng = StdRng::seed_from_u64(3);
        let vocab_w = crate::init::uniform_matrix(&mut rng, dec_units, V, 0.1);
        let mut vocab_b = Array1::zeros(V);
        vocab_b[EOS as usize] = -1000.0;
        let copy_w = crate::init::uniform_matrix(&mut rng, enc_units, dec_units, 0.1);
        OutputProjection::from_parts(vocab_w, vocab_b, copy_w, BATCH, S_MAX)
    }

    #[test]
    fn test_length_penalty() {
        assert_eq!(length_penalty(7, 0.0), 1.0);
        // length 1: ((5 + 1) / 6)^w = 1 for any w.
        assert!((length_penalty(1, 0.8) - 1.0).abs() < 1e-6);
        assert!(length_penalty(10, 0.8) > 1.0);
    }

    #[test]
    fn test_terminates_after_exactly_max_iterations() {
        let mut rng = StdRng::seed_from_u64(9);
        let dec_units = 6;
        let enc_units = 4;
        let embed_units = 3;
        let decoder = build_stack(
            UnitType::Gru,
            dec_units,
            embed_units + enc_units,
            1,
            0,
            0.0,
            1.0,
            0.1,
            &mut rng,
        )
        .unwrap();

        let proj = rigged_projection(dec_units, enc_units);
        let enc = NdArray3::from_shape_fn((S_MAX, BATCH, enc_units), |(s, b, e)| {
            ((s + b + e) as f32 * 0.4).sin()
        });
        let prepared = proj.prepare(enc.view(), &[3, 2]).unwrap();

        let embed = crate::init::uniform_matrix(&mut rng, V, embed_units, 0.1);
        let emb_src = NdArray3::from_elem((S_MAX, BATCH, embed_units), 0.2);
        let table =
            extended_embedding_table(embed.view(), emb_src.view(), enc.view(), BATCH, S_MAX);

        let k = 2;
        let initial = tile_states(&decoder.zero_state(BATCH), k);
        let params = BeamParams {
            beam_width: k,
            length_penalty_weight: 0.6,
            max_iterations: 5,
            sos: SOS,
            eos: EOS,
        };
        let ids = beam_search(
            &decoder,
            initial,
            &prepared,
            table.view(),
            BATCH,
            &params,
            &mut rng,
        );

        // eos is unreachable, so every beam runs the full 5 expansions.
        assert_eq!(ids.dim(), (k, BATCH, 5));
        for id in ids.iter() {
            assert_ne!(*id, EOS);
            assert!((*id as usize) < V + BATCH * S_MAX);
        }
    }

    #[test]
    fn test_beams_are_distinct_and_ranked() {
        let mut rng = StdRng::seed_from_u64(4);
        let dec_units = 6;
        let enc_units = 4;
        let embed_units = 3;
        let decoder = build_stack(
            UnitType::Lstm,
            dec_units,
            embed_units + enc_units,
            1,
            0,
            0.0,
            1.0,
            0.1,
            &mut rng,
        )
        .unwrap();
        let proj = rigged_projection(dec_units, enc_units);
        let enc = NdArray3::from_shape_fn((S_MAX, BATCH, enc_units), |(s, b, e)| {
            ((2 * s + b + e) as f32 * 0.3).cos()
        });
        let prepared = proj.prepare(enc.view(), &[3, 3]).unwrap();
        let embed = crate::init::uniform_matrix(&mut rng, V, embed_units, 0.1);
        let emb_src = NdArray3::from_elem((S_MAX, BATCH, embed_units), 0.1);
        let table =
            extended_embedding_table(embed.view(), emb_src.view(), enc.view(), BATCH, S_MAX);

        let k = 3;
        let initial = tile_states(&decoder.zero_state(BATCH), k);
        let params = BeamParams {
            beam_width: k,
            length_penalty_weight: 0.0,
            max_iterations: 3,
            sos: SOS,
            eos: EOS,
        };
        let ids = beam_search(
            &decoder,
            initial,
            &prepared,
            table.view(),
            BATCH,
            &params,
            &mut rng,
        );
        assert_eq!(ids.dim(), (k, BATCH, 3));

        // The k beams of an example differ somewhere.
        for b in 0..BATCH {
            let first: Vec<TokenId> = (0..3).map(|t| ids[[0, b, t]]).collect();
            let second: Vec<TokenId> = (0..3).map(|t| ids[[1, b, t]]).collect();
            assert_ne!(first, second);
        }
    }
}
