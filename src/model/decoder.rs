//! Decoder-cell construction and the extended embedding table.
//!
//! A predicted token may name a source position, so the decoder's input
//! embedding table is rebuilt once per forward pass: ordinary vocabulary
//! rows are the learned decoder embeddings zero-padded on the right, and
//! each `(example, position)` slot holds that position's embedded source
//! token concatenated with its encoder contextual output.

use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3};
use rand::Rng;

use crate::config::ModelConfig;
use crate::error::{ModelError, Result};
use crate::rnn::{build_stack, LayerState, RnnStack};
use crate::vocab::TokenId;

/// Build the decoder's recurrent stack.
///
/// The hidden width is `num_units + z_hidden_size`, matching the
/// latent-augmented encoder state; requesting attention is a fatal
/// configuration error.
pub fn build_decoder_cell<R: Rng>(config: &ModelConfig, rng: &mut R) -> Result<RnnStack> {
    if config.attention {
        return Err(ModelError::AttentionUnsupported);
    }
    build_stack(
        config.unit_type,
        config.decoder_state_units(),
        config.decoder_input_units(),
        config.num_layers,
        config.num_residual_layers,
        config.dropout,
        config.forget_bias,
        config.init_weight,
        rng,
    )
}

/// Replicate each example's state rows `beam_width` times, consecutively:
/// tiled row `b * beam_width + j` carries example `b`.
pub fn tile_states(states: &[LayerState], beam_width: usize) -> Vec<LayerState> {
    states
        .iter()
        .map(|layer| {
            let (batch, units) = layer.hidden.dim();
            let mut cell = Array2::zeros((batch * beam_width, units));
            let mut hidden = Array2::zeros((batch * beam_width, units));
            for b in 0..batch {
                for j in 0..beam_width {
                    cell.row_mut(b * beam_width + j).assign(&layer.cell.row(b));
                    hidden
                        .row_mut(b * beam_width + j)
                        .assign(&layer.hidden.row(b));
                }
            }
            LayerState { cell, hidden }
        })
        .collect()
}

/// Build the per-forward-pass extended embedding table,
/// `[V + batch_size * src_max_len, E + H_enc]`.
///
/// Slots for examples or positions absent from this batch stay zero.
pub fn extended_embedding_table(
    decoder_embeddings: ArrayView2<f32>,
    embedded_source: ArrayView3<f32>,
    encoder_outputs: ArrayView3<f32>,
    batch_size: usize,
    src_max_len: usize,
) -> Array2<f32> {
    let (vocab_size, embed_units) = decoder_embeddings.dim();
    let (src_len, batch, enc_units) = encoder_outputs.dim();
    debug_assert_eq!(embedded_source.dim().0, src_len);
    debug_assert_eq!(embedded_source.dim().1, batch);
    debug_assert!(batch <= batch_size);
    debug_assert!(src_len <= src_max_len);

    let width = embed_units + enc_units;
    let mut table = Array2::zeros((vocab_size + batch_size * src_max_len, width));
    table
        .slice_mut(s![..vocab_size, ..embed_units])
        .assign(&decoder_embeddings);
    for b in 0..batch {
        for p in 0..src_len {
            let row = vocab_size + b * src_max_len + p;
            table
                .slice_mut(s![row, ..embed_units])
                .assign(&embedded_source.slice(s![p, b, ..]));
            table
                .slice_mut(s![row, embed_units..])
                .assign(&encoder_outputs.slice(s![p, b, ..]));
        }
    }
    table
}

/// Look up one id per example, `[B] -> [B, width]`.
pub fn embed_step(table: ArrayView2<f32>, ids: &[TokenId]) -> Array2<f32> {
    let mut out = Array2::zeros((ids.len(), table.ncols()));
    for (b, &id) in ids.iter().enumerate() {
        debug_assert!((id as usize) < table.nrows());
        out.row_mut(b).assign(&table.row(id as usize));
    }
    out
}

/// Look up a `[B, L]` id matrix time-major, `-> [L, B, width]`.
pub fn embed_sequence(table: ArrayView2<f32>, ids: ArrayView2<TokenId>) -> Array3<f32> {
    let (batch, steps) = ids.dim();
    let mut out = Array3::zeros((steps, batch, table.ncols()));
    for b in 0..batch {
        for t in 0..steps {
            let id = ids[[b, t]] as usize;
            debug_assert!(id < table.nrows());
            out.slice_mut(s![t, b, ..]).assign(&table.row(id));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_build_decoder_cell_widths() {
        let config = ModelConfig::tiny();
        let mut rng = StdRng::seed_from_u64(1);
        let cell = build_decoder_cell(&config, &mut rng).unwrap();
        assert_eq!(cell.num_units(), config.decoder_state_units());
        assert_eq!(cell.input_units(), config.decoder_input_units());
        assert_eq!(cell.num_layers(), config.num_layers);
    }

    #[test]
    fn test_attention_is_fatal() {
        let mut config = ModelConfig::tiny();
        config.attention = true;
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            build_decoder_cell(&config, &mut rng),
            Err(ModelError::AttentionUnsupported)
        ));
    }

    #[test]
    fn test_tile_states_repeats_rows_consecutively() {
        let mut layer = LayerState::zeros(2, 3);
        layer.hidden.row_mut(0).fill(1.0);
        layer.hidden.row_mut(1).fill(2.0);
        layer.cell.row_mut(1).fill(5.0);

        let tiled = tile_states(&[layer], 3);
        assert_eq!(tiled[0].hidden.dim(), (6, 3));
        for j in 0..3 {
            assert_eq!(tiled[0].hidden[[j, 0]], 1.0);
            assert_eq!(tiled[0].hidden[[3 + j, 0]], 2.0);
            assert_eq!(tiled[0].cell[[3 + j, 2]], 5.0);
        }
    }

    #[test]
    fn test_extended_table_layout() {
        let vocab_size = 4;
        let embed = Array2::from_shape_fn((vocab_size, 2), |(i, j)| (i * 2 + j) as f32);
        let emb_src = Array3::from_elem((2, 1, 2), 9.0);
        let enc_out = Array3::from_elem((2, 1, 3), 7.0);

        let table = extended_embedding_table(embed.view(), emb_src.view(), enc_out.view(), 2, 3);
        assert_eq!(table.dim(), (4 + 2 * 3, 5));

        // Vocabulary rows: embedding then zero padding.
        assert_eq!(table[[1, 0]], 2.0);
        assert_eq!(table[[1, 1]], 3.0);
        assert_eq!(table[[1, 2]], 0.0);
        assert_eq!(table[[1, 4]], 0.0);

        // Copy rows for example 0, positions 0 and 1.
        for p in 0..2 {
            let row = vocab_size + p;
            assert_eq!(table[[row, 0]], 9.0);
            assert_eq!(table[[row, 1]], 9.0);
            assert_eq!(table[[row, 2]], 7.0);
            assert_eq!(table[[row, 4]], 7.0);
        }
        // Position 2 of example 0 and all of example 1 are absent: zero.
        assert!(table.row(vocab_size + 2).iter().all(|&v| v == 0.0));
        assert!(table.slice(s![vocab_size + 3.., ..]).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_embed_step_and_sequence_agree() {
        let table = Array2::from_shape_fn((6, 3), |(i, j)| (i * 3 + j) as f32);
        let step = embed_step(table.view(), &[4, 0]);
        assert_eq!(step.dim(), (2, 3));
        assert_eq!(step[[0, 1]], 13.0);

        let ids = ndarray::arr2(&[[4u32, 1], [0, 5]]);
        let seq = embed_sequence(table.view(), ids.view());
        assert_eq!(seq.dim(), (2, 2, 3));
        assert_eq!(seq.slice(s![0, 0, ..]), step.row(0));
        assert_eq!(seq[[1, 1, 0]], 15.0);
    }
}
