//! Copy-augmented output projection.
//!
//! Merges vocabulary logits with source-copy logits into one normalized,
//! masked distribution over the extended vocabulary `V + batch_size *
//! src_max_len`. Invalid source positions hold exactly zero mass before an
//! epsilon is added for the final log, and each example's copy mass is
//! scattered into its own `[b * src_max_len, b * src_max_len + S)` slice so
//! examples never alias.

use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayViewMut1, Axis};
use rand::Rng;

use crate::error::{ModelError, Result};
use crate::init;

/// Epsilon added to the distribution before the log, keeping it finite
/// where the true mass is degenerate.
pub const LOG_EPSILON: f32 = 1e-8;

/// Index of the largest entry, first occurrence winning ties.
pub fn argmax(row: ArrayView1<f32>) -> usize {
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in row.iter().enumerate() {
        if v > best_val {
            best = i;
            best_val = v;
        }
    }
    best
}

/// Projection from decoder hidden outputs to the extended vocabulary.
#[derive(Debug)]
pub struct OutputProjection {
    vocab_w: Array2<f32>,
    vocab_b: Array1<f32>,
    copy_w: Array2<f32>,
    vocab_size: usize,
    batch_size: usize,
    src_max_len: usize,
}

impl OutputProjection {
    /// New projection for `decoder_units`-wide decoder outputs and
    /// `encoder_units`-wide encoder outputs.
    pub fn new<R: Rng>(
        decoder_units: usize,
        encoder_units: usize,
        vocab_size: usize,
        batch_size: usize,
        src_max_len: usize,
        init_weight: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            vocab_w: init::uniform_matrix(rng, decoder_units, vocab_size, init_weight),
            vocab_b: init::uniform_vector(rng, vocab_size, init_weight),
            copy_w: init::uniform_matrix(rng, encoder_units, decoder_units, init_weight),
            vocab_size,
            batch_size,
            src_max_len,
        }
    }

    /// Projection from explicit weights, for tests that rig the scores.
    #[cfg(test)]
    pub(crate) fn from_parts(
        vocab_w: Array2<f32>,
        vocab_b: Array1<f32>,
        copy_w: Array2<f32>,
        batch_size: usize,
        src_max_len: usize,
    ) -> Self {
        let vocab_size = vocab_w.ncols();
        Self {
            vocab_w,
            vocab_b,
            copy_w,
            vocab_size,
            batch_size,
            src_max_len,
        }
    }

    /// Width of the extended vocabulary.
    pub fn extended_size(&self) -> usize {
        self.vocab_size + self.batch_size * self.src_max_len
    }

    /// Ordinary vocabulary width.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Number of learned scalars.
    pub fn param_count(&self) -> usize {
        self.vocab_w.len() + self.vocab_b.len() + self.copy_w.len()
    }

    /// Precompute the copy compatibilities and the source mask for one
    /// batch, shared by every decode step of the forward pass.
    pub fn prepare(
        &self,
        encoder_outputs: ArrayView3<f32>,
        source_lengths: &[usize],
    ) -> Result<Prepared<'_>> {
        let (src_len, batch, enc_units) = encoder_outputs.dim();
        if batch != source_lengths.len() {
            return Err(ModelError::ShapeMismatch {
                context: "OutputProjection::prepare",
                expected: format!("{batch} source lengths"),
                actual: format!("{}", source_lengths.len()),
            });
        }
        if batch > self.batch_size {
            return Err(ModelError::BatchTooLarge {
                got: batch,
                max: self.batch_size,
            });
        }
        if src_len > self.src_max_len {
            return Err(ModelError::ShapeMismatch {
                context: "OutputProjection::prepare",
                expected: format!("source length <= {}", self.src_max_len),
                actual: format!("{src_len}"),
            });
        }
        if enc_units != self.copy_w.nrows() {
            return Err(ModelError::ShapeMismatch {
                context: "OutputProjection::prepare",
                expected: format!("{} encoder units", self.copy_w.nrows()),
                actual: format!("{enc_units}"),
            });
        }

        // copy_h[s, b, :] = tanh(enc[s, b, :] · copy_w)
        let decoder_units = self.copy_w.ncols();
        let mut copy_h = Array3::zeros((src_len, batch, decoder_units));
        for s in 0..src_len {
            let projected = encoder_outputs
                .index_axis(Axis(0), s)
                .dot(&self.copy_w)
                .mapv(f32::tanh);
            copy_h.slice_mut(s![s, .., ..]).assign(&projected);
        }

        Ok(Prepared {
            proj: self,
            copy_h,
            source_lengths: source_lengths.to_vec(),
            src_len,
            batch,
        })
    }
}

/// Per-batch working state of the projection.
#[derive(Debug)]
pub struct Prepared<'a> {
    proj: &'a OutputProjection,
    copy_h: Array3<f32>,
    source_lengths: Vec<usize>,
    src_len: usize,
    batch: usize,
}

impl Prepared<'_> {
    /// Width of the extended vocabulary.
    pub fn extended_size(&self) -> usize {
        self.proj.extended_size()
    }

    /// One row of the distribution: joint masked softmax over vocabulary
    /// and this example's valid source positions, scattered into the
    /// example's slice of the extended space.
    fn distribution_row(&self, dec: ArrayView1<f32>, example: usize, mut out: ArrayViewMut1<f32>) {
        let v = self.proj.vocab_size;
        let valid = self.source_lengths[example].min(self.src_len);

        let vocab_logits = dec.dot(&self.proj.vocab_w) + &self.proj.vocab_b;
        let mut copy_logits = vec![0.0f32; valid];
        for (s, logit) in copy_logits.iter_mut().enumerate() {
            *logit = dec.dot(&self.copy_h.slice(s![s, example, ..]));
        }

        // Stable softmax over the surviving entries only; masked copy
        // positions contribute nothing to the normalizer.
        let mut max = f32::NEG_INFINITY;
        for &x in vocab_logits.iter() {
            max = max.max(x);
        }
        for &x in &copy_logits {
            max = max.max(x);
        }

        let mut sum = 0.0f32;
        let mut vocab_exp = vec![0.0f32; v];
        for (i, &x) in vocab_logits.iter().enumerate() {
            let e = (x - max).exp();
            vocab_exp[i] = e;
            sum += e;
        }
        let mut copy_exp = vec![0.0f32; valid];
        for (s, &x) in copy_logits.iter().enumerate() {
            let e = (x - max).exp();
            copy_exp[s] = e;
            sum += e;
        }

        for (i, &e) in vocab_exp.iter().enumerate() {
            out[i] = e / sum;
        }
        let base = v + example * self.proj.src_max_len;
        debug_assert!(base + valid <= self.extended_size());
        for (s, &e) in copy_exp.iter().enumerate() {
            out[base + s] = e / sum;
        }
    }

    /// Distributions for a block of decoder rows; row `i` belongs to
    /// example `i / beam_width`. Pre-epsilon: rows sum to one and masked
    /// entries are exactly zero.
    fn probability_rows(&self, dec: ArrayView2<f32>, beam_width: usize) -> Array2<f32> {
        debug_assert!(beam_width >= 1);
        debug_assert_eq!(dec.nrows(), self.batch * beam_width);
        let mut out = Array2::zeros((dec.nrows(), self.extended_size()));
        for i in 0..dec.nrows() {
            self.distribution_row(dec.row(i), i / beam_width, out.row_mut(i));
        }
        out
    }

    /// Pre-epsilon probabilities for one decode step, `[B, H'] -> [B, V_ext]`.
    pub fn probabilities_step(&self, dec: ArrayView2<f32>) -> Array2<f32> {
        self.probability_rows(dec, 1)
    }

    /// Log-probabilities for one decode step.
    pub fn log_probs_step(&self, dec: ArrayView2<f32>) -> Array2<f32> {
        self.probabilities_step(dec)
            .mapv_into(|p| (p + LOG_EPSILON).ln())
    }

    /// Log-probabilities for beam-tiled decoder rows, `[B * k, H']`.
    pub fn log_probs_tiled(&self, dec: ArrayView2<f32>, beam_width: usize) -> Array2<f32> {
        self.probability_rows(dec, beam_width)
            .mapv_into(|p| (p + LOG_EPSILON).ln())
    }

    /// Pre-epsilon probabilities for a whole unrolled sequence,
    /// `[T, B, H'] -> [T, B, V_ext]`.
    pub fn probabilities(&self, dec: ArrayView3<f32>) -> Array3<f32> {
        let (steps, batch, _) = dec.dim();
        debug_assert_eq!(batch, self.batch);
        let mut out = Array3::zeros((steps, batch, self.extended_size()));
        for t in 0..steps {
            for b in 0..batch {
                self.distribution_row(dec.slice(s![t, b, ..]), b, out.slice_mut(s![t, b, ..]));
            }
        }
        out
    }

    /// Log-probabilities for a whole unrolled sequence.
    pub fn log_probs(&self, dec: ArrayView3<f32>) -> Array3<f32> {
        self.probabilities(dec).mapv_into(|p| (p + LOG_EPSILON).ln())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const V: usize = 6;
    const BATCH: usize = 3;
    const S_MAX: usize = 5;
    const DEC: usize = 4;
    const ENC: usize = 4;

    fn projection() -> OutputProjection {
        let mut rng = StdRng::seed_from_u64(11);
        OutputProjection::new(DEC, ENC, V, BATCH, S_MAX, 0.1, &mut rng)
    }

    fn encoder_outputs(src_len: usize, batch: usize) -> Array3<f32> {
        Array3::from_shape_fn((src_len, batch, ENC), |(s, b, e)| {
            ((s + 2 * b + 3 * e) as f32 * 0.37).sin()
        })
    }

    fn decoder_outputs(steps: usize, batch: usize) -> Array3<f32> {
        Array3::from_shape_fn((steps, batch, DEC), |(t, b, h)| {
            ((t + 5 * b + 2 * h) as f32 * 0.23).cos()
        })
    }

    #[test]
    fn test_rows_sum_to_one_before_epsilon() {
        let proj = projection();
        let enc = encoder_outputs(4, BATCH);
        let prepared = proj.prepare(enc.view(), &[4, 2, 3]).unwrap();
        let probs = prepared.probabilities(decoder_outputs(3, BATCH).view());
        for t in 0..3 {
            for b in 0..BATCH {
                let sum: f32 = probs.slice(s![t, b, ..]).sum();
                assert_relative_eq!(sum, 1.0, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_masked_positions_exactly_zero() {
        let proj = projection();
        let enc = encoder_outputs(4, BATCH);
        let lengths = [4usize, 2, 3];
        let prepared = proj.prepare(enc.view(), &lengths).unwrap();
        let probs = prepared.probabilities(decoder_outputs(2, BATCH).view());
        for t in 0..2 {
            for (b, &len) in lengths.iter().enumerate() {
                let base = V + b * S_MAX;
                for s in len..S_MAX {
                    assert_eq!(probs[[t, b, base + s]], 0.0, "t={t} b={b} s={s}");
                }
            }
        }
    }

    #[test]
    fn test_examples_never_alias() {
        let proj = projection();
        let enc = encoder_outputs(4, BATCH);
        let prepared = proj.prepare(enc.view(), &[4, 4, 4]).unwrap();
        let probs = prepared.probabilities(decoder_outputs(1, BATCH).view());
        // Example b's copy mass lives only in its own slice.
        for b in 0..BATCH {
            for other in 0..BATCH {
                if other == b {
                    continue;
                }
                let base = V + other * S_MAX;
                let alien: f32 = probs.slice(s![0, b, base..base + S_MAX]).sum();
                assert_eq!(alien, 0.0);
            }
            let own: f32 = probs
                .slice(s![0, b, V + b * S_MAX..V + (b + 1) * S_MAX])
                .sum();
            assert!(own > 0.0);
        }
    }

    #[test]
    fn test_log_probs_finite_everywhere() {
        let proj = projection();
        let enc = encoder_outputs(3, 2);
        let prepared = proj.prepare(enc.view(), &[3, 1]).unwrap();
        let logp = prepared.log_probs(decoder_outputs(2, 2).view());
        assert!(logp.iter().all(|v| v.is_finite()));
        // Masked entries carry exactly ln(epsilon); example 0's slice
        // starts right after the vocabulary.
        assert_relative_eq!(logp[[0, 0, V + 4]], LOG_EPSILON.ln());
    }

    #[test]
    fn test_partial_batch_rows_well_formed() {
        let proj = projection();
        // Two examples against a projection configured for three.
        let enc = encoder_outputs(4, 2);
        let prepared = proj.prepare(enc.view(), &[4, 3]).unwrap();
        let probs = prepared.probabilities_step(decoder_outputs(1, 2).index_axis(Axis(0), 0));
        assert_eq!(probs.dim(), (2, V + BATCH * S_MAX));
        for b in 0..2 {
            assert_relative_eq!(probs.row(b).sum(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_oversized_batch_rejected() {
        let proj = projection();
        let enc = encoder_outputs(3, BATCH + 1);
        let err = proj.prepare(enc.view(), &[3, 3, 3, 3]).unwrap_err();
        assert!(matches!(err, ModelError::BatchTooLarge { got: 4, max: 3 }));
    }

    #[test]
    fn test_overlong_source_rejected() {
        let proj = projection();
        let enc = encoder_outputs(S_MAX + 1, BATCH);
        let err = proj.prepare(enc.view(), &[6, 6, 6]).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let proj = projection();
        let enc = encoder_outputs(3, BATCH);
        assert!(proj.prepare(enc.view(), &[3, 3]).is_err());
    }

    #[test]
    fn test_copy_path_wins_golden_position() {
        // Source "the cat sat"; the decoder state is rigged to align with
        // source position 1, so the copy of that position must win and its
        // extended id must be V + b * S_MAX + 1.
        let vocab_w = Array2::zeros((DEC, V));
        let vocab_b = Array1::zeros(V);
        // Identity-ish copy projection: copy_h = tanh(enc).
        let copy_w = Array2::from_shape_fn((ENC, DEC), |(i, j)| f32::from(u8::from(i == j)));
        let proj = OutputProjection::from_parts(vocab_w, vocab_b, copy_w, BATCH, S_MAX);

        let mut enc = Array3::zeros((3, 1, ENC));
        // Position 1 ("cat") points along +e0, the others away from it.
        enc[[1, 0, 0]] = 5.0;
        enc[[0, 0, 0]] = -5.0;
        enc[[2, 0, 0]] = -5.0;
        let prepared = proj.prepare(enc.view(), &[3]).unwrap();

        let mut dec = Array2::zeros((1, DEC));
        dec[[0, 0]] = 5.0;
        let probs = prepared.probabilities_step(dec.view());

        let b = 0;
        let winner = argmax(probs.row(0));
        assert_eq!(winner, V + b * S_MAX + 1);
    }

    #[test]
    fn test_tiled_rows_share_example_mask() {
        let proj = projection();
        let enc = encoder_outputs(4, 2);
        let lengths = [4usize, 2];
        let prepared = proj.prepare(enc.view(), &lengths).unwrap();

        let k = 3;
        let dec = Array2::from_shape_fn((2 * k, DEC), |(i, j)| ((i + j) as f32 * 0.3).sin());
        let logp = prepared.log_probs_tiled(dec.view(), k);
        assert_eq!(logp.nrows(), 2 * k);
        // Every row of example 1 masks positions 2.. of its slice.
        for row in k..2 * k {
            for s in 2..S_MAX {
                assert_relative_eq!(logp[[row, V + S_MAX + s]], LOG_EPSILON.ln());
            }
        }
    }

    #[test]
    fn test_argmax_first_max_wins() {
        let row = ndarray::arr1(&[0.1, 0.5, 0.5, 0.2]);
        assert_eq!(argmax(row.view()), 1);
    }

    #[test]
    fn test_extended_size() {
        let proj = projection();
        assert_eq!(proj.extended_size(), V + BATCH * S_MAX);
    }
}
