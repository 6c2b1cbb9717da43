//! Source-sequence encoder.

use ndarray::{s, Array2, Array3, ArrayView3};
use rand::Rng;

use crate::config::{EncoderType, ModelConfig};
use crate::error::Result;
use crate::rnn::{build_stack, LayerState, RnnStack};

/// Reverse each example's valid prefix along the time axis.
///
/// Rows past the valid length come out zero, which matches the zeroed
/// outputs the stack produces there.
fn reverse_time(inputs: ArrayView3<f32>, lengths: &[usize]) -> Array3<f32> {
    let (steps, batch, features) = inputs.dim();
    let mut reversed = Array3::zeros((steps, batch, features));
    for b in 0..batch {
        let len = lengths[b].min(steps);
        for t in 0..len {
            reversed
                .slice_mut(s![t, b, ..])
                .assign(&inputs.slice(s![len - 1 - t, b, ..]));
        }
    }
    reversed
}

/// One forward/backward layer pair of a bidirectional encoder.
struct BiLayer {
    forward: RnnStack,
    backward: RnnStack,
    residual: bool,
}

enum EncoderKind {
    Uni(RnnStack),
    Bi(Vec<BiLayer>),
}

/// Recurrent encoder over the embedded source sequence.
///
/// The unidirectional variant is a single multi-layer stack. The
/// bidirectional variant is `num_layers / 2` independent forward/backward
/// layer pairs whose outputs are concatenated along the feature axis per
/// layer; final states are interleaved `[fw, bw]` per pair, so both
/// variants return `num_layers` layer states of width `num_units`.
pub struct Encoder {
    kind: EncoderKind,
    num_units: usize,
}

impl Encoder {
    /// Build an encoder for `input_units`-wide embedded rows.
    pub fn new<R: Rng>(config: &ModelConfig, input_units: usize, rng: &mut R) -> Result<Self> {
        let kind = match config.encoder_type {
            EncoderType::Uni => EncoderKind::Uni(build_stack(
                config.unit_type,
                config.num_units,
                input_units,
                config.num_layers,
                config.num_residual_layers,
                config.dropout,
                config.forget_bias,
                config.init_weight,
                rng,
            )?),
            EncoderType::Bi => {
                let num_pairs = config.num_layers / 2;
                let num_residual_pairs = config.num_residual_layers / 2;
                let residual_from = num_pairs - num_residual_pairs;
                let mut pairs = Vec::with_capacity(num_pairs);
                for li in 0..num_pairs {
                    let layer_input = if li == 0 {
                        input_units
                    } else {
                        2 * config.num_units
                    };
                    let build_one = |rng: &mut R| {
                        build_stack(
                            config.unit_type,
                            config.num_units,
                            layer_input,
                            1,
                            0,
                            config.dropout,
                            config.forget_bias,
                            config.init_weight,
                            rng,
                        )
                    };
                    let forward = build_one(rng)?;
                    let backward = build_one(rng)?;
                    let residual = li >= residual_from && layer_input == 2 * config.num_units;
                    pairs.push(BiLayer {
                        forward,
                        backward,
                        residual,
                    });
                }
                EncoderKind::Bi(pairs)
            }
        };
        Ok(Self {
            kind,
            num_units: config.num_units,
        })
    }

    /// Width of the per-timestep output features.
    pub fn output_units(&self) -> usize {
        match &self.kind {
            EncoderKind::Uni(_) => self.num_units,
            EncoderKind::Bi(_) => 2 * self.num_units,
        }
    }

    /// Number of learned scalars.
    pub fn param_count(&self) -> usize {
        match &self.kind {
            EncoderKind::Uni(stack) => stack.param_count(),
            EncoderKind::Bi(pairs) => pairs
                .iter()
                .map(|p| p.forward.param_count() + p.backward.param_count())
                .sum(),
        }
    }

    /// Encode the embedded source, `[S, B, E]` time-major.
    ///
    /// Returns per-timestep outputs `[S, B, output_units]` and one final
    /// state per layer.
    pub fn forward<R: Rng>(
        &self,
        embedded: ArrayView3<f32>,
        lengths: &[usize],
        training: bool,
        rng: &mut R,
    ) -> (Array3<f32>, Vec<LayerState>) {
        match &self.kind {
            EncoderKind::Uni(stack) => {
                let batch = embedded.dim().1;
                stack.run(embedded, lengths, stack.zero_state(batch), training, rng)
            }
            EncoderKind::Bi(pairs) => {
                let (steps, batch, _) = embedded.dim();
                let mut x = embedded.to_owned();
                let mut states = Vec::with_capacity(pairs.len() * 2);
                for pair in pairs {
                    let (fw_out, fw_state) = pair.forward.run(
                        x.view(),
                        lengths,
                        pair.forward.zero_state(batch),
                        training,
                        rng,
                    );
                    let reversed = reverse_time(x.view(), lengths);
                    let (bw_rev_out, bw_state) = pair.backward.run(
                        reversed.view(),
                        lengths,
                        pair.backward.zero_state(batch),
                        training,
                        rng,
                    );
                    let bw_out = reverse_time(bw_rev_out.view(), lengths);

                    let mut y = Array3::zeros((steps, batch, 2 * self.num_units));
                    y.slice_mut(s![.., .., ..self.num_units]).assign(&fw_out);
                    y.slice_mut(s![.., .., self.num_units..]).assign(&bw_out);
                    if pair.residual {
                        y += &x;
                    }
                    states.extend(fw_state);
                    states.extend(bw_state);
                    x = y;
                }
                (x, states)
            }
        }
    }
}

/// Concatenate two `[B, _]` matrices along the feature axis.
pub(crate) fn hconcat(a: &Array2<f32>, b: &Array2<f32>) -> Array2<f32> {
    debug_assert_eq!(a.nrows(), b.nrows());
    let mut out = Array2::zeros((a.nrows(), a.ncols() + b.ncols()));
    out.slice_mut(s![.., ..a.ncols()]).assign(a);
    out.slice_mut(s![.., a.ncols()..]).assign(b);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn embedded(steps: usize, batch: usize, units: usize) -> Array3<f32> {
        Array3::from_shape_fn((steps, batch, units), |(t, b, e)| {
            ((t + 2 * b + 3 * e) as f32 * 0.1).sin() * 0.5
        })
    }

    #[test]
    fn test_uni_shapes() {
        let config = ModelConfig::tiny();
        let mut rng = StdRng::seed_from_u64(1);
        let encoder = Encoder::new(&config, config.num_units, &mut rng).unwrap();
        assert_eq!(encoder.output_units(), config.num_units);

        let x = embedded(5, 3, config.num_units);
        let (out, states) = encoder.forward(x.view(), &[5, 4, 2], false, &mut rng);
        assert_eq!(out.dim(), (5, 3, config.num_units));
        assert_eq!(states.len(), config.num_layers);
        assert_eq!(states[0].units(), config.num_units);
    }

    #[test]
    fn test_bi_shapes_and_state_interleaving() {
        let config = ModelConfig::tiny().with_encoder_type(EncoderType::Bi);
        let mut rng = StdRng::seed_from_u64(1);
        let encoder = Encoder::new(&config, config.num_units, &mut rng).unwrap();
        assert_eq!(encoder.output_units(), 2 * config.num_units);

        let x = embedded(5, 2, config.num_units);
        let (out, states) = encoder.forward(x.view(), &[5, 3], false, &mut rng);
        assert_eq!(out.dim(), (5, 2, 2 * config.num_units));
        // One fw and one bw state per pair, each num_units wide.
        assert_eq!(states.len(), config.num_layers);
        assert!(states.iter().all(|s| s.units() == config.num_units));
    }

    #[test]
    fn test_bi_backward_sees_reversed_sequence() {
        // With a length-1 example, forward and backward finals must agree.
        let config = ModelConfig::tiny().with_encoder_type(EncoderType::Bi);
        let mut rng = StdRng::seed_from_u64(1);
        let encoder = Encoder::new(&config, config.num_units, &mut rng).unwrap();

        let x = embedded(4, 1, config.num_units);
        let (out, _) = encoder.forward(x.view(), &[1], false, &mut rng);
        // Outputs past the valid length are zero in both directions.
        assert!(out.slice(s![1.., 0, ..]).iter().all(|&v| v == 0.0));
        assert!(out.slice(s![0, 0, ..]).iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_reverse_time_round_trip() {
        let x = embedded(5, 2, 3);
        let lengths = [5, 3];
        let twice = reverse_time(reverse_time(x.view(), &lengths).view(), &lengths);
        for b in 0..2 {
            for t in 0..lengths[b] {
                assert_eq!(twice.slice(s![t, b, ..]), x.slice(s![t, b, ..]));
            }
        }
    }

    #[test]
    fn test_hconcat() {
        let a = Array2::from_elem((2, 3), 1.0);
        let b = Array2::from_elem((2, 2), 2.0);
        let c = hconcat(&a, &b);
        assert_eq!(c.dim(), (2, 5));
        assert_eq!(c[[0, 2]], 1.0);
        assert_eq!(c[[0, 3]], 2.0);
    }
}
