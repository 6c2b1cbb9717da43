//! Variational latent branch.
//!
//! Active only when `z_hidden_size > 0`. During training the target
//! sequence is re-encoded, a Gaussian posterior is derived from the source
//! and target summaries, and a reparameterized sample plus an annealed
//! KL-divergence loss come back. Outside training the sample is drawn from
//! the standard-normal prior. The sample is concatenated into both
//! components of every encoder-state layer, widening the decoder state by
//! `z_hidden_size`.

use ndarray::{Array2, ArrayView3};
use rand::Rng;

use crate::config::{EncoderType, ModelConfig};
use crate::error::Result;
use crate::init;
use crate::rnn::{Dense, LayerState};

use super::encoder::{hconcat, Encoder};

/// KL annealing weight at a given training step.
///
/// `min((tanh(step / kl_steps - 3.5) + 1) / 2, max_kl_weight)` — starts
/// near zero, rises monotonically, saturates at `max_kl_weight`.
pub fn kl_annealing_weight(step: u64, kl_steps: f32, max_kl_weight: f32) -> f32 {
    (((step as f32 / kl_steps - 3.5).tanh() + 1.0) / 2.0).min(max_kl_weight)
}

/// A reparameterized latent draw with its (unweighted) KL divergence.
pub struct PosteriorSample {
    /// Latent codes, `[B, Z]`
    pub z: Array2<f32>,
    /// `-0.5 * mean_b(sum_z(1 + logvar - mean² - exp(logvar)))`
    pub kl_divergence: f32,
}

/// Gaussian latent encoder over the (source, target) summary pair.
pub struct LatentEncoder {
    target_encoder: Encoder,
    hx_proj: Dense,
    hy_proj: Dense,
    mean_proj: Dense,
    logvar_proj: Dense,
    encoder_type: EncoderType,
    z_size: usize,
}

impl LatentEncoder {
    /// Build the latent branch; requires `z_hidden_size > 0`.
    pub fn new<R: Rng>(config: &ModelConfig, rng: &mut R) -> Result<Self> {
        debug_assert!(config.z_hidden_size > 0);
        let target_encoder = Encoder::new(config, config.num_units, rng)?;
        // Summary extraction concatenates both directions' top states first.
        let summary_input = match config.encoder_type {
            EncoderType::Uni => config.num_units,
            EncoderType::Bi => 2 * config.num_units,
        };
        let h = config.num_units;
        Ok(Self {
            target_encoder,
            hx_proj: Dense::new(summary_input, h, config.init_weight, rng),
            hy_proj: Dense::new(summary_input, h, config.init_weight, rng),
            mean_proj: Dense::new(2 * h, config.z_hidden_size, config.init_weight, rng),
            logvar_proj: Dense::new(2 * h, config.z_hidden_size, config.init_weight, rng),
            encoder_type: config.encoder_type,
            z_size: config.z_hidden_size,
        })
    }

    /// Latent width.
    pub fn z_size(&self) -> usize {
        self.z_size
    }

    /// Number of learned scalars.
    pub fn param_count(&self) -> usize {
        self.target_encoder.param_count()
            + self.hx_proj.param_count()
            + self.hy_proj.param_count()
            + self.mean_proj.param_count()
            + self.logvar_proj.param_count()
    }

    /// Semantic summary of an encoder state: the top layer's output
    /// component (both directions concatenated for `Bi`), tanh-projected
    /// to `num_units`.
    fn summarize(&self, states: &[LayerState], proj: &Dense) -> Array2<f32> {
        let top = match self.encoder_type {
            EncoderType::Uni => states[states.len() - 1].hidden.clone(),
            EncoderType::Bi => hconcat(
                &states[states.len() - 2].hidden,
                &states[states.len() - 1].hidden,
            ),
        };
        proj.forward_tanh(top.view())
    }

    /// Training-time posterior: re-encode the embedded target, derive mean
    /// and log-variance, and draw `z = mean + exp(0.5 * logvar) * ε`.
    pub fn posterior<R: Rng>(
        &self,
        source_state: &[LayerState],
        embedded_target: ArrayView3<f32>,
        target_lengths: &[usize],
        rng: &mut R,
    ) -> PosteriorSample {
        let batch = embedded_target.dim().1;
        let (_, target_state) =
            self.target_encoder
                .forward(embedded_target, target_lengths, true, rng);

        let hx = self.summarize(source_state, &self.hx_proj);
        let hy = self.summarize(&target_state, &self.hy_proj);
        let hxhy = hconcat(&hx, &hy);

        let mean = self.mean_proj.forward(hxhy.view());
        let logvar = self.logvar_proj.forward(hxhy.view());

        let epsilon = init::standard_normal_matrix(rng, batch, self.z_size);
        let z = &mean + &(logvar.mapv(|v| (0.5 * v).exp()) * &epsilon);

        let kl_divergence = kl_divergence(&mean, &logvar);
        PosteriorSample { z, kl_divergence }
    }

    /// Prior sample for eval and inference, `[B, Z]` standard normal.
    pub fn prior<R: Rng>(&self, batch: usize, rng: &mut R) -> Array2<f32> {
        init::standard_normal_matrix(rng, batch, self.z_size)
    }
}

/// Standard Gaussian-to-standard-Gaussian KL divergence, summed over the
/// latent axis and averaged over the batch.
pub fn kl_divergence(mean: &Array2<f32>, logvar: &Array2<f32>) -> f32 {
    debug_assert_eq!(mean.dim(), logvar.dim());
    let batch = mean.nrows() as f32;
    let per_example: f32 = mean
        .iter()
        .zip(logvar.iter())
        .map(|(&m, &lv)| 1.0 + lv - m * m - lv.exp())
        .sum();
    -0.5 * per_example / batch
}

/// Concatenate the latent sample into both components of every layer state.
pub fn augment_states(states: &[LayerState], z: &Array2<f32>) -> Vec<LayerState> {
    states
        .iter()
        .map(|layer| LayerState {
            cell: hconcat(&layer.cell, z),
            hidden: hconcat(&layer.hidden, z),
        })
        .collect()
}
