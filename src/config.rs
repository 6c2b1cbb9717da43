//! Model configuration.
//!
//! All scalar and flag options the model consumes are gathered in
//! [`ModelConfig`]. The configuration is validated once, at model
//! construction; invalid combinations are fatal errors, never silent
//! fallbacks.

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Encoder topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderType {
    /// Stack of unidirectional layers
    Uni,
    /// Forward/backward layer pairs with per-layer feature concatenation
    Bi,
}

/// Recurrent unit type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitType {
    Lstm,
    Gru,
}

/// Execution mode, fixed once at model construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Teacher-forced unrolling with loss and KL annealing
    Train,
    /// Teacher-forced unrolling with loss, latent drawn from the prior
    Eval,
    /// Greedy or beam-search decoding
    Infer,
}

/// Configuration for the copy-augmented seq2seq model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Encoder topology
    pub encoder_type: EncoderType,
    /// Recurrent cell type for encoder and decoder
    pub unit_type: UnitType,
    /// Hidden width of every recurrent layer (also the embedding width)
    pub num_units: usize,
    /// Number of recurrent layers (must be even for `Bi`)
    pub num_layers: usize,
    /// Number of top layers with residual connections
    pub num_residual_layers: usize,
    /// Input dropout probability, applied in train mode only
    pub dropout: f32,
    /// Bias added to the LSTM forget gate
    pub forget_bias: f32,
    /// Latent code width; 0 disables the variational branch entirely
    pub z_hidden_size: usize,
    /// Beam width at inference; 0 selects greedy decoding
    pub beam_width: usize,
    /// Exponent of the `((5 + len) / 6)` length-penalty term
    pub length_penalty_weight: f32,
    /// Explicit cap on decoding steps; derived from the source length if unset
    pub tgt_max_len_infer: Option<usize>,
    /// Time constant of the KL annealing schedule
    pub kl_steps: f32,
    /// Upper bound of the KL annealing weight
    pub max_kl_weight: f32,
    /// Must be false; this model does not support attention
    pub attention: bool,
    /// Static batch size used for the extended-vocabulary id space
    pub batch_size: usize,
    /// Static maximum source length used for the extended-vocabulary id space
    pub src_max_len: usize,
    /// Half-width of the uniform weight initializer
    pub init_weight: f32,
    /// Seed for weight init, dropout, and latent sampling
    pub random_seed: u64,
}

impl ModelConfig {
    /// Small configuration for tests
    pub fn tiny() -> Self {
        Self {
            encoder_type: EncoderType::Uni,
            unit_type: UnitType::Lstm,
            num_units: 16,
            num_layers: 2,
            num_residual_layers: 0,
            dropout: 0.0,
            forget_bias: 1.0,
            z_hidden_size: 8,
            beam_width: 0,
            length_penalty_weight: 0.0,
            tgt_max_len_infer: None,
            kl_steps: 1000.0,
            max_kl_weight: 0.5,
            attention: false,
            batch_size: 4,
            src_max_len: 10,
            init_weight: 0.1,
            random_seed: 42,
        }
    }

    /// Set the beam width
    pub fn with_beam_width(mut self, beam_width: usize) -> Self {
        self.beam_width = beam_width;
        self
    }

    /// Set the latent code width (0 disables the variational branch)
    pub fn with_latent_size(mut self, z_hidden_size: usize) -> Self {
        self.z_hidden_size = z_hidden_size;
        self
    }

    /// Set the encoder topology
    pub fn with_encoder_type(mut self, encoder_type: EncoderType) -> Self {
        self.encoder_type = encoder_type;
        self
    }

    /// Set the recurrent unit type
    pub fn with_unit_type(mut self, unit_type: UnitType) -> Self {
        self.unit_type = unit_type;
        self
    }

    /// Set the random seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    /// Width of the encoder output features
    pub fn encoder_output_units(&self) -> usize {
        match self.encoder_type {
            EncoderType::Uni => self.num_units,
            EncoderType::Bi => 2 * self.num_units,
        }
    }

    /// Hidden width of the decoder cell, widened by the latent code
    pub fn decoder_state_units(&self) -> usize {
        self.num_units + self.z_hidden_size
    }

    /// Width of the decoder input rows in the extended embedding table
    pub fn decoder_input_units(&self) -> usize {
        self.num_units + self.encoder_output_units()
    }

    /// Number of virtual copy-position slots in the extended vocabulary
    pub fn copy_slots(&self) -> usize {
        self.batch_size * self.src_max_len
    }

    /// Check the configuration, returning the first fatal error found
    pub fn validate(&self) -> Result<()> {
        if self.attention {
            return Err(ModelError::AttentionUnsupported);
        }
        if self.encoder_type == EncoderType::Bi && self.num_layers % 2 != 0 {
            return Err(ModelError::OddBidirectionalLayers(self.num_layers));
        }
        if self.num_units == 0 {
            return Err(ModelError::InvalidConfig("num_units must be > 0".into()));
        }
        if self.num_layers == 0 {
            return Err(ModelError::InvalidConfig("num_layers must be > 0".into()));
        }
        if self.num_residual_layers >= self.num_layers {
            return Err(ModelError::InvalidConfig(format!(
                "num_residual_layers {} must be below num_layers {}",
                self.num_residual_layers, self.num_layers
            )));
        }
        if self.batch_size == 0 {
            return Err(ModelError::InvalidConfig("batch_size must be > 0".into()));
        }
        if self.src_max_len == 0 {
            return Err(ModelError::InvalidConfig("src_max_len must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ModelError::InvalidConfig(format!(
                "dropout {} must be in [0, 1)",
                self.dropout
            )));
        }
        if self.kl_steps <= 0.0 {
            return Err(ModelError::InvalidConfig("kl_steps must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.max_kl_weight) {
            return Err(ModelError::InvalidConfig(format!(
                "max_kl_weight {} must be in [0, 1]",
                self.max_kl_weight
            )));
        }
        Ok(())
    }
}
