//! # apuntar
//!
//! A copy-augmented, optionally-variational sequence-to-sequence model.
//!
//! The decoder scores an *extended vocabulary*: the ordinary target
//! vocabulary plus one virtual slot per `(example, source position)` pair,
//! letting it emit "copy source position p" as if it were a token. An
//! optional Gaussian latent code, learned from the target during training
//! and drawn from the prior at inference, conditions the decoder's initial
//! state; its KL term follows a tanh annealing schedule.
//!
//! ## Structure
//!
//! - [`config`] — model configuration and mode selection
//! - [`vocab`] / [`data`] — vocabulary lookup and batched, padded inputs
//! - [`rnn`] — LSTM/GRU cells and multi-layer stacks
//! - [`model`] — encoder, latent branch, copy-augmented output projection,
//!   greedy and beam-search decoding, loss
//!
//! ## Example
//!
//! ```
//! use apuntar::{BatchedInput, Mode, Model, ModelConfig, Vocabulary};
//!
//! let vocab = Vocabulary::new(
//!     ["<unk>", "<s>", "</s>", "the", "cat", "sat"],
//!     "<unk>",
//!     "<s>",
//!     "</s>",
//! )
//! .unwrap();
//!
//! let sources = vec![vocab.encode(&["the", "cat", "sat"])];
//! let targets = vec![vocab.encode(&["the", "cat"])];
//! let flags = vec![vec![false, false]];
//! let batch = BatchedInput::new(
//!     &sources,
//!     &targets,
//!     &flags,
//!     vocab.sos_id(),
//!     vocab.eos_id(),
//! )
//! .unwrap();
//!
//! let mut model = Model::new(
//!     ModelConfig::tiny(),
//!     Mode::Train,
//!     vocab.clone(),
//!     vocab,
//! )
//! .unwrap();
//! let out = model.train_step(&batch).unwrap();
//! assert!(out.loss.is_finite());
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod init;
pub mod model;
pub mod rnn;
pub mod trace;
pub mod vocab;

pub use config::{EncoderType, Mode, ModelConfig, UnitType};
pub use data::{decode_extended, encode_copy, BatchedInput, ExtendedToken};
pub use error::{ModelError, Result};
pub use model::{EvalOutput, InferOutput, Model, Seq2SeqArch, TrainOutput};
pub use vocab::{TokenId, Vocabulary};
