//! The copy-augmented variational sequence-to-sequence model.
//!
//! [`Model`] wires the encoder, the optional latent branch, the decoder
//! cell and the extended-vocabulary output projection into three
//! operations fixed by the construction-time [`Mode`]: teacher-forced
//! training, teacher-forced evaluation, and greedy or beam-search
//! inference.

pub mod beam;
pub mod decoder;
pub mod encoder;
pub mod latent;
pub mod output;

pub use beam::{length_penalty, BeamParams};
pub use encoder::Encoder;
pub use latent::{kl_annealing_weight, LatentEncoder};
pub use output::{argmax, OutputProjection};

use std::time::Instant;

use ndarray::{Array3, ArrayView3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{Mode, ModelConfig};
use crate::data::{decode_extended, BatchedInput, ExtendedToken};
use crate::error::{ModelError, Result};
use crate::init;
use crate::rnn::{LayerState, RnnStack};
use crate::trace::{self, TraceStep};
use crate::vocab::{TokenId, Vocabulary};

use decoder::{embed_sequence, embed_step, extended_embedding_table, tile_states};
use latent::augment_states;

/// Required override points of the seq2seq architecture.
///
/// A concrete model supplies the encoder and the decoder cell; the decode
/// control flow, output projection and loss are shared.
pub trait Seq2SeqArch {
    /// Build the source encoder.
    fn build_encoder<R: Rng>(config: &ModelConfig, rng: &mut R) -> Result<Encoder>;

    /// Build the decoder's recurrent stack.
    fn build_decoder_cell<R: Rng>(config: &ModelConfig, rng: &mut R) -> Result<RnnStack>;
}

/// Result of one teacher-forced training step.
#[derive(Debug, Clone)]
pub struct TrainOutput {
    /// Masked cross-entropy, summed over tokens, divided by the batch size
    pub loss: f32,
    /// Annealed KL divergence (already weighted)
    pub kl_loss: f32,
    /// Current annealing weight
    pub kl_weight: f32,
    /// Source plus target tokens in the batch
    pub word_count: usize,
    /// Predicted positions in the batch
    pub predict_count: usize,
    /// Number of examples
    pub batch_size: usize,
}

impl TrainOutput {
    /// The training objective: cross-entropy plus the annealed KL term.
    pub fn total_loss(&self) -> f32 {
        self.loss + self.kl_loss
    }
}

/// Result of one evaluation step.
#[derive(Debug, Clone)]
pub struct EvalOutput {
    pub loss: f32,
    pub predict_count: usize,
    pub batch_size: usize,
}

/// Result of decoding one batch.
#[derive(Debug, Clone)]
pub struct InferOutput {
    /// Per-step extended log-probabilities for greedy decoding, absent for
    /// beam search
    pub log_probs: Option<Array3<f32>>,
    /// Predicted ids, `[beams, B, T]`, eos-padded; copy predictions are
    /// per-example-local (`V + position`, the batch offset removed)
    pub sample_ids: Array3<TokenId>,
    /// Predicted tokens up to (excluding) eos; copy predictions resolve
    /// through the source sentence
    pub sample_words: Vec<Vec<Vec<String>>>,
}

impl InferOutput {
    /// The best hypothesis per example in canonical `[batch, time]` layout
    /// (for greedy decoding, the only hypothesis).
    pub fn top_sample_ids(&self) -> ndarray::ArrayView2<'_, TokenId> {
        self.sample_ids.index_axis(ndarray::Axis(0), 0)
    }
}

struct EncodedBatch {
    embedded_source: Array3<f32>,
    encoder_outputs: Array3<f32>,
    decoder_state: Vec<LayerState>,
    kl_divergence: f32,
    kl_weight: f32,
}

/// Concrete copy-augmented seq2seq model.
pub struct Model {
    config: ModelConfig,
    mode: Mode,
    src_vocab: Vocabulary,
    tgt_vocab: Vocabulary,
    embedding_encoder: ndarray::Array2<f32>,
    embedding_decoder: ndarray::Array2<f32>,
    encoder: Encoder,
    latent: Option<LatentEncoder>,
    decoder: RnnStack,
    output: OutputProjection,
    global_step: u64,
    rng: StdRng,
}

impl Seq2SeqArch for Model {
    fn build_encoder<R: Rng>(config: &ModelConfig, rng: &mut R) -> Result<Encoder> {
        Encoder::new(config, config.num_units, rng)
    }

    fn build_decoder_cell<R: Rng>(config: &ModelConfig, rng: &mut R) -> Result<RnnStack> {
        decoder::build_decoder_cell(config, rng)
    }
}

impl Model {
    /// Construct the model for one fixed mode.
    pub fn new(
        config: ModelConfig,
        mode: Mode,
        src_vocab: Vocabulary,
        tgt_vocab: Vocabulary,
    ) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.random_seed);

        let embedding_encoder =
            init::uniform_matrix(&mut rng, src_vocab.size(), config.num_units, config.init_weight);
        let embedding_decoder =
            init::uniform_matrix(&mut rng, tgt_vocab.size(), config.num_units, config.init_weight);

        let encoder = <Self as Seq2SeqArch>::build_encoder(&config, &mut rng)?;
        let latent = if config.z_hidden_size > 0 {
            Some(LatentEncoder::new(&config, &mut rng)?)
        } else {
            None
        };
        let decoder = <Self as Seq2SeqArch>::build_decoder_cell(&config, &mut rng)?;
        let output = OutputProjection::new(
            config.decoder_state_units(),
            config.encoder_output_units(),
            tgt_vocab.size(),
            config.batch_size,
            config.src_max_len,
            config.init_weight,
            &mut rng,
        );

        Ok(Self {
            config,
            mode,
            src_vocab,
            tgt_vocab,
            embedding_encoder,
            embedding_decoder,
            encoder,
            latent,
            decoder,
            output,
            global_step: 0,
            rng,
        })
    }

    /// The construction-time mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Current value of the training-step counter.
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Advance the training-step counter; called once per training step by
    /// the external training loop. A no-op counter when the latent branch
    /// is disabled, kept so reporting stays uniform.
    pub fn advance_global_step(&mut self) {
        if self.latent.is_some() {
            self.global_step += 1;
        }
    }

    /// Number of learned scalars.
    pub fn param_count(&self) -> usize {
        self.embedding_encoder.len()
            + self.embedding_decoder.len()
            + self.encoder.param_count()
            + self.latent.as_ref().map_or(0, LatentEncoder::param_count)
            + self.decoder.param_count()
            + self.output.param_count()
    }

    fn validate_batch(&self, batch: &BatchedInput) -> Result<()> {
        let b = batch.batch_size();
        if b == 0 {
            return Err(ModelError::InvalidConfig("empty batch".into()));
        }
        if b > self.config.batch_size {
            return Err(ModelError::BatchTooLarge {
                got: b,
                max: self.config.batch_size,
            });
        }
        if batch.max_source_len() > self.config.src_max_len {
            return Err(ModelError::ShapeMismatch {
                context: "Model::validate_batch",
                expected: format!("source length <= {}", self.config.src_max_len),
                actual: format!("{}", batch.max_source_len()),
            });
        }
        Ok(())
    }

    /// Encode the source and derive the (possibly latent-augmented)
    /// decoder initial state.
    fn encode(&mut self, batch: &BatchedInput) -> EncodedBatch {
        let training = self.mode == Mode::Train;

        let started = Instant::now();
        let embedded_source =
            embed_sequence(self.embedding_encoder.view(), batch.source.view());
        let (encoder_outputs, encoder_state) = self.encoder.forward(
            embedded_source.view(),
            &batch.source_lengths,
            training,
            &mut self.rng,
        );
        trace::global().record(TraceStep::Encode, started.elapsed());

        let (decoder_state, kl_divergence, kl_weight) = match &self.latent {
            None => (encoder_state, 0.0, 0.0),
            Some(latent) => {
                if training {
                    let started = Instant::now();
                    let embedded_target =
                        embed_sequence(self.embedding_encoder.view(), batch.target_input.view());
                    let sample = latent.posterior(
                        &encoder_state,
                        embedded_target.view(),
                        &batch.target_lengths,
                        &mut self.rng,
                    );
                    trace::global().record(TraceStep::TargetEncode, started.elapsed());
                    let weight = kl_annealing_weight(
                        self.global_step,
                        self.config.kl_steps,
                        self.config.max_kl_weight,
                    );
                    (
                        augment_states(&encoder_state, &sample.z),
                        sample.kl_divergence,
                        weight,
                    )
                } else {
                    let z = latent.prior(batch.batch_size(), &mut self.rng);
                    (augment_states(&encoder_state, &z), 0.0, 0.0)
                }
            }
        };

        EncodedBatch {
            embedded_source,
            encoder_outputs,
            decoder_state,
            kl_divergence,
            kl_weight,
        }
    }

    /// Teacher-forced unroll shared by train and eval.
    fn forward_teacher_forced(&mut self, batch: &BatchedInput) -> Result<(Array3<f32>, f32, f32)> {
        let encoded = self.encode(batch);
        let table = extended_embedding_table(
            self.embedding_decoder.view(),
            encoded.embedded_source.view(),
            encoded.encoder_outputs.view(),
            self.config.batch_size,
            self.config.src_max_len,
        );

        let shifted = batch.shifted_target_input(self.config.src_max_len);
        let decoder_inputs = embed_sequence(table.view(), shifted.view());

        let training = self.mode == Mode::Train;
        let started = Instant::now();
        let (decoder_outputs, _) = self.decoder.run(
            decoder_inputs.view(),
            &batch.target_lengths,
            encoded.decoder_state,
            training,
            &mut self.rng,
        );
        trace::global().record(TraceStep::Decode, started.elapsed());

        let started = Instant::now();
        let prepared = self
            .output
            .prepare(encoded.encoder_outputs.view(), &batch.source_lengths)?;
        let log_probs = prepared.log_probs(decoder_outputs.view());
        trace::global().record(TraceStep::Project, started.elapsed());

        Ok((log_probs, encoded.kl_divergence, encoded.kl_weight))
    }

    /// Masked cross-entropy against the shifted extended-vocabulary labels,
    /// summed over valid positions and divided by the batch size.
    fn compute_loss(&self, log_probs: ArrayView3<f32>, batch: &BatchedInput) -> f32 {
        let started = Instant::now();
        let labels = batch.shifted_target_output(self.config.src_max_len);
        let steps = log_probs.dim().0;
        let mut total = 0.0f32;
        for b in 0..batch.batch_size() {
            for t in 0..batch.target_lengths[b].min(steps) {
                let label = labels[[b, t]] as usize;
                debug_assert!(label < log_probs.dim().2);
                total -= log_probs[[t, b, label]];
            }
        }
        trace::global().record(TraceStep::Loss, started.elapsed());
        total / batch.batch_size() as f32
    }

    /// One teacher-forced training step.
    pub fn train_step(&mut self, batch: &BatchedInput) -> Result<TrainOutput> {
        assert_eq!(self.mode, Mode::Train, "train_step requires a Train model");
        self.validate_batch(batch)?;

        let (log_probs, kl_divergence, kl_weight) = self.forward_teacher_forced(batch)?;
        let loss = self.compute_loss(log_probs.view(), batch);

        Ok(TrainOutput {
            loss,
            kl_loss: kl_divergence * kl_weight,
            kl_weight,
            word_count: batch.word_count(),
            predict_count: batch.predict_count(),
            batch_size: batch.batch_size(),
        })
    }

    /// One teacher-forced evaluation step; the latent code is drawn from
    /// the prior and no KL term is reported.
    pub fn eval_step(&mut self, batch: &BatchedInput) -> Result<EvalOutput> {
        assert_eq!(self.mode, Mode::Eval, "eval_step requires an Eval model");
        self.validate_batch(batch)?;

        let (log_probs, _, _) = self.forward_teacher_forced(batch)?;
        let loss = self.compute_loss(log_probs.view(), batch);

        Ok(EvalOutput {
            loss,
            predict_count: batch.predict_count(),
            batch_size: batch.batch_size(),
        })
    }

    /// Maximum decoding steps: the configured cap, or twice the longest
    /// source length in the batch.
    fn max_iterations(&self, batch: &BatchedInput) -> usize {
        self.config
            .tgt_max_len_infer
            .unwrap_or_else(|| (2.0 * batch.longest_source() as f64).round() as usize)
    }

    /// Decode one batch with greedy or beam search, per the configured
    /// beam width.
    pub fn infer(&mut self, batch: &BatchedInput) -> Result<InferOutput> {
        assert_eq!(self.mode, Mode::Infer, "infer requires an Infer model");
        self.validate_batch(batch)?;

        let encoded = self.encode(batch);
        let table = extended_embedding_table(
            self.embedding_decoder.view(),
            encoded.embedded_source.view(),
            encoded.encoder_outputs.view(),
            self.config.batch_size,
            self.config.src_max_len,
        );
        let prepared = self
            .output
            .prepare(encoded.encoder_outputs.view(), &batch.source_lengths)?;

        let max_iterations = self.max_iterations(batch);
        let sos = self.tgt_vocab.sos_id();
        let eos = self.tgt_vocab.eos_id();
        let batch_size = batch.batch_size();

        let (log_probs, raw_ids) = if self.config.beam_width > 0 {
            let started = Instant::now();
            let initial = tile_states(&encoded.decoder_state, self.config.beam_width);
            let params = BeamParams {
                beam_width: self.config.beam_width,
                length_penalty_weight: self.config.length_penalty_weight,
                max_iterations,
                sos,
                eos,
            };
            let ids = beam::beam_search(
                &self.decoder,
                initial,
                &prepared,
                table.view(),
                batch_size,
                &params,
                &mut self.rng,
            );
            trace::global().record(TraceStep::BeamExpand, started.elapsed());
            (None, ids)
        } else {
            let started = Instant::now();
            let mut states = encoded.decoder_state;
            let mut current = vec![sos; batch_size];
            let mut finished = vec![false; batch_size];
            let mut sequences: Vec<Vec<TokenId>> = vec![Vec::new(); batch_size];
            let mut step_log_probs = Vec::with_capacity(max_iterations);

            for _ in 0..max_iterations {
                if finished.iter().all(|&f| f) {
                    break;
                }
                let inputs = embed_step(table.view(), &current);
                let out = self.decoder.step(inputs.view(), &mut states, false, &mut self.rng);
                let log_p = prepared.log_probs_step(out.view());
                for b in 0..batch_size {
                    if finished[b] {
                        current[b] = eos;
                        continue;
                    }
                    let next = argmax(log_p.row(b)) as TokenId;
                    sequences[b].push(next);
                    if next == eos {
                        finished[b] = true;
                    }
                    current[b] = next;
                }
                step_log_probs.push(log_p);
            }
            trace::global().record(TraceStep::Decode, started.elapsed());

            let width = prepared.extended_size();
            let steps = step_log_probs.len();
            let mut stacked = Array3::zeros((steps, batch_size, width));
            for (t, log_p) in step_log_probs.into_iter().enumerate() {
                stacked.index_axis_mut(ndarray::Axis(0), t).assign(&log_p);
            }

            let max_len = sequences.iter().map(Vec::len).max().unwrap_or(0);
            let mut ids = Array3::from_elem((1, batch_size, max_len), eos);
            for (b, seq) in sequences.iter().enumerate() {
                for (t, &id) in seq.iter().enumerate() {
                    ids[[0, b, t]] = id;
                }
            }
            (Some(stacked), ids)
        };

        let (sample_ids, sample_words) = self.localize_and_render(batch, &raw_ids);
        Ok(InferOutput {
            log_probs,
            sample_ids,
            sample_words,
        })
    }

    /// Remove the batch offset from copy predictions and resolve every
    /// prediction to a token string, stopping at eos.
    fn localize_and_render(
        &self,
        batch: &BatchedInput,
        ids: &Array3<TokenId>,
    ) -> (Array3<TokenId>, Vec<Vec<Vec<String>>>) {
        let vocab_size = self.tgt_vocab.size();
        let src_max_len = self.config.src_max_len;
        let eos = self.tgt_vocab.eos_id();
        let unk = self
            .tgt_vocab
            .token(self.tgt_vocab.unk_id())
            .unwrap_or("<unk>")
            .to_string();
        let (beams, batch_size, steps) = ids.dim();

        let mut local = ids.clone();
        let mut words = vec![vec![Vec::new(); batch_size]; beams];
        for j in 0..beams {
            for b in 0..batch_size {
                let mut done = false;
                for t in 0..steps {
                    let id = ids[[j, b, t]];
                    match decode_extended(id, vocab_size, src_max_len) {
                        ExtendedToken::Vocab(v) => {
                            if !done && v != eos {
                                words[j][b].push(
                                    self.tgt_vocab
                                        .token(v)
                                        .map_or_else(|| unk.clone(), str::to_string),
                                );
                            }
                            if v == eos {
                                done = true;
                            }
                        }
                        ExtendedToken::Copy { example, position } => {
                            local[[j, b, t]] = (vocab_size + position) as TokenId;
                            if !done {
                                let word = if position < batch.max_source_len() {
                                    let src_id = batch.source[[example.min(batch_size - 1), position]];
                                    self.src_vocab
                                        .token(src_id)
                                        .map_or_else(|| unk.clone(), str::to_string)
                                } else {
                                    unk.clone()
                                };
                                words[j][b].push(word);
                            }
                        }
                    }
                }
            }
        }
        (local, words)
    }
}
