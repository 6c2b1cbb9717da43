//! Batched model inputs and extended-vocabulary id arithmetic.
//!
//! A target label may name an ordinary vocabulary token (`id < V`) or a
//! source position to copy. Copy labels are stored per-example-local as
//! `V + position`; before they reach the embedding lookup or the loss they
//! are shifted into the batch-global space `V + example * src_max_len +
//! position`, keyed on a per-position binary flag. The shift and its
//! inverse live here so both directions are tested in one place.

use ndarray::Array2;

use crate::error::{ModelError, Result};
use crate::vocab::TokenId;

/// A decoded extended-vocabulary id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedToken {
    /// Ordinary vocabulary token
    Vocab(TokenId),
    /// Copy of `position` in `example`'s source sequence
    Copy { example: usize, position: usize },
}

/// Encode a copy of `position` in `example` as a batch-global extended id.
pub fn encode_copy(
    vocab_size: usize,
    src_max_len: usize,
    example: usize,
    position: usize,
) -> TokenId {
    debug_assert!(position < src_max_len, "copy position out of range");
    (vocab_size + example * src_max_len + position) as TokenId
}

/// Decode a batch-global extended id back to a token or a copy position.
pub fn decode_extended(id: TokenId, vocab_size: usize, src_max_len: usize) -> ExtendedToken {
    let id = id as usize;
    if id < vocab_size {
        ExtendedToken::Vocab(id as TokenId)
    } else {
        let offset = id - vocab_size;
        ExtendedToken::Copy {
            example: offset / src_max_len,
            position: offset % src_max_len,
        }
    }
}

/// One padded batch of source and target sequences.
///
/// `target_input` is the sos-prefixed teacher-forcing input and
/// `target_output` the eos-suffixed label sequence; both are `[B, T]` with
/// `T = max raw target length + 1`. `copy_flags` is `[B, T-1]`, aligned
/// with the raw target tokens, marking labels stored as per-example-local
/// copy ids.
#[derive(Debug, Clone)]
pub struct BatchedInput {
    /// Source ids, `[B, S]`, padded with eos
    pub source: Array2<TokenId>,
    /// Valid source length per example
    pub source_lengths: Vec<usize>,
    /// Teacher-forcing input ids, `[B, T]`
    pub target_input: Array2<TokenId>,
    /// Label ids, `[B, T]`
    pub target_output: Array2<TokenId>,
    /// Valid target length per example, counting the eos label
    pub target_lengths: Vec<usize>,
    /// Copy-label flags aligned with the raw target tokens, `[B, T-1]`
    pub copy_flags: Array2<u8>,
}

impl BatchedInput {
    /// Assemble a batch from ragged id sequences.
    ///
    /// `targets[b]` holds the raw target ids, where a copy label is already
    /// encoded per-example-local as `vocab_size + position` and flagged in
    /// `copy_flags[b]`. Short sequences are padded with `eos`.
    pub fn new(
        sources: &[Vec<TokenId>],
        targets: &[Vec<TokenId>],
        copy_flags: &[Vec<bool>],
        sos: TokenId,
        eos: TokenId,
    ) -> Result<Self> {
        let batch = sources.len();
        if targets.len() != batch || copy_flags.len() != batch {
            return Err(ModelError::ShapeMismatch {
                context: "BatchedInput::new",
                expected: format!("{batch} target and flag rows"),
                actual: format!("{} targets, {} flag rows", targets.len(), copy_flags.len()),
            });
        }
        for (target, flags) in targets.iter().zip(copy_flags) {
            if target.len() != flags.len() {
                return Err(ModelError::ShapeMismatch {
                    context: "BatchedInput::new",
                    expected: format!("{} flags", target.len()),
                    actual: format!("{}", flags.len()),
                });
            }
        }

        let src_len = sources.iter().map(Vec::len).max().unwrap_or(0);
        let raw_tgt_len = targets.iter().map(Vec::len).max().unwrap_or(0);
        let tgt_len = raw_tgt_len + 1;

        let mut source = Array2::from_elem((batch, src_len), eos);
        let mut source_lengths = Vec::with_capacity(batch);
        for (b, seq) in sources.iter().enumerate() {
            for (s, &id) in seq.iter().enumerate() {
                source[[b, s]] = id;
            }
            source_lengths.push(seq.len());
        }

        let mut target_input = Array2::from_elem((batch, tgt_len), eos);
        let mut target_output = Array2::from_elem((batch, tgt_len), eos);
        let mut flags = Array2::zeros((batch, raw_tgt_len));
        let mut target_lengths = Vec::with_capacity(batch);
        for (b, seq) in targets.iter().enumerate() {
            target_input[[b, 0]] = sos;
            for (j, &id) in seq.iter().enumerate() {
                target_input[[b, j + 1]] = id;
                target_output[[b, j]] = id;
                flags[[b, j]] = u8::from(copy_flags[b][j]);
            }
            // target_output[[b, seq.len()]] is already eos from the fill
            target_lengths.push(seq.len() + 1);
        }

        Ok(Self {
            source,
            source_lengths,
            target_input,
            target_output,
            target_lengths,
            copy_flags: flags,
        })
    }

    /// Number of examples in this batch.
    pub fn batch_size(&self) -> usize {
        self.source.nrows()
    }

    /// Padded source length.
    pub fn max_source_len(&self) -> usize {
        self.source.ncols()
    }

    /// Padded target length, including the sos/eos slot.
    pub fn max_target_len(&self) -> usize {
        self.target_input.ncols()
    }

    /// Longest valid source length in the batch.
    pub fn longest_source(&self) -> usize {
        self.source_lengths.iter().copied().max().unwrap_or(0)
    }

    /// Source tokens plus target tokens, for throughput reporting.
    pub fn word_count(&self) -> usize {
        self.source_lengths.iter().sum::<usize>() + self.target_lengths.iter().sum::<usize>()
    }

    /// Number of predicted positions, for perplexity.
    pub fn predict_count(&self) -> usize {
        self.target_lengths.iter().sum()
    }

    /// Teacher-forcing input ids with copy labels shifted batch-global.
    ///
    /// Column 0 is the sos token; column `j + 1` carries raw token `j`,
    /// shifted by `b * src_max_len` where its copy flag is set.
    pub fn shifted_target_input(&self, src_max_len: usize) -> Array2<TokenId> {
        let mut shifted = self.target_input.clone();
        for b in 0..self.batch_size() {
            let base = (b * src_max_len) as TokenId;
            for j in 0..self.copy_flags.ncols() {
                if self.copy_flags[[b, j]] != 0 {
                    shifted[[b, j + 1]] += base;
                }
            }
        }
        shifted
    }

    /// Label ids with copy labels shifted batch-global.
    ///
    /// Column `j` carries raw token `j`, shifted where flagged; the final
    /// eos column is never shifted.
    pub fn shifted_target_output(&self, src_max_len: usize) -> Array2<TokenId> {
        let mut shifted = self.target_output.clone();
        for b in 0..self.batch_size() {
            let base = (b * src_max_len) as TokenId;
            for j in 0..self.copy_flags.ncols() {
                if self.copy_flags[[b, j]] != 0 {
                    shifted[[b, j]] += base;
                }
            }
        }
        shifted
    }
}
