//! Vocabulary lookup.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Token ID type
pub type TokenId = u32;

/// Token↔id lookup with reserved unknown/start/end tokens.
///
/// Ids are dense and assigned in insertion order; the reverse lookup is
/// used to render inference output as strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocabulary {
    tokens: Vec<String>,
    index: HashMap<String, TokenId>,
    unk: TokenId,
    sos: TokenId,
    eos: TokenId,
}

impl Vocabulary {
    /// Build a vocabulary from a token list.
    ///
    /// The unknown, start-of-sequence and end-of-sequence tokens must all be
    /// present in `tokens`; a missing special token is a configuration
    /// error. Duplicate tokens keep their first id.
    pub fn new<S: Into<String>>(
        tokens: impl IntoIterator<Item = S>,
        unk_token: &str,
        sos_token: &str,
        eos_token: &str,
    ) -> Result<Self> {
        let mut stored: Vec<String> = Vec::new();
        let mut index: HashMap<String, TokenId> = HashMap::new();
        for token in tokens {
            let token = token.into();
            if !index.contains_key(&token) {
                index.insert(token.clone(), stored.len() as TokenId);
                stored.push(token);
            }
        }

        let resolve = |name: &str| -> Result<TokenId> {
            index
                .get(name)
                .copied()
                .ok_or_else(|| ModelError::UnknownToken(name.to_string()))
        };
        let unk = resolve(unk_token)?;
        let sos = resolve(sos_token)?;
        let eos = resolve(eos_token)?;

        Ok(Self {
            tokens: stored,
            index,
            unk,
            sos,
            eos,
        })
    }

    /// Id for a token, falling back to the unknown id.
    pub fn lookup(&self, token: &str) -> TokenId {
        self.index.get(token).copied().unwrap_or(self.unk)
    }

    /// Token string for an id.
    pub fn token(&self, id: TokenId) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    /// Number of tokens.
    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    /// Id of the unknown token.
    pub fn unk_id(&self) -> TokenId {
        self.unk
    }

    /// Id of the start-of-sequence token.
    pub fn sos_id(&self) -> TokenId {
        self.sos
    }

    /// Id of the end-of-sequence token.
    pub fn eos_id(&self) -> TokenId {
        self.eos
    }

    /// Encode a whitespace-free token slice to ids, unknowns mapped to unk.
    pub fn encode(&self, tokens: &[&str]) -> Vec<TokenId> {
        tokens.iter().map(|t| self.lookup(t)).collect()
    }
}
