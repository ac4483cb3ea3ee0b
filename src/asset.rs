// src/asset.rs
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::LedgerError;

/// Symbolic currency or token code, e.g. `ETH`, `USDC`, `NGN`.
///
/// Codes are case-sensitive once stored; the boundary canonicalizes them to
/// upper-case so `eth` and `ETH` address the same balance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetCode(String);

const MAX_LEN: usize = 32;

impl AssetCode {
    pub fn new(code: &str) -> Result<Self, LedgerError> {
        let valid = !code.is_empty()
            && code.len() <= MAX_LEN
            && code
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

        if !valid {
            return Err(LedgerError::InvalidAsset(code.to_string()));
        }

        Ok(Self(code.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AssetCode {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<AssetCode> for String {
    fn from(code: AssetCode) -> Self {
        code.0
    }
}

impl fmt::Display for AssetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
