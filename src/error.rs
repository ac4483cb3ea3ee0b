// src/error.rs
use thiserror::Error;

use crate::{AccountId, Amount, BalanceKey};

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Every way a ledger call can fail.
///
/// Whatever the variant, the balance store and journal are exactly as they
/// were before the call.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Non-numeric, signed, fractional or zero amount.
    #[error("Invalid amount: {0:?}")]
    InvalidAmount(String),

    #[error("Invalid asset code: {0:?}")]
    InvalidAsset(String),

    #[error("Invalid account id: {0:?}")]
    InvalidAccount(String),

    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    #[error("Insufficient balance on {key}: available {available}, requested {requested}")]
    InsufficientBalance {
        key: BalanceKey,
        available: Amount,
        requested: Amount,
    },

    /// The operation was already applied under this reference.
    #[error("Duplicate reference: {0}")]
    DuplicateReference(String),

    #[error("An external reference is required for this operation")]
    MissingReference,

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Lock contention on {0}")]
    LockContention(String),

    #[error("Atomic unit did not commit within {0} ms")]
    Timeout(u64),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidAmount(_) => "invalid_amount",
            Self::InvalidAsset(_) => "invalid_asset",
            Self::InvalidAccount(_) => "invalid_account",
            Self::InvalidTransfer(_) => "invalid_transfer",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::DuplicateReference(_) => "duplicate_reference",
            Self::MissingReference => "missing_reference",
            Self::AccountNotFound(_) => "account_not_found",
            Self::LockContention(_) => "lock_contention",
            Self::Timeout(_) => "timeout",
            Self::Storage(_) => "storage_failure",
            Self::Config(_) => "config",
        }
    }

    /// Transient failures. Retrying is only safe when the original call
    /// carried an external reference.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockContention(_) | Self::Timeout(_))
    }
}
