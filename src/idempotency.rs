// src/idempotency.rs
use std::sync::Arc;
use tracing::info;

use crate::{JournalEntry, LedgerAdapter, LedgerError, StoreError};

/// Storage key for an external reference.
///
/// References are caller-chosen and unbounded in length; the unique column
/// holds a fixed-size digest instead.
pub(crate) fn reference_key(reference: &str) -> String {
    blake3::hash(reference.as_bytes()).to_hex().to_string()
}

/// Rejects replays of an operation that already reached the journal.
///
/// The pre-lock `check` only avoids contention on obvious retries. The
/// authoritative guard is the journal's unique reference column: of two
/// racing requests with the same reference, the store reports `Conflict`
/// to the loser, which `translate` turns into `DuplicateReference`.
#[derive(Clone)]
pub struct IdempotencyGuard {
    adapter: Arc<dyn LedgerAdapter>,
}

impl IdempotencyGuard {
    pub fn new(adapter: Arc<dyn LedgerAdapter>) -> Self {
        Self { adapter }
    }

    pub async fn check(&self, reference: Option<&str>) -> Result<(), LedgerError> {
        let Some(reference) = reference else {
            return Ok(());
        };

        if let Some(prior) = self.prior(reference).await? {
            info!(reference, entry_id = %prior.id, "replayed reference rejected");
            return Err(LedgerError::DuplicateReference(reference.to_string()));
        }

        Ok(())
    }

    pub async fn prior(&self, reference: &str) -> Result<Option<JournalEntry>, LedgerError> {
        self.adapter
            .entry_by_reference(&reference_key(reference))
            .await
            .map_err(|e| translate(e, Some(reference)))
    }
}

/// Map an adapter failure onto the public taxonomy.
pub(crate) fn translate(err: StoreError, reference: Option<&str>) -> LedgerError {
    match err {
        StoreError::Conflict => {
            LedgerError::DuplicateReference(reference.unwrap_or_default().to_string())
        }
        StoreError::LockTimeout(key) => LedgerError::LockContention(key),
        other => LedgerError::Storage(other.to_string()),
    }
}
