// src/store.rs
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::{AccountId, Amount, AuditRecord, Balance, BalanceKey, JournalEntry};

/// Failures surfaced by a storage adapter.
///
/// `Conflict` is kept apart from every other write failure so the
/// operations layer can turn it into `DuplicateReference`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Balance row not found: {0}")]
    NotFound(BalanceKey),

    #[error("Reference already recorded")]
    Conflict,

    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),

    #[error("Balance row {0} written without holding its lock")]
    NotLocked(BalanceKey),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Storage backend of the ledger.
///
/// Implementors own the balance rows, the journal, the audit log and the
/// account registry. All writes to balances, journal and audit go through an
/// [`AtomicUnit`].
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    /// BEGIN an atomic unit. Row locks taken inside it wait at most
    /// `lock_timeout` before failing with `StoreError::LockTimeout`.
    async fn begin(&self, lock_timeout: Duration) -> Result<Box<dyn AtomicUnit>, StoreError>;

    async fn open_account(&self, account: &AccountId) -> Result<(), StoreError>;
    async fn account_exists(&self, account: &AccountId) -> Result<bool, StoreError>;

    // READ OPERATIONS
    async fn get_balance(&self, key: &BalanceKey) -> Result<Option<Amount>, StoreError>;
    async fn balances(&self, account: &AccountId) -> Result<Vec<Balance>, StoreError>;
    /// Journal of one key in commit order.
    async fn journal(&self, key: &BalanceKey) -> Result<Vec<JournalEntry>, StoreError>;
    async fn entry_by_reference(
        &self,
        reference_key: &str,
    ) -> Result<Option<JournalEntry>, StoreError>;
    async fn audit_trail(&self, account: &AccountId) -> Result<Vec<AuditRecord>, StoreError>;
}

/// One transactional boundary over the balance store and journal.
///
/// Nothing written through a unit is visible to anyone else until `commit`
/// succeeds. Dropping a unit without committing discards its writes and
/// releases its locks, exactly like `rollback`.
#[async_trait]
pub trait AtomicUnit: Send {
    /// Create the row with amount 0 if it does not exist. Idempotent.
    async fn ensure(&mut self, key: &BalanceKey) -> Result<(), StoreError>;

    /// Take the exclusive row lock for the rest of the unit and return the
    /// current amount. `NotFound` if the row was never ensured.
    async fn lock_for_update(&mut self, key: &BalanceKey) -> Result<Amount, StoreError>;

    /// Overwrite a row previously locked by this unit.
    async fn set_amount(&mut self, key: &BalanceKey, amount: &Amount) -> Result<(), StoreError>;

    /// Append to the journal. `Conflict` if the entry's reference is taken.
    async fn append_entry(&mut self, entry: &JournalEntry) -> Result<(), StoreError>;

    async fn append_audit(&mut self, record: &AuditRecord) -> Result<(), StoreError>;

    /// Journal of one key in commit order, read on this unit's own
    /// connection, followed by anything this unit has staged for the key.
    async fn journal(&mut self, key: &BalanceKey) -> Result<Vec<JournalEntry>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
