// src/adapters/memory.rs
use crate::{
    AccountId, Amount, AtomicUnit, AuditRecord, Balance, BalanceKey, JournalEntry, LedgerAdapter,
    StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

/// Write that an armed [`FailPoint`] makes fail, once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    JournalWrite,
    AuditWrite,
    Commit,
}

#[derive(Default)]
struct MemoryStore {
    accounts: HashSet<AccountId>,
    balances: HashMap<BalanceKey, (Amount, DateTime<Utc>)>,
    journal: Vec<JournalEntry>,
    // reference key -> index into `journal`
    references: HashMap<String, usize>,
    audit: Vec<AuditRecord>,
}

#[derive(Clone, Default)]
struct Shared {
    store: Arc<Mutex<MemoryStore>>,
    // One async mutex per balance row; rows are never deleted so neither are these.
    row_locks: Arc<Mutex<HashMap<BalanceKey, Arc<tokio::sync::Mutex<()>>>>>,
    faults: Arc<Mutex<HashSet<FailPoint>>>,
}

impl Shared {
    fn store(&self) -> Result<MutexGuard<'_, MemoryStore>, StoreError> {
        self.store
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn row_lock(&self, key: &BalanceKey) -> Result<Arc<tokio::sync::Mutex<()>>, StoreError> {
        let mut locks = self
            .row_locks
            .lock()
            .map_err(|_| StoreError::Unavailable("row lock table poisoned".to_string()))?;
        Ok(Arc::clone(locks.entry(key.clone()).or_default()))
    }

    // The fault table is a plain set; a panic while it was held cannot leave
    // it half-updated, so a poisoned lock is recovered rather than reported.
    fn faults(&self) -> MutexGuard<'_, HashSet<FailPoint>> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn trip(&self, point: FailPoint) -> Result<(), StoreError> {
        if self.faults().remove(&point) {
            return Err(StoreError::Unavailable(format!("injected failure: {point:?}")));
        }
        Ok(())
    }
}

/// Single-node adapter: row locks are in-process async mutexes keyed by
/// `(account, asset)`, and a unit's writes are staged privately until commit.
pub struct MemoryAdapter {
    shared: Shared,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            shared: Shared::default(),
        }
    }

    /// Make the next write at `point` fail with `StoreError::Unavailable`.
    pub fn inject_failure(&self, point: FailPoint) {
        self.shared.faults().insert(point);
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerAdapter for MemoryAdapter {
    async fn begin(&self, lock_timeout: Duration) -> Result<Box<dyn AtomicUnit>, StoreError> {
        Ok(Box::new(MemoryUnit {
            shared: self.shared.clone(),
            lock_timeout,
            held: HashMap::new(),
            created: HashSet::new(),
            amounts: HashMap::new(),
            entries: Vec::new(),
            audit: Vec::new(),
        }))
    }

    async fn open_account(&self, account: &AccountId) -> Result<(), StoreError> {
        self.shared.store()?.accounts.insert(account.clone());
        Ok(())
    }

    async fn account_exists(&self, account: &AccountId) -> Result<bool, StoreError> {
        Ok(self.shared.store()?.accounts.contains(account))
    }

    async fn get_balance(&self, key: &BalanceKey) -> Result<Option<Amount>, StoreError> {
        let store = self.shared.store()?;
        Ok(store.balances.get(key).map(|(amount, _)| amount.clone()))
    }

    async fn balances(&self, account: &AccountId) -> Result<Vec<Balance>, StoreError> {
        let store = self.shared.store()?;
        let mut balances: Vec<Balance> = store
            .balances
            .iter()
            .filter(|(key, _)| &key.account_id == account)
            .map(|(key, (amount, updated_at))| {
                Balance::new(key.clone(), amount.clone(), *updated_at)
            })
            .collect();
        balances.sort_by(|a, b| a.asset.cmp(&b.asset));
        Ok(balances)
    }

    async fn journal(&self, key: &BalanceKey) -> Result<Vec<JournalEntry>, StoreError> {
        let store = self.shared.store()?;
        Ok(store
            .journal
            .iter()
            .filter(|e| e.account_id == key.account_id && e.asset == key.asset)
            .cloned()
            .collect())
    }

    async fn entry_by_reference(
        &self,
        reference_key: &str,
    ) -> Result<Option<JournalEntry>, StoreError> {
        let store = self.shared.store()?;
        Ok(store
            .references
            .get(reference_key)
            .and_then(|idx| store.journal.get(*idx))
            .cloned())
    }

    async fn audit_trail(&self, account: &AccountId) -> Result<Vec<AuditRecord>, StoreError> {
        let store = self.shared.store()?;
        Ok(store
            .audit
            .iter()
            .filter(|r| &r.account_id == account)
            .cloned()
            .collect())
    }
}

struct MemoryUnit {
    shared: Shared,
    lock_timeout: Duration,
    held: HashMap<BalanceKey, OwnedMutexGuard<()>>,
    created: HashSet<BalanceKey>,
    amounts: HashMap<BalanceKey, Amount>,
    entries: Vec<JournalEntry>,
    audit: Vec<AuditRecord>,
}

impl MemoryUnit {
    fn row_exists(&self, key: &BalanceKey) -> Result<bool, StoreError> {
        if self.created.contains(key) {
            return Ok(true);
        }
        Ok(self.shared.store()?.balances.contains_key(key))
    }

    fn committed_amount(&self, key: &BalanceKey) -> Result<Amount, StoreError> {
        let store = self.shared.store()?;
        Ok(store
            .balances
            .get(key)
            .map(|(amount, _)| amount.clone())
            .unwrap_or_default())
    }

    fn reference_taken(&self, reference_key: &str) -> Result<bool, StoreError> {
        let staged = self
            .entries
            .iter()
            .any(|e| e.reference_key().as_deref() == Some(reference_key));
        Ok(staged || self.shared.store()?.references.contains_key(reference_key))
    }
}

#[async_trait]
impl AtomicUnit for MemoryUnit {
    async fn ensure(&mut self, key: &BalanceKey) -> Result<(), StoreError> {
        if !self.row_exists(key)? {
            self.created.insert(key.clone());
        }
        Ok(())
    }

    async fn lock_for_update(&mut self, key: &BalanceKey) -> Result<Amount, StoreError> {
        if !self.row_exists(key)? {
            return Err(StoreError::NotFound(key.clone()));
        }

        if !self.held.contains_key(key) {
            let row = self.shared.row_lock(key)?;
            let guard = tokio::time::timeout(self.lock_timeout, row.lock_owned())
                .await
                .map_err(|_| StoreError::LockTimeout(key.to_string()))?;
            self.held.insert(key.clone(), guard);
        }

        // Read after the lock is granted: the previous holder may have committed.
        match self.amounts.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => self.committed_amount(key),
        }
    }

    async fn set_amount(&mut self, key: &BalanceKey, amount: &Amount) -> Result<(), StoreError> {
        if !self.held.contains_key(key) {
            return Err(StoreError::NotLocked(key.clone()));
        }
        self.amounts.insert(key.clone(), amount.clone());
        Ok(())
    }

    async fn append_entry(&mut self, entry: &JournalEntry) -> Result<(), StoreError> {
        self.shared.trip(FailPoint::JournalWrite)?;

        if let Some(reference_key) = entry.reference_key() {
            if self.reference_taken(&reference_key)? {
                return Err(StoreError::Conflict);
            }
        }

        self.entries.push(entry.clone());
        Ok(())
    }

    async fn append_audit(&mut self, record: &AuditRecord) -> Result<(), StoreError> {
        self.shared.trip(FailPoint::AuditWrite)?;
        self.audit.push(record.clone());
        Ok(())
    }

    async fn journal(&mut self, key: &BalanceKey) -> Result<Vec<JournalEntry>, StoreError> {
        let store = self.shared.store()?;
        Ok(store
            .journal
            .iter()
            .chain(self.entries.iter())
            .filter(|e| e.account_id == key.account_id && e.asset == key.asset)
            .cloned()
            .collect())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.shared.trip(FailPoint::Commit)?;

        let unit = *self;
        let mut store = unit.shared.store()?;

        // Re-check under the store lock: two units on different rows may
        // carry the same reference.
        for entry in &unit.entries {
            if let Some(reference_key) = entry.reference_key() {
                if store.references.contains_key(&reference_key) {
                    return Err(StoreError::Conflict);
                }
            }
        }

        let now = Utc::now();
        for key in unit.created {
            store
                .balances
                .entry(key)
                .or_insert_with(|| (Amount::zero(), now));
        }
        for (key, amount) in unit.amounts {
            store.balances.insert(key, (amount, now));
        }
        for entry in unit.entries {
            if let Some(reference_key) = entry.reference_key() {
                let idx = store.journal.len();
                store.references.insert(reference_key, idx);
            }
            store.journal.push(entry);
        }
        store.audit.extend(unit.audit);

        drop(store);
        drop(unit.held);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        drop(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AssetCode, EntryKind};

    fn key(account: &str) -> BalanceKey {
        BalanceKey::new(
            AccountId::new(account).unwrap(),
            AssetCode::new("ETH").unwrap(),
        )
    }

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let adapter = MemoryAdapter::new();
        let k = key("alice");

        for _ in 0..2 {
            let mut unit = adapter.begin(TIMEOUT).await.unwrap();
            unit.ensure(&k).await.unwrap();
            unit.ensure(&k).await.unwrap();
            unit.commit().await.unwrap();
        }

        assert_eq!(adapter.get_balance(&k).await.unwrap(), Some(Amount::zero()));
    }

    #[tokio::test]
    async fn test_lock_missing_row_is_not_found() {
        let adapter = MemoryAdapter::new();
        let mut unit = adapter.begin(TIMEOUT).await.unwrap();

        assert!(matches!(
            unit.lock_for_update(&key("ghost")).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_set_amount_requires_lock() {
        let adapter = MemoryAdapter::new();
        let k = key("alice");
        let mut unit = adapter.begin(TIMEOUT).await.unwrap();
        unit.ensure(&k).await.unwrap();

        assert!(matches!(
            unit.set_amount(&k, &Amount::from(5)).await,
            Err(StoreError::NotLocked(_))
        ));
    }

    #[tokio::test]
    async fn test_staged_writes_invisible_until_commit() {
        let adapter = MemoryAdapter::new();
        let k = key("alice");

        let mut unit = adapter.begin(TIMEOUT).await.unwrap();
        unit.ensure(&k).await.unwrap();
        unit.lock_for_update(&k).await.unwrap();
        unit.set_amount(&k, &Amount::from(50)).await.unwrap();
        assert_eq!(adapter.get_balance(&k).await.unwrap(), None);

        unit.commit().await.unwrap();
        assert_eq!(adapter.get_balance(&k).await.unwrap(), Some(Amount::from(50)));
    }

    #[tokio::test]
    async fn test_rollback_discards_everything() {
        let adapter = MemoryAdapter::new();
        let k = key("alice");

        let mut unit = adapter.begin(TIMEOUT).await.unwrap();
        unit.ensure(&k).await.unwrap();
        unit.lock_for_update(&k).await.unwrap();
        unit.set_amount(&k, &Amount::from(50)).await.unwrap();
        unit.append_entry(&JournalEntry::new(&k, EntryKind::Credit, Amount::from(50), Amount::from(50)))
            .await
            .unwrap();
        unit.rollback().await.unwrap();

        assert_eq!(adapter.get_balance(&k).await.unwrap(), None);
        assert!(adapter.journal(&k).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_locker_waits_then_times_out() {
        let adapter = MemoryAdapter::new();
        let k = key("alice");

        let mut first = adapter.begin(TIMEOUT).await.unwrap();
        first.ensure(&k).await.unwrap();
        first.lock_for_update(&k).await.unwrap();

        let mut second = adapter.begin(Duration::from_millis(50)).await.unwrap();
        second.ensure(&k).await.unwrap();
        assert!(matches!(
            second.lock_for_update(&k).await,
            Err(StoreError::LockTimeout(_))
        ));

        // Dropping the holder releases the row.
        drop(first);
        let mut third = adapter.begin(TIMEOUT).await.unwrap();
        third.ensure(&k).await.unwrap();
        assert_eq!(third.lock_for_update(&k).await.unwrap(), Amount::zero());
    }

    #[tokio::test]
    async fn test_locker_sees_previous_commit() {
        let adapter = Arc::new(MemoryAdapter::new());
        let k = key("alice");

        let mut first = adapter.begin(TIMEOUT).await.unwrap();
        first.ensure(&k).await.unwrap();
        first.lock_for_update(&k).await.unwrap();

        let waiter = {
            let adapter = Arc::clone(&adapter);
            let k = k.clone();
            tokio::spawn(async move {
                let mut unit = adapter.begin(Duration::from_secs(5)).await.unwrap();
                unit.ensure(&k).await.unwrap();
                unit.lock_for_update(&k).await.unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        first.set_amount(&k, &Amount::from(7)).await.unwrap();
        first.commit().await.unwrap();

        assert_eq!(waiter.await.unwrap(), Amount::from(7));
    }

    #[tokio::test]
    async fn test_reference_conflict() {
        let adapter = MemoryAdapter::new();
        let k = key("alice");
        let entry = || {
            JournalEntry::new(&k, EntryKind::Credit, Amount::from(1), Amount::from(1))
                .with_reference(Some("dep-1".to_string()))
        };

        let mut unit = adapter.begin(TIMEOUT).await.unwrap();
        unit.append_entry(&entry()).await.unwrap();
        assert!(matches!(
            unit.append_entry(&entry()).await,
            Err(StoreError::Conflict)
        ));
        unit.commit().await.unwrap();

        let mut unit = adapter.begin(TIMEOUT).await.unwrap();
        assert!(matches!(
            unit.append_entry(&entry()).await,
            Err(StoreError::Conflict)
        ));
    }

    #[tokio::test]
    async fn test_unit_journal_includes_staged_entries() {
        let adapter = MemoryAdapter::new();
        let k = key("alice");
        let other = key("bob");
        let credit = |k: &BalanceKey, n: u64| {
            JournalEntry::new(k, EntryKind::Credit, Amount::from(n), Amount::from(n))
        };

        let mut unit = adapter.begin(TIMEOUT).await.unwrap();
        unit.append_entry(&credit(&k, 3)).await.unwrap();
        unit.append_entry(&credit(&other, 9)).await.unwrap();
        unit.commit().await.unwrap();

        let mut unit = adapter.begin(TIMEOUT).await.unwrap();
        unit.append_entry(&credit(&k, 4)).await.unwrap();
        let journal = unit.journal(&k).await.unwrap();
        let amounts: Vec<Amount> = journal.into_iter().map(|e| e.amount).collect();
        assert_eq!(amounts, [Amount::from(3), Amount::from(4)]);

        unit.rollback().await.unwrap();
        assert_eq!(adapter.journal(&k).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_survives_poisoned_fault_table() {
        let adapter = MemoryAdapter::new();
        let faults = Arc::clone(&adapter.shared.faults);
        let poisoner = std::thread::spawn(move || {
            let _held = faults.lock().unwrap();
            panic!("poison the fault table");
        });
        assert!(poisoner.join().is_err());
        assert!(adapter.shared.faults.is_poisoned());

        adapter.inject_failure(FailPoint::Commit);

        let unit = adapter.begin(TIMEOUT).await.unwrap();
        assert!(matches!(unit.commit().await, Err(StoreError::Unavailable(_))));
        let unit = adapter.begin(TIMEOUT).await.unwrap();
        assert!(unit.commit().await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let adapter = MemoryAdapter::new();
        let k = key("alice");
        adapter.inject_failure(FailPoint::AuditWrite);

        let record = AuditRecord {
            id: uuid::Uuid::now_v7(),
            actor: "test".to_string(),
            action: crate::AuditAction::Credit,
            account_id: k.account_id.clone(),
            asset: k.asset.clone(),
            previous_balance: Amount::zero(),
            new_balance: Amount::from(1),
            journal_entry_id: uuid::Uuid::now_v7(),
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        };

        let mut unit = adapter.begin(TIMEOUT).await.unwrap();
        assert!(unit.append_audit(&record).await.is_err());
        assert!(unit.append_audit(&record).await.is_ok());
    }
}
