// src/operations.rs
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEmitter, Mutation};
use crate::idempotency::{IdempotencyGuard, translate};
use crate::telemetry::{record_amount, record_outcome};
use crate::{
    AccountId, Amount, AssetCode, AtomicUnit, AuditRecord, Balance, BalanceKey, EntryKind,
    JournalEntry, LedgerAdapter, LedgerConfig, LedgerError, Reconciliation, Result, StoreError,
};

/// Credit or debit of a single balance.
#[derive(Debug, Clone)]
pub struct MutationRequest {
    pub account_id: AccountId,
    pub asset: String,
    /// Base-10 integer string in the asset's smallest unit.
    pub amount: String,
    pub external_ref: Option<String>,
    pub actor: Option<String>,
    pub metadata: serde_json::Value,
}

impl MutationRequest {
    pub fn new(account_id: AccountId, asset: impl Into<String>, amount: impl Into<String>) -> Self {
        Self {
            account_id,
            asset: asset.into(),
            amount: amount.into(),
            external_ref: None,
            actor: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn reference(mut self, external_ref: impl Into<String>) -> Self {
        self.external_ref = Some(external_ref.into());
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Move `amount` of one asset between two provisioned accounts.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub from: AccountId,
    pub to: AccountId,
    pub asset: String,
    pub amount: String,
    pub external_ref: Option<String>,
    pub actor: Option<String>,
    pub metadata: serde_json::Value,
}

impl TransferRequest {
    pub fn new(
        from: AccountId,
        to: AccountId,
        asset: impl Into<String>,
        amount: impl Into<String>,
    ) -> Self {
        Self {
            from,
            to,
            asset: asset.into(),
            amount: amount.into(),
            external_ref: None,
            actor: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn reference(mut self, external_ref: impl Into<String>) -> Self {
        self.external_ref = Some(external_ref.into());
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationReceipt {
    pub previous_balance: Amount,
    pub new_balance: Amount,
    pub journal_entry_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transfer_id: Uuid,
    pub debit: MutationReceipt,
    pub credit: MutationReceipt,
}

/// The ledger: the only mutation surface over balances and the journal.
///
/// Every mutation runs as one atomic unit:
/// 1. validate the request and reject replayed references (before any lock)
/// 2. BEGIN, ensure and lock the balance row(s)
/// 3. compute and validate the new balance(s)
/// 4. write balance(s), journal entry(ies) and the audit record
/// 5. COMMIT, or ROLLBACK on any error so nothing is partially applied
#[derive(Clone)]
pub struct Ledger {
    adapter: Arc<dyn LedgerAdapter>,
    guard: IdempotencyGuard,
    audit: AuditEmitter,
    config: LedgerConfig,
}

impl Ledger {
    pub fn new(adapter: Arc<dyn LedgerAdapter>) -> Self {
        Self::with_config(adapter, LedgerConfig::default())
    }

    pub fn with_config(adapter: Arc<dyn LedgerAdapter>, config: LedgerConfig) -> Self {
        Self {
            guard: IdempotencyGuard::new(Arc::clone(&adapter)),
            audit: AuditEmitter::new(config.default_actor.clone()),
            adapter,
            config,
        }
    }

    pub fn adapter(&self) -> &dyn LedgerAdapter {
        self.adapter.as_ref()
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    // MUTATIONS

    #[instrument(skip_all, fields(operation = "credit", account = %request.account_id, asset = %request.asset))]
    pub async fn credit(&self, request: MutationRequest) -> Result<MutationReceipt> {
        let started = Instant::now();
        let result = self.bounded(self.mutate(EntryKind::Credit, &request)).await;
        record_outcome("credit", started, &result);
        result
    }

    #[instrument(skip_all, fields(operation = "debit", account = %request.account_id, asset = %request.asset))]
    pub async fn debit(&self, request: MutationRequest) -> Result<MutationReceipt> {
        let started = Instant::now();
        let result = self.bounded(self.mutate(EntryKind::Debit, &request)).await;
        record_outcome("debit", started, &result);
        result
    }

    #[instrument(skip_all, fields(operation = "transfer", from = %request.from, to = %request.to, asset = %request.asset))]
    pub async fn transfer(&self, request: TransferRequest) -> Result<TransferReceipt> {
        let started = Instant::now();
        let result = self.bounded(self.move_funds(&request)).await;
        record_outcome("transfer", started, &result);
        result
    }

    // PROVISIONING

    /// Provision the account context that transfers require. Idempotent.
    pub async fn open_account(&self, account_id: &AccountId) -> Result<()> {
        self.adapter
            .open_account(account_id)
            .await
            .map_err(|e| self.failure(translate(e, None)))
    }

    /// Create a zero balance row for `(account, asset)` if absent. Idempotent.
    pub async fn initialize(&self, account_id: &AccountId, asset: &str) -> Result<()> {
        let key = BalanceKey::new(account_id.clone(), AssetCode::new(asset)?);
        let mut unit = self.begin(None).await?;
        let staged = unit.ensure(&key).await.map_err(|e| translate(e, None));
        self.finish(unit, staged, None).await
    }

    // READS

    /// Current amount; `0` for a key that was never referenced.
    pub async fn get_balance(&self, account_id: &AccountId, asset: &str) -> Result<Amount> {
        let key = BalanceKey::new(account_id.clone(), AssetCode::new(asset)?);
        let amount = self
            .adapter
            .get_balance(&key)
            .await
            .map_err(|e| self.failure(translate(e, None)))?;
        Ok(amount.unwrap_or_default())
    }

    pub async fn balances(&self, account_id: &AccountId) -> Result<Vec<Balance>> {
        self.adapter
            .balances(account_id)
            .await
            .map_err(|e| self.failure(translate(e, None)))
    }

    /// Journal of one balance, oldest first.
    pub async fn history(&self, account_id: &AccountId, asset: &str) -> Result<Vec<JournalEntry>> {
        let key = BalanceKey::new(account_id.clone(), AssetCode::new(asset)?);
        self.adapter
            .journal(&key)
            .await
            .map_err(|e| self.failure(translate(e, None)))
    }

    /// The entry an earlier call recorded under `external_ref`, so a caller
    /// that got `DuplicateReference` can answer with the original result.
    pub async fn entry_by_reference(&self, external_ref: &str) -> Result<Option<JournalEntry>> {
        self.guard.prior(external_ref).await
    }

    pub async fn audit_trail(&self, account_id: &AccountId) -> Result<Vec<AuditRecord>> {
        self.adapter
            .audit_trail(account_id)
            .await
            .map_err(|e| self.failure(translate(e, None)))
    }

    /// Replay the journal of one key against its stored balance.
    ///
    /// The row lock is held while the journal is read through the same unit,
    /// so no writer can commit in between and only one connection is used.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, account_id: &AccountId, asset: &str) -> Result<Reconciliation> {
        let key = BalanceKey::new(account_id.clone(), AssetCode::new(asset)?);
        self.bounded(self.replay(key)).await
    }

    // INTERNALS

    async fn replay(&self, key: BalanceKey) -> Result<Reconciliation> {
        let mut unit = self.begin(None).await?;
        let read = read_locked_journal(unit.as_mut(), &key).await;
        if let Err(e) = unit.rollback().await {
            warn!(error = %e, "rollback after reconcile failed");
        }
        let (balance, journal) = read.map_err(|e| self.failure(translate(e, None)))?;

        let mut credited = Amount::zero();
        let mut debited = Amount::zero();
        for entry in &journal {
            match entry.kind {
                EntryKind::Credit => credited = &credited + &entry.amount,
                EntryKind::Debit => debited = &debited + &entry.amount,
            }
        }

        let reconciliation = Reconciliation {
            key,
            balance,
            credited,
            debited,
            entries: journal.len(),
        };
        if !reconciliation.is_consistent() {
            error!(
                key = %reconciliation.key,
                balance = %reconciliation.balance,
                credited = %reconciliation.credited,
                debited = %reconciliation.debited,
                "journal does not reconcile with balance"
            );
        }
        Ok(reconciliation)
    }

    async fn mutate(&self, kind: EntryKind, request: &MutationRequest) -> Result<MutationReceipt> {
        let amount = Amount::parse_positive(&request.amount)?;
        let key = BalanceKey::new(request.account_id.clone(), AssetCode::new(&request.asset)?);
        let reference = self.reference(request.external_ref.as_deref())?;
        self.guard.check(reference).await?;

        let mut unit = self.begin(reference).await?;
        let staged = self
            .stage_mutation(unit.as_mut(), kind, &key, &amount, request, reference)
            .await;
        let receipt = self.finish(unit, staged, reference).await?;

        record_amount(&key.asset, &amount);
        debug!(
            kind = %kind,
            amount = %amount,
            new_balance = %receipt.new_balance,
            entry_id = %receipt.journal_entry_id,
            "mutation committed"
        );
        Ok(receipt)
    }

    async fn stage_mutation(
        &self,
        unit: &mut dyn AtomicUnit,
        kind: EntryKind,
        key: &BalanceKey,
        amount: &Amount,
        request: &MutationRequest,
        reference: Option<&str>,
    ) -> Result<MutationReceipt> {
        let store = |e: StoreError| translate(e, reference);

        unit.ensure(key).await.map_err(store)?;
        let previous = unit.lock_for_update(key).await.map_err(store)?;

        let new_balance = match kind {
            EntryKind::Credit => &previous + amount,
            EntryKind::Debit => withdraw(key, &previous, amount)?,
        };
        unit.set_amount(key, &new_balance).await.map_err(store)?;

        let entry = JournalEntry::new(key, kind, amount.clone(), new_balance.clone())
            .with_reference(reference.map(str::to_string));
        unit.append_entry(&entry).await.map_err(store)?;

        let action = match kind {
            EntryKind::Credit => AuditAction::Credit,
            EntryKind::Debit => AuditAction::Debit,
        };
        let record = self.audit.record(
            request.actor.as_deref(),
            action,
            Mutation {
                key,
                previous_balance: &previous,
                new_balance: &new_balance,
                journal_entry_id: entry.id,
            },
            request.metadata.clone(),
        );
        self.audit.emit(unit, &record).await.map_err(store)?;

        Ok(MutationReceipt {
            previous_balance: previous,
            new_balance,
            journal_entry_id: entry.id,
        })
    }

    async fn move_funds(&self, request: &TransferRequest) -> Result<TransferReceipt> {
        let amount = Amount::parse_positive(&request.amount)?;
        let asset = AssetCode::new(&request.asset)?;
        if request.from == request.to {
            return Err(LedgerError::InvalidTransfer(format!(
                "sender and receiver are both {}",
                request.from
            )));
        }
        let reference = self.reference(request.external_ref.as_deref())?;

        for account_id in [&request.from, &request.to] {
            let exists = self
                .adapter
                .account_exists(account_id)
                .await
                .map_err(|e| self.failure(translate(e, reference)))?;
            if !exists {
                return Err(LedgerError::AccountNotFound(account_id.clone()));
            }
        }

        self.guard.check(reference).await?;

        let sender = BalanceKey::new(request.from.clone(), asset.clone());
        let receiver = BalanceKey::new(request.to.clone(), asset);

        let mut unit = self.begin(reference).await?;
        let staged = self
            .stage_transfer(unit.as_mut(), &sender, &receiver, &amount, request, reference)
            .await;
        let receipt = self.finish(unit, staged, reference).await?;

        record_amount(&sender.asset, &amount);
        debug!(
            transfer_id = %receipt.transfer_id,
            amount = %amount,
            "transfer committed"
        );
        Ok(receipt)
    }

    async fn stage_transfer(
        &self,
        unit: &mut dyn AtomicUnit,
        sender: &BalanceKey,
        receiver: &BalanceKey,
        amount: &Amount,
        request: &TransferRequest,
        reference: Option<&str>,
    ) -> Result<TransferReceipt> {
        let store = |e: StoreError| translate(e, reference);

        // Row creation takes index locks too, so it follows the lock order.
        let (first, second) = ordered(sender, receiver);
        unit.ensure(first).await.map_err(store)?;
        unit.ensure(second).await.map_err(store)?;
        let (sender_before, receiver_before) = lock_ordered(unit, sender, receiver)
            .await
            .map_err(store)?;

        let sender_after = withdraw(sender, &sender_before, amount)?;
        let receiver_after = &receiver_before + amount;
        unit.set_amount(sender, &sender_after).await.map_err(store)?;
        unit.set_amount(receiver, &receiver_after)
            .await
            .map_err(store)?;

        let transfer_id = Uuid::now_v7();
        let debit = JournalEntry::new(sender, EntryKind::Debit, amount.clone(), sender_after.clone())
            .with_reference(reference.map(str::to_string))
            .with_counterparty(receiver.account_id.clone(), transfer_id);
        let credit =
            JournalEntry::new(receiver, EntryKind::Credit, amount.clone(), receiver_after.clone())
                .with_counterparty(sender.account_id.clone(), transfer_id);
        unit.append_entry(&debit).await.map_err(store)?;
        unit.append_entry(&credit).await.map_err(store)?;

        // One audit record, on the initiating side.
        let metadata = serde_json::json!({
            "transfer_id": transfer_id,
            "counterparty": receiver.account_id,
            "counterparty_previous_balance": receiver_before,
            "counterparty_new_balance": receiver_after,
            "credit_entry_id": credit.id,
            "request": request.metadata,
        });
        let record = self.audit.record(
            request.actor.as_deref(),
            AuditAction::Transfer,
            Mutation {
                key: sender,
                previous_balance: &sender_before,
                new_balance: &sender_after,
                journal_entry_id: debit.id,
            },
            metadata,
        );
        self.audit.emit(unit, &record).await.map_err(store)?;

        Ok(TransferReceipt {
            transfer_id,
            debit: MutationReceipt {
                previous_balance: sender_before,
                new_balance: sender_after,
                journal_entry_id: debit.id,
            },
            credit: MutationReceipt {
                previous_balance: receiver_before,
                new_balance: receiver_after,
                journal_entry_id: credit.id,
            },
        })
    }

    fn reference<'r>(&self, external_ref: Option<&'r str>) -> Result<Option<&'r str>> {
        match external_ref {
            Some("") => Err(LedgerError::MissingReference),
            None if self.config.require_reference => Err(LedgerError::MissingReference),
            other => Ok(other),
        }
    }

    async fn begin(&self, reference: Option<&str>) -> Result<Box<dyn AtomicUnit>> {
        self.adapter
            .begin(self.config.lock_timeout())
            .await
            .map_err(|e| self.failure(translate(e, reference)))
    }

    /// COMMIT a successfully staged unit, ROLLBACK otherwise.
    async fn finish<T>(
        &self,
        unit: Box<dyn AtomicUnit>,
        staged: Result<T>,
        reference: Option<&str>,
    ) -> Result<T> {
        match staged {
            Ok(value) => {
                unit.commit()
                    .await
                    .map_err(|e| self.failure(translate(e, reference)))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = unit.rollback().await {
                    warn!(error = %rollback, "rollback failed, unit dropped");
                }
                Err(self.failure(err))
            }
        }
    }

    /// Bound the whole atomic unit. On expiry the unit is dropped, which
    /// rolls it back and releases its locks.
    async fn bounded<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.operation_timeout(), operation)
            .await
            .map_err(|_| self.failure(LedgerError::Timeout(self.config.operation_timeout_ms)))?
    }

    fn failure(&self, err: LedgerError) -> LedgerError {
        match &err {
            LedgerError::Storage(_) => error!(error = %err, "ledger storage failure"),
            e if e.is_retryable() => warn!(error = %err, "ledger unit aborted"),
            _ => debug!(error = %err, "ledger unit aborted"),
        }
        err
    }
}

fn withdraw(key: &BalanceKey, available: &Amount, requested: &Amount) -> Result<Amount> {
    available
        .checked_sub(requested)
        .ok_or_else(|| LedgerError::InsufficientBalance {
            key: key.clone(),
            available: available.clone(),
            requested: requested.clone(),
        })
}

/// The two keys in global lock order, whatever their roles.
fn ordered<'k>(a: &'k BalanceKey, b: &'k BalanceKey) -> (&'k BalanceKey, &'k BalanceKey) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Lock two rows in global key order.
///
/// Returns the amounts in argument order. Two opposite-direction transfers
/// over the same pair therefore always contend on the same first row and
/// cannot wait on each other in a cycle.
async fn lock_ordered(
    unit: &mut dyn AtomicUnit,
    a: &BalanceKey,
    b: &BalanceKey,
) -> std::result::Result<(Amount, Amount), StoreError> {
    let (first, second) = ordered(a, b);
    let first_amount = unit.lock_for_update(first).await?;
    let second_amount = unit.lock_for_update(second).await?;
    if first == a {
        Ok((first_amount, second_amount))
    } else {
        Ok((second_amount, first_amount))
    }
}

/// Lock the row, then read its journal on the same unit. A key with no row
/// yet reconciles as an empty balance.
async fn read_locked_journal(
    unit: &mut dyn AtomicUnit,
    key: &BalanceKey,
) -> std::result::Result<(Amount, Vec<JournalEntry>), StoreError> {
    let balance = match unit.lock_for_update(key).await {
        Ok(amount) => amount,
        Err(StoreError::NotFound(_)) => Amount::zero(),
        Err(e) => return Err(e),
    };
    let journal = unit.journal(key).await?;
    Ok((balance, journal))
}
