// src/adapters/postgres.rs
use crate::{
    AccountId, Amount, AssetCode, AtomicUnit, AuditAction, AuditRecord, Balance, BalanceKey,
    EntryKind, JournalEntry, LedgerAdapter, StoreError,
};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use tracing::warn;

// SQLSTATE codes that are not generic storage failures.
const UNIQUE_VIOLATION: &str = "23505";
const LOCK_NOT_AVAILABLE: &str = "55P03";
const DEADLOCK_DETECTED: &str = "40P01";

const JOURNAL_BY_REFERENCE: &str = r#"
    SELECT id, account_id, asset, amount::TEXT AS amount, kind, external_ref,
           counterparty, correlation_id, balance_after::TEXT AS balance_after, created_at
    FROM ledger_journal
    WHERE reference_key = $1
"#;

const JOURNAL_BY_KEY: &str = r#"
    SELECT id, account_id, asset, amount::TEXT AS amount, kind, external_ref,
           counterparty, correlation_id, balance_after::TEXT AS balance_after, created_at
    FROM ledger_journal
    WHERE account_id = $1 AND asset = $2
    ORDER BY seq
"#;

fn storage(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// Classify a write error, keeping uniqueness and lock failures apart.
fn classify(err: sqlx::Error, key: Option<&BalanceKey>) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some(UNIQUE_VIOLATION) => return StoreError::Conflict,
            Some(LOCK_NOT_AVAILABLE) | Some(DEADLOCK_DETECTED) => {
                let key = key.map(|k| k.to_string()).unwrap_or_default();
                return StoreError::LockTimeout(key);
            }
            _ => {}
        }
    }
    storage(err)
}

fn amount(row: &PgRow, column: &str) -> Result<Amount, StoreError> {
    let raw: String = row.try_get(column).map_err(storage)?;
    Amount::parse(&raw).map_err(|e| StoreError::Unavailable(e.to_string()))
}

fn account(row: &PgRow, column: &str) -> Result<AccountId, StoreError> {
    let raw: String = row.try_get(column).map_err(storage)?;
    AccountId::new(raw).map_err(|e| StoreError::Unavailable(e.to_string()))
}

fn asset(row: &PgRow, column: &str) -> Result<AssetCode, StoreError> {
    let raw: String = row.try_get(column).map_err(storage)?;
    AssetCode::new(&raw).map_err(|e| StoreError::Unavailable(e.to_string()))
}

fn journal_entry(row: &PgRow) -> Result<JournalEntry, StoreError> {
    let kind: String = row.try_get("kind").map_err(storage)?;
    let counterparty: Option<String> = row.try_get("counterparty").map_err(storage)?;

    Ok(JournalEntry {
        id: row.try_get("id").map_err(storage)?,
        account_id: account(row, "account_id")?,
        asset: asset(row, "asset")?,
        amount: amount(row, "amount")?,
        kind: EntryKind::parse(&kind)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown entry kind {kind:?}")))?,
        external_ref: row.try_get("external_ref").map_err(storage)?,
        counterparty: counterparty
            .map(AccountId::new)
            .transpose()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?,
        correlation_id: row.try_get("correlation_id").map_err(storage)?,
        balance_after: amount(row, "balance_after")?,
        created_at: row.try_get("created_at").map_err(storage)?,
    })
}

fn audit_record(row: &PgRow) -> Result<AuditRecord, StoreError> {
    let action: String = row.try_get("action").map_err(storage)?;

    Ok(AuditRecord {
        id: row.try_get("id").map_err(storage)?,
        actor: row.try_get("actor").map_err(storage)?,
        action: AuditAction::parse(&action)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown audit action {action:?}")))?,
        account_id: account(row, "account_id")?,
        asset: asset(row, "asset")?,
        previous_balance: amount(row, "previous_balance")?,
        new_balance: amount(row, "new_balance")?,
        journal_entry_id: row.try_get("journal_entry_id").map_err(storage)?,
        metadata: row.try_get("metadata").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
    })
}

/// Relational adapter. Row locks are `SELECT … FOR UPDATE` inside a
/// Postgres transaction; reference uniqueness is a unique index.
#[derive(Clone)]
pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger tables if they do not exist.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS ledger_accounts (
                id TEXT PRIMARY KEY,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ledger_balances (
                account_id TEXT NOT NULL,
                asset TEXT NOT NULL,
                amount NUMERIC(78, 0) NOT NULL DEFAULT 0 CHECK (amount >= 0),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (account_id, asset)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ledger_journal (
                seq BIGSERIAL UNIQUE,
                id UUID PRIMARY KEY,
                account_id TEXT NOT NULL,
                asset TEXT NOT NULL,
                amount NUMERIC(78, 0) NOT NULL CHECK (amount > 0),
                kind TEXT NOT NULL CHECK (kind IN ('credit', 'debit')),
                external_ref TEXT,
                reference_key TEXT UNIQUE,
                counterparty TEXT,
                correlation_id UUID,
                balance_after NUMERIC(78, 0) NOT NULL CHECK (balance_after >= 0),
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_ledger_journal_key
            ON ledger_journal(account_id, asset, seq)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ledger_audit (
                seq BIGSERIAL UNIQUE,
                id UUID PRIMARY KEY,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                account_id TEXT NOT NULL,
                asset TEXT NOT NULL,
                previous_balance NUMERIC(78, 0) NOT NULL,
                new_balance NUMERIC(78, 0) NOT NULL,
                journal_entry_id UUID NOT NULL REFERENCES ledger_journal(id),
                metadata JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_ledger_audit_account
            ON ledger_audit(account_id, seq)
            "#,
            // Journal and audit rows are immutable once written.
            r#"
            CREATE OR REPLACE FUNCTION ledger_reject_mutation() RETURNS trigger AS $$
            BEGIN
                RAISE EXCEPTION '% is append-only', TG_TABLE_NAME;
            END;
            $$ LANGUAGE plpgsql
            "#,
            "DROP TRIGGER IF EXISTS ledger_journal_append_only ON ledger_journal",
            r#"
            CREATE TRIGGER ledger_journal_append_only
            BEFORE UPDATE OR DELETE ON ledger_journal
            FOR EACH ROW EXECUTE FUNCTION ledger_reject_mutation()
            "#,
            "DROP TRIGGER IF EXISTS ledger_audit_append_only ON ledger_audit",
            r#"
            CREATE TRIGGER ledger_audit_append_only
            BEFORE UPDATE OR DELETE ON ledger_audit
            FOR EACH ROW EXECUTE FUNCTION ledger_reject_mutation()
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(())
    }
}

#[async_trait]
impl LedgerAdapter for PostgresAdapter {
    async fn begin(&self, lock_timeout: Duration) -> Result<Box<dyn AtomicUnit>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // SET cannot take bind parameters.
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            lock_timeout.as_millis().max(1)
        ))
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        Ok(Box::new(PostgresUnit { tx }))
    }

    async fn open_account(&self, account: &AccountId) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO ledger_accounts (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(account.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn account_exists(&self, account: &AccountId) -> Result<bool, StoreError> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM ledger_accounts WHERE id = $1)")
            .bind(account.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(storage)
    }

    async fn get_balance(&self, key: &BalanceKey) -> Result<Option<Amount>, StoreError> {
        let raw: Option<String> = sqlx::query_scalar(
            r#"
            SELECT amount::TEXT
            FROM ledger_balances
            WHERE account_id = $1 AND asset = $2
            "#,
        )
        .bind(key.account_id.as_str())
        .bind(key.asset.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        raw.map(|raw| Amount::parse(&raw).map_err(|e| StoreError::Unavailable(e.to_string())))
            .transpose()
    }

    async fn balances(&self, account_id: &AccountId) -> Result<Vec<Balance>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT account_id, asset, amount::TEXT AS amount, updated_at
            FROM ledger_balances
            WHERE account_id = $1
            ORDER BY asset
            "#,
        )
        .bind(account_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter()
            .map(|row| {
                Ok(Balance {
                    account_id: account(row, "account_id")?,
                    asset: asset(row, "asset")?,
                    amount: amount(row, "amount")?,
                    updated_at: row.try_get("updated_at").map_err(storage)?,
                })
            })
            .collect()
    }

    async fn journal(&self, key: &BalanceKey) -> Result<Vec<JournalEntry>, StoreError> {
        let rows = sqlx::query(JOURNAL_BY_KEY)
            .bind(key.account_id.as_str())
            .bind(key.asset.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        rows.iter().map(journal_entry).collect()
    }

    async fn entry_by_reference(
        &self,
        reference_key: &str,
    ) -> Result<Option<JournalEntry>, StoreError> {
        let row = sqlx::query(JOURNAL_BY_REFERENCE)
            .bind(reference_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        row.as_ref().map(journal_entry).transpose()
    }

    async fn audit_trail(&self, account_id: &AccountId) -> Result<Vec<AuditRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, actor, action, account_id, asset,
                   previous_balance::TEXT AS previous_balance,
                   new_balance::TEXT AS new_balance,
                   journal_entry_id, metadata, created_at
            FROM ledger_audit
            WHERE account_id = $1
            ORDER BY seq
            "#,
        )
        .bind(account_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter().map(audit_record).collect()
    }
}

/// A Postgres transaction. Dropping it without commit rolls back.
struct PostgresUnit {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl AtomicUnit for PostgresUnit {
    async fn ensure(&mut self, key: &BalanceKey) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_balances (account_id, asset, amount)
            VALUES ($1, $2, 0)
            ON CONFLICT (account_id, asset) DO NOTHING
            "#,
        )
        .bind(key.account_id.as_str())
        .bind(key.asset.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| classify(e, Some(key)))?;
        Ok(())
    }

    async fn lock_for_update(&mut self, key: &BalanceKey) -> Result<Amount, StoreError> {
        let raw: Option<String> = sqlx::query_scalar(
            r#"
            SELECT amount::TEXT
            FROM ledger_balances
            WHERE account_id = $1 AND asset = $2
            FOR UPDATE
            "#,
        )
        .bind(key.account_id.as_str())
        .bind(key.asset.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| classify(e, Some(key)))?;

        let raw = raw.ok_or_else(|| StoreError::NotFound(key.clone()))?;
        Amount::parse(&raw).map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn set_amount(&mut self, key: &BalanceKey, amount: &Amount) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE ledger_balances
            SET amount = $3::NUMERIC, updated_at = NOW()
            WHERE account_id = $1 AND asset = $2
            "#,
        )
        .bind(key.account_id.as_str())
        .bind(key.asset.as_str())
        .bind(amount.to_string())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| classify(e, Some(key)))?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(key.clone()));
        }
        Ok(())
    }

    async fn append_entry(&mut self, entry: &JournalEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_journal (id, account_id, asset, amount, kind, external_ref,
                                        reference_key, counterparty, correlation_id,
                                        balance_after, created_at)
            VALUES ($1, $2, $3, $4::NUMERIC, $5, $6, $7, $8, $9, $10::NUMERIC, $11)
            "#,
        )
        .bind(entry.id)
        .bind(entry.account_id.as_str())
        .bind(entry.asset.as_str())
        .bind(entry.amount.to_string())
        .bind(entry.kind.as_str())
        .bind(entry.external_ref.as_deref())
        .bind(entry.reference_key())
        .bind(entry.counterparty.as_ref().map(|c| c.as_str()))
        .bind(entry.correlation_id)
        .bind(entry.balance_after.to_string())
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| classify(e, None))?;
        Ok(())
    }

    async fn append_audit(&mut self, record: &AuditRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_audit (id, actor, action, account_id, asset, previous_balance,
                                      new_balance, journal_entry_id, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6::NUMERIC, $7::NUMERIC, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(&record.actor)
        .bind(record.action.as_str())
        .bind(record.account_id.as_str())
        .bind(record.asset.as_str())
        .bind(record.previous_balance.to_string())
        .bind(record.new_balance.to_string())
        .bind(record.journal_entry_id)
        .bind(&record.metadata)
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| classify(e, None))?;
        Ok(())
    }

    async fn journal(&mut self, key: &BalanceKey) -> Result<Vec<JournalEntry>, StoreError> {
        let rows = sqlx::query(JOURNAL_BY_KEY)
            .bind(key.account_id.as_str())
            .bind(key.asset.as_str())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| classify(e, Some(key)))?;

        rows.iter().map(journal_entry).collect()
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(|e| classify(e, None))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(|e| {
            warn!(error = %e, "postgres rollback failed");
            storage(e)
        })
    }
}
