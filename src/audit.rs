// src/audit.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

use crate::{AccountId, Amount, AssetCode, AtomicUnit, BalanceKey, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Credit,
    Debit,
    Transfer,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
            Self::Transfer => "transfer",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "credit" => Some(Self::Credit),
            "debit" => Some(Self::Debit),
            "transfer" => Some(Self::Transfer),
            _ => None,
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who changed which balance, from what, to what.
///
/// Purely observational: the ledger writes these but never reads them back
/// to make a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub actor: String,
    pub action: AuditAction,
    pub account_id: AccountId,
    pub asset: AssetCode,
    pub previous_balance: Amount,
    pub new_balance: Amount,
    pub journal_entry_id: Uuid,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A balance transition that is about to be committed.
pub struct Mutation<'a> {
    pub key: &'a BalanceKey,
    pub previous_balance: &'a Amount,
    pub new_balance: &'a Amount,
    pub journal_entry_id: Uuid,
}

/// Writes audit records into the current atomic unit.
///
/// A failed audit write is returned to the caller, which aborts the whole
/// unit: every committed balance change has an audit record.
#[derive(Debug, Clone)]
pub struct AuditEmitter {
    default_actor: String,
}

impl AuditEmitter {
    pub fn new(default_actor: impl Into<String>) -> Self {
        Self {
            default_actor: default_actor.into(),
        }
    }

    pub fn record(
        &self,
        actor: Option<&str>,
        action: AuditAction,
        mutation: Mutation<'_>,
        metadata: serde_json::Value,
    ) -> AuditRecord {
        AuditRecord {
            id: Uuid::now_v7(),
            actor: actor.unwrap_or(&self.default_actor).to_string(),
            action,
            account_id: mutation.key.account_id.clone(),
            asset: mutation.key.asset.clone(),
            previous_balance: mutation.previous_balance.clone(),
            new_balance: mutation.new_balance.clone(),
            journal_entry_id: mutation.journal_entry_id,
            metadata,
            created_at: Utc::now(),
        }
    }

    pub async fn emit(
        &self,
        unit: &mut dyn AtomicUnit,
        record: &AuditRecord,
    ) -> Result<(), StoreError> {
        unit.append_audit(record).await?;
        debug!(
            audit_id = %record.id,
            actor = %record.actor,
            action = %record.action,
            account = %record.account_id,
            asset = %record.asset,
            previous = %record.previous_balance,
            new = %record.new_balance,
            "audit record staged"
        );
        Ok(())
    }
}

impl Default for AuditEmitter {
    fn default() -> Self {
        Self::new("system")
    }
}
