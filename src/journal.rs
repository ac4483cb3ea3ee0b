// src/journal.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{AccountId, Amount, AssetCode, BalanceKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Credit,
    Debit,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "credit" => Some(Self::Credit),
            "debit" => Some(Self::Debit),
            _ => None,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one balance-affecting event.
///
/// `amount` is always positive; direction lives in `kind`. Entries are
/// written inside the same atomic unit as the balance change they explain
/// and are never updated or deleted afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: Uuid,
    pub account_id: AccountId,
    pub asset: AssetCode,
    pub amount: Amount,
    pub kind: EntryKind,
    pub external_ref: Option<String>,
    pub counterparty: Option<AccountId>,
    /// Shared by both legs of a transfer.
    pub correlation_id: Option<Uuid>,
    pub balance_after: Amount,
    pub created_at: DateTime<Utc>,
}

impl JournalEntry {
    pub fn new(key: &BalanceKey, kind: EntryKind, amount: Amount, balance_after: Amount) -> Self {
        Self {
            id: Uuid::now_v7(),
            account_id: key.account_id.clone(),
            asset: key.asset.clone(),
            amount,
            kind,
            external_ref: None,
            counterparty: None,
            correlation_id: None,
            balance_after,
            created_at: Utc::now(),
        }
    }

    pub fn with_reference(mut self, external_ref: Option<String>) -> Self {
        self.external_ref = external_ref;
        self
    }

    pub fn with_counterparty(mut self, counterparty: AccountId, correlation_id: Uuid) -> Self {
        self.counterparty = Some(counterparty);
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(self.account_id.clone(), self.asset.clone())
    }

    /// Uniqueness key of `external_ref`, if any.
    pub fn reference_key(&self) -> Option<String> {
        self.external_ref
            .as_deref()
            .map(crate::idempotency::reference_key)
    }
}
