// src/balance.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AccountId, Amount, AssetCode, BalanceKey};

/// Snapshot of one balance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub account_id: AccountId,
    pub asset: AssetCode,
    pub amount: Amount,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn new(key: BalanceKey, amount: Amount, updated_at: DateTime<Utc>) -> Self {
        Self {
            account_id: key.account_id,
            asset: key.asset,
            amount,
            updated_at,
        }
    }

    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(self.account_id.clone(), self.asset.clone())
    }
}

/// Outcome of replaying the journal of one balance key against its stored amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub key: BalanceKey,
    pub balance: Amount,
    pub credited: Amount,
    pub debited: Amount,
    pub entries: usize,
}

impl Reconciliation {
    /// Σcredits − Σdebits, or `None` if the journal debits more than it credits.
    pub fn journal_net(&self) -> Option<Amount> {
        self.credited.checked_sub(&self.debited)
    }

    pub fn is_consistent(&self) -> bool {
        self.journal_net().as_ref() == Some(&self.balance)
    }
}
