//! # ledger-engine
//!
//! Per-account, per-asset balances with strict correctness guarantees.
//!
//! The ledger is the system of record for who holds how much of what. It
//! exposes exactly three mutations, [`Ledger::credit`], [`Ledger::debit`]
//! and [`Ledger::transfer`], plus reads. Each mutation is one atomic unit:
//! the balance row is locked, the new balance is validated, and the balance
//! write, its journal entry and its audit record commit together or not at
//! all.
//!
//! ```rust,ignore
//! use ledger_engine::{AccountId, Ledger, MutationRequest, adapters::MemoryAdapter};
//! use std::sync::Arc;
//!
//! let ledger = Ledger::new(Arc::new(MemoryAdapter::new()));
//! let alice = AccountId::new("alice")?;
//!
//! let receipt = ledger
//!     .credit(MutationRequest::new(alice.clone(), "ETH", "50").reference("deposit-0xabc"))
//!     .await?;
//! assert_eq!(receipt.new_balance.to_string(), "50");
//! ```
//!
//! ## Guarantees
//!
//! - Balances never go negative; amounts are arbitrary-precision integers.
//! - Two operations on the same `(account, asset)` never interleave.
//! - Transfers lock both rows in a global order, so opposite-direction
//!   transfers cannot deadlock.
//! - A reference is applied at most once; replays fail with
//!   [`LedgerError::DuplicateReference`].
//! - Σcredits − Σdebits in the journal equals the stored balance
//!   ([`Ledger::reconcile`]).
//!
//! ## Adapters
//!
//! | Adapter                             | Row lock                      |
//! |-------------------------------------|-------------------------------|
//! | [`adapters::MemoryAdapter`]         | keyed in-process async mutex  |
//! | `adapters::PostgresAdapter` (`postgres` feature) | `SELECT … FOR UPDATE` |
pub mod account;
pub mod adapters;
pub mod amount;
pub mod asset;
pub mod audit;
pub mod balance;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod journal;
pub mod operations;
pub mod store;
pub mod telemetry;

pub use account::{AccountId, BalanceKey};
pub use amount::Amount;
pub use asset::AssetCode;
pub use audit::{AuditAction, AuditEmitter, AuditRecord};
pub use balance::{Balance, Reconciliation};
pub use config::LedgerConfig;
pub use error::{LedgerError, Result};
pub use idempotency::IdempotencyGuard;
pub use journal::{EntryKind, JournalEntry};
pub use operations::{Ledger, MutationReceipt, MutationRequest, TransferReceipt, TransferRequest};
pub use store::{AtomicUnit, LedgerAdapter, StoreError};
