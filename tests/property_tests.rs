//! Property-based tests for ledger invariants
//!
//! - Balance tracking: stored balance == Σcredits − Σ(successful debits)
//! - Non-negativity: a debit succeeds iff the balance covers it, also under
//!   random concurrent interleavings
//! - Conservation: transfers never create or destroy value
//! - Reconciliation: the journal always explains the stored balance

use ledger_engine::{
    AccountId, Amount, EntryKind, Ledger, LedgerError, MutationRequest, TransferRequest,
    adapters::MemoryAdapter,
};
use proptest::prelude::*;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Credit(u64),
    Debit(u64),
}

/// Strategy for generating positive amounts
fn amount_strategy() -> impl Strategy<Value = u64> {
    1u64..10_000u64
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        amount_strategy().prop_map(Op::Credit),
        amount_strategy().prop_map(Op::Debit),
    ]
}

/// (from, to, amount) over a small fixed set of accounts
fn transfer_strategy() -> impl Strategy<Value = (usize, usize, u64)> {
    (0usize..3, 0usize..3, amount_strategy())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn multi_thread_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn create_test_ledger() -> Ledger {
    Ledger::new(Arc::new(MemoryAdapter::new()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: the stored balance follows the model and never goes negative
    #[test]
    fn prop_balance_tracks_successful_operations(ops in prop::collection::vec(op_strategy(), 1..40)) {
        runtime().block_on(async {
            let ledger = create_test_ledger();
            let user = AccountId::new("prop-user").unwrap();
            let mut model: u128 = 0;

            for op in &ops {
                match *op {
                    Op::Credit(amount) => {
                        let receipt = ledger
                            .credit(MutationRequest::new(user.clone(), "USDC", amount.to_string()))
                            .await;
                        prop_assert!(receipt.is_ok());
                        model += u128::from(amount);
                    }
                    Op::Debit(amount) => {
                        let receipt = ledger
                            .debit(MutationRequest::new(user.clone(), "USDC", amount.to_string()))
                            .await;
                        if model >= u128::from(amount) {
                            prop_assert!(receipt.is_ok());
                            model -= u128::from(amount);
                        } else {
                            let is_insufficient = matches!(receipt, Err(LedgerError::InsufficientBalance { .. }));
                            prop_assert!(is_insufficient);
                        }
                    }
                }
            }

            let balance = ledger.get_balance(&user, "USDC").await.unwrap();
            prop_assert_eq!(balance.to_string(), model.to_string());

            let reconciliation = ledger.reconcile(&user, "USDC").await.unwrap();
            prop_assert!(reconciliation.is_consistent());
            Ok(())
        })?;
    }

    /// Property: racing debits never overdraw, and the journal is a valid
    /// total order whose balances never go below zero
    #[test]
    fn prop_concurrent_debits_never_overdraw(
        seed in amount_strategy(),
        debits in prop::collection::vec(1u64..2_000u64, 2..24),
    ) {
        multi_thread_runtime().block_on(async {
            let ledger = create_test_ledger();
            let user = AccountId::new("racing-user").unwrap();
            ledger
                .credit(MutationRequest::new(user.clone(), "ETH", seed.to_string()))
                .await
                .unwrap();

            let handles: Vec<_> = debits
                .iter()
                .map(|amount| {
                    let ledger = ledger.clone();
                    let user = user.clone();
                    let amount = amount.to_string();
                    tokio::spawn(async move {
                        ledger.debit(MutationRequest::new(user, "ETH", amount)).await
                    })
                })
                .collect();

            let mut debited: u128 = 0;
            for (handle, amount) in handles.into_iter().zip(&debits) {
                match handle.await.unwrap() {
                    Ok(receipt) => {
                        prop_assert_eq!(
                            receipt.previous_balance.checked_sub(&receipt.new_balance),
                            Some(Amount::from(*amount))
                        );
                        debited += u128::from(*amount);
                    }
                    Err(LedgerError::InsufficientBalance { available, .. }) => {
                        prop_assert!(available < Amount::from(*amount));
                    }
                    Err(other) => prop_assert!(false, "unexpected error: {}", other),
                }
            }

            let remaining = ledger.get_balance(&user, "ETH").await.unwrap();
            prop_assert_eq!(remaining.to_string(), (u128::from(seed) - debited).to_string());

            let mut running = Amount::zero();
            for entry in ledger.history(&user, "ETH").await.unwrap() {
                running = match entry.kind {
                    EntryKind::Credit => &running + &entry.amount,
                    EntryKind::Debit => match running.checked_sub(&entry.amount) {
                        Some(next) => next,
                        None => return Err(TestCaseError::fail("journal debits below zero")),
                    },
                };
                prop_assert_eq!(&entry.balance_after, &running);
            }
            prop_assert_eq!(running, remaining);
            Ok(())
        })?;
    }

    /// Property: transfers conserve the total across accounts
    #[test]
    fn prop_transfers_conserve_total(
        seeds in prop::collection::vec(amount_strategy(), 3),
        transfers in prop::collection::vec(transfer_strategy(), 1..30),
    ) {
        runtime().block_on(async {
            let ledger = create_test_ledger();
            let accounts: Vec<AccountId> = (0..3)
                .map(|i| AccountId::new(format!("acct-{i}")).unwrap())
                .collect();

            let mut total = Amount::zero();
            for (account, seed) in accounts.iter().zip(&seeds) {
                ledger.open_account(account).await.unwrap();
                ledger
                    .credit(MutationRequest::new(account.clone(), "ETH", seed.to_string()))
                    .await
                    .unwrap();
                total = &total + &Amount::from(*seed);
            }

            for (from, to, amount) in transfers {
                let result = ledger
                    .transfer(TransferRequest::new(
                        accounts[from].clone(),
                        accounts[to].clone(),
                        "ETH",
                        amount.to_string(),
                    ))
                    .await;
                match result {
                    Ok(receipt) => {
                        prop_assert_ne!(from, to);
                        prop_assert_eq!(receipt.debit.previous_balance.checked_sub(&receipt.debit.new_balance), Some(Amount::from(amount)));
                    }
                    Err(LedgerError::InsufficientBalance { .. }) => prop_assert_ne!(from, to),
                    Err(LedgerError::InvalidTransfer(_)) => prop_assert_eq!(from, to),
                    Err(other) => prop_assert!(false, "unexpected error: {}", other),
                }
            }

            let mut after = Amount::zero();
            for account in &accounts {
                after = &after + &ledger.get_balance(account, "ETH").await.unwrap();
                prop_assert!(ledger.reconcile(account, "ETH").await.unwrap().is_consistent());
            }
            prop_assert_eq!(after, total);
            Ok(())
        })?;
    }

    /// Property: any digit string parses to its canonical decimal form
    #[test]
    fn prop_amount_parse_is_canonical(raw in "[0-9]{1,60}") {
        let amount = Amount::parse(&raw).unwrap();
        let trimmed = raw.trim_start_matches('0');
        let expected = if trimmed.is_empty() { "0" } else { trimmed };
        prop_assert_eq!(amount.to_string(), expected);
    }

    /// Property: anything that is not a plain digit string is rejected
    #[test]
    fn prop_amount_rejects_non_digits(raw in "[0-9]{0,5}[-+. eE_a-z][0-9]{0,5}") {
        prop_assert!(Amount::parse(&raw).is_err());
    }
}
