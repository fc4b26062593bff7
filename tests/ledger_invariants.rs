//! Ledger invariants through the public API
//!
//! Conservation, non-negativity and entry pairing must hold for any
//! sequence of transfers, not just the hand-picked scenarios.

use std::sync::Arc;

use bank_ledger::config::ExecutorConfig;
use bank_ledger::ledger::{
    Currency, LedgerQueries, NewAccount, Page, TransferExecutor, TransferRequest, TransferStatus,
};
use bank_ledger::store::{LedgerStore, MemoryLedgerStore};
use proptest::prelude::*;

fn executor_config() -> ExecutorConfig {
    ExecutorConfig {
        max_attempts: 20,
        initial_backoff_ms: 1,
        max_backoff_ms: 10,
        backoff_multiplier: 2.0,
        jitter_factor: 0.2,
        lock_timeout_ms: 2000,
        unit_timeout_ms: 5000,
    }
}

struct Ledger {
    store: MemoryLedgerStore,
    executor: Arc<TransferExecutor>,
    queries: LedgerQueries,
}

impl Ledger {
    fn new() -> Self {
        let store = MemoryLedgerStore::new();
        let shared: Arc<dyn LedgerStore> = Arc::new(store.clone());
        Self {
            store,
            executor: Arc::new(TransferExecutor::new(shared.clone(), &executor_config())),
            queries: LedgerQueries::new(shared),
        }
    }

    async fn open_all(&self, balances: &[i64]) -> Vec<i64> {
        let mut ids = Vec::new();
        for (i, balance) in balances.iter().enumerate() {
            let account = self
                .queries
                .create_account(NewAccount::new(format!("holder-{}", i), *balance, Currency::EUR))
                .await
                .unwrap();
            ids.push(account.id);
        }
        ids
    }

    async fn check(&self, opening_total: i128) -> Result<(), TestCaseError> {
        prop_assert_eq!(self.store.total_balance().unwrap(), opening_total);

        let page = Page::new(Page::MAX_LIMIT, 0).unwrap();
        for account in self.queries.list_accounts(page).await.unwrap() {
            prop_assert!(account.balance >= 0);
        }
        for transfer in self.queries.list_transfers(page).await.unwrap() {
            let entries = self.queries.transfer_entries(transfer.id).await.unwrap();
            match transfer.status {
                TransferStatus::Completed | TransferStatus::Reversed => {
                    prop_assert_eq!(entries.len(), 2);
                    prop_assert_eq!(entries[0].amount + entries[1].amount, 0);
                    prop_assert_eq!(entries[1].amount, transfer.amount);
                }
                TransferStatus::Failed => prop_assert!(entries.is_empty()),
                TransferStatus::Pending => prop_assert!(false, "pending transfer left behind"),
            }
        }
        Ok(())
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: sequential transfers never create or destroy money
    #[test]
    fn sequential_transfers_conserve_total(
        balances in prop::collection::vec(0i64..5_000, 2..6),
        moves in prop::collection::vec((0usize..6, 0usize..6, 1i64..3_000), 1..40),
    ) {
        runtime().block_on(async {
            let ledger = Ledger::new();
            let ids = ledger.open_all(&balances).await;
            let total: i128 = balances.iter().map(|b| *b as i128).sum();

            for (from, to, amount) in moves {
                let (from, to) = (ids[from % ids.len()], ids[to % ids.len()]);
                let result = ledger.executor.execute(TransferRequest::new(from, to, amount)).await;
                if from == to {
                    prop_assert!(result.is_err());
                } else {
                    let status = result.unwrap().status;
                    prop_assert!(matches!(status, TransferStatus::Completed | TransferStatus::Failed));
                }
            }
            ledger.check(total).await
        })?;
    }

    /// Property: concurrent transfers over overlapping accounts conserve the
    /// total and keep every balance non-negative
    #[test]
    fn concurrent_transfers_conserve_total(
        balances in prop::collection::vec(0i64..2_000, 2..5),
        moves in prop::collection::vec((0usize..5, 0usize..5, 1i64..1_500), 1..30),
    ) {
        runtime().block_on(async {
            let ledger = Ledger::new();
            let ids = ledger.open_all(&balances).await;
            let total: i128 = balances.iter().map(|b| *b as i128).sum();

            let mut handles = Vec::new();
            for (from, to, amount) in moves {
                let (from, to) = (ids[from % ids.len()], ids[to % ids.len()]);
                if from == to {
                    continue;
                }
                let executor = ledger.executor.clone();
                handles.push(tokio::spawn(async move {
                    executor.execute(TransferRequest::new(from, to, amount)).await
                }));
            }
            for handle in handles {
                prop_assert!(handle.await.unwrap().is_ok());
            }
            ledger.check(total).await
        })?;
    }

    /// Property: a transfer followed by its reversal restores both balances
    #[test]
    fn reversal_restores_balances(
        from_balance in 1i64..10_000,
        to_balance in 0i64..10_000,
        amount in 1i64..10_000,
    ) {
        runtime().block_on(async {
            let ledger = Ledger::new();
            let ids = ledger.open_all(&[from_balance, to_balance]).await;

            let transfer = ledger
                .executor
                .execute(TransferRequest::new(ids[0], ids[1], amount))
                .await
                .unwrap();
            if amount > from_balance {
                prop_assert_eq!(transfer.status, TransferStatus::Failed);
                prop_assert!(ledger.executor.reverse(transfer.id, None).await.is_err());
            } else {
                prop_assert_eq!(transfer.status, TransferStatus::Completed);
                let reversal = ledger.executor.reverse(transfer.id, None).await.unwrap();
                prop_assert_eq!(reversal.status, TransferStatus::Reversed);
            }

            prop_assert_eq!(ledger.queries.get_account(ids[0]).await.unwrap().balance, from_balance);
            prop_assert_eq!(ledger.queries.get_account(ids[1]).await.unwrap().balance, to_balance);
            ledger.check((from_balance + to_balance) as i128).await
        })?;
    }
}

// ============================================================================
// Error Surface
// ============================================================================

#[tokio::test]
async fn test_error_codes_and_classes() {
    use bank_ledger::ledger::{ErrorClass, TransferError};

    let ledger = Ledger::new();
    let ids = ledger.open_all(&[100, 0]).await;

    let err = ledger
        .executor
        .execute(TransferRequest::new(ids[0], ids[0], 10))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert_eq!(err.class(), ErrorClass::InvalidRequest);

    let err = ledger
        .executor
        .execute(TransferRequest::new(ids[0], 999, 10))
        .await
        .unwrap_err();
    assert_eq!(err, TransferError::AccountNotFound(999));
    assert_eq!(err.class(), ErrorClass::InvalidRequest);

    let failed = ledger
        .executor
        .execute(TransferRequest::new(ids[0], ids[1], 500))
        .await
        .unwrap();
    assert_eq!(failed.status, TransferStatus::Failed);
}

#[tokio::test]
async fn test_transfer_serializes_with_lowercase_status() {
    let ledger = Ledger::new();
    let ids = ledger.open_all(&[100, 0]).await;
    let transfer = ledger
        .executor
        .execute(TransferRequest::new(ids[0], ids[1], 40).with_reason("lunch"))
        .await
        .unwrap();

    let json = serde_json::to_value(&transfer).unwrap();
    assert_eq!(json["status"], "completed");
    assert_eq!(json["amount"], 40);
    assert_eq!(json["reason"], "lunch");
}
