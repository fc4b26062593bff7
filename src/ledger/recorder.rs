//! Entry Recorder
//!
//! Writes the two ledger entries backing a transfer. The pair always sums
//! to zero. Writes go through the caller's unit of work; nothing here commits.

use crate::store::LedgerTx;

use super::error::StoreError;
use super::types::{AccountId, Amount, Entry, NewEntry, TransferId};

pub struct EntryRecorder;

impl EntryRecorder {
    /// The debit/credit pair for moving `amount` from `source` to `dest`
    pub fn pair(
        transfer_id: TransferId,
        source: AccountId,
        dest: AccountId,
        amount: Amount,
    ) -> (NewEntry, NewEntry) {
        debug_assert!(amount > 0);
        debug_assert_ne!(source, dest);
        (
            NewEntry {
                account_id: source,
                transfer_id,
                amount: -amount,
            },
            NewEntry {
                account_id: dest,
                transfer_id,
                amount,
            },
        )
    }

    /// Insert the pair inside `tx`. Returns `(debit, credit)`.
    pub async fn record(
        tx: &mut dyn LedgerTx,
        transfer_id: TransferId,
        source: AccountId,
        dest: AccountId,
        amount: Amount,
    ) -> Result<(Entry, Entry), StoreError> {
        let (debit, credit) = Self::pair(transfer_id, source, dest, amount);
        let debit = tx.insert_entry(&debit).await?;
        let credit = tx.insert_entry(&credit).await?;
        Ok((debit, credit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::state::TransferStatus;
    use crate::ledger::types::{Currency, NewAccount, NewTransfer};
    use crate::store::{LedgerStore, MemoryLedgerStore};
    use std::time::Duration;

    #[test]
    fn test_pair_sums_to_zero() {
        let (debit, credit) = EntryRecorder::pair(9, 1, 2, 300);
        assert_eq!(debit.account_id, 1);
        assert_eq!(debit.amount, -300);
        assert_eq!(credit.account_id, 2);
        assert_eq!(credit.amount, 300);
        assert_eq!(debit.amount + credit.amount, 0);
        assert_eq!(debit.transfer_id, 9);
        assert_eq!(credit.transfer_id, 9);
    }

    #[tokio::test]
    async fn test_record_writes_only_within_unit() {
        let store = MemoryLedgerStore::new();
        let a = store
            .create_account(&NewAccount::new("a", 100, Currency::GBP))
            .await
            .unwrap();
        let b = store
            .create_account(&NewAccount::new("b", 0, Currency::GBP))
            .await
            .unwrap();

        let mut tx = store.begin(Duration::from_secs(1)).await.unwrap();
        let transfer = tx
            .insert_transfer(&NewTransfer {
                from_account_id: a.id,
                to_account_id: b.id,
                amount: 40,
                status: TransferStatus::Pending,
                reason: None,
                idempotency_key: None,
                reversal_of: None,
            })
            .await
            .unwrap();
        let (debit, credit) = EntryRecorder::record(tx.as_mut(), transfer.id, a.id, b.id, 40)
            .await
            .unwrap();
        assert_eq!(debit.amount + credit.amount, 0);
        assert!(debit.id < credit.id);

        // Not committed yet
        assert_eq!(store.entry_count().unwrap(), 0);
        tx.commit().await.unwrap();

        let entries = store.list_transfer_entries(transfer.id).await.unwrap();
        assert_eq!(entries, vec![debit, credit]);
    }
}
