//! Read paths and account opening
//!
//! No locks are taken here. Reads see committed state only.

use std::sync::Arc;
use tracing::info;

use crate::store::LedgerStore;

use super::error::{StoreError, TransferError};
use super::types::{Account, AccountId, Entry, NewAccount, Page, Transfer, TransferId};

pub struct LedgerQueries {
    store: Arc<dyn LedgerStore>,
}

fn persistence(context: String) -> impl FnOnce(StoreError) -> TransferError {
    move |source| TransferError::persistence(context, source)
}

impl LedgerQueries {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn create_account(&self, account: NewAccount) -> Result<Account, TransferError> {
        account.validate()?;
        let created = self
            .store
            .create_account(&account)
            .await
            .map_err(persistence(format!("create account for {}", account.owner)))?;
        info!(
            account_id = created.id,
            owner = %created.owner,
            currency = %created.currency,
            balance = created.balance,
            "Account opened"
        );
        Ok(created)
    }

    pub async fn get_account(&self, id: AccountId) -> Result<Account, TransferError> {
        self.store
            .get_account(id)
            .await
            .map_err(persistence(format!("load account {}", id)))?
            .ok_or(TransferError::AccountNotFound(id))
    }

    pub async fn list_accounts(&self, page: Page) -> Result<Vec<Account>, TransferError> {
        self.store
            .list_accounts(page)
            .await
            .map_err(persistence("list accounts".to_string()))
    }

    pub async fn get_transfer(&self, id: TransferId) -> Result<Transfer, TransferError> {
        self.store
            .get_transfer(id)
            .await
            .map_err(persistence(format!("load transfer {}", id)))?
            .ok_or(TransferError::TransferNotFound(id))
    }

    pub async fn list_transfers(&self, page: Page) -> Result<Vec<Transfer>, TransferError> {
        self.store
            .list_transfers(page)
            .await
            .map_err(persistence("list transfers".to_string()))
    }

    pub async fn list_entries(&self, page: Page) -> Result<Vec<Entry>, TransferError> {
        self.store
            .list_entries(page)
            .await
            .map_err(persistence("list entries".to_string()))
    }

    /// Entries of one account, oldest first. Unknown accounts are an error,
    /// not an empty history.
    pub async fn account_entries(
        &self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Entry>, TransferError> {
        self.get_account(account_id).await?;
        self.store
            .list_account_entries(account_id, page)
            .await
            .map_err(persistence(format!("list entries of account {}", account_id)))
    }

    /// The entry pair backing a transfer; empty for failed transfers
    pub async fn transfer_entries(&self, transfer_id: TransferId) -> Result<Vec<Entry>, TransferError> {
        self.get_transfer(transfer_id).await?;
        self.store
            .list_transfer_entries(transfer_id)
            .await
            .map_err(persistence(format!("list entries of transfer {}", transfer_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::error::ValidationError;
    use crate::ledger::types::Currency;
    use crate::store::MemoryLedgerStore;

    fn queries() -> (MemoryLedgerStore, LedgerQueries) {
        let store = MemoryLedgerStore::new();
        let queries = LedgerQueries::new(Arc::new(store.clone()));
        (store, queries)
    }

    #[tokio::test]
    async fn test_create_and_get_account() {
        let (_store, queries) = queries();
        let account = queries
            .create_account(NewAccount::new("alice", 250, Currency::INR))
            .await
            .unwrap();
        assert_eq!(account.balance, 250);
        assert_eq!(account.currency, Currency::INR);

        let loaded = queries.get_account(account.id).await.unwrap();
        assert_eq!(loaded, account);
    }

    #[tokio::test]
    async fn test_create_account_validation() {
        let (store, queries) = queries();
        let err = queries
            .create_account(NewAccount::new("", 0, Currency::USD))
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::Validation(ValidationError::EmptyOwner));

        let err = queries
            .create_account(NewAccount::new("bob", -1, Currency::USD))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransferError::Validation(ValidationError::NegativeOpeningBalance(-1))
        );
        assert!(store.list_accounts(Page::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_not_found() {
        let (_store, queries) = queries();
        assert_eq!(
            queries.get_account(7).await.unwrap_err(),
            TransferError::AccountNotFound(7)
        );
        assert_eq!(
            queries.get_transfer(8).await.unwrap_err(),
            TransferError::TransferNotFound(8)
        );
        assert_eq!(
            queries.account_entries(7, Page::default()).await.unwrap_err(),
            TransferError::AccountNotFound(7)
        );
    }

    #[tokio::test]
    async fn test_list_accounts_paged() {
        let (_store, queries) = queries();
        for owner in ["a", "b", "c", "d"] {
            queries
                .create_account(NewAccount::new(owner, 0, Currency::JPY))
                .await
                .unwrap();
        }
        let page = queries
            .list_accounts(Page::new(2, 1).unwrap())
            .await
            .unwrap();
        let owners: Vec<_> = page.iter().map(|a| a.owner.as_str()).collect();
        assert_eq!(owners, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_store_outage_maps_to_persistence() {
        let (store, queries) = queries();
        store.set_unavailable(true);
        let err = queries.list_transfers(Page::default()).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Persistence {
                source: StoreError::Unavailable(_),
                ..
            }
        ));
        assert!(!err.is_retryable());
    }
}
