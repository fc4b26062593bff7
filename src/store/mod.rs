//! Ledger Store
//!
//! Durable home of accounts, entries and transfers. The executor drives
//! writes through a [`LedgerTx`] unit of work; read paths go straight to
//! the [`LedgerStore`].
//!
//! Backends:
//! - [`PgLedgerStore`] - PostgreSQL, row locks via `SELECT ... FOR UPDATE`
//! - [`MemoryLedgerStore`] - in-process tables with per-account async locks

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

use async_trait::async_trait;
use std::time::Duration;

use crate::ledger::error::StoreError;
use crate::ledger::state::TransferStatus;
use crate::ledger::types::{
    Account, AccountId, Amount, Entry, NewAccount, NewEntry, NewTransfer, Page, Transfer,
    TransferId,
};

/// Storage backend shared by every executor and query path
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Open an atomic unit of work. Row-lock waits inside it give up after
    /// `lock_timeout` with [`StoreError::Conflict`].
    async fn begin(&self, lock_timeout: Duration) -> Result<Box<dyn LedgerTx>, StoreError>;

    async fn create_account(&self, account: &NewAccount) -> Result<Account, StoreError>;

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, StoreError>;

    async fn list_accounts(&self, page: Page) -> Result<Vec<Account>, StoreError>;

    /// Standalone insert, used for transfers that terminate without moving funds
    async fn insert_transfer(&self, transfer: &NewTransfer) -> Result<Transfer, StoreError>;

    async fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>, StoreError>;

    async fn find_transfer_by_key(&self, key: &str) -> Result<Option<Transfer>, StoreError>;

    /// The committed `reversed` transfer compensating `original`, if any
    async fn find_reversal(&self, original: TransferId) -> Result<Option<Transfer>, StoreError>;

    async fn list_transfers(&self, page: Page) -> Result<Vec<Transfer>, StoreError>;

    async fn list_entries(&self, page: Page) -> Result<Vec<Entry>, StoreError>;

    async fn list_account_entries(
        &self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Entry>, StoreError>;

    async fn list_transfer_entries(&self, transfer_id: TransferId)
    -> Result<Vec<Entry>, StoreError>;
}

/// One atomic unit of work
///
/// Nothing written through a `LedgerTx` is visible to other units until
/// [`LedgerTx::commit`] succeeds. Dropping an unfinished unit discards it
/// and releases its locks.
#[async_trait]
pub trait LedgerTx: Send {
    /// Take the exclusive row lock on an account and return its current state.
    /// `None` if the account does not exist.
    async fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError>;

    /// Add `delta` to a locked account's balance. A result below zero
    /// violates the balance constraint.
    async fn apply_balance_delta(
        &mut self,
        id: AccountId,
        delta: Amount,
    ) -> Result<Account, StoreError>;

    async fn insert_transfer(&mut self, transfer: &NewTransfer) -> Result<Transfer, StoreError>;

    /// Compare-and-set status transition
    async fn set_transfer_status(
        &mut self,
        id: TransferId,
        expected: TransferStatus,
        next: TransferStatus,
    ) -> Result<Transfer, StoreError>;

    async fn insert_entry(&mut self, entry: &NewEntry) -> Result<Entry, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}
