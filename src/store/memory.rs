//! In-memory ledger store
//!
//! Same contract as the PostgreSQL store, for isolated tests and local runs:
//! - committed tables live behind one `std::sync::Mutex`, never held across an await
//! - each account has its own async row lock, held by a unit until it finishes
//! - writes are staged in the unit and applied to the tables on commit
//! - CHECK / UNIQUE / FK constraints of the SQL schema are enforced by hand
//!
//! Fault injection (`inject_commit_conflicts`, `set_unavailable`) lets tests
//! drive the executor's retry and fatal-error paths.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use tracing::debug;

use super::{LedgerStore, LedgerTx};
use crate::ledger::error::StoreError;
use crate::ledger::state::TransferStatus;
use crate::ledger::types::{
    Account, AccountId, Amount, Entry, EntryId, NewAccount, NewEntry, NewTransfer, Page,
    Transfer, TransferId,
};

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    transfers: BTreeMap<TransferId, Transfer>,
    entries: BTreeMap<EntryId, Entry>,
    last_account_id: AccountId,
    last_transfer_id: TransferId,
    last_entry_id: EntryId,
}

impl Tables {
    fn key_taken(&self, key: &str) -> bool {
        self.transfers
            .values()
            .any(|t| t.idempotency_key.as_deref() == Some(key))
    }

    fn reversal_taken(&self, original: TransferId) -> bool {
        self.transfers
            .values()
            .any(|t| t.status == TransferStatus::Reversed && t.reversal_of == Some(original))
    }

    /// CHECK and FK constraints of `transfers`
    fn check_transfer(&self, transfer: &NewTransfer) -> Result<(), StoreError> {
        if transfer.amount <= 0 {
            return Err(StoreError::Constraint(
                "transfers_amount_check".to_string(),
            ));
        }
        if transfer.from_account_id == transfer.to_account_id {
            return Err(StoreError::Constraint("transfers_check".to_string()));
        }
        for id in [transfer.from_account_id, transfer.to_account_id] {
            if !self.accounts.contains_key(&id) {
                return Err(StoreError::Constraint(format!(
                    "transfers references missing account {}",
                    id
                )));
            }
        }
        if let Some(original) = transfer.reversal_of
            && !self.transfers.contains_key(&original)
        {
            return Err(StoreError::Constraint(format!(
                "transfers references missing transfer {}",
                original
            )));
        }
        Ok(())
    }

    fn new_transfer_row(&mut self, transfer: &NewTransfer) -> Transfer {
        self.last_transfer_id += 1;
        Transfer {
            id: self.last_transfer_id,
            from_account_id: transfer.from_account_id,
            to_account_id: transfer.to_account_id,
            amount: transfer.amount,
            status: transfer.status,
            reason: transfer.reason.clone(),
            idempotency_key: transfer.idempotency_key.clone(),
            reversal_of: transfer.reversal_of,
            created_at: Utc::now(),
        }
    }
}

#[derive(Default)]
struct Faults {
    commit_conflicts: u32,
    unavailable: bool,
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<AccountId, Arc<RowLock<()>>>>,
    faults: Mutex<Faults>,
}

impl Shared {
    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Corrupt("ledger tables poisoned".to_string()))
    }

    fn faults(&self) -> Result<MutexGuard<'_, Faults>, StoreError> {
        self.faults
            .lock()
            .map_err(|_| StoreError::Corrupt("fault table poisoned".to_string()))
    }

    fn row_lock(&self, id: AccountId) -> Result<Arc<RowLock<()>>, StoreError> {
        let mut locks = self
            .row_locks
            .lock()
            .map_err(|_| StoreError::Corrupt("row lock table poisoned".to_string()))?;
        Ok(locks.entry(id).or_default().clone())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.faults()?.unavailable {
            return Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct MemoryLedgerStore {
    shared: Arc<Shared>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with a serialization conflict
    pub fn inject_commit_conflicts(&self, count: u32) {
        if let Ok(mut faults) = self.shared.faults() {
            faults.commit_conflicts = count;
        }
    }

    /// Simulate a lost connection: every operation fails with `Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut faults) = self.shared.faults() {
            faults.unavailable = unavailable;
        }
    }

    /// Sum of all committed balances
    pub fn total_balance(&self) -> Result<i128, StoreError> {
        Ok(self
            .shared
            .tables()?
            .accounts
            .values()
            .map(|a| a.balance as i128)
            .sum())
    }

    pub fn entry_count(&self) -> Result<usize, StoreError> {
        Ok(self.shared.tables()?.entries.len())
    }

    pub fn transfer_count(&self) -> Result<usize, StoreError> {
        Ok(self.shared.tables()?.transfers.len())
    }
}

fn page_of<T: Clone>(rows: impl Iterator<Item = T>, page: Page) -> Vec<T> {
    let rows: Vec<T> = rows.collect();
    rows[page.bounds(rows.len())].to_vec()
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self, lock_timeout: Duration) -> Result<Box<dyn LedgerTx>, StoreError> {
        self.shared.check_available()?;
        Ok(Box::new(MemoryLedgerTx {
            shared: self.shared.clone(),
            lock_timeout,
            row_guards: HashMap::new(),
            accounts: BTreeMap::new(),
            touched: BTreeSet::new(),
            transfers: BTreeMap::new(),
            entries: Vec::new(),
            finished: false,
        }))
    }

    async fn create_account(&self, account: &NewAccount) -> Result<Account, StoreError> {
        self.shared.check_available()?;
        if account.balance < 0 {
            return Err(StoreError::Constraint(
                "accounts_balance_check".to_string(),
            ));
        }
        let mut tables = self.shared.tables()?;
        tables.last_account_id += 1;
        let now = Utc::now();
        let row = Account {
            id: tables.last_account_id,
            owner: account.owner.clone(),
            balance: account.balance,
            currency: account.currency,
            created_at: now,
            updated_at: now,
        };
        tables.accounts.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        self.shared.check_available()?;
        Ok(self.shared.tables()?.accounts.get(&id).cloned())
    }

    async fn list_accounts(&self, page: Page) -> Result<Vec<Account>, StoreError> {
        self.shared.check_available()?;
        let tables = self.shared.tables()?;
        Ok(page_of(tables.accounts.values().cloned(), page))
    }

    async fn insert_transfer(&self, transfer: &NewTransfer) -> Result<Transfer, StoreError> {
        self.shared.check_available()?;
        let mut tables = self.shared.tables()?;
        tables.check_transfer(transfer)?;
        if let Some(key) = &transfer.idempotency_key
            && tables.key_taken(key)
        {
            return Err(StoreError::Duplicate(format!("idempotency_key {}", key)));
        }
        if transfer.status == TransferStatus::Reversed
            && let Some(original) = transfer.reversal_of
            && tables.reversal_taken(original)
        {
            return Err(StoreError::Duplicate(format!("reversal_of {}", original)));
        }
        let row = tables.new_transfer_row(transfer);
        tables.transfers.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>, StoreError> {
        self.shared.check_available()?;
        Ok(self.shared.tables()?.transfers.get(&id).cloned())
    }

    async fn find_transfer_by_key(&self, key: &str) -> Result<Option<Transfer>, StoreError> {
        self.shared.check_available()?;
        let tables = self.shared.tables()?;
        Ok(tables
            .transfers
            .values()
            .find(|t| t.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn find_reversal(&self, original: TransferId) -> Result<Option<Transfer>, StoreError> {
        self.shared.check_available()?;
        let tables = self.shared.tables()?;
        Ok(tables
            .transfers
            .values()
            .find(|t| t.status == TransferStatus::Reversed && t.reversal_of == Some(original))
            .cloned())
    }

    async fn list_transfers(&self, page: Page) -> Result<Vec<Transfer>, StoreError> {
        self.shared.check_available()?;
        let tables = self.shared.tables()?;
        Ok(page_of(tables.transfers.values().cloned(), page))
    }

    async fn list_entries(&self, page: Page) -> Result<Vec<Entry>, StoreError> {
        self.shared.check_available()?;
        let tables = self.shared.tables()?;
        Ok(page_of(tables.entries.values().cloned(), page))
    }

    async fn list_account_entries(
        &self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Entry>, StoreError> {
        self.shared.check_available()?;
        let tables = self.shared.tables()?;
        Ok(page_of(
            tables
                .entries
                .values()
                .filter(|e| e.account_id == account_id)
                .cloned(),
            page,
        ))
    }

    async fn list_transfer_entries(
        &self,
        transfer_id: TransferId,
    ) -> Result<Vec<Entry>, StoreError> {
        self.shared.check_available()?;
        let tables = self.shared.tables()?;
        Ok(tables
            .entries
            .values()
            .filter(|e| e.transfer_id == transfer_id)
            .cloned()
            .collect())
    }
}

/// Unit of work over the in-memory tables
///
/// Holds the row locks it acquired until commit, rollback or drop.
pub struct MemoryLedgerTx {
    shared: Arc<Shared>,
    lock_timeout: Duration,
    row_guards: HashMap<AccountId, OwnedMutexGuard<()>>,
    /// Locked rows with staged balances
    accounts: BTreeMap<AccountId, Account>,
    touched: BTreeSet<AccountId>,
    transfers: BTreeMap<TransferId, Transfer>,
    entries: Vec<Entry>,
    finished: bool,
}

impl MemoryLedgerTx {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::Backend(
                "transaction already finished".to_string(),
            ));
        }
        Ok(())
    }

    /// Drop staged writes and release every row lock
    fn discard(&mut self) {
        self.accounts.clear();
        self.touched.clear();
        self.transfers.clear();
        self.entries.clear();
        self.row_guards.clear();
        self.finished = true;
    }

    fn staged_key_taken(&self, key: &str) -> bool {
        self.transfers
            .values()
            .any(|t| t.idempotency_key.as_deref() == Some(key))
    }

    /// Unique constraints against what other units committed meanwhile
    fn check_unique_on_commit(&self, tables: &Tables) -> Result<(), StoreError> {
        for transfer in self.transfers.values() {
            if let Some(key) = &transfer.idempotency_key
                && tables.key_taken(key)
            {
                return Err(StoreError::Duplicate(format!("idempotency_key {}", key)));
            }
            if transfer.status == TransferStatus::Reversed
                && let Some(original) = transfer.reversal_of
                && tables.reversal_taken(original)
            {
                return Err(StoreError::Duplicate(format!("reversal_of {}", original)));
            }
        }
        Ok(())
    }

    fn apply(&mut self) -> Result<(), StoreError> {
        {
            let mut faults = self.shared.faults()?;
            if faults.unavailable {
                return Err(StoreError::Unavailable(
                    "in-memory store marked unavailable".to_string(),
                ));
            }
            if faults.commit_conflicts > 0 {
                faults.commit_conflicts -= 1;
                return Err(StoreError::Conflict(
                    "could not serialize access due to concurrent update".to_string(),
                ));
            }
        }

        let shared = self.shared.clone();
        let mut tables = shared.tables()?;
        self.check_unique_on_commit(&tables)?;

        for id in &self.touched {
            if let Some(account) = self.accounts.get(id) {
                tables.accounts.insert(*id, account.clone());
            }
        }
        for (id, transfer) in std::mem::take(&mut self.transfers) {
            tables.transfers.insert(id, transfer);
        }
        for entry in std::mem::take(&mut self.entries) {
            tables.entries.insert(entry.id, entry);
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    async fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        self.ensure_open()?;
        if let Some(account) = self.accounts.get(&id) {
            return Ok(Some(account.clone()));
        }

        if !self.shared.tables()?.accounts.contains_key(&id) {
            return Ok(None);
        }
        let lock = self.shared.row_lock(id)?;
        let guard = tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                StoreError::Conflict(format!("lock wait timed out on account {}", id))
            })?;

        // Re-read under the lock: the row may have changed while we waited
        let account = self
            .shared
            .tables()?
            .accounts
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("account {}", id)))?;
        debug!(account_id = id, balance = account.balance, "Row lock acquired");

        self.row_guards.insert(id, guard);
        self.accounts.insert(id, account.clone());
        Ok(Some(account))
    }

    async fn apply_balance_delta(
        &mut self,
        id: AccountId,
        delta: Amount,
    ) -> Result<Account, StoreError> {
        self.ensure_open()?;
        let account = self.accounts.get_mut(&id).ok_or_else(|| {
            StoreError::Constraint(format!("account {} is not locked by this unit", id))
        })?;
        let balance = account
            .balance
            .checked_add(delta)
            .ok_or_else(|| StoreError::Constraint("balance overflow".to_string()))?;
        if balance < 0 {
            return Err(StoreError::Constraint(
                "accounts_balance_check".to_string(),
            ));
        }
        account.balance = balance;
        account.updated_at = Utc::now();
        let account = account.clone();
        self.touched.insert(id);
        Ok(account)
    }

    async fn insert_transfer(&mut self, transfer: &NewTransfer) -> Result<Transfer, StoreError> {
        self.ensure_open()?;
        if let Some(key) = &transfer.idempotency_key
            && self.staged_key_taken(key)
        {
            return Err(StoreError::Duplicate(format!("idempotency_key {}", key)));
        }
        let row = {
            let mut tables = self.shared.tables()?;
            tables.check_transfer(transfer)?;
            if let Some(key) = &transfer.idempotency_key
                && tables.key_taken(key)
            {
                return Err(StoreError::Duplicate(format!("idempotency_key {}", key)));
            }
            tables.new_transfer_row(transfer)
        };
        self.transfers.insert(row.id, row.clone());
        Ok(row)
    }

    async fn set_transfer_status(
        &mut self,
        id: TransferId,
        expected: TransferStatus,
        next: TransferStatus,
    ) -> Result<Transfer, StoreError> {
        self.ensure_open()?;
        if !expected.can_transition_to(next) {
            return Err(StoreError::Constraint(format!(
                "illegal transfer transition {} -> {}",
                expected, next
            )));
        }
        let reversal_of = match self.transfers.get(&id) {
            Some(t) if t.status == expected => t.reversal_of,
            _ => {
                return Err(StoreError::Constraint(format!(
                    "transfer {} is not {}",
                    id, expected
                )));
            }
        };
        if next == TransferStatus::Reversed
            && let Some(original) = reversal_of
            && self.shared.tables()?.reversal_taken(original)
        {
            return Err(StoreError::Duplicate(format!("reversal_of {}", original)));
        }
        let transfer = self
            .transfers
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("transfer {}", id)))?;
        transfer.status = next;
        Ok(transfer.clone())
    }

    async fn insert_entry(&mut self, entry: &NewEntry) -> Result<Entry, StoreError> {
        self.ensure_open()?;
        let staged_transfer = self.transfers.contains_key(&entry.transfer_id);
        let row = {
            let mut tables = self.shared.tables()?;
            if !tables.accounts.contains_key(&entry.account_id) {
                return Err(StoreError::Constraint(format!(
                    "entries references missing account {}",
                    entry.account_id
                )));
            }
            if !staged_transfer && !tables.transfers.contains_key(&entry.transfer_id) {
                return Err(StoreError::Constraint(format!(
                    "entries references missing transfer {}",
                    entry.transfer_id
                )));
            }
            tables.last_entry_id += 1;
            Entry {
                id: tables.last_entry_id,
                account_id: entry.account_id,
                transfer_id: entry.transfer_id,
                amount: entry.amount,
                created_at: Utc::now(),
            }
        };
        self.entries.push(row.clone());
        Ok(row)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let result = self.apply();
        // Locks go only after the writes are visible
        self.discard();
        result
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.discard();
        Ok(())
    }
}
