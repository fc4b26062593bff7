//! PostgreSQL ledger store
//!
//! Row locks are plain `SELECT ... FOR UPDATE`; the lock wait bound is set
//! per unit with `SET LOCAL lock_timeout`. The `balance >= 0` CHECK backs up
//! the executor's validator.

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::debug;

use super::{LedgerStore, LedgerTx};
use crate::ledger::error::StoreError;
use crate::ledger::state::TransferStatus;
use crate::ledger::types::{
    Account, AccountId, Amount, Currency, Entry, NewAccount, NewEntry, NewTransfer, Page,
    Transfer, TransferId,
};

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at, updated_at";
const ENTRY_COLUMNS: &str = "id, account_id, transfer_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, status, reason, \
                                idempotency_key, reversal_of, created_at";

pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self, lock_timeout: Duration) -> Result<Box<dyn LedgerTx>, StoreError> {
        let mut tx = self.pool.begin().await?;
        // SET does not take bind parameters; the value is an integer we format ourselves
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            lock_timeout.as_millis().max(1)
        ))
        .execute(&mut *tx)
        .await?;
        Ok(Box::new(PgLedgerTx { tx: Some(tx) }))
    }

    async fn create_account(&self, account: &NewAccount) -> Result<Account, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) \
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(&account.owner)
        .bind(account.balance)
        .bind(account.currency.as_str())
        .fetch_one(&self.pool)
        .await?;
        row_to_account(&row)
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_account).transpose()
    }

    async fn list_accounts(&self, page: Page) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id LIMIT $1 OFFSET $2"
        ))
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_account).collect()
    }

    async fn insert_transfer(&self, transfer: &NewTransfer) -> Result<Transfer, StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_transfer_on(&mut *conn, transfer).await
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn find_transfer_by_key(&self, key: &str) -> Result<Option<Transfer>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn find_reversal(&self, original: TransferId) -> Result<Option<Transfer>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE reversal_of = $1 AND status = $2"
        ))
        .bind(original)
        .bind(TransferStatus::Reversed.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn list_transfers(&self, page: Page) -> Result<Vec<Transfer>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers ORDER BY id LIMIT $1 OFFSET $2"
        ))
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_transfer).collect()
    }

    async fn list_entries(&self, page: Page) -> Result<Vec<Entry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries ORDER BY id LIMIT $1 OFFSET $2"
        ))
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn list_account_entries(
        &self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Entry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE account_id = $1 \
             ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(account_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn list_transfer_entries(
        &self,
        transfer_id: TransferId,
    ) -> Result<Vec<Entry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE transfer_id = $1 ORDER BY id"
        ))
        .bind(transfer_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entry).collect()
    }
}

/// One PostgreSQL transaction. `None` once committed or rolled back.
pub struct PgLedgerTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgLedgerTx {
    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(StoreError::Backend(
                "transaction already finished".to_string(),
            )),
        }
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let conn = self.conn()?;
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        debug!(account_id = id, found = row.is_some(), "Row lock acquired");
        row.as_ref().map(row_to_account).transpose()
    }

    async fn apply_balance_delta(
        &mut self,
        id: AccountId,
        delta: Amount,
    ) -> Result<Account, StoreError> {
        let conn = self.conn()?;
        let row = sqlx::query(&format!(
            "UPDATE accounts SET balance = balance + $1, updated_at = NOW() \
             WHERE id = $2 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(delta)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        match row {
            Some(row) => row_to_account(&row),
            None => Err(StoreError::NotFound(format!("account {}", id))),
        }
    }

    async fn insert_transfer(&mut self, transfer: &NewTransfer) -> Result<Transfer, StoreError> {
        let conn = self.conn()?;
        insert_transfer_on(conn, transfer).await
    }

    async fn set_transfer_status(
        &mut self,
        id: TransferId,
        expected: TransferStatus,
        next: TransferStatus,
    ) -> Result<Transfer, StoreError> {
        if !expected.can_transition_to(next) {
            return Err(StoreError::Constraint(format!(
                "illegal transfer transition {} -> {}",
                expected, next
            )));
        }
        let conn = self.conn()?;
        let row = sqlx::query(&format!(
            "UPDATE transfers SET status = $1 WHERE id = $2 AND status = $3 \
             RETURNING {TRANSFER_COLUMNS}"
        ))
        .bind(next.as_str())
        .bind(id)
        .bind(expected.as_str())
        .fetch_optional(&mut *conn)
        .await?;
        match row {
            Some(row) => row_to_transfer(&row),
            None => Err(StoreError::Constraint(format!(
                "transfer {} is not {}",
                id, expected
            ))),
        }
    }

    async fn insert_entry(&mut self, entry: &NewEntry) -> Result<Entry, StoreError> {
        let conn = self.conn()?;
        let row = sqlx::query(&format!(
            "INSERT INTO entries (account_id, transfer_id, amount) VALUES ($1, $2, $3) \
             RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(entry.account_id)
        .bind(entry.transfer_id)
        .bind(entry.amount)
        .fetch_one(&mut *conn)
        .await?;
        row_to_entry(&row)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => Ok(tx.commit().await?),
            None => Err(StoreError::Backend(
                "transaction already finished".to_string(),
            )),
        }
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => Ok(tx.rollback().await?),
            None => Ok(()),
        }
    }
}

async fn insert_transfer_on(
    conn: &mut PgConnection,
    transfer: &NewTransfer,
) -> Result<Transfer, StoreError> {
    let row = sqlx::query(&format!(
        "INSERT INTO transfers \
            (from_account_id, to_account_id, amount, status, reason, idempotency_key, reversal_of) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING {TRANSFER_COLUMNS}"
    ))
    .bind(transfer.from_account_id)
    .bind(transfer.to_account_id)
    .bind(transfer.amount)
    .bind(transfer.status.as_str())
    .bind(&transfer.reason)
    .bind(&transfer.idempotency_key)
    .bind(transfer.reversal_of)
    .fetch_one(&mut *conn)
    .await?;
    row_to_transfer(&row)
}

fn row_to_account(row: &PgRow) -> Result<Account, StoreError> {
    let currency: String = row.try_get("currency")?;
    let currency: Currency = currency
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("invalid currency: {}", currency)))?;

    Ok(Account {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        balance: row.try_get("balance")?,
        currency,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_entry(row: &PgRow) -> Result<Entry, StoreError> {
    Ok(Entry {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        transfer_id: row.try_get("transfer_id")?,
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_transfer(row: &PgRow) -> Result<Transfer, StoreError> {
    let status: String = row.try_get("status")?;
    let status = TransferStatus::from_db(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("invalid transfer status: {}", status)))?;

    Ok(Transfer {
        id: row.try_get("id")?,
        from_account_id: row.try_get("from_account_id")?,
        to_account_id: row.try_get("to_account_id")?,
        amount: row.try_get("amount")?,
        status,
        reason: row.try_get("reason")?,
        idempotency_key: row.try_get("idempotency_key")?,
        reversal_of: row.try_get("reversal_of")?,
        created_at: row.try_get("created_at")?,
    })
}
