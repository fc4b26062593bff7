//! Transfer Executor
//!
//! Runs one transfer end-to-end as a single atomic unit against the store:
//!
//! ```text
//! validate request ──▶ (idempotency lookup) ──▶ pre-check accounts
//!        │                                         │ can_debit(unlocked bal)
//!        │                                         └─ insufficient ─▶ persist FAILED
//!        ▼
//! ┌──────────────────── atomic unit ─────────────────────┐
//! │ lock accounts in LockOrder ─▶ can_debit(locked bal)  │
//! │    ├─ insufficient ─▶ rollback ─▶ persist FAILED     │
//! │    └─ ok ─▶ insert PENDING ─▶ debit / credit         │
//! │            ─▶ EntryRecorder ─▶ COMPLETED ─▶ commit   │
//! └──────────────────────────────────────────────────────┘
//!        │ Conflict (lock timeout, serialization, unit timeout)
//!        ▼
//! retry whole unit with backoff, up to max_attempts
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Lock order**: both account rows are locked in ascending id order on
//!    every path, reversals included
//! 2. **Validate under lock**: the debit check uses the balance read after the
//!    lock was granted
//! 3. **All or nothing**: balances, entries and the transfer row commit together;
//!    a failed or abandoned unit leaves no PENDING row behind
//! 4. **One key, one transfer**: a replayed idempotency key only returns the
//!    stored transfer when accounts and amount match
//!
//! The unlocked pre-check may only reject. A passing pre-check still goes
//! through the locked check, which is the one that decides.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::store::{LedgerStore, LedgerTx};

use super::error::{StoreError, TransferError, ValidationError};
use super::lock_order::LockOrder;
use super::recorder::EntryRecorder;
use super::retry::RetryPolicy;
use super::state::TransferStatus;
use super::types::{Account, AccountId, Amount, NewTransfer, Transfer, TransferId, TransferRequest};
use super::validator::can_debit;

/// A funds movement the executor is about to run: a plain transfer or a
/// compensating one
#[derive(Debug, Clone)]
struct Movement {
    from: AccountId,
    to: AccountId,
    amount: Amount,
    reason: Option<String>,
    idempotency_key: Option<String>,
    reversal_of: Option<TransferId>,
}

impl Movement {
    fn success_status(&self) -> TransferStatus {
        match self.reversal_of {
            Some(_) => TransferStatus::Reversed,
            None => TransferStatus::Completed,
        }
    }

    fn row(&self, status: TransferStatus, reason: Option<String>) -> NewTransfer {
        NewTransfer {
            from_account_id: self.from,
            to_account_id: self.to,
            amount: self.amount,
            status,
            reason,
            idempotency_key: self.idempotency_key.clone(),
            reversal_of: self.reversal_of,
        }
    }

    /// Same accounts and amount as a stored transfer
    fn matches(&self, transfer: &Transfer) -> bool {
        transfer.from_account_id == self.from
            && transfer.to_account_id == self.to
            && transfer.amount == self.amount
    }

    /// A second apply after an unknown commit is caught by a unique constraint
    fn replay_safe(&self) -> bool {
        self.idempotency_key.is_some() || self.reversal_of.is_some()
    }

    fn context(&self) -> String {
        format!(
            "transfer {} -> {} amount {}",
            self.from, self.to, self.amount
        )
    }
}

/// What one atomic unit ended with, short of a store error
#[derive(Debug)]
enum UnitOutcome {
    Committed(Transfer),
    InsufficientFunds { balance: Amount },
    MissingAccount(AccountId),
}

pub struct TransferExecutor {
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
    lock_timeout: Duration,
    unit_timeout: Duration,
}

impl TransferExecutor {
    pub fn new(store: Arc<dyn LedgerStore>, config: &ExecutorConfig) -> Self {
        Self {
            store,
            retry: config.retry_policy(),
            lock_timeout: config.lock_timeout(),
            unit_timeout: config.unit_timeout(),
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Move `amount` from `from` to `to`
    ///
    /// Returns the transfer row: `completed` on success, `failed` when the
    /// source balance was insufficient. `Err` means the request was invalid
    /// or the system could not process it.
    pub async fn execute(&self, request: TransferRequest) -> Result<Transfer, TransferError> {
        request.validate()?;

        let movement = Movement {
            from: request.from,
            to: request.to,
            amount: request.amount,
            reason: request.reason,
            idempotency_key: request.idempotency_key,
            reversal_of: None,
        };

        if let Some(key) = &movement.idempotency_key
            && let Some(existing) = self.find_by_key(key).await?
        {
            debug!(transfer_id = existing.id, key = %key, "Idempotent replay");
            return replay(&movement, key, existing);
        }

        self.start(movement).await
    }

    /// Compensate a completed transfer with a new `reversed` transfer in the
    /// opposite direction. The original row is left untouched.
    pub async fn reverse(
        &self,
        transfer_id: TransferId,
        reason: Option<String>,
    ) -> Result<Transfer, TransferError> {
        let original = self
            .store
            .get_transfer(transfer_id)
            .await
            .map_err(|e| TransferError::persistence(format!("load transfer {}", transfer_id), e))?
            .ok_or(TransferError::TransferNotFound(transfer_id))?;

        if original.status != TransferStatus::Completed {
            return Err(TransferError::NotReversible {
                transfer_id,
                status: original.status,
            });
        }
        self.ensure_not_reversed(transfer_id).await?;

        let movement = Movement {
            from: original.to_account_id,
            to: original.from_account_id,
            amount: original.amount,
            reason: Some(reason.unwrap_or_else(|| format!("reversal of transfer {}", transfer_id))),
            idempotency_key: None,
            reversal_of: Some(transfer_id),
        };
        self.start(movement).await
    }

    /// Pre-checks, then the locked unit
    async fn start(&self, movement: Movement) -> Result<Transfer, TransferError> {
        let source = self.precheck_accounts(&movement).await?;
        if !can_debit(source.balance, movement.amount) {
            debug!(
                from = movement.from,
                balance = source.balance,
                amount = movement.amount,
                "Insufficient funds before locking"
            );
            return self.record_insufficient_funds(&movement, source.balance).await;
        }
        self.run(movement).await
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Transfer>, TransferError> {
        self.store
            .find_transfer_by_key(key)
            .await
            .map_err(|e| TransferError::persistence(format!("idempotency lookup {}", key), e))
    }

    async fn ensure_not_reversed(&self, transfer_id: TransferId) -> Result<(), TransferError> {
        let reversal = self.store.find_reversal(transfer_id).await.map_err(|e| {
            TransferError::persistence(format!("reversal lookup {}", transfer_id), e)
        })?;
        match reversal {
            Some(reversal) => Err(TransferError::AlreadyReversed {
                transfer_id,
                reversal_id: reversal.id,
            }),
            None => Ok(()),
        }
    }

    /// Existence and currency checks, before any lock is taken. Returns the
    /// source account as last committed.
    async fn precheck_accounts(&self, movement: &Movement) -> Result<Account, TransferError> {
        let from = self.load_account(movement.from, movement).await?;
        let to = self.load_account(movement.to, movement).await?;
        if from.currency != to.currency {
            return Err(ValidationError::CurrencyMismatch {
                from: from.currency,
                to: to.currency,
            }
            .into());
        }
        Ok(from)
    }

    async fn load_account(
        &self,
        id: AccountId,
        movement: &Movement,
    ) -> Result<Account, TransferError> {
        self.store
            .get_account(id)
            .await
            .map_err(|e| TransferError::persistence(movement.context(), e))?
            .ok_or(TransferError::AccountNotFound(id))
    }

    /// Retry loop around the atomic unit
    ///
    /// A unit timeout is a retryable conflict, except once the commit was
    /// sent: the server may have applied it without us seeing the ack.
    /// Retrying then is only safe when a unique constraint (idempotency key,
    /// single reversal) stops the second apply. A plain transfer gets
    /// `CommitUnknown` instead.
    async fn run(&self, movement: Movement) -> Result<Transfer, TransferError> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let committing = AtomicBool::new(false);
            let unit = self.run_unit(&movement, &committing);
            let result = match tokio::time::timeout(self.unit_timeout, unit).await {
                Ok(result) => result,
                Err(_) if committing.load(Ordering::Acquire) && !movement.replay_safe() => {
                    warn!(
                        from = movement.from,
                        to = movement.to,
                        amount = movement.amount,
                        attempt,
                        "Unit timed out during commit, not retrying"
                    );
                    Err(StoreError::CommitUnknown(
                        "atomic unit timed out waiting for commit".to_string(),
                    ))
                }
                Err(_) => Err(StoreError::Conflict("atomic unit timed out".to_string())),
            };

            match result {
                Ok(UnitOutcome::Committed(transfer)) => {
                    info!(
                        transfer_id = transfer.id,
                        from = movement.from,
                        to = movement.to,
                        amount = movement.amount,
                        status = %transfer.status,
                        attempt,
                        "Transfer committed"
                    );
                    return Ok(transfer);
                }
                Ok(UnitOutcome::InsufficientFunds { balance }) => {
                    return self.record_insufficient_funds(&movement, balance).await;
                }
                Ok(UnitOutcome::MissingAccount(id)) => {
                    return Err(TransferError::AccountNotFound(id));
                }
                Err(StoreError::Conflict(detail)) => {
                    if !self.retry.should_retry(attempt) {
                        warn!(
                            from = movement.from,
                            to = movement.to,
                            amount = movement.amount,
                            attempts = attempt,
                            "Transfer abandoned after repeated conflicts"
                        );
                        return Err(TransferError::ConcurrencyConflict {
                            from: movement.from,
                            to: movement.to,
                            amount: movement.amount,
                            attempts: attempt,
                        });
                    }
                    let delay = self.retry.delay(attempt);
                    debug!(
                        from = movement.from,
                        to = movement.to,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        detail = %detail,
                        "Retrying transfer after conflict"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(StoreError::Duplicate(detail)) => {
                    return self.resolve_duplicate(&movement, detail).await;
                }
                Err(e) => return Err(TransferError::persistence(movement.context(), e)),
            }
        }
    }

    /// One attempt. Commits on success, rolls back otherwise.
    async fn run_unit(
        &self,
        movement: &Movement,
        committing: &AtomicBool,
    ) -> Result<UnitOutcome, StoreError> {
        let mut tx = self.store.begin(self.lock_timeout).await?;

        match self.apply(tx.as_mut(), movement).await {
            Ok(UnitOutcome::Committed(transfer)) => {
                committing.store(true, Ordering::Release);
                tx.commit().await?;
                Ok(UnitOutcome::Committed(transfer))
            }
            Ok(outcome) => {
                tx.rollback().await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed unit also failed");
                }
                Err(e)
            }
        }
    }

    /// The writes of one unit. `Committed` here means "ready to commit".
    async fn apply(
        &self,
        tx: &mut dyn LedgerTx,
        movement: &Movement,
    ) -> Result<UnitOutcome, StoreError> {
        let mut source = None;
        for id in LockOrder::of(movement.from, movement.to).sequence() {
            match tx.lock_account(id).await? {
                Some(account) if id == movement.from => source = Some(account),
                Some(_) => {}
                None => return Ok(UnitOutcome::MissingAccount(id)),
            }
        }
        let source = source.ok_or_else(|| StoreError::NotFound(format!("account {}", movement.from)))?;

        if !can_debit(source.balance, movement.amount) {
            return Ok(UnitOutcome::InsufficientFunds {
                balance: source.balance,
            });
        }

        let pending = tx
            .insert_transfer(&movement.row(TransferStatus::Pending, movement.reason.clone()))
            .await?;
        tx.apply_balance_delta(movement.from, -movement.amount).await?;
        tx.apply_balance_delta(movement.to, movement.amount).await?;
        EntryRecorder::record(tx, pending.id, movement.from, movement.to, movement.amount).await?;
        let transfer = tx
            .set_transfer_status(pending.id, TransferStatus::Pending, movement.success_status())
            .await?;

        Ok(UnitOutcome::Committed(transfer))
    }

    /// Persist the business-rule rejection. No balance was touched.
    async fn record_insufficient_funds(
        &self,
        movement: &Movement,
        balance: Amount,
    ) -> Result<Transfer, TransferError> {
        let rejection = TransferError::InsufficientFunds {
            account_id: movement.from,
            balance,
            amount: movement.amount,
        };
        let reason = match &movement.reason {
            Some(requested) => format!("{} ({})", rejection, requested),
            None => rejection.to_string(),
        };

        match self
            .store
            .insert_transfer(&movement.row(TransferStatus::Failed, Some(reason)))
            .await
        {
            Ok(transfer) => {
                info!(
                    transfer_id = transfer.id,
                    from = movement.from,
                    to = movement.to,
                    amount = movement.amount,
                    balance,
                    "Transfer failed: insufficient funds"
                );
                Ok(transfer)
            }
            Err(StoreError::Duplicate(detail)) => self.resolve_duplicate(movement, detail).await,
            Err(e) => Err(TransferError::persistence(movement.context(), e)),
        }
    }

    /// A unique constraint fired: a concurrent request with the same
    /// idempotency key, or a concurrent reversal of the same transfer, won
    async fn resolve_duplicate(
        &self,
        movement: &Movement,
        detail: String,
    ) -> Result<Transfer, TransferError> {
        if let Some(original) = movement.reversal_of {
            self.ensure_not_reversed(original).await?;
        }
        if let Some(key) = &movement.idempotency_key
            && let Some(existing) = self.find_by_key(key).await?
        {
            debug!(transfer_id = existing.id, key = %key, "Lost idempotency race, returning winner");
            return replay(movement, key, existing);
        }
        Err(TransferError::persistence(
            movement.context(),
            StoreError::Duplicate(detail),
        ))
    }
}

/// Hand back the transfer already stored under `key`, if it is the same one
fn replay(movement: &Movement, key: &str, existing: Transfer) -> Result<Transfer, TransferError> {
    if movement.matches(&existing) {
        return Ok(existing);
    }
    warn!(
        key = %key,
        transfer_id = existing.id,
        from = movement.from,
        to = movement.to,
        amount = movement.amount,
        "Idempotency key reused for a different transfer"
    );
    Err(ValidationError::IdempotencyKeyReused {
        key: key.to_string(),
        transfer_id: existing.id,
    }
    .into())
}
