//! Double-Entry Ledger
//!
//! Accounts hold balances in one currency. Every completed transfer moves
//! funds between exactly two accounts and is backed by a pair of entries
//! summing to zero.
//!
//! # Transfer Lifecycle
//!
//! ```text
//! PENDING → COMPLETED
//!    ↓
//!  FAILED            (insufficient funds, no money moved)
//!
//! PENDING → REVERSED (compensating transfer for a COMPLETED one)
//! ```
//!
//! PENDING never outlives the atomic unit that created it.
//!
//! # Safety Invariants
//!
//! 1. **Conservation**: the sum of all balances only changes when accounts open
//! 2. **Non-negative**: no committed balance is below zero
//! 3. **Lock Order**: account rows are always locked lowest id first
//! 4. **Paired Entries**: each completed or reversed transfer has one debit and
//!    one credit of equal magnitude, and a failed transfer has none

pub mod error;
pub mod executor;
pub mod lock_order;
pub mod queries;
pub mod recorder;
pub mod retry;
pub mod state;
pub mod types;
pub mod validator;


pub use error::{ErrorClass, StoreError, TransferError, ValidationError};
pub use executor::TransferExecutor;
pub use lock_order::LockOrder;
pub use queries::LedgerQueries;
pub use recorder::EntryRecorder;
pub use retry::RetryPolicy;
pub use state::TransferStatus;
pub use types::{
    Account, AccountId, Amount, Currency, Entry, EntryId, NewAccount, NewEntry, NewTransfer, Page,
    Transfer, TransferId, TransferRequest,
};
