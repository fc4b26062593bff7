//! Bank Ledger - Double-Entry Transfer Core
//!
//! Accounts, transfers and the entries backing them, with a transfer
//! executor that stays correct under concurrent load.
//!
//! # Modules
//!
//! - [`ledger`] - Domain types, transfer executor, entry recorder, queries
//! - [`store`] - Storage seam with PostgreSQL and in-memory backends
//! - [`db`] - Connection pool and schema
//! - [`config`] - YAML configuration
//! - [`logging`] - Tracing setup

pub mod config;
pub mod db;
pub mod ledger;
pub mod logging;
pub mod store;

// Convenient re-exports at crate root
pub use ledger::{
    Account, AccountId, Amount, Currency, Entry, LedgerQueries, NewAccount, Page, Transfer,
    TransferError, TransferExecutor, TransferId, TransferRequest, TransferStatus,
};
pub use store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
