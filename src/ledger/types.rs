//! Ledger Core Types
//!
//! Accounts, entries and transfers as stored, plus the insert payloads the
//! executor hands to the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::ValidationError;
use super::state::TransferStatus;

pub type AccountId = i64;
pub type TransferId = i64;
pub type EntryId = i64;

/// Amount in minor currency units (cents, paise, yen)
pub type Amount = i64;

/// Account currency. Closed set, mirrored by the `accounts.currency` CHECK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    USD,
    EUR,
    INR,
    GBP,
    JPY,
}

impl Currency {
    pub const ALL: [Currency; 5] = [
        Currency::USD,
        Currency::EUR,
        Currency::INR,
        Currency::GBP,
        Currency::JPY,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::INR => "INR",
            Currency::GBP => "GBP",
            Currency::JPY => "JPY",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Currency {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USD" => Ok(Currency::USD),
            "EUR" => Ok(Currency::EUR),
            "INR" => Ok(Currency::INR),
            "GBP" => Ok(Currency::GBP),
            "JPY" => Ok(Currency::JPY),
            other => Err(ValidationError::UnknownCurrency(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner: String,
    pub balance: Amount,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One signed movement against one account. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub account_id: AccountId,
    pub transfer_id: TransferId,
    pub amount: Amount,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: Amount,
    pub status: TransferStatus,
    pub reason: Option<String>,
    pub idempotency_key: Option<String>,
    /// Set on compensating transfers: the completed transfer being undone
    pub reversal_of: Option<TransferId>,
    pub created_at: DateTime<Utc>,
}

/// Caller-facing transfer request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Amount,
    #[serde(default)]
    pub reason: Option<String>,
    /// Client-supplied key; a repeated key returns the original transfer
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl TransferRequest {
    pub fn new(from: AccountId, to: AccountId, amount: Amount) -> Self {
        Self {
            from,
            to,
            amount,
            reason: None,
            idempotency_key: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Shape checks that need no store access
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.from == self.to {
            return Err(ValidationError::SameAccount(self.from));
        }
        if self.amount <= 0 {
            return Err(ValidationError::NonPositiveAmount(self.amount));
        }
        if let Some(key) = &self.idempotency_key
            && (key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN)
        {
            return Err(ValidationError::InvalidIdempotencyKey);
        }
        Ok(())
    }
}

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub owner: String,
    pub balance: Amount,
    pub currency: Currency,
}

impl NewAccount {
    pub fn new(owner: impl Into<String>, balance: Amount, currency: Currency) -> Self {
        Self {
            owner: owner.into(),
            balance,
            currency,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.owner.trim().is_empty() {
            return Err(ValidationError::EmptyOwner);
        }
        if self.balance < 0 {
            return Err(ValidationError::NegativeOpeningBalance(self.balance));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransfer {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: Amount,
    pub status: TransferStatus,
    pub reason: Option<String>,
    pub idempotency_key: Option<String>,
    pub reversal_of: Option<TransferId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewEntry {
    pub account_id: AccountId,
    pub transfer_id: TransferId,
    pub amount: Amount,
}

/// limit + offset pagination, results ordered by id
///
/// Only constructed through [`Page::new`], deserialization included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPage")]
pub struct Page {
    limit: i64,
    offset: i64,
}

#[derive(Deserialize)]
struct RawPage {
    limit: i64,
    offset: i64,
}

impl TryFrom<RawPage> for Page {
    type Error = ValidationError;

    fn try_from(raw: RawPage) -> Result<Self, Self::Error> {
        Page::new(raw.limit, raw.offset)
    }
}

impl Page {
    pub const MAX_LIMIT: i64 = 1000;

    pub fn new(limit: i64, offset: i64) -> Result<Self, ValidationError> {
        if !(1..=Self::MAX_LIMIT).contains(&limit) || offset < 0 {
            return Err(ValidationError::InvalidPage { limit, offset });
        }
        Ok(Self { limit, offset })
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Index range into an id-ordered slice of `len` rows
    pub fn bounds(&self, len: usize) -> std::ops::Range<usize> {
        let start = (self.offset as usize).min(len);
        let end = start.saturating_add(self.limit as usize).min(len);
        start..end
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}
