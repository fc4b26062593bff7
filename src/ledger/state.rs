//! Transfer status state machine
//!
//! ```text
//! PENDING ─┬─▶ COMPLETED
//!          ├─▶ FAILED
//!          └─▶ REVERSED   (compensating transfers only)
//! ```
//!
//! PENDING only exists inside the executor's atomic unit. A completed
//! transfer is never mutated; undoing it creates a new REVERSED transfer.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Completed,
    Failed,
    Reversed,
}

impl TransferStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        match self {
            TransferStatus::Pending => false,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Reversed => true,
        }
    }

    /// Statuses only move forward out of PENDING
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        match (self, next) {
            (TransferStatus::Pending, TransferStatus::Completed)
            | (TransferStatus::Pending, TransferStatus::Failed)
            | (TransferStatus::Pending, TransferStatus::Reversed) => true,
            (TransferStatus::Pending, TransferStatus::Pending)
            | (TransferStatus::Completed, _)
            | (TransferStatus::Failed, _)
            | (TransferStatus::Reversed, _) => false,
        }
    }

    /// Storage representation (`transfers.status`)
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Reversed => "reversed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TransferStatus::Pending),
            "completed" => Some(TransferStatus::Completed),
            "failed" => Some(TransferStatus::Failed),
            "reversed" => Some(TransferStatus::Reversed),
            _ => None,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
