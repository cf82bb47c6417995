//! # Outcomes
//!
//! The final disposition of a transaction and the envelope that carries it.
//!
//! ## Wire format
//!
//! ```text
//! {"id":"0190f5c2-7a3e-7c41-9d2b-5b1e8f0a6c3d","action":"c"}
//! ```
//!
//! `action` is a single character: `c` for commit, `r` for rollback. No
//! other fields are written, and unknown fields are ignored when reading so
//! other participants may extend the envelope.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{TransactionError, TransactionId};

/// Final disposition of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// Make the transaction's effects permanent.
    #[serde(rename = "c")]
    Commit,
    /// Undo the transaction's effects.
    #[serde(rename = "r")]
    Rollback,
}

impl Outcome {
    /// Single-character wire code.
    #[must_use]
    pub fn code(self) -> char {
        match self {
            Self::Commit => 'c',
            Self::Rollback => 'r',
        }
    }

    /// Lowercase name for logs and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope published for every outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeMessage {
    /// Transaction the outcome applies to.
    pub id: TransactionId,
    /// The outcome itself.
    pub action: Outcome,
}

impl OutcomeMessage {
    /// Create an envelope.
    #[must_use]
    pub fn new(id: TransactionId, action: Outcome) -> Self {
        Self { id, action }
    }

    /// Serialize to the JSON wire payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransactionError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a JSON wire payload.
    ///
    /// # Errors
    ///
    /// - `TransactionError::Codec` - invalid JSON, missing field, unknown
    ///   action code or an id that is not a valid routing key
    pub fn from_bytes(payload: &[u8]) -> Result<Self, TransactionError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Whether this envelope announces a commit.
    #[must_use]
    pub fn is_commit(&self) -> bool {
        self.action == Outcome::Commit
    }
}
