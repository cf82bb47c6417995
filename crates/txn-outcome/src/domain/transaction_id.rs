//! # Transaction Identifiers
//!
//! Ids are UUIDv7 values in lowercase hyphenated form. The leading 48 bits
//! are a millisecond timestamp, so lexicographic order of the strings is
//! creation order. Within one process a monotonic guard makes that order
//! strict even for ids minted in the same millisecond.
//!
//! Ids received from other participants are opaque: anything that is a valid
//! routing key is accepted.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{const_mutex, Mutex};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TransactionError;

/// Longest routing key an AMQP broker accepts.
pub const MAX_ID_LEN: usize = 255;

/// Last UUID handed out by [`TransactionId::generate`] in this process.
static LAST_ISSUED: Mutex<u128> = const_mutex(0);

/// Globally unique, time-ordered transaction identifier.
///
/// Also used verbatim as the routing key of every outcome message for the
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransactionId(String);

impl TransactionId {
    /// Mint a new identifier.
    ///
    /// Never fails and never blocks beyond a short uncontended lock.
    #[must_use]
    pub fn generate() -> Self {
        let candidate = Uuid::now_v7().as_u128();

        let issued = {
            let mut last = LAST_ISSUED.lock();
            let next = if candidate > *last {
                candidate
            } else {
                // Same millisecond or the clock stepped back
                last.wrapping_add(1)
            };
            *last = next;
            next
        };

        Self(Uuid::from_u128(issued).hyphenated().to_string())
    }

    /// Accept an identifier produced elsewhere.
    ///
    /// # Errors
    ///
    /// - `TransactionError::InvalidId` - empty, or longer than [`MAX_ID_LEN`] bytes
    pub fn parse(raw: &str) -> Result<Self, TransactionError> {
        if raw.is_empty() {
            return Err(TransactionError::InvalidId(
                "transaction id must not be empty".to_string(),
            ));
        }
        if raw.len() > MAX_ID_LEN {
            return Err(TransactionError::InvalidId(format!(
                "transaction id is {} bytes, routing keys are limited to {}",
                raw.len(),
                MAX_ID_LEN
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// The id as a routing key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Creation time embedded in a time-based UUID (v1, v6 or v7).
    ///
    /// Returns `None` for ids that are not time-based UUIDs.
    #[must_use]
    pub fn created_at(&self) -> Option<SystemTime> {
        let uuid = Uuid::parse_str(&self.0).ok()?;
        let (secs, nanos) = uuid.get_timestamp()?.to_unix();
        UNIX_EPOCH.checked_add(Duration::new(secs, nanos))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TransactionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TransactionId {
    type Error = TransactionError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<TransactionId> for String {
    fn from(id: TransactionId) -> Self {
        id.0
    }
}

impl std::str::FromStr for TransactionId {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
