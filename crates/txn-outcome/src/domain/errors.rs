//! # Error Types
//!
//! Failures surfaced by the protocol.
//!
//! | Type | Raised by | Propagation |
//! |------|-----------|-------------|
//! | `BrokerError` | Broker adapters | Mapped into `TransactionError` |
//! | `TransactionError` | Client operations | Returned to the caller |
//! | `HandlerError` | Listener handlers | Drives ack/requeue, never returned |

use thiserror::Error;

use super::TransactionId;

/// Errors reported by a [`Broker`](crate::ports::Broker) implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker cannot be reached or refused the connection.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// A channel-level operation failed (conflicting declaration, unknown
    /// delivery tag, missing exchange).
    #[error("Channel error: {0}")]
    Channel(String),
}

/// Errors returned by [`TransactionClient`](crate::TransactionClient) operations.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Cannot reach or authenticate to the broker. Every operation fails
    /// with this until a connect succeeds.
    #[error("Broker connection failed: {0}")]
    Connection(String),

    /// A channel operation failed for this call only.
    #[error("Channel operation failed: {0}")]
    Channel(String),

    /// The outcome could not be handed to the broker.
    #[error("Failed to publish outcome for {id}: {source}")]
    Publish {
        /// Transaction the outcome belonged to.
        id: TransactionId,
        /// Underlying broker failure.
        #[source]
        source: BrokerError,
    },

    /// A transaction id is not usable as a routing key.
    #[error("Invalid transaction id: {0}")]
    InvalidId(String),

    /// An outcome message failed to encode or decode.
    #[error("Invalid outcome message: {0}")]
    Codec(#[from] serde_json::Error),

    /// This client already consumes the endpoint.
    #[error("Listener endpoint '{endpoint}' is already being consumed by this client")]
    AlreadyConsuming {
        /// Endpoint (queue) name.
        endpoint: String,
    },

    /// Client configuration is unusable.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<BrokerError> for TransactionError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Connection(msg) => Self::Connection(msg),
            BrokerError::Channel(msg) => Self::Channel(msg),
        }
    }
}

/// Failure signalled by a listener handler.
///
/// Under explicit acknowledgement this rejects the delivery and the broker
/// redelivers it. Under auto-ack the message is already gone and the
/// failure is only logged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Create a handler error from any displayable reason.
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }

    /// The failure reason.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{:#}", err))
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
