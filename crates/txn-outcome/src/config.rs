//! Client configuration.

use std::env;

use serde::{Deserialize, Serialize};

use crate::domain::TransactionError;
use crate::ports::AckMode;

/// Default broker connection string.
pub const DEFAULT_URL: &str = "amqp://localhost";

/// Default routing exchange name.
pub const DEFAULT_EXCHANGE: &str = "transactions";

/// Settings for a [`TransactionClient`](crate::TransactionClient).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker connection string
    pub url: String,
    /// Routing exchange every outcome passes through
    pub exchange: String,
    /// Acknowledgement discipline for every listener of this client
    pub ack: AckMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            ack: AckMode::Auto,
        }
    }
}

impl ClientConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TXN_BROKER_URL`: Broker url (default: amqp://localhost)
    /// - `TXN_EXCHANGE`: Routing exchange (default: transactions)
    /// - `TXN_ACK`: `true`, `1` or `explicit` selects explicit ack (default: auto-ack)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            url: lookup("TXN_BROKER_URL").unwrap_or(defaults.url),
            exchange: lookup("TXN_EXCHANGE").unwrap_or(defaults.exchange),
            ack: lookup("TXN_ACK")
                .map(|v| {
                    let v = v.to_lowercase();
                    AckMode::from_flag(v == "true" || v == "1" || v == "explicit")
                })
                .unwrap_or(defaults.ack),
        }
    }

    /// Set the broker url.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the routing exchange.
    #[must_use]
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Set the acknowledgement mode.
    #[must_use]
    pub fn with_ack_mode(mut self, ack: AckMode) -> Self {
        self.ack = ack;
        self
    }

    /// Shorthand for `with_ack_mode(AckMode::Explicit)`.
    #[must_use]
    pub fn with_explicit_ack(self) -> Self {
        self.with_ack_mode(AckMode::Explicit)
    }

    /// Check the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Config`] for an empty url or exchange.
    pub fn validate(&self) -> Result<(), TransactionError> {
        if self.url.trim().is_empty() {
            return Err(TransactionError::Config("broker url is empty".to_string()));
        }
        if self.exchange.trim().is_empty() {
            return Err(TransactionError::Config("exchange name is empty".to_string()));
        }
        Ok(())
    }
}
