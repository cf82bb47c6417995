//! # Outcome Publisher
//!
//! Announces a commit or rollback through the routing exchange, using the
//! transaction id as routing key. Publishing is fire-and-forget: the call
//! returns once the broker has accepted the message, and an outcome for an
//! id nobody is bound to is dropped by the broker.

use outcome_telemetry::{log_outcome_event, OUTCOMES_PUBLISHED, PUBLISH_FAILURES};

use super::TransactionClient;
use crate::domain::{BrokerError, Outcome, OutcomeMessage, TransactionError, TransactionId};

impl TransactionClient {
    /// Publish `outcome` for transaction `id`.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Publish`] if no connection or channel can
    /// be established, the exchange cannot be asserted, or the broker refuses
    /// the message.
    pub async fn publish(&self, id: &TransactionId, outcome: Outcome) -> Result<(), TransactionError> {
        let payload = OutcomeMessage::new(id.clone(), outcome).to_bytes()?;

        match self.send(id, payload).await {
            Ok(()) => {
                OUTCOMES_PUBLISHED.with_label_values(&[outcome.as_str()]).inc();
                log_outcome_event!(
                    debug,
                    "Outcome published",
                    id,
                    outcome,
                    exchange = %self.config.exchange
                );
                Ok(())
            }
            Err(source) => {
                PUBLISH_FAILURES.inc();
                log_outcome_event!(warn, "Outcome publish failed", id, outcome, error = %source);
                Err(TransactionError::Publish {
                    id: id.clone(),
                    source,
                })
            }
        }
    }

    /// Announce that transaction `id` committed.
    ///
    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub async fn commit(&self, id: &TransactionId) -> Result<(), TransactionError> {
        self.publish(id, Outcome::Commit).await
    }

    /// Announce that transaction `id` rolled back.
    ///
    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub async fn rollback(&self, id: &TransactionId) -> Result<(), TransactionError> {
        self.publish(id, Outcome::Rollback).await
    }

    async fn send(&self, id: &TransactionId, payload: Vec<u8>) -> Result<(), BrokerError> {
        let channel = self.channel().await?;
        let result = async {
            self.ensure_exchange(channel.as_ref()).await?;
            channel
                .publish(&self.config.exchange, id.as_str(), payload)
                .await
        }
        .await;
        Self::release(channel).await;
        result
    }
}
