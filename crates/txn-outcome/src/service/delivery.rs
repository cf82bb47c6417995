//! # Delivery & Retry Coordinator
//!
//! One coordinator task per listener. It takes deliveries from the consumer
//! one at a time, runs the handler, and settles the delivery according to
//! the client's acknowledgement mode.
//!
//! | Mode | Handler `Ok` | Handler `Err` / panic | Undecodable payload |
//! |------|--------------|-----------------------|---------------------|
//! | auto-ack | consumed | lost (logged) | discarded (logged) |
//! | explicit-ack | `ack` | `nack`, requeued | `nack`, discarded |
//!
//! Under explicit ack a failing handler sees the same message again with
//! `attempt` incremented, without limit. Bounding retries is up to the
//! handler (inspect `attempt`) or to broker-side dead-lettering.
//!
//! ```text
//! Delivered ──handler Ok──→ Acknowledged
//!     ↑
//!     └── Redelivered ←── Rejected ←──handler Err──┘
//! ```

use std::sync::Arc;

use outcome_telemetry::{DELIVERIES, HANDLER_DURATION, HANDLER_FAILURES, LISTENERS_ACTIVE};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::domain::{HandlerError, OutcomeMessage};
use crate::ports::{AckMode, Channel, Consumer, Delivery, OutcomeDelivery, OutcomeHandler};

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handler succeeded and the delivery was acknowledged.
    Acked,
    /// Handler failed and the delivery went back to the queue.
    Requeued,
    /// The payload was not an outcome message and was dropped.
    Discarded,
    /// Auto-ack delivery handled successfully.
    Consumed,
    /// Auto-ack delivery whose handler failed. The message is gone.
    Lost,
    /// The broker refused the ack or nack.
    Unsettled,
}

impl Disposition {
    /// Metric label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::Requeued => "requeued",
            Self::Discarded => "discarded",
            Self::Consumed => "consumed",
            Self::Lost => "lost",
            Self::Unsettled => "unsettled",
        }
    }
}

/// Drives one listener endpoint.
pub(crate) struct DeliveryCoordinator {
    endpoint: String,
    ack_mode: AckMode,
    channel: Arc<dyn Channel>,
    handler: Arc<dyn OutcomeHandler>,
}

impl DeliveryCoordinator {
    pub(crate) fn new(
        endpoint: impl Into<String>,
        ack_mode: AckMode,
        channel: Arc<dyn Channel>,
        handler: Arc<dyn OutcomeHandler>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            ack_mode,
            channel,
            handler,
        }
    }

    /// Consume until shutdown is signalled or the broker ends the consumer.
    ///
    /// A delivery being handled when shutdown arrives is settled first.
    pub(crate) async fn run(self, mut consumer: Consumer, mut shutdown: watch::Receiver<bool>) {
        let consumer_tag = consumer.tag().to_string();
        LISTENERS_ACTIVE.inc();
        info!(
            endpoint = %self.endpoint,
            consumer = %consumer_tag,
            ack_mode = ?self.ack_mode,
            "Listener started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!(endpoint = %self.endpoint, "Shutdown signal received");
                    break;
                }
                delivery = consumer.recv() => {
                    match delivery {
                        Some(delivery) => {
                            self.process(delivery).await;
                        }
                        None => {
                            warn!(endpoint = %self.endpoint, "Consumer closed by broker");
                            break;
                        }
                    }
                }
            }
        }

        // Unsettled deliveries go back to the queue on cancel
        if let Err(e) = self.channel.cancel(&consumer_tag).await {
            debug!(endpoint = %self.endpoint, error = %e, "Consumer cancel failed");
        }
        if let Err(e) = self.channel.close().await {
            debug!(endpoint = %self.endpoint, error = %e, "Channel close failed");
        }

        LISTENERS_ACTIVE.dec();
        info!(endpoint = %self.endpoint, "Listener stopped");
    }

    /// Handle and settle one delivery.
    pub(crate) async fn process(&self, delivery: Delivery) -> Disposition {
        let delivery_tag = delivery.delivery_tag;
        let attempt = delivery.attempt;

        let message = match OutcomeMessage::from_bytes(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                error!(
                    endpoint = %self.endpoint,
                    delivery_tag,
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "Undecodable outcome payload"
                );
                let disposition = if self.ack_mode.is_explicit() {
                    self.settle(delivery_tag, Disposition::Discarded).await
                } else {
                    Disposition::Discarded
                };
                return self.record(disposition);
            }
        };

        let transaction_id = message.id.clone();
        let action = message.action;
        let result = self
            .invoke(OutcomeDelivery {
                message,
                endpoint: self.endpoint.clone(),
                delivery_tag,
                redelivered: delivery.redelivered,
                attempt,
            })
            .await;

        let disposition = match result {
            Ok(()) if self.ack_mode.is_explicit() => {
                self.settle(delivery_tag, Disposition::Acked).await
            }
            Ok(()) => Disposition::Consumed,
            Err(e) => {
                HANDLER_FAILURES
                    .with_label_values(&[self.endpoint.as_str()])
                    .inc();
                if self.ack_mode.is_explicit() {
                    warn!(
                        endpoint = %self.endpoint,
                        transaction_id = %transaction_id,
                        action = %action,
                        attempt,
                        error = %e,
                        "Handler failed, requeueing"
                    );
                    self.settle(delivery_tag, Disposition::Requeued).await
                } else {
                    warn!(
                        endpoint = %self.endpoint,
                        transaction_id = %transaction_id,
                        action = %action,
                        error = %e,
                        "Handler failed under auto-ack, outcome lost"
                    );
                    Disposition::Lost
                }
            }
        };

        debug!(
            endpoint = %self.endpoint,
            transaction_id = %transaction_id,
            delivery_tag,
            attempt,
            disposition = disposition.as_str(),
            "Delivery processed"
        );
        self.record(disposition)
    }

    /// Run the handler in its own task so a panic becomes a handler error.
    async fn invoke(&self, delivery: OutcomeDelivery) -> Result<(), HandlerError> {
        let handler = Arc::clone(&self.handler);
        let _timer = HANDLER_DURATION.start_timer();

        match tokio::spawn(async move { handler.handle(delivery).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(HandlerError::new("handler panicked")),
            Err(e) => Err(HandlerError::new(e)),
        }
    }

    /// Ack (for `Acked`) or nack the delivery; `Requeued` requeues.
    async fn settle(&self, delivery_tag: u64, intended: Disposition) -> Disposition {
        let result = match intended {
            Disposition::Acked => self.channel.ack(delivery_tag).await,
            Disposition::Requeued => self.channel.nack(delivery_tag, true).await,
            _ => self.channel.nack(delivery_tag, false).await,
        };

        match result {
            Ok(()) => intended,
            Err(e) => {
                error!(
                    endpoint = %self.endpoint,
                    delivery_tag,
                    intended = intended.as_str(),
                    error = %e,
                    "Failed to settle delivery"
                );
                Disposition::Unsettled
            }
        }
    }

    fn record(&self, disposition: Disposition) -> Disposition {
        DELIVERIES
            .with_label_values(&[self.endpoint.as_str(), disposition.as_str()])
            .inc();
        disposition
    }
}
