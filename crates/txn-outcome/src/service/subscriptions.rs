//! # Subscription Manager
//!
//! Listener endpoints are durable queues; a binding routes one transaction id
//! to one endpoint. The broker's routing table is the only record of who
//! listens to what, so bindings survive restarts of every participant.
//!
//! `bind` and `unbind` declare what they need themselves and can be called
//! before or after `create_listener`.

use std::collections::HashMap;
use std::sync::Arc;

use outcome_telemetry::BINDING_CHANGES;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use super::client::{ListenerHandle, ListenerSlot, TransactionClient};
use super::delivery::DeliveryCoordinator;
use crate::domain::{BrokerError, TransactionError, TransactionId};
use crate::ports::{ConsumeOptions, OutcomeHandler, QueueOptions};

const ENDPOINT_QUEUE: QueueOptions = QueueOptions { durable: true };

impl TransactionClient {
    /// Declare the durable endpoint `endpoint` and start consuming it with
    /// `handler`.
    ///
    /// Declaring is idempotent; the endpoint may already exist and hold
    /// messages, which are delivered right away.
    ///
    /// # Errors
    ///
    /// - [`TransactionError::AlreadyConsuming`] if this client already
    ///   consumes `endpoint`
    /// - [`TransactionError::Connection`] / [`TransactionError::Channel`] for
    ///   broker failures
    pub async fn create_listener<H>(&self, endpoint: &str, handler: H) -> Result<(), TransactionError>
    where
        H: OutcomeHandler,
    {
        let reservation = Reservation::claim(&self.listeners, endpoint)?;
        let handle = self.start_listener(endpoint, Arc::new(handler)).await?;
        reservation.fulfil(handle);
        Ok(())
    }

    async fn start_listener(
        &self,
        endpoint: &str,
        handler: Arc<dyn OutcomeHandler>,
    ) -> Result<ListenerHandle, BrokerError> {
        let channel = self.channel().await?;
        let attached = async {
            self.ensure_exchange(channel.as_ref()).await?;
            let queue = channel.assert_queue(endpoint, ENDPOINT_QUEUE).await?;
            let consumer = channel
                .consume(
                    endpoint,
                    ConsumeOptions {
                        ack_mode: self.config.ack,
                    },
                )
                .await?;
            Ok::<_, BrokerError>((queue, consumer))
        }
        .await;
        let (queue, consumer) = match attached {
            Ok(attached) => attached,
            Err(e) => {
                Self::release(channel).await;
                return Err(e);
            }
        };

        info!(
            endpoint,
            pending = queue.message_count,
            consumers = queue.consumer_count + 1,
            "Listener attached"
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let coordinator = DeliveryCoordinator::new(endpoint, self.config.ack, channel, handler);
        let task = tokio::spawn(coordinator.run(consumer, shutdown_rx));
        Ok(ListenerHandle { shutdown, task })
    }

    /// Route outcomes for `id` to `endpoint`. Binding an existing pair again
    /// changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Connection`] or
    /// [`TransactionError::Channel`] for broker failures.
    pub async fn bind(&self, endpoint: &str, id: &TransactionId) -> Result<(), TransactionError> {
        let channel = self.channel().await?;
        let result = async {
            self.ensure_exchange(channel.as_ref()).await?;
            channel.assert_queue(endpoint, ENDPOINT_QUEUE).await?;
            channel
                .bind_queue(endpoint, &self.config.exchange, id.as_str())
                .await
        }
        .await;
        Self::release(channel).await;
        result?;

        BINDING_CHANGES.with_label_values(&["bind"]).inc();
        debug!(endpoint, transaction_id = %id, "Endpoint bound");
        Ok(())
    }

    /// Stop routing outcomes for `id` to `endpoint`. Unbinding a pair that is
    /// not bound is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Connection`] or
    /// [`TransactionError::Channel`] for broker failures.
    pub async fn unbind(&self, endpoint: &str, id: &TransactionId) -> Result<(), TransactionError> {
        let channel = self.channel().await?;
        let result = async {
            self.ensure_exchange(channel.as_ref()).await?;
            channel
                .unbind_queue(endpoint, &self.config.exchange, id.as_str())
                .await
        }
        .await;
        Self::release(channel).await;
        result?;

        BINDING_CHANGES.with_label_values(&["unbind"]).inc();
        debug!(endpoint, transaction_id = %id, "Endpoint unbound");
        Ok(())
    }

    /// Stop consuming `endpoint`. Deliveries not yet settled return to the
    /// queue; the endpoint and its bindings stay.
    ///
    /// Returns `false` if this client was not consuming `endpoint`.
    pub async fn cancel_listener(&self, endpoint: &str) -> bool {
        let handle = {
            let mut listeners = self.listeners.lock();
            match listeners.remove(endpoint) {
                Some(ListenerSlot::Running(handle)) => handle,
                Some(ListenerSlot::Starting) => {
                    // Still attaching; leave it to create_listener
                    listeners.insert(endpoint.to_string(), ListenerSlot::Starting);
                    return false;
                }
                None => return false,
            }
        };

        let was_running = !handle.task.is_finished();
        handle.stop().await;
        info!(endpoint, "Listener cancelled");
        was_running
    }

    /// Endpoints this client is currently consuming, sorted.
    #[must_use]
    pub fn active_listeners(&self) -> Vec<String> {
        let listeners = self.listeners.lock();
        let mut active: Vec<String> = listeners
            .iter()
            .filter(|(_, slot)| matches!(slot, ListenerSlot::Running(_)) && slot.is_live())
            .map(|(endpoint, _)| endpoint.clone())
            .collect();
        active.sort();
        active
    }

    /// Cancel every listener and wait for them to stop.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, ListenerHandle)> = {
            let mut listeners = self.listeners.lock();
            let endpoints: Vec<String> = listeners
                .iter()
                .filter(|(_, slot)| matches!(slot, ListenerSlot::Running(_)))
                .map(|(endpoint, _)| endpoint.clone())
                .collect();
            endpoints
                .into_iter()
                .filter_map(|endpoint| match listeners.remove(&endpoint) {
                    Some(ListenerSlot::Running(handle)) => Some((endpoint, handle)),
                    _ => None,
                })
                .collect()
        };

        for (endpoint, handle) in handles {
            handle.stop().await;
            debug!(endpoint = %endpoint, "Listener stopped on shutdown");
        }
        info!("Transaction client shut down");
    }
}

/// A `Starting` slot held while `create_listener` attaches.
///
/// Dropping it unfulfilled, whether on error or because the caller abandoned
/// the future, frees the endpoint again.
struct Reservation<'a> {
    listeners: &'a Mutex<HashMap<String, ListenerSlot>>,
    endpoint: &'a str,
    fulfilled: bool,
}

impl<'a> Reservation<'a> {
    fn claim(
        listeners: &'a Mutex<HashMap<String, ListenerSlot>>,
        endpoint: &'a str,
    ) -> Result<Self, TransactionError> {
        let mut slots = listeners.lock();
        if slots.get(endpoint).is_some_and(ListenerSlot::is_live) {
            return Err(TransactionError::AlreadyConsuming {
                endpoint: endpoint.to_string(),
            });
        }
        slots.insert(endpoint.to_string(), ListenerSlot::Starting);
        Ok(Self {
            listeners,
            endpoint,
            fulfilled: false,
        })
    }

    fn fulfil(mut self, handle: ListenerHandle) {
        self.listeners
            .lock()
            .insert(self.endpoint.to_string(), ListenerSlot::Running(handle));
        self.fulfilled = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.fulfilled {
            return;
        }
        let mut slots = self.listeners.lock();
        if matches!(slots.get(self.endpoint), Some(ListenerSlot::Starting)) {
            slots.remove(self.endpoint);
            debug!(endpoint = self.endpoint, "Listener attach abandoned");
        }
    }
}
