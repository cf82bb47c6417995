//! # Transaction Client
//!
//! The composition root a participant service constructs once and shares.
//!
//! ```text
//! ┌──────────────────────────── TransactionClient ────────────────────────────┐
//! │ config            url / exchange / ack mode                               │
//! │ connection        OnceCell<Arc<dyn Connection>>  (lazy, retried on fail)  │
//! │ exchange_ready    OnceCell<()>                   (asserted once)          │
//! │ listeners         endpoint -> coordinator task + shutdown signal          │
//! └───────────────────────────────────────────────────────────────────────────┘
//!            │ one channel per operation, one long-lived channel per listener
//!            ▼
//!      Arc<dyn Broker>
//! ```
//!
//! Nothing here is global: two clients on the same broker share only what the
//! broker itself stores.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::ClientConfig;
use crate::domain::{BrokerError, TransactionError, TransactionId};
use crate::ports::{Broker, Channel, Connection, ExchangeKind, ExchangeOptions};

/// Client for publishing outcomes and managing listeners.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct TransactionClient {
    broker: Arc<dyn Broker>,
    pub(super) config: ClientConfig,
    connection: OnceCell<Arc<dyn Connection>>,
    exchange_ready: OnceCell<()>,
    pub(super) listeners: Mutex<HashMap<String, ListenerSlot>>,
}

/// Registry entry for one endpoint consumed by this client.
pub(super) enum ListenerSlot {
    /// `create_listener` is declaring the queue and attaching.
    Starting,
    /// The coordinator task is consuming.
    Running(ListenerHandle),
}

/// Handle to a running delivery coordinator.
pub(super) struct ListenerHandle {
    pub(super) shutdown: watch::Sender<bool>,
    pub(super) task: JoinHandle<()>,
}

impl ListenerSlot {
    /// Whether this slot still blocks a new attach.
    pub(super) fn is_live(&self) -> bool {
        match self {
            Self::Starting => true,
            Self::Running(handle) => !handle.task.is_finished(),
        }
    }
}

impl ListenerHandle {
    /// Signal the coordinator and wait for it to release its consumer.
    pub(super) async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            debug!(error = %e, "Listener task ended abnormally");
        }
    }
}

impl TransactionClient {
    /// Create a client. No connection is made until the first operation.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Config`] if the configuration does not
    /// validate.
    pub fn new(broker: Arc<dyn Broker>, config: ClientConfig) -> Result<Self, TransactionError> {
        config.validate()?;
        Ok(Self {
            broker,
            config,
            connection: OnceCell::new(),
            exchange_ready: OnceCell::new(),
            listeners: Mutex::new(HashMap::new()),
        })
    }

    /// The configuration this client was built with.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Mint a new transaction identifier.
    #[must_use]
    pub fn generate_id(&self) -> TransactionId {
        TransactionId::generate()
    }

    /// Whether the broker connection has been established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.initialized()
    }

    /// The shared connection, established on first use.
    ///
    /// A failed connect leaves the cell empty so the next call tries again.
    async fn connection(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                let connection = self.broker.connect(&self.config.url).await?;
                debug!(url = %self.config.url, "Broker connection established");
                Ok::<_, BrokerError>(connection)
            })
            .await?;
        Ok(Arc::clone(connection))
    }

    /// Open a fresh channel on the shared connection.
    pub(super) async fn channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        self.connection().await?.open_channel().await
    }

    /// Assert the routing exchange, once per client.
    pub(super) async fn ensure_exchange(&self, channel: &dyn Channel) -> Result<(), BrokerError> {
        self.exchange_ready
            .get_or_try_init(|| async {
                channel
                    .assert_exchange(
                        &self.config.exchange,
                        ExchangeKind::Direct,
                        ExchangeOptions { durable: true },
                    )
                    .await
            })
            .await?;
        Ok(())
    }

    /// Close a per-operation channel. Failures only matter for the log.
    pub(super) async fn release(channel: Arc<dyn Channel>) {
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Channel close failed");
        }
    }
}
