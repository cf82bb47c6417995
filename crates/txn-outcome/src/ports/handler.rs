//! # Listener Handlers
//!
//! A handler processes one outcome and reports success or failure. The
//! delivery coordinator turns that report into an ack or a requeue.
//!
//! Async closures work directly:
//!
//! ```rust,ignore
//! client
//!     .create_listener("billing", |delivery: OutcomeDelivery| async move {
//!         ledger.apply(&delivery.message).await?;
//!         Ok(())
//!     })
//!     .await?;
//! ```

use std::future::Future;

use async_trait::async_trait;

use crate::domain::{HandlerError, OutcomeMessage};

/// A decoded outcome together with its delivery metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeDelivery {
    /// The outcome envelope.
    pub message: OutcomeMessage,
    /// Listener endpoint the message arrived on.
    pub endpoint: String,
    /// Broker delivery tag.
    pub delivery_tag: u64,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
    /// 1-based attempt counter. Handlers can use it to back off or to give
    /// up after N attempts; the protocol itself retries without limit.
    pub attempt: u32,
}

/// Capability to process one outcome message.
#[async_trait]
pub trait OutcomeHandler: Send + Sync + 'static {
    /// Process the delivery. `Err` requests redelivery under explicit ack.
    async fn handle(&self, delivery: OutcomeDelivery) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> OutcomeHandler for F
where
    F: Fn(OutcomeDelivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, delivery: OutcomeDelivery) -> Result<(), HandlerError> {
        (self)(delivery).await
    }
}
