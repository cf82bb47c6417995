//! # Broker Port
//!
//! The narrow slice of an AMQP-style broker the protocol relies on.
//!
//! ```text
//! Broker ──connect(url)──→ Connection ──open_channel()──→ Channel
//!                                                           │
//!      assert_exchange / assert_queue / bind_queue / unbind_queue
//!      publish / consume → Consumer / ack / nack / cancel / close
//! ```
//!
//! Adapters own queue durability, routing and redelivery. The protocol keeps
//! no routing state of its own.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::Stream;

use crate::domain::BrokerError;

/// Entry point of a broker implementation.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a connection to the broker at `url`.
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, BrokerError>;
}

/// A live broker connection. Cheap to share; channels are opened from it.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a new channel on this connection.
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;
}

/// A channel: the unit on which declarations, publishes and consumers live.
///
/// Delivery tags are scoped to the channel that received them.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare an exchange if absent. Re-declaring with the same properties
    /// is a no-op; different properties are a channel error.
    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError>;

    /// Declare a queue if absent, same idempotence rules as exchanges.
    async fn assert_queue(&self, name: &str, options: QueueOptions)
        -> Result<QueueInfo, BrokerError>;

    /// Route messages published to `exchange` with `routing_key` into `queue`.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Remove a binding. Missing bindings are not an error.
    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Hand a message to the broker. Returns once the broker has accepted it
    /// for routing, whether or not any queue was bound.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError>;

    /// Start consuming `queue`.
    async fn consume(&self, queue: &str, options: ConsumeOptions)
        -> Result<Consumer, BrokerError>;

    /// Acknowledge an explicit-ack delivery; the broker forgets the message.
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Reject an explicit-ack delivery. With `requeue` the broker redelivers
    /// it, otherwise it is discarded (or dead-lettered by broker policy).
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Stop a consumer. Its unacknowledged deliveries return to the queue.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Close the channel, cancelling every consumer on it.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Exchange routing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Exact routing-key match.
    Direct,
    /// Every bound queue, routing key ignored.
    Fanout,
}

impl ExchangeKind {
    /// AMQP name of the exchange type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
        }
    }
}

/// Exchange declaration options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExchangeOptions {
    /// Survive broker restarts.
    pub durable: bool,
}

/// Queue declaration options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    /// Survive broker restarts.
    pub durable: bool,
}

/// Result of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    /// Queue name.
    pub name: String,
    /// Messages ready for delivery.
    pub message_count: usize,
    /// Consumers attached.
    pub consumer_count: usize,
}

/// How deliveries are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// The broker settles each message the moment it is delivered. Handler
    /// failures lose the message.
    #[default]
    Auto,
    /// The consumer must `ack` or `nack` every delivery. Failed handlers
    /// lead to redelivery.
    Explicit,
}

impl AckMode {
    /// `true` selects explicit acknowledgement, `false` auto-ack.
    #[must_use]
    pub fn from_flag(explicit: bool) -> Self {
        if explicit {
            Self::Explicit
        } else {
            Self::Auto
        }
    }

    /// Whether the consumer has to settle deliveries itself.
    #[must_use]
    pub fn is_explicit(self) -> bool {
        self == Self::Explicit
    }
}

/// Consumer options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumeOptions {
    /// Acknowledgement discipline for this consumer.
    pub ack_mode: AckMode,
}

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to `ack`/`nack` this delivery.
    pub delivery_tag: u64,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key it was published with.
    pub routing_key: String,
    /// Raw message body.
    pub payload: Vec<u8>,
    /// Whether this message was delivered before.
    pub redelivered: bool,
    /// 1-based delivery attempt counter.
    pub attempt: u32,
}

/// Receiving end of a consumer.
///
/// Yields `None` once the broker cancels the consumer or closes the channel.
pub struct Consumer {
    tag: String,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
}

impl Consumer {
    /// Wrap a delivery feed under a consumer tag.
    #[must_use]
    pub fn new(tag: impl Into<String>, deliveries: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            tag: tag.into(),
            deliveries,
        }
    }

    /// Broker-assigned consumer tag.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Wait for the next delivery.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }

    /// Take a delivery if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.deliveries.try_recv().ok()
    }
}

impl Stream for Consumer {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.deliveries.poll_recv(cx)
    }
}
