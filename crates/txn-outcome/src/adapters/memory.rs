//! # In-Memory Broker
//!
//! A process-local broker with AMQP semantics for the subset the protocol
//! uses. Suitable for tests and single-process deployments; distributed
//! deployments plug a networked broker in behind the same port.
//!
//! ## Semantics
//!
//! - Direct exchanges route on exact routing key, fanout to every bound queue
//! - Bindings are a set per `(exchange, routing key)`
//! - Messages with no matching binding are dropped and counted
//! - Queues buffer while no consumer is attached, then dispatch round-robin
//! - Explicit-ack deliveries stay in flight until `ack`/`nack`; a requeued
//!   message goes back to the head of its queue with its attempt count kept
//! - Cancelling a consumer or closing its channel requeues what it held

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::BrokerError;
use crate::ports::{
    AckMode, Broker, Channel, Connection, ConsumeOptions, Consumer, Delivery, ExchangeKind,
    ExchangeOptions, QueueInfo, QueueOptions,
};

/// URL schemes this broker answers to. The AMQP schemes are aliases so a
/// client on default settings can run against it unchanged.
const ACCEPTED_SCHEMES: [&str; 3] = ["amqp://", "amqps://", "memory://"];

/// Point-in-time view of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages waiting for a consumer.
    pub ready: usize,
    /// Messages delivered but not yet acknowledged.
    pub unacked: usize,
    /// Attached consumers.
    pub consumers: usize,
    /// Whether the queue was declared durable.
    pub durable: bool,
}

/// Process-local broker. Clones share the same exchanges and queues.
///
/// `connect` accepts `memory://` as well as `amqp://` and `amqps://` URLs,
/// but never opens a socket: an AMQP address is only a name here, and the
/// host, port and credentials in it are ignored. Any other scheme is a
/// [`BrokerError::Connection`].
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    topology: Mutex<Topology>,
    unreachable: AtomicBool,
    next_delivery_tag: AtomicU64,
    next_consumer: AtomicU64,
    next_channel: AtomicU64,
    published: AtomicU64,
    unroutable: AtomicU64,
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    /// Explicit-ack deliveries awaiting settlement, by delivery tag.
    in_flight: HashMap<u64, InFlight>,
}

struct ExchangeState {
    kind: ExchangeKind,
    options: ExchangeOptions,
    /// routing key -> bound queue names
    bindings: HashMap<String, BTreeSet<String>>,
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct ConsumerSlot {
    tag: String,
    channel_id: u64,
    ack_mode: AckMode,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    attempts: u32,
}

struct InFlight {
    queue: String,
    channel_id: u64,
    consumer_tag: String,
    message: StoredMessage,
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the broker going away (`false`) or coming back (`true`).
    /// While unreachable every connect and channel open fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Whether connects currently succeed.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        !self.state.unreachable.load(Ordering::SeqCst)
    }

    /// Whether an exchange has been declared.
    #[must_use]
    pub fn exchange_exists(&self, name: &str) -> bool {
        self.state.topology.lock().exchanges.contains_key(name)
    }

    /// Whether a queue has been declared.
    #[must_use]
    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.topology.lock().queues.contains_key(name)
    }

    /// Current counters for a queue, `None` if it does not exist.
    #[must_use]
    pub fn queue_stats(&self, name: &str) -> Option<QueueStats> {
        let topology = self.state.topology.lock();
        let queue = topology.queues.get(name)?;
        let unacked = topology
            .in_flight
            .values()
            .filter(|entry| entry.queue == name)
            .count();
        Some(QueueStats {
            ready: queue.ready.len(),
            unacked,
            consumers: queue.consumers.len(),
            durable: queue.options.durable,
        })
    }

    /// All `(routing key, queue)` bindings on an exchange, sorted.
    #[must_use]
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        let topology = self.state.topology.lock();
        let Some(exchange) = topology.exchanges.get(exchange) else {
            return Vec::new();
        };
        let mut bindings: Vec<(String, String)> = exchange
            .bindings
            .iter()
            .flat_map(|(key, queues)| queues.iter().map(move |q| (key.clone(), q.clone())))
            .collect();
        bindings.sort();
        bindings
    }

    /// Whether `queue` is bound to `exchange` under `routing_key`.
    #[must_use]
    pub fn has_binding(&self, exchange: &str, queue: &str, routing_key: &str) -> bool {
        self.state
            .topology
            .lock()
            .exchanges
            .get(exchange)
            .and_then(|e| e.bindings.get(routing_key))
            .is_some_and(|queues| queues.contains(queue))
    }

    /// Administratively destroy a queue with its bindings, buffered messages
    /// and consumers. Returns `false` if the queue did not exist.
    pub fn delete_queue(&self, name: &str) -> bool {
        let mut topology = self.state.topology.lock();
        let Some(queue) = topology.queues.remove(name) else {
            return false;
        };
        for exchange in topology.exchanges.values_mut() {
            exchange.bindings.retain(|_, queues| {
                queues.remove(name);
                !queues.is_empty()
            });
        }
        topology.in_flight.retain(|_, entry| entry.queue != name);

        debug!(
            queue = name,
            dropped_messages = queue.ready.len(),
            consumers = queue.consumers.len(),
            "Queue deleted"
        );
        true
    }

    /// Messages accepted by `publish`, routed or not.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.state.published.load(Ordering::Relaxed)
    }

    /// Messages dropped because no queue was bound for their routing key.
    #[must_use]
    pub fn unroutable_count(&self) -> u64 {
        self.state.unroutable.load(Ordering::Relaxed)
    }

    fn ensure_reachable(&self) -> Result<(), BrokerError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(BrokerError::Connection(
                "broker unreachable: connection refused".to_string(),
            ))
        }
    }

    fn next_tag(&self) -> u64 {
        self.state.next_delivery_tag.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Hand ready messages to consumers until one side runs out.
    fn dispatch(&self, topology: &mut Topology, queue_name: &str) {
        let Topology {
            queues, in_flight, ..
        } = topology;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.consumers.is_empty() {
            let Some(mut message) = queue.ready.pop_front() else {
                break;
            };
            let index = queue.next_consumer % queue.consumers.len();
            let delivery_tag = self.next_tag();
            message.attempts += 1;

            let slot = &queue.consumers[index];
            let (consumer_tag, channel_id, ack_mode) =
                (slot.tag.clone(), slot.channel_id, slot.ack_mode);
            let delivery = Delivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                payload: message.payload.clone(),
                redelivered: message.attempts > 1,
                attempt: message.attempts,
            };

            if slot.sender.send(delivery).is_err() {
                // Receiver dropped without a cancel
                message.attempts -= 1;
                queue.ready.push_front(message);
                queue.consumers.remove(index);
                debug!(queue = queue_name, consumer = %consumer_tag, "Consumer gone, removed");
                continue;
            }

            if ack_mode.is_explicit() {
                in_flight.insert(
                    delivery_tag,
                    InFlight {
                        queue: queue_name.to_string(),
                        channel_id,
                        consumer_tag,
                        message,
                    },
                );
            }
            queue.next_consumer = index + 1;
        }
    }

    /// Put an in-flight message back at the head of its queue.
    fn requeue(&self, topology: &mut Topology, entry: InFlight) {
        let queue_name = entry.queue.clone();
        match topology.queues.get_mut(&queue_name) {
            Some(queue) => queue.ready.push_front(entry.message),
            None => return,
        }
        self.dispatch(topology, &queue_name);
    }

    /// Remove consumers matching `predicate` and requeue what they held.
    fn cancel_consumers<F>(&self, predicate: F)
    where
        F: Fn(&str, u64) -> bool,
    {
        let mut topology = self.state.topology.lock();

        let mut touched = Vec::new();
        for (name, queue) in topology.queues.iter_mut() {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|slot| !predicate(slot.tag.as_str(), slot.channel_id));
            if queue.consumers.len() != before {
                touched.push(name.clone());
            }
        }

        let mut held: Vec<u64> = topology
            .in_flight
            .iter()
            .filter(|(_, entry)| predicate(entry.consumer_tag.as_str(), entry.channel_id))
            .map(|(tag, _)| *tag)
            .collect();
        // Newest pushed first so the oldest ends up at the head
        held.sort_unstable_by(|a, b| b.cmp(a));
        for tag in held {
            if let Some(entry) = topology.in_flight.remove(&tag) {
                if let Some(queue) = topology.queues.get_mut(&entry.queue) {
                    queue.ready.push_front(entry.message);
                }
            }
        }

        for name in touched {
            self.dispatch(&mut topology, &name);
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, BrokerError> {
        if !ACCEPTED_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
            return Err(BrokerError::Connection(format!(
                "unsupported broker url '{}'",
                url
            )));
        }
        self.ensure_reachable()?;

        debug!(url, "Connected to in-memory broker");
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
        }))
    }
}

/// Connection handle to an [`InMemoryBroker`].
struct MemoryConnection {
    broker: InMemoryBroker,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        self.broker.ensure_reachable()?;
        let id = self.broker.state.next_channel.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Channel on an [`InMemoryBroker`].
///
/// Dropping the channel closes it.
struct MemoryChannel {
    broker: InMemoryBroker,
    id: u64,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Channel(format!("channel {} is closed", self.id)))
        } else {
            Ok(())
        }
    }

    /// Take a settled delivery out of the in-flight table.
    fn settle(&self, topology: &mut Topology, delivery_tag: u64) -> Result<InFlight, BrokerError> {
        let owner = topology
            .in_flight
            .get(&delivery_tag)
            .map(|entry| entry.channel_id);
        match owner {
            None => Err(BrokerError::Channel(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ))),
            Some(channel_id) if channel_id != self.id => Err(BrokerError::Channel(format!(
                "PRECONDITION_FAILED - delivery tag {} belongs to another channel",
                delivery_tag
            ))),
            Some(_) => topology.in_flight.remove(&delivery_tag).ok_or_else(|| {
                BrokerError::Channel(format!("delivery tag {} vanished", delivery_tag))
            }),
        }
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let id = self.id;
            self.broker
                .cancel_consumers(|_, channel_id| channel_id == id);
        }
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topology = self.broker.state.topology.lock();

        if let Some(existing) = topology.exchanges.get(name) {
            if existing.kind != kind || existing.options != options {
                return Err(BrokerError::Channel(format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange '{}': declared {} (durable={}), requested {} (durable={})",
                    name,
                    existing.kind.as_str(),
                    existing.options.durable,
                    kind.as_str(),
                    options.durable
                )));
            }
            return Ok(());
        }

        topology.exchanges.insert(
            name.to_string(),
            ExchangeState {
                kind,
                options,
                bindings: HashMap::new(),
            },
        );
        debug!(exchange = name, kind = kind.as_str(), durable = options.durable, "Exchange declared");
        Ok(())
    }

    async fn assert_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<QueueInfo, BrokerError> {
        self.ensure_open()?;
        let mut topology = self.broker.state.topology.lock();

        let queue = topology.queues.entry(name.to_string()).or_insert_with(|| {
            debug!(queue = name, durable = options.durable, "Queue declared");
            QueueState {
                options,
                ready: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            }
        });

        if queue.options != options {
            return Err(BrokerError::Channel(format!(
                "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}': declared {}, requested {}",
                name, queue.options.durable, options.durable
            )));
        }

        Ok(QueueInfo {
            name: name.to_string(),
            message_count: queue.ready.len(),
            consumer_count: queue.consumers.len(),
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topology = self.broker.state.topology.lock();

        if !topology.queues.contains_key(queue) {
            return Err(BrokerError::Channel(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        }
        let Some(state) = topology.exchanges.get_mut(exchange) else {
            return Err(BrokerError::Channel(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        };

        let inserted = state
            .bindings
            .entry(routing_key.to_string())
            .or_default()
            .insert(queue.to_string());
        debug!(queue, exchange, routing_key, new = inserted, "Queue bound");
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topology = self.broker.state.topology.lock();

        let Some(state) = topology.exchanges.get_mut(exchange) else {
            return Ok(());
        };
        let removed = match state.bindings.get_mut(routing_key) {
            Some(queues) => {
                let removed = queues.remove(queue);
                if queues.is_empty() {
                    state.bindings.remove(routing_key);
                }
                removed
            }
            None => false,
        };
        debug!(queue, exchange, routing_key, removed, "Queue unbound");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topology = self.broker.state.topology.lock();

        let Some(state) = topology.exchanges.get(exchange) else {
            return Err(BrokerError::Channel(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        };

        let targets: BTreeSet<String> = match state.kind {
            ExchangeKind::Direct => state.bindings.get(routing_key).cloned().unwrap_or_default(),
            ExchangeKind::Fanout => state.bindings.values().flatten().cloned().collect(),
        };

        self.broker.state.published.fetch_add(1, Ordering::Relaxed);

        if targets.is_empty() {
            self.broker.state.unroutable.fetch_add(1, Ordering::Relaxed);
            debug!(exchange, routing_key, "Message dropped (no bound queues)");
            return Ok(());
        }

        for queue_name in &targets {
            match topology.queues.get_mut(queue_name) {
                Some(queue) => queue.ready.push_back(StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    payload: payload.clone(),
                    attempts: 0,
                }),
                None => {
                    warn!(queue = %queue_name, "Binding points at a missing queue");
                    continue;
                }
            }
            self.broker.dispatch(&mut topology, queue_name);
        }

        debug!(exchange, routing_key, queues = targets.len(), "Message routed");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<Consumer, BrokerError> {
        self.ensure_open()?;
        let mut topology = self.broker.state.topology.lock();

        let Some(state) = topology.queues.get_mut(queue) else {
            return Err(BrokerError::Channel(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        };

        let tag = format!(
            "ctag-{}",
            self.broker.state.next_consumer.fetch_add(1, Ordering::Relaxed) + 1
        );
        let (sender, receiver) = mpsc::unbounded_channel();
        state.consumers.push(ConsumerSlot {
            tag: tag.clone(),
            channel_id: self.id,
            ack_mode: options.ack_mode,
            sender,
        });
        debug!(queue, consumer = %tag, ack_mode = ?options.ack_mode, "Consumer attached");

        self.broker.dispatch(&mut topology, queue);
        Ok(Consumer::new(tag, receiver))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topology = self.broker.state.topology.lock();
        let entry = self.settle(&mut topology, delivery_tag)?;
        debug!(queue = %entry.queue, delivery_tag, "Delivery acknowledged");
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topology = self.broker.state.topology.lock();
        let entry = self.settle(&mut topology, delivery_tag)?;

        if requeue {
            debug!(queue = %entry.queue, delivery_tag, attempts = entry.message.attempts, "Delivery requeued");
            self.broker.requeue(&mut topology, entry);
        } else {
            debug!(queue = %entry.queue, delivery_tag, "Delivery discarded");
        }
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let id = self.id;
        self.broker
            .cancel_consumers(|tag, channel_id| channel_id == id && tag == consumer_tag);
        debug!(consumer = consumer_tag, "Consumer cancelled");
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shutdown();
        Ok(())
    }
}
