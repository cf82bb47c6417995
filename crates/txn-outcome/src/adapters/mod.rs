//! # Adapters Layer
//!
//! Broker implementations behind the [`Broker`](crate::ports::Broker) port.

pub mod memory;

pub use memory::{InMemoryBroker, QueueStats};
