//! # Transaction Outcome - Broker-Routed Commit/Rollback Notifications
//!
//! Independent services agree on how a distributed transaction ended by
//! exchanging one short message through a shared broker.
//!
//! ## Flow
//!
//! ```text
//! ┌──────────────┐  generate_id()      ┌──────────────┐
//! │  Authority   │ ──── T1 ──────────→ │ Participant  │
//! │              │                     │  svc-a       │
//! │              │                     │ create_listener("svc-a", h)
//! │              │                     │ bind("svc-a", T1)
//! │ commit(T1)   │                     └──────────────┘
//! └──────┬───────┘                             ↑
//!        │ publish {id:T1, action:"c"}         │ h({id:T1, action:"c"})
//!        ▼                                     │
//!  ┌─────────────────┐  routing key T1  ┌──────────────┐
//!  │ exchange        │ ───────────────→ │ queue svc-a  │
//!  │ "transactions"  │                  │ (durable)    │
//!  └─────────────────┘                  └──────────────┘
//! ```
//!
//! The transaction id is the routing key, so the broker's binding table is
//! the registry of who listens to which transaction. The library keeps no
//! routing state of its own.
//!
//! ## Layers
//!
//! - `domain`: identifiers, outcomes, wire envelope, errors
//! - `ports`: the broker boundary and the listener handler trait
//! - `adapters`: the in-memory broker
//! - `service`: [`TransactionClient`]
//!
//! ## Wire format
//!
//! `{"id":"<transaction id>","action":"c"}` for commit, `"r"` for rollback.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod ports;
pub mod service;

// Re-export main types
pub use adapters::{InMemoryBroker, QueueStats};
pub use config::{ClientConfig, DEFAULT_EXCHANGE, DEFAULT_URL};
pub use domain::{
    BrokerError, HandlerError, Outcome, OutcomeMessage, TransactionError, TransactionId,
    MAX_ID_LEN,
};
pub use ports::{
    AckMode, Broker, Channel, Connection, ConsumeOptions, Consumer, Delivery, ExchangeKind,
    ExchangeOptions, OutcomeDelivery, OutcomeHandler, QueueInfo, QueueOptions,
};
pub use service::{Disposition, TransactionClient};
