//! # Service Layer
//!
//! [`TransactionClient`] and the operations it exposes, grouped by role:
//!
//! | Module | Role |
//! |--------|------|
//! | `client` | Lazy connection, exchange assertion, listener registry |
//! | `publisher` | `publish` / `commit` / `rollback` |
//! | `subscriptions` | `create_listener` / `bind` / `unbind` / listener lifecycle |
//! | `delivery` | Per-listener ack / requeue decisions |

mod client;
mod delivery;
mod publisher;
mod subscriptions;

pub use client::TransactionClient;
pub use delivery::Disposition;
