//! # Ports Layer
//!
//! - **Driven port**: [`Broker`] / [`Connection`] / [`Channel`], implemented by
//!   broker adapters
//! - **Driving port**: [`OutcomeHandler`], implemented by participant services

pub mod broker;
pub mod handler;

pub use broker::*;
pub use handler::*;
