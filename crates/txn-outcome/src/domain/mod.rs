//! # Domain Layer
//!
//! Transaction identifiers, outcomes and the error taxonomy. Nothing here
//! touches the broker.

pub mod errors;
pub mod outcome;
pub mod transaction_id;

pub use errors::*;
pub use outcome::*;
pub use transaction_id::*;
