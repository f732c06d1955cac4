//! Core types shared across the crate.
//!
//! - [`id`]: Execution unit identifiers (`UnitId`)
//! - [`cancel`]: Cancellation reason and kind types

pub mod cancel;
pub mod id;

pub use cancel::{CancelKind, CancelReason};
pub use id::UnitId;
