//! interruptible-rpc: cancellable synchronous RPC transport.
//!
//! # Overview
//!
//! A thread parked in a blocking socket read does not notice a generic
//! "please stop" flag. This crate makes cancellation of a pending remote call
//! reach the transport itself: every call-issuing or call-handling thread is
//! an *execution unit* whose in-flight connection is bound in a
//! [`CallRegistry`]. Cancelling the unit force-closes exactly that connection,
//! exactly once, and then raises the unit's cancellation flag so the call can
//! tell "cancelled" apart from a genuine transport fault.
//!
//! # Core Guarantees
//!
//! - **One call per unit**: at most one registry entry exists per [`UnitId`]
//! - **Exactly-once teardown**: normal completion and forced close race to
//!   remove an entry; the first wins and the other is a no-op
//! - **No blind waits**: a blocked read is unblocked by closing its
//!   connection, never by a timeout
//! - **Explicit capabilities**: the registry and the cancellation state travel
//!   in a [`Cx`] passed to every task; there is no global registry
//!
//! # Module Structure
//!
//! - [`types`]: Unit identifiers and cancellation reasons
//! - [`cx`]: Capability context, cancellation state and the call registry
//! - [`transport`]: Transport factory and registry-bound streams
//! - [`unit`]: Interruptible execution unit factory
//! - [`rpc`]: Framed request/response layer built on the factories
//! - [`lock`]: Demonstration exclusive-lock service
//! - [`config`]: Runtime configuration with env and file overrides
//! - [`error`](mod@error): Error types
//! - [`tracing_compat`]: Optional tracing integration (requires `tracing-integration` feature)

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
// Bindings that only feed log fields go unread when logging compiles out.
#![cfg_attr(
    not(feature = "tracing-integration"),
    allow(unused_variables, unused_assignments)
)]

pub mod config;
pub mod cx;
pub mod error;
pub mod lock;
pub mod rpc;
pub mod tracing_compat;
pub mod transport;
pub mod types;
pub mod unit;

// ── Test-only modules ───────────────────────────────────────────────────
#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

pub use config::{ConfigError, RpcConfig};
pub use cx::{CallBinding, CallRegistry, Connection, Cx, EntryState, RegistryError, Role};
pub use error::{Error, ErrorCategory, ErrorKind, Result};
pub use lock::{LockClient, LockError, LockService, Ticket};
pub use rpc::{RemoteFault, RpcClient, RpcServer, Service};
pub use transport::{CallStream, TransportFactory};
pub use types::{CancelKind, CancelReason, UnitId};
pub use unit::{Canceller, Unit, UnitFactory, UnitHandle};
