//! Demonstration service: one exclusive lock, handed out as tickets.
//!
//! A caller that asks for a held lock waits inside the server until the
//! holder releases it. That wait is what makes the service interesting
//! here: if the caller gives up (cancels its unit), the handler must notice
//! that nobody is waiting for the answer anymore and must not grant the
//! lock to a dead connection.
//!
//! - [`LockService`]: the server-side state and [`Service`](crate::Service) impl
//! - [`LockClient`]: typed stub over [`RpcClient`](crate::RpcClient)

pub mod client;
pub mod service;

pub use client::LockClient;
pub use service::{LockService, LockStatus};

use core::fmt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Conventional listen address for the lock service.
pub const DEFAULT_LOCK_ADDR: &str = "127.0.0.1:1099";

/// Method name for acquiring the lock.
pub const METHOD_ACQUIRE: &str = "lock.acquire";
/// Method name for releasing the lock.
pub const METHOD_RELEASE: &str = "lock.release";
/// Method name for the status query.
pub const METHOD_STATUS: &str = "lock.status";

/// Proof of holding the lock.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticket(u64);

impl Ticket {
    /// Never issued; means "no ticket".
    pub const NONE: Self = Self(0);

    /// Draws a fresh ticket from the OS entropy source.
    ///
    /// Tickets are non-zero and fit in an `i64`, so peers that only speak
    /// signed integers can carry them.
    pub fn generate() -> Result<Self, LockError> {
        loop {
            let mut bytes = [0_u8; 8];
            getrandom::fill(&mut bytes).map_err(|err| LockError::Entropy(err.to_string()))?;
            let raw = u64::from_le_bytes(bytes) & (i64::MAX as u64);
            if raw != 0 {
                return Ok(Self(raw));
            }
        }
    }

    /// Wraps a raw value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// True for [`Ticket::NONE`].
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ticket({:#x})", self.0)
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Lock service errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    /// The waiting caller is gone; the handler abandoned the wait.
    #[error("caller connection is gone")]
    ConnectionGone,
    /// The service is shutting down.
    #[error("lock service is shutting down")]
    ShuttingDown,
    /// A release presented a ticket that does not hold the lock.
    #[error("ticket {presented} does not hold the lock")]
    TicketMismatch {
        /// The ticket that was presented.
        presented: Ticket,
    },
    /// The OS entropy source failed.
    #[error("entropy source failed: {0}")]
    Entropy(String),
}
