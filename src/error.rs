//! Error types and error handling strategy.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - A transport fault is only ever reported as [`ErrorKind::Connection`]
//!   or, when the unit had been cancelled, as [`ErrorKind::Cancelled`]
//! - Nothing in this crate retries; the classification below only tells a
//!   surrounding framework what it is looking at
//!
//! # Error Categories
//!
//! - **Cancellation**: the call was aborted on request
//! - **Transport**: I/O faults and malformed frames
//! - **Registry**: bookkeeping contract violations (logic bugs)
//! - **Service**: the remote side answered with a fault, or gave up
//! - **Config**: invalid configuration
//! - **Internal**: invariant violations inside the crate

use core::fmt;
use std::io;
use std::sync::Arc;

use crate::config::ConfigError;
use crate::cx::RegistryError;
use crate::rpc::{FrameError, RemoteFault};
use crate::types::CancelReason;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Cancellation ===
    /// The call was cancelled; any transport fault it saw was self-inflicted.
    Cancelled,

    // === Transport ===
    /// I/O fault on the transport connection.
    Connection,
    /// Peer sent bytes that do not form a valid frame or message.
    Protocol,
    /// A frame exceeded the configured size limit.
    FrameTooLarge,

    // === Registry ===
    /// A unit tried to bind a second connection while one was in flight.
    AlreadyBound,

    // === Service ===
    /// The remote service answered with an application fault.
    Remote,
    /// The server is shutting down.
    ShuttingDown,
    /// A handler abandoned its work because its connection is gone.
    Abandoned,

    // === Config ===
    /// Invalid configuration value.
    Config,

    // === Internal ===
    /// Internal error (bug).
    Internal,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Cancelled => ErrorCategory::Cancellation,
            Self::Connection | Self::Protocol | Self::FrameTooLarge => ErrorCategory::Transport,
            Self::AlreadyBound => ErrorCategory::Registry,
            Self::Remote | Self::ShuttingDown | Self::Abandoned => ErrorCategory::Service,
            Self::Config => ErrorCategory::Config,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Returns true if the error is a logic bug rather than an operational
    /// condition. Such errors are fatal and must never be retried.
    #[must_use]
    pub const fn is_bug(&self) -> bool {
        matches!(self, Self::AlreadyBound | Self::Internal)
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Connection => "connection error",
            Self::Protocol => "protocol error",
            Self::FrameTooLarge => "frame too large",
            Self::AlreadyBound => "unit already bound",
            Self::Remote => "remote fault",
            Self::ShuttingDown => "shutting down",
            Self::Abandoned => "abandoned",
            Self::Config => "invalid configuration",
            Self::Internal => "internal error",
        }
    }
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Cancellation-related failures.
    Cancellation,
    /// Transport-layer failures.
    Transport,
    /// Registry contract violations.
    Registry,
    /// Failures reported by the remote service.
    Service,
    /// Configuration failures.
    Config,
    /// Internal errors.
    Internal,
}

/// The main error type.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Returns true if this error is a genuine transport fault.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self.kind, ErrorKind::Connection)
    }

    /// Returns the message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Creates a cancellation error from a structured reason.
    #[must_use]
    pub fn cancelled(reason: &CancelReason) -> Self {
        Self::new(ErrorKind::Cancelled).with_message(reason.to_string())
    }

    /// Creates a transport fault wrapping an I/O error.
    #[must_use]
    pub fn connection(err: io::Error) -> Self {
        Self::new(ErrorKind::Connection)
            .with_message(err.to_string())
            .with_source(err)
    }

    /// Creates an error carrying the fault reported by the remote service.
    #[must_use]
    pub fn remote(fault: RemoteFault) -> Self {
        let kind = fault.code.error_kind();
        Self::new(kind)
            .with_message(fault.message.clone())
            .with_source(fault)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<RegistryError> for Error {
    fn from(err: RegistryError) -> Self {
        Self::new(ErrorKind::AlreadyBound)
            .with_message(err.to_string())
            .with_source(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::new(ErrorKind::Config)
            .with_message(err.to_string())
            .with_source(err)
    }
}

impl From<FrameError> for Error {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(io) => Self::connection(io),
            FrameError::TooLarge { .. } => Self::new(ErrorKind::FrameTooLarge)
                .with_message(err.to_string())
                .with_source(err),
            FrameError::Json(_) => Self::new(ErrorKind::Protocol)
                .with_message(err.to_string())
                .with_source(err),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = core::result::Result<T, Error>;
