//! Tracing compatibility layer.
//!
//! Library code logs through this module instead of naming `tracing`
//! directly, so the crate builds with or without the `tracing-integration`
//! feature:
//!
//! - **With the feature**: the `tracing` macros are re-exported unchanged.
//! - **Without it**: the macros below swallow their arguments and compile to
//!   nothing.
//!
//! ```rust,ignore
//! use interruptible_rpc::tracing_compat::{debug, info_span};
//!
//! let _span = info_span!("handler", unit = %cx.unit_id()).entered();
//! debug!(endpoint = %addr, "connecting");
//! ```
//!
//! Field conventions used across the crate: `unit` for the [`UnitId`],
//! `role` for the registry role, `peer` for the remote address and `method`
//! for the RPC method name.
//!
//! [`UnitId`]: crate::types::UnitId

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, info_span, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    /// No-op trace-level logging macro.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// No-op debug-level logging macro.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op info-level logging macro.
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {};
    }

    /// No-op warn-level logging macro.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }

    /// No-op error-level logging macro.
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    /// No-op span macro returning a [`NoopSpan`](crate::tracing_compat::NoopSpan).
    #[macro_export]
    macro_rules! info_span {
        ($($arg:tt)*) => {
            $crate::tracing_compat::NoopSpan
        };
    }

    pub use crate::{debug, error, info, info_span, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
pub use noop::*;

/// Span stand-in used when tracing is disabled.
#[cfg(not(feature = "tracing-integration"))]
#[derive(Debug, Clone, Copy)]
pub struct NoopSpan;

#[cfg(not(feature = "tracing-integration"))]
impl NoopSpan {
    /// Returns a guard that does nothing on drop.
    #[inline]
    #[must_use]
    pub fn enter(&self) -> NoopGuard {
        NoopGuard
    }

    /// Returns a guard that does nothing on drop.
    #[inline]
    #[must_use]
    pub fn entered(self) -> NoopGuard {
        NoopGuard
    }
}

/// Guard returned by [`NoopSpan::enter`].
#[cfg(not(feature = "tracing-integration"))]
#[derive(Debug)]
pub struct NoopGuard;
