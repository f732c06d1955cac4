//! The capability context handed to every unit task.
//!
//! `Cx` is how a task learns who it is, whether someone wants it to stop,
//! and whether the connection driving its call is still there. It carries
//! the shared [`CallRegistry`] explicitly; nothing here is thread-local.

use super::cancel::{CancelHook, CancelState};
use super::registry::{CallRegistry, RegistryError};
use crate::error::{Error, Result};
use crate::types::{CancelReason, UnitId};
use crate::unit::Canceller;
use std::fmt;
use std::io;
use std::sync::Arc;

struct CxInner {
    unit: UnitId,
    cancel: Arc<CancelState>,
    registry: Arc<CallRegistry>,
}

/// Capability context for one execution unit.
///
/// Cheap to clone; clones observe the same unit.
#[derive(Clone)]
pub struct Cx {
    inner: Arc<CxInner>,
}

impl Cx {
    /// Creates a context with a fresh unit id for a thread that was not
    /// started through [`UnitFactory`](crate::unit::UnitFactory).
    ///
    /// Useful for a main thread that issues calls itself; anyone holding
    /// its [`canceller`](Self::canceller) can still interrupt those calls.
    #[must_use]
    pub fn new(registry: Arc<CallRegistry>) -> Self {
        Self::from_parts(UnitId::next(), Arc::new(CancelState::new()), registry)
    }

    pub(crate) fn from_parts(
        unit: UnitId,
        cancel: Arc<CancelState>,
        registry: Arc<CallRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(CxInner {
                unit,
                cancel,
                registry,
            }),
        }
    }

    /// Creates a context over a private registry.
    #[doc(hidden)]
    #[must_use]
    pub fn for_testing() -> Self {
        Self::new(CallRegistry::shared())
    }

    /// The unit this context belongs to.
    #[inline]
    #[must_use]
    pub fn unit_id(&self) -> UnitId {
        self.inner.unit
    }

    /// The registry this unit binds its connections into.
    #[must_use]
    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.inner.registry
    }

    /// True once cancellation of this unit has been requested.
    #[inline]
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel.is_requested()
    }

    /// The strongest cancellation reason recorded so far.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.inner.cancel.reason()
    }

    /// Returns `Err(Cancelled)` if cancellation has been requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancel_requested() {
            let reason = self.cancel_reason().unwrap_or_default();
            return Err(Error::cancelled(&reason));
        }
        Ok(())
    }

    /// Whether this unit still has a live connection bound.
    ///
    /// False when nothing was ever bound as well as after the call ended
    /// or was force-closed. Long-running handler logic treats false as
    /// "abandon".
    #[must_use]
    pub fn is_connection_alive(&self) -> bool {
        self.inner.registry.is_alive(self.inner.unit)
    }

    /// Reclassifies a transport fault seen by this unit.
    ///
    /// A fault observed after cancellation was requested is reported as
    /// [`ErrorKind::Cancelled`](crate::ErrorKind::Cancelled); anything else
    /// is a genuine [`ErrorKind::Connection`](crate::ErrorKind::Connection)
    /// fault. A refused bind keeps its own kind.
    #[must_use]
    pub fn classify_io(&self, err: io::Error) -> Error {
        if let Some(registry_err) = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<RegistryError>())
        {
            return Error::from(registry_err.clone());
        }
        if self.is_cancel_requested() {
            let reason = self.cancel_reason().unwrap_or_default();
            return Error::cancelled(&reason).with_source(err);
        }
        Error::connection(err)
    }

    /// Runs `hook` once when cancellation is requested.
    ///
    /// Used by tasks blocked on something other than their connection.
    /// Dropping the returned guard deregisters the hook.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) -> CancelHook {
        self.inner.cancel.on_cancel(hook)
    }

    /// A handle other threads can use to cancel this unit.
    #[must_use]
    pub fn canceller(&self) -> Canceller {
        Canceller::new(
            self.inner.unit,
            Arc::clone(&self.inner.cancel),
            Arc::clone(&self.inner.registry),
        )
    }
}

impl fmt::Debug for Cx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cx")
            .field("unit", &self.inner.unit)
            .field("cancel_requested", &self.is_cancel_requested())
            .finish_non_exhaustive()
    }
}
