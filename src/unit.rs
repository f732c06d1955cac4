//! Interruptible execution units.
//!
//! A unit is one OS thread driving at most one call at a time. It is
//! created through a [`UnitFactory`] so that its cancellation primitive
//! knows about the [`CallRegistry`]: cancelling a unit first force-closes
//! whatever connection it has bound, then raises the ordinary cancellation
//! flag and runs its cancel hooks.
//!
//! # Cancel ordering
//!
//! 1. `close_and_unbind(unit)` unblocks any read or write in progress.
//! 2. The flag is raised and hooks run, so the fault the task is about to
//!    observe classifies as [`Cancelled`](crate::ErrorKind::Cancelled).
//! 3. On the first request only, a second `close_and_unbind` sweeps up a
//!    connection bound between steps 1 and 2. Anything bound after step 2
//!    is refused by the transport factory's post-bind flag check.

use crate::config::RpcConfig;
use crate::cx::{CallRegistry, CancelState, Cx};
use crate::tracing_compat::{debug, info, warn};
use crate::types::{CancelReason, UnitId};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Creates execution units bound to one registry.
#[derive(Debug, Clone)]
pub struct UnitFactory {
    registry: Arc<CallRegistry>,
    name_prefix: String,
    stack_size: Option<usize>,
}

impl UnitFactory {
    /// Creates a factory with default thread settings.
    #[must_use]
    pub fn new(registry: Arc<CallRegistry>) -> Self {
        Self::from_config(registry, &RpcConfig::default())
    }

    /// Creates a factory using the unit settings from `config`.
    #[must_use]
    pub fn from_config(registry: Arc<CallRegistry>, config: &RpcConfig) -> Self {
        Self {
            registry,
            name_prefix: config.unit_name_prefix.clone(),
            stack_size: config.unit_stack_size,
        }
    }

    /// The registry units created here bind into.
    #[must_use]
    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    /// Wraps `task` in an unstarted unit with a fresh id.
    pub fn new_unit<T, F>(&self, task: F) -> Unit<T>
    where
        F: FnOnce(&Cx) -> T + Send + 'static,
        T: Send + 'static,
    {
        let id = UnitId::next();
        let cancel = Arc::new(CancelState::new());
        let cx = Cx::from_parts(id, Arc::clone(&cancel), Arc::clone(&self.registry));
        Unit {
            canceller: Canceller::new(id, cancel, Arc::clone(&self.registry)),
            cx,
            task: Box::new(task),
            name: format!("{}-{}", self.name_prefix, id.as_u64()),
            stack_size: self.stack_size,
        }
    }

    /// Creates and starts a unit.
    pub fn spawn<T, F>(&self, task: F) -> io::Result<UnitHandle<T>>
    where
        F: FnOnce(&Cx) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.new_unit(task).start()
    }
}

/// An execution unit that has not started running yet.
///
/// It can already be cancelled; a unit cancelled before `start` runs its
/// task with the flag set.
pub struct Unit<T> {
    cx: Cx,
    canceller: Canceller,
    task: Box<dyn FnOnce(&Cx) -> T + Send>,
    name: String,
    stack_size: Option<usize>,
}

impl<T: Send + 'static> Unit<T> {
    /// The unit's id.
    #[must_use]
    pub fn id(&self) -> UnitId {
        self.cx.unit_id()
    }

    /// A handle that can cancel this unit from any thread.
    #[must_use]
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    /// Spawns the unit's thread.
    pub fn start(self) -> io::Result<UnitHandle<T>> {
        let Self {
            cx,
            canceller,
            task,
            name,
            stack_size,
        } = self;
        let id = cx.unit_id();
        let mut builder = thread::Builder::new().name(name);
        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }
        let join = builder.spawn(move || {
            let _exit = ExitGuard { cx: &cx };
            debug!(unit = %cx.unit_id(), "unit started");
            task(&cx)
        })?;
        Ok(UnitHandle {
            id,
            canceller,
            join,
        })
    }
}

impl<T> fmt::Debug for Unit<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.cx.unit_id())
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Releases a binding the task leaked when its thread exits.
struct ExitGuard<'a> {
    cx: &'a Cx,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        let unit = self.cx.unit_id();
        if let Some(leaked) = self.cx.registry().unbind(unit) {
            warn!(
                unit = %unit,
                role = %leaked.role,
                "unit exited with a bound connection; closing it"
            );
            leaked.connection.close();
        }
        debug!(unit = %unit, "unit exited");
    }
}

/// Handle to a running unit.
pub struct UnitHandle<T> {
    id: UnitId,
    canceller: Canceller,
    join: JoinHandle<T>,
}

impl<T> UnitHandle<T> {
    /// The unit's id.
    #[must_use]
    pub const fn id(&self) -> UnitId {
        self.id
    }

    /// Cancels the unit with a plain user reason.
    ///
    /// Returns true for the first request; further calls are no-ops.
    pub fn cancel(&self) -> bool {
        self.canceller.cancel()
    }

    /// Cancels the unit with an explicit reason.
    pub fn cancel_with(&self, reason: CancelReason) -> bool {
        self.canceller.cancel_with(reason)
    }

    /// A cloneable handle that can cancel this unit.
    #[must_use]
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    /// True once the unit's task has returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the task to return.
    pub fn join(self) -> thread::Result<T> {
        self.join.join()
    }
}

impl<T> fmt::Debug for UnitHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitHandle")
            .field("id", &self.id)
            .field("finished", &self.join.is_finished())
            .finish_non_exhaustive()
    }
}

/// Cancels one unit. Cloneable and usable from any thread, any number of
/// times.
#[derive(Clone)]
pub struct Canceller {
    unit: UnitId,
    state: Arc<CancelState>,
    registry: Arc<CallRegistry>,
}

impl Canceller {
    pub(crate) fn new(unit: UnitId, state: Arc<CancelState>, registry: Arc<CallRegistry>) -> Self {
        Self {
            unit,
            state,
            registry,
        }
    }

    /// The unit this handle cancels.
    #[must_use]
    pub const fn unit_id(&self) -> UnitId {
        self.unit
    }

    /// True once any cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.is_requested()
    }

    /// Cancels with a plain user reason.
    pub fn cancel(&self) -> bool {
        self.cancel_with(CancelReason::default())
    }

    /// Force-closes the unit's connection, then raises its flag.
    ///
    /// Returns true only for the first request.
    pub fn cancel_with(&self, reason: CancelReason) -> bool {
        let closed = self.registry.close_and_unbind(self.unit);
        let first = self.state.request(&reason);
        if first {
            let swept = self.registry.close_and_unbind(self.unit);
            info!(
                unit = %self.unit,
                reason = %reason,
                closed = closed || swept,
                "unit cancelled"
            );
        } else {
            debug!(unit = %self.unit, closed, "repeat cancel");
        }
        first
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canceller")
            .field("unit", &self.unit)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
