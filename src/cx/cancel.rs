//! Per-unit cancellation state.
//!
//! Holds the flag a task polls, the strongest reason seen so far, and the
//! hooks that wake a task parked on something other than I/O (a condition
//! variable, for instance). Hooks run exactly once, outside any internal
//! lock, on the thread that made the first request.

use crate::tracing_compat::trace;
use crate::types::CancelReason;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Hooks {
    next_id: u64,
    pending: Vec<(u64, Hook)>,
    fired: bool,
}

/// Shared cancellation state for one unit.
#[derive(Default)]
pub struct CancelState {
    requested: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    hooks: Mutex<Hooks>,
}

impl CancelState {
    /// Creates a fresh, unrequested state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True once any cancellation has been requested.
    #[inline]
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// The strongest reason requested so far.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        *self.reason.lock()
    }

    /// Records `reason`, raises the flag and fires hooks on the first call.
    ///
    /// Returns true only for the first request. Later requests can still
    /// strengthen the stored reason.
    pub fn request(&self, reason: &CancelReason) -> bool {
        {
            let mut slot = self.reason.lock();
            match slot.as_mut() {
                Some(existing) => {
                    existing.strengthen(reason);
                }
                None => *slot = Some(*reason),
            }
        }
        if self.requested.swap(true, Ordering::AcqRel) {
            return false;
        }

        let pending = {
            let mut hooks = self.hooks.lock();
            hooks.fired = true;
            std::mem::take(&mut hooks.pending)
        };
        trace!(hooks = pending.len(), reason = %reason, "cancel requested");
        for (_, hook) in pending {
            hook();
        }
        true
    }

    /// Registers `hook` to run when cancellation is first requested.
    ///
    /// If that already happened the hook runs immediately on this thread.
    pub fn on_cancel(self: &Arc<Self>, hook: impl FnOnce() + Send + 'static) -> CancelHook {
        let mut hooks = self.hooks.lock();
        if hooks.fired {
            drop(hooks);
            hook();
            return CancelHook { state: None, id: 0 };
        }
        let id = hooks.next_id;
        hooks.next_id += 1;
        hooks.pending.push((id, Box::new(hook)));
        CancelHook {
            state: Some(Arc::clone(self)),
            id,
        }
    }

    fn remove_hook(&self, id: u64) {
        self.hooks
            .lock()
            .pending
            .retain(|(hook_id, _)| *hook_id != id);
    }
}

impl fmt::Debug for CancelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelState")
            .field("requested", &self.is_requested())
            .field("reason", &self.reason())
            .finish_non_exhaustive()
    }
}

/// Registration returned by [`CancelState::on_cancel`].
///
/// Dropping it deregisters a hook that has not fired yet.
#[must_use = "dropping the guard deregisters the hook"]
pub struct CancelHook {
    state: Option<Arc<CancelState>>,
    id: u64,
}

impl fmt::Debug for CancelHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHook")
            .field("id", &self.id)
            .field("armed", &self.state.is_some())
            .finish()
    }
}

impl Drop for CancelHook {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            state.remove_hook(self.id);
        }
    }
}
