//! Server-side lock state.

use super::{LockError, METHOD_ACQUIRE, METHOD_RELEASE, METHOD_STATUS, Ticket};
use crate::cx::Cx;
use crate::rpc::{FaultCode, RemoteFault, Service};
use crate::tracing_compat::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Default)]
struct LockState {
    holder: Option<Ticket>,
    shutting_down: bool,
    waiters: usize,
}

#[derive(Default)]
struct Shared {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl Shared {
    /// Wakes every waiter. Takes the state lock first so a waiter between
    /// its predicate check and its wait cannot miss the wake-up.
    fn wake_all(&self) {
        let _state = self.state.lock();
        self.cond.notify_all();
    }
}

/// Snapshot returned by the status method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatus {
    /// Whether some ticket holds the lock.
    pub held: bool,
    /// Callers currently waiting.
    pub waiters: usize,
    /// Whether the service is shutting down.
    pub shutting_down: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct ReleaseParams {
    pub(super) ticket: Ticket,
}

/// One exclusive lock shared by every caller.
///
/// Cloning yields another handle to the same lock.
#[derive(Clone, Default)]
pub struct LockService {
    shared: Arc<Shared>,
}

impl LockService {
    /// Creates a free lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the lock and returns a fresh ticket.
    ///
    /// The wait ends without granting when the service shuts down or when
    /// the caller behind `cx` is gone. "Gone" means cancellation was
    /// requested for the handling unit, or the unit had a live connection
    /// when the wait began and no longer does. Every check and the grant
    /// happen under the same lock as the wait.
    pub fn acquire(&self, cx: &Cx) -> Result<Ticket, LockError> {
        let shared = Arc::clone(&self.shared);
        let _hook = cx.on_cancel(move || shared.wake_all());
        let remote = cx.is_connection_alive();

        let mut state = self.shared.state.lock();
        state.waiters += 1;
        let outcome = loop {
            if state.shutting_down {
                break Err(LockError::ShuttingDown);
            }
            if cx.is_cancel_requested() || (remote && !cx.is_connection_alive()) {
                break Err(LockError::ConnectionGone);
            }
            if state.holder.is_none() {
                match Ticket::generate() {
                    Ok(ticket) => {
                        state.holder = Some(ticket);
                        break Ok(ticket);
                    }
                    Err(err) => break Err(err),
                }
            }
            debug!(unit = %cx.unit_id(), waiters = state.waiters, "lock held; waiting");
            self.shared.cond.wait(&mut state);
        };
        state.waiters -= 1;
        drop(state);

        match &outcome {
            Ok(ticket) => {
                info!(unit = %cx.unit_id(), ticket = %ticket, "lock granted");
            }
            Err(LockError::ConnectionGone) => {
                warn!(unit = %cx.unit_id(), "caller gone; abandoning lock wait");
            }
            Err(err) => {
                debug!(unit = %cx.unit_id(), error = %err, "lock wait ended");
            }
        }
        outcome
    }

    /// Releases the lock held by `ticket`.
    ///
    /// Releasing a free lock is a no-op. Presenting any other ticket while
    /// the lock is held fails with [`LockError::TicketMismatch`].
    pub fn release(&self, ticket: Ticket) -> Result<(), LockError> {
        let mut state = self.shared.state.lock();
        match state.holder {
            None => {
                debug!(ticket = %ticket, "release of a free lock ignored");
                Ok(())
            }
            Some(holder) if holder == ticket => {
                state.holder = None;
                self.shared.cond.notify_all();
                drop(state);
                info!(ticket = %ticket, "lock released");
                Ok(())
            }
            Some(_) => {
                drop(state);
                warn!(ticket = %ticket, "release with a ticket that does not hold the lock");
                Err(LockError::TicketMismatch { presented: ticket })
            }
        }
    }

    /// Releases the lock regardless of who holds it.
    ///
    /// Returns the ticket that held it.
    pub fn force_release(&self) -> Option<Ticket> {
        let mut state = self.shared.state.lock();
        let previous = state.holder.take();
        self.shared.cond.notify_all();
        drop(state);
        if let Some(ticket) = previous {
            warn!(ticket = %ticket, "lock force-released by operator");
        }
        previous
    }

    /// Refuses all further acquisitions, fails current waiters and frees
    /// the lock.
    pub fn shutdown(&self) -> Option<Ticket> {
        let mut state = self.shared.state.lock();
        state.shutting_down = true;
        let previous = state.holder.take();
        self.shared.cond.notify_all();
        drop(state);
        info!(released = ?previous, "lock service shutting down");
        previous
    }

    /// The ticket holding the lock, if any.
    #[must_use]
    pub fn holder(&self) -> Option<Ticket> {
        self.shared.state.lock().holder
    }

    /// Callers currently waiting in [`acquire`](Self::acquire).
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.shared.state.lock().waiters
    }

    /// Current status snapshot.
    #[must_use]
    pub fn status(&self) -> LockStatus {
        let state = self.shared.state.lock();
        LockStatus {
            held: state.holder.is_some(),
            waiters: state.waiters,
            shutting_down: state.shutting_down,
        }
    }
}

impl fmt::Debug for LockService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockService")
            .field("state", &*self.shared.state.lock())
            .finish()
    }
}

impl From<LockError> for RemoteFault {
    fn from(err: LockError) -> Self {
        let code = match err {
            LockError::ConnectionGone => FaultCode::Abandoned,
            LockError::ShuttingDown => FaultCode::ShuttingDown,
            LockError::TicketMismatch { .. } => FaultCode::Denied,
            LockError::Entropy(_) => FaultCode::Internal,
        };
        Self::new(code, err.to_string())
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, RemoteFault> {
    serde_json::to_value(value)
        .map_err(|err| RemoteFault::new(FaultCode::Internal, err.to_string()))
}

impl Service for LockService {
    fn call(&self, cx: &Cx, method: &str, params: Value) -> Result<Value, RemoteFault> {
        match method {
            METHOD_ACQUIRE => {
                let ticket = self.acquire(cx)?;
                to_value(&ticket)
            }
            METHOD_RELEASE => {
                let params: ReleaseParams = serde_json::from_value(params)
                    .map_err(|err| RemoteFault::bad_request(err.to_string()))?;
                self.release(params.ticket)?;
                Ok(Value::Null)
            }
            METHOD_STATUS => to_value(&self.status()),
            other => Err(RemoteFault::unknown_method(other)),
        }
    }

    fn undelivered(&self, method: &str, result: Value) {
        if method != METHOD_ACQUIRE {
            return;
        }
        match serde_json::from_value::<Ticket>(result) {
            Ok(ticket) => {
                warn!(ticket = %ticket, "granted ticket never reached its caller; releasing");
                if let Err(err) = self.release(ticket) {
                    debug!(error = %err, "compensating release found the lock moved on");
                }
            }
            Err(err) => {
                warn!(error = %err, "undelivered acquire result is not a ticket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cx::{CallRegistry, Role};
    use crate::test_utils::{DEFAULT_WAIT, MockConnection, init_test_logging, wait_until};
    use crate::types::CancelReason;
    use crate::unit::UnitFactory;
    use serde_json::json;

    fn init_test(test_name: &str) {
        init_test_logging();
        crate::test_phase!(test_name);
    }

    #[test]
    fn acquire_free_lock_grants_ticket() {
        init_test("acquire_free_lock_grants_ticket");
        let lock = LockService::new();
        let cx = Cx::for_testing();
        let ticket = lock.acquire(&cx).expect("free lock");
        assert_ne!(ticket, Ticket::NONE);
        assert_eq!(lock.holder(), Some(ticket));
        crate::test_complete!("acquire_free_lock_grants_ticket");
    }

    #[test]
    fn release_rules() {
        init_test("release_rules");
        let lock = LockService::new();
        lock.release(Ticket::from_raw(5))
            .expect("free lock release is a no-op");

        let ticket = lock.acquire(&Cx::for_testing()).expect("acquire");
        let wrong = Ticket::from_raw(ticket.as_u64() ^ 1);
        assert_eq!(
            lock.release(wrong),
            Err(LockError::TicketMismatch { presented: wrong })
        );
        let none = Ticket::NONE;
        assert_eq!(
            lock.release(none),
            Err(LockError::TicketMismatch { presented: none })
        );
        assert_eq!(lock.holder(), Some(ticket), "failed release leaves holder");
        lock.release(ticket).expect("holder releases");
        assert_eq!(lock.holder(), None);
        lock.release(ticket).expect("second release is a no-op");
        crate::test_complete!("release_rules");
    }

    #[test]
    fn waiter_gets_lock_after_release() {
        init_test("waiter_gets_lock_after_release");
        let lock = LockService::new();
        let first = lock.acquire(&Cx::for_testing()).expect("first");
        let units = UnitFactory::new(CallRegistry::shared());
        let waiter_lock = lock.clone();
        let handle = units
            .spawn(move |cx| waiter_lock.acquire(cx))
            .expect("spawn");

        assert!(wait_until(DEFAULT_WAIT, || lock.waiters() == 1));
        lock.release(first).expect("release");
        let second = handle.join().expect("join").expect("granted");
        assert_ne!(second, first);
        assert_eq!(lock.holder(), Some(second));
        crate::test_complete!("waiter_gets_lock_after_release");
    }

    #[test]
    fn cancel_wakes_waiter_without_granting() {
        init_test("cancel_wakes_waiter_without_granting");
        let lock = LockService::new();
        let first = lock.acquire(&Cx::for_testing()).expect("first");
        let units = UnitFactory::new(CallRegistry::shared());
        let waiter_lock = lock.clone();
        let handle = units
            .spawn(move |cx| waiter_lock.acquire(cx))
            .expect("spawn");

        assert!(wait_until(DEFAULT_WAIT, || lock.waiters() == 1));
        handle.cancel_with(CancelReason::user("give up"));
        assert_eq!(handle.join().expect("join"), Err(LockError::ConnectionGone));
        assert_eq!(lock.holder(), Some(first), "holder unchanged");
        assert_eq!(lock.waiters(), 0);
        crate::test_complete!("cancel_wakes_waiter_without_granting");
    }

    #[test]
    fn dead_connection_is_never_granted() {
        init_test("dead_connection_is_never_granted");
        let registry = CallRegistry::shared();
        let lock = LockService::new();
        let first = lock.acquire(&Cx::for_testing()).expect("first");
        let units = UnitFactory::new(Arc::clone(&registry));
        let waiter_lock = lock.clone();
        let handle = units
            .spawn(move |cx| {
                let _binding = cx
                    .registry()
                    .bind(cx.unit_id(), Arc::new(MockConnection::new(1)), Role::Server)
                    .expect("bind");
                waiter_lock.acquire(cx)
            })
            .expect("spawn");

        assert!(wait_until(DEFAULT_WAIT, || lock.waiters() == 1));
        // Tear the connection down without raising the flag, then free the lock.
        assert!(registry.close_and_unbind(handle.id()));
        lock.release(first).expect("release");
        assert_eq!(handle.join().expect("join"), Err(LockError::ConnectionGone));
        assert_eq!(lock.holder(), None, "nobody was granted");
        crate::test_complete!("dead_connection_is_never_granted");
    }

    #[test]
    fn shutdown_fails_waiters_and_frees_lock() {
        init_test("shutdown_fails_waiters_and_frees_lock");
        let lock = LockService::new();
        let first = lock.acquire(&Cx::for_testing()).expect("first");
        let units = UnitFactory::new(CallRegistry::shared());
        let waiter_lock = lock.clone();
        let handle = units
            .spawn(move |cx| waiter_lock.acquire(cx))
            .expect("spawn");
        assert!(wait_until(DEFAULT_WAIT, || lock.waiters() == 1));

        assert_eq!(lock.shutdown(), Some(first));
        assert_eq!(handle.join().expect("join"), Err(LockError::ShuttingDown));
        assert_eq!(
            lock.acquire(&Cx::for_testing()),
            Err(LockError::ShuttingDown)
        );
        assert!(lock.status().shutting_down);
        crate::test_complete!("shutdown_fails_waiters_and_frees_lock");
    }

    #[test]
    fn force_release_frees_for_next_caller() {
        init_test("force_release_frees_for_next_caller");
        let lock = LockService::new();
        let first = lock.acquire(&Cx::for_testing()).expect("first");
        assert_eq!(lock.force_release(), Some(first));
        assert_eq!(lock.force_release(), None);
        let second = lock.acquire(&Cx::for_testing()).expect("second");
        assert_eq!(
            lock.release(first),
            Err(LockError::TicketMismatch { presented: first })
        );
        lock.release(second).expect("release");
        crate::test_complete!("force_release_frees_for_next_caller");
    }

    #[test]
    fn service_dispatch_and_compensation() {
        init_test("service_dispatch_and_compensation");
        let lock = LockService::new();
        let cx = Cx::for_testing();
        let value = Service::call(&lock, &cx, METHOD_ACQUIRE, Value::Null).expect("acquire");
        let ticket: Ticket = serde_json::from_value(value.clone()).expect("ticket");

        let status = Service::call(&lock, &cx, METHOD_STATUS, Value::Null).expect("status");
        assert_eq!(
            status,
            json!({"held": true, "waiters": 0, "shutting_down": false})
        );

        let fault = Service::call(&lock, &cx, METHOD_RELEASE, json!({"ticket": 1}))
            .expect_err("mismatch");
        assert_eq!(fault.code, FaultCode::Denied);
        let fault = Service::call(&lock, &cx, METHOD_RELEASE, json!({"nope": 1})).expect_err("bad");
        assert_eq!(fault.code, FaultCode::BadRequest);

        lock.undelivered(METHOD_ACQUIRE, value);
        assert_eq!(lock.holder(), None, "undelivered ticket released");
        lock.undelivered(METHOD_RELEASE, Value::Null);
        assert!(lock.release(ticket).is_ok());
        crate::test_complete!("service_dispatch_and_compensation");
    }
}
