//! Call registry: which unit is driving which connection right now.
//!
//! The registry is not a global singleton. It is constructed explicitly,
//! shared as an `Arc<CallRegistry>`, and carried as a capability on
//! [`Cx`](crate::cx::Cx) and the factories built from it.
//!
//! # Entry Lifecycle
//!
//! ```text
//! bind() ──► Live ──┬─ unbind()           ──► Released (normal completion)
//!                   │
//!                   └─ close_and_unbind() ──► Closing ──► Dead (forced close)
//! ```
//!
//! Both exits remove the entry under the registry lock, so for one unit id
//! exactly one of them wins and the other finds nothing. The connection's
//! `close` runs after the lock is released, on an entry that is already
//! unreachable, so a slow close never stalls unrelated units.

use crate::tracing_compat::{debug, error, info};
use crate::types::UnitId;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use thiserror::Error;

// ============================================================================
// Connection capability
// ============================================================================

/// A live transport resource owned by one in-flight call.
///
/// `close` must be idempotent and must unblock any thread currently
/// parked in I/O on the connection.
pub trait Connection: Send + Sync + 'static {
    /// Forcibly closes the connection.
    fn close(&self);

    /// Returns true once `close` has taken effect.
    fn is_closed(&self) -> bool;

    /// Short description for logs.
    fn describe(&self) -> String {
        "connection".to_string()
    }
}

/// Which side of a call a binding belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The unit issued the call.
    Client,
    /// The unit is handling the call.
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

/// State of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryState {
    /// Bound and reachable.
    Live = 0,
    /// Removed by a forced close that is still closing the connection.
    Closing = 1,
    /// Removed by a forced close that finished.
    Dead = 2,
    /// Removed by normal completion.
    Released = 3,
}

impl EntryState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Live,
            1 => Self::Closing,
            2 => Self::Dead,
            _ => Self::Released,
        }
    }

    /// Returns true if the entry was torn down by a forced close.
    #[must_use]
    pub const fn is_forced(self) -> bool {
        matches!(self, Self::Closing | Self::Dead)
    }
}

#[derive(Debug, Clone)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(EntryState::Live as u8)))
    }

    fn get(&self) -> EntryState {
        EntryState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: EntryState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Registry contract violations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The unit already has a call in flight.
    #[error("unit {unit} already has a bound connection")]
    AlreadyBound {
        /// The offending unit.
        unit: UnitId,
    },
}

// ============================================================================
// Bindings
// ============================================================================

/// Proof of a successful [`CallRegistry::bind`].
///
/// Held by the stream that owns the connection. The binding id lets the
/// owner release exactly its own entry and never a newer one for the same
/// unit.
#[derive(Debug)]
pub struct CallBinding {
    unit: UnitId,
    role: Role,
    id: u64,
    state: StateCell,
}

impl CallBinding {
    /// The bound unit.
    #[must_use]
    pub const fn unit(&self) -> UnitId {
        self.unit
    }

    /// The role the connection was bound with.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Current state of the entry this binding created.
    #[must_use]
    pub fn state(&self) -> EntryState {
        self.state.get()
    }
}

/// An entry removed by [`CallRegistry::unbind`].
pub struct RemovedEntry {
    /// Role the entry was bound with.
    pub role: Role,
    /// The connection, still open. The caller decides whether to close it.
    pub connection: Arc<dyn Connection>,
}

impl fmt::Debug for RemovedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemovedEntry")
            .field("role", &self.role)
            .field("connection", &self.connection.describe())
            .finish()
    }
}

struct Slot {
    id: u64,
    role: Role,
    connection: Arc<dyn Connection>,
    state: StateCell,
}

/// Counters describing registry traffic since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Successful binds.
    pub binds: u64,
    /// Entries removed by normal completion.
    pub unbinds: u64,
    /// Entries removed by forced close.
    pub forced_closes: u64,
    /// Binds rejected with `AlreadyBound`.
    pub rejected_binds: u64,
}

#[derive(Debug, Default)]
struct Counters {
    binds: AtomicU64,
    unbinds: AtomicU64,
    forced_closes: AtomicU64,
    rejected_binds: AtomicU64,
}

// ============================================================================
// Registry
// ============================================================================

/// Mapping from execution unit to its in-flight connection.
pub struct CallRegistry {
    entries: Mutex<HashMap<UnitId, Slot>>,
    next_binding: AtomicU64,
    counters: Counters,
}

impl CallRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_binding: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    /// Creates an empty registry ready to be shared.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Binds `connection` to `unit`.
    ///
    /// Fails if the unit already has an entry. That is a logic bug in the
    /// caller; the connection is left untouched for the caller to close.
    pub fn bind(
        &self,
        unit: UnitId,
        connection: Arc<dyn Connection>,
        role: Role,
    ) -> Result<CallBinding, RegistryError> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&unit) {
            error!(
                unit = %unit,
                role = %role,
                existing = %existing.role,
                "unit already bound; second concurrent call refused"
            );
            drop(entries);
            self.counters.rejected_binds.fetch_add(1, Ordering::Relaxed);
            return Err(RegistryError::AlreadyBound { unit });
        }

        let id = self.next_binding.fetch_add(1, Ordering::Relaxed);
        let state = StateCell::new();
        let describe = connection.describe();
        entries.insert(
            unit,
            Slot {
                id,
                role,
                connection,
                state: state.clone(),
            },
        );
        drop(entries);

        self.counters.binds.fetch_add(1, Ordering::Relaxed);
        debug!(unit = %unit, role = %role, conn = %describe, "bound");
        Ok(CallBinding {
            unit,
            role,
            id,
            state,
        })
    }

    /// Removes the unit's entry without closing the connection.
    ///
    /// Idempotent: returns `None` if nothing was bound.
    pub fn unbind(&self, unit: UnitId) -> Option<RemovedEntry> {
        let slot = self.entries.lock().remove(&unit)?;
        slot.state.set(EntryState::Released);
        self.counters.unbinds.fetch_add(1, Ordering::Relaxed);
        debug!(unit = %unit, role = %slot.role, "unbound");
        Some(RemovedEntry {
            role: slot.role,
            connection: slot.connection,
        })
    }

    /// Removes the entry created by `binding`, if it is still the current one.
    ///
    /// Returns false when a forced close already took it or a newer binding
    /// replaced it.
    pub fn unbind_binding(&self, binding: &CallBinding) -> bool {
        let mut entries = self.entries.lock();
        let matches = entries
            .get(&binding.unit)
            .is_some_and(|slot| slot.id == binding.id);
        if !matches {
            return false;
        }
        let Some(slot) = entries.remove(&binding.unit) else {
            return false;
        };
        drop(entries);
        slot.state.set(EntryState::Released);
        self.counters.unbinds.fetch_add(1, Ordering::Relaxed);
        debug!(unit = %binding.unit, role = %slot.role, "call finished; unbound");
        true
    }

    /// Force-closes and removes the unit's entry.
    ///
    /// Returns whether a connection was actually closed. Calls that find
    /// nothing (never bound, already completed, already closed) are no-ops.
    pub fn close_and_unbind(&self, unit: UnitId) -> bool {
        let Some(slot) = self.entries.lock().remove(&unit) else {
            return false;
        };
        slot.state.set(EntryState::Closing);
        slot.connection.close();
        slot.state.set(EntryState::Dead);
        self.counters.forced_closes.fetch_add(1, Ordering::Relaxed);
        info!(
            unit = %unit,
            role = %slot.role,
            conn = %slot.connection.describe(),
            "connection force-closed"
        );
        true
    }

    /// True only while the unit has a live entry.
    ///
    /// "Never bound" and "already ended" both read as false.
    #[must_use]
    pub fn is_alive(&self, unit: UnitId) -> bool {
        self.entries
            .lock()
            .get(&unit)
            .is_some_and(|slot| slot.state.get() == EntryState::Live)
    }

    /// Role of the unit's current entry.
    #[must_use]
    pub fn role_of(&self, unit: UnitId) -> Option<Role> {
        self.entries.lock().get(&unit).map(|slot| slot.role)
    }

    /// Number of bound units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no unit is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Snapshot of the traffic counters.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            binds: self.counters.binds.load(Ordering::Relaxed),
            unbinds: self.counters.unbinds.load(Ordering::Relaxed),
            forced_closes: self.counters.forced_closes.load(Ordering::Relaxed),
            rejected_binds: self.counters.rejected_binds.load(Ordering::Relaxed),
        }
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CallRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRegistry")
            .field("bound", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}
