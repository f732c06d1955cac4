//! Capability context, cancellation state and the call registry.
//!
//! - [`Cx`]: what a unit task receives; its identity, cancellation flag and
//!   registry handle
//! - [`CallRegistry`]: unit-to-connection bindings shared by all units
//! - [`CancelState`]: the per-unit flag plus wake-up hooks

pub mod cancel;
pub mod cx;
pub mod registry;

pub use cancel::{CancelHook, CancelState};
pub use cx::Cx;
pub use registry::{
    CallBinding, CallRegistry, Connection, EntryState, RegistryError, RegistryStats, RemovedEntry,
    Role,
};
