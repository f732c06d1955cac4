//! Identifier types for execution units.
//!
//! A [`UnitId`] names one schedulable thread of control driving at most one
//! in-flight call. Identifiers are process-unique and never reused, so a
//! stale id held by a late canceller can never alias a newer unit.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// A unique identifier for an execution unit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(u64);

impl UnitId {
    /// Allocates the next process-unique unit id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates a unit ID for testing purposes.
    ///
    /// Test ids live in the same space as allocated ids; tests that mix both
    /// should pick values well above anything [`next`](Self::next) hands out.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw numeric value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for UnitId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnitId({})", self.0)
    }
}

impl fmt::Display for UnitId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;

    fn init_test(test_name: &str) {
        init_test_logging();
        crate::test_phase!(test_name);
    }

    #[test]
    fn next_is_unique_and_increasing() {
        init_test("next_is_unique_and_increasing");
        let a = UnitId::next();
        let b = UnitId::next();
        crate::assert_with_log!(a < b, "ids should increase", true, a < b);
        crate::assert_with_log!(a != b, "ids should be unique", true, a != b);
        crate::test_complete!("next_is_unique_and_increasing");
    }

    #[test]
    fn next_is_unique_across_threads() {
        init_test("next_is_unique_across_threads");
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..64).map(|_| UnitId::next()).collect::<Vec<_>>()))
            .collect();
        let mut all: Vec<UnitId> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("id thread panicked"))
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        crate::assert_with_log!(all.len() == total, "no duplicate ids", total, all.len());
        crate::test_complete!("next_is_unique_across_threads");
    }

    #[test]
    fn debug_and_display_forms() {
        init_test("debug_and_display_forms");
        let id = UnitId::new_for_test(42);
        assert_eq!(format!("{id:?}"), "UnitId(42)");
        assert_eq!(format!("{id}"), "U42");
        assert_eq!(id.as_u64(), 42);
        crate::test_complete!("debug_and_display_forms");
    }

    #[test]
    fn serializes_as_plain_number() {
        init_test("serializes_as_plain_number");
        let id = UnitId::new_for_test(7);
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "7");
        let back: UnitId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
        crate::test_complete!("serializes_as_plain_number");
    }
}
