//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., total may briefly disagree with the sum of
//! per-subsystem counters). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Address space reserved by pool backings (pinned reservations and memfd sizes)
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Bytes currently committed or mapped for pool use
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}

// Breakdown by subsystem
crate::sync::static_atomic! {
    pub static BLOCK_POOL_COMMITTED: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static STATE_TABLE_COMMITTED: Counter = Counter::new();
}
// Superseded views kept alive until their mapping is dropped
crate::sync::static_atomic! {
    pub static RETIRED_MAPPINGS: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static STATE_POOL_LIVE: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static STATE_STREAM_BLOCKS: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_clamps_negative() {
        let c = Counter::new();
        c.sub(10);
        assert_eq!(c.get(), 0);
        c.add(25);
        assert_eq!(c.get(), 15);
    }

    #[test]
    fn test_counter_clamps_huge_delta() {
        let c = Counter::new();
        c.add(usize::MAX);
        assert_eq!(c.get(), isize::MAX as usize);
    }
}
