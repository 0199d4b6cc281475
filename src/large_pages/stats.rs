//! All counters use `Relaxed` ordering. They are written once, after the
//! remap completed, and are for diagnostic display only.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Readers should always use `load()`/`get()`, which clamp negative values to
/// zero.
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
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Bytes of text moved onto huge pages
crate::sync::static_atomic! {
    pub static REMAPPED_BYTES: Counter = Counter::new();
}
// Number of huge pages now backing text
crate::sync::static_atomic! {
    pub static REMAPPED_HUGE_PAGES: Counter = Counter::new();
}

/// Snapshot of what the remap achieved in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LargePagesStats {
    pub remapped_bytes: usize,
    pub remapped_huge_pages: usize,
}

/// Read the diagnostic counters.
#[must_use]
pub fn large_pages_stats() -> LargePagesStats {
    LargePagesStats {
        remapped_bytes: REMAPPED_BYTES.get(),
        remapped_huge_pages: REMAPPED_HUGE_PAGES.get(),
    }
}
