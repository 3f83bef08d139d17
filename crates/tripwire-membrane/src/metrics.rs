//! Atomic counters for membrane observability.
//!
//! All counters use relaxed ordering. They are diagnostic, not
//! synchronization primitives.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-membrane operation counters.
#[derive(Debug)]
pub struct MembraneMetrics {
    /// Tracked allocations handed out.
    pub allocations: AtomicU64,
    /// Tracked blocks released.
    pub releases: AtomicU64,
    /// Releases of pointers not in the live list.
    pub bad_releases: AtomicU64,
    /// Bad releases matching a recently released block.
    pub double_releases: AtomicU64,
    /// Releases through the wrong allocation class.
    pub class_mismatches: AtomicU64,
    /// Footer or header sentinels found clobbered.
    pub corruptions: AtomicU64,
    /// Buffer operations clamped to the destination capacity.
    pub truncations: AtomicU64,
    /// Source buffers larger than their destination.
    pub potential_overruns: AtomicU64,
    /// Reads of poisoned or unterminated buffers.
    pub uninitialized_reads: AtomicU64,
    /// Null arguments and other caller misuse.
    pub usage_errors: AtomicU64,
    /// Allocations or table inserts refused for lack of room.
    pub exhaustions: AtomicU64,
    pub file_opens: AtomicU64,
    pub file_closes: AtomicU64,
    /// Closes of handles that were not open.
    pub bad_closes: AtomicU64,
    /// Opens that landed on a handle still marked open.
    pub handle_reuses: AtomicU64,
}

impl MembraneMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            bad_releases: AtomicU64::new(0),
            double_releases: AtomicU64::new(0),
            class_mismatches: AtomicU64::new(0),
            corruptions: AtomicU64::new(0),
            truncations: AtomicU64::new(0),
            potential_overruns: AtomicU64::new(0),
            uninitialized_reads: AtomicU64::new(0),
            usage_errors: AtomicU64::new(0),
            exhaustions: AtomicU64::new(0),
            file_opens: AtomicU64::new(0),
            file_closes: AtomicU64::new(0),
            bad_closes: AtomicU64::new(0),
            handle_reuses: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocations: Self::get(&self.allocations),
            releases: Self::get(&self.releases),
            bad_releases: Self::get(&self.bad_releases),
            double_releases: Self::get(&self.double_releases),
            class_mismatches: Self::get(&self.class_mismatches),
            corruptions: Self::get(&self.corruptions),
            truncations: Self::get(&self.truncations),
            potential_overruns: Self::get(&self.potential_overruns),
            uninitialized_reads: Self::get(&self.uninitialized_reads),
            usage_errors: Self::get(&self.usage_errors),
            exhaustions: Self::get(&self.exhaustions),
            file_opens: Self::get(&self.file_opens),
            file_closes: Self::get(&self.file_closes),
            bad_closes: Self::get(&self.bad_closes),
            handle_reuses: Self::get(&self.handle_reuses),
        }
    }
}

impl Default for MembraneMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all membrane counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub allocations: u64,
    pub releases: u64,
    pub bad_releases: u64,
    pub double_releases: u64,
    pub class_mismatches: u64,
    pub corruptions: u64,
    pub truncations: u64,
    pub potential_overruns: u64,
    pub uninitialized_reads: u64,
    pub usage_errors: u64,
    pub exhaustions: u64,
    pub file_opens: u64,
    pub file_closes: u64,
    pub bad_closes: u64,
    pub handle_reuses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = MembraneMetrics::new();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn increment_works() {
        let m = MembraneMetrics::new();
        MembraneMetrics::inc(&m.allocations);
        MembraneMetrics::inc(&m.allocations);
        MembraneMetrics::inc(&m.bad_closes);
        let snap = m.snapshot();
        assert_eq!(snap.allocations, 2);
        assert_eq!(snap.bad_closes, 1);
        assert_eq!(snap.releases, 0);
    }
}
