//! Heap usage reports.

use std::fmt;

use serde::Serialize;

/// One region found by a detailed heap walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HeapRegion {
    /// A block handed out by the heap. `size` includes the block header.
    Allocated {
        offset: usize,
        size: usize,
        requested: usize,
    },
    /// A free node. `size` excludes the node header.
    Free {
        offset: usize,
        size: usize,
        next: Option<usize>,
    },
}

/// Snapshot of heap usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeapStatus {
    pub heap_size: usize,
    pub used: usize,
    pub available: usize,
    /// User bytes requested by live blocks.
    pub requested: usize,
    pub allocations: u64,
    pub releases: u64,
    pub failures: u64,
    pub free_nodes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regions: Option<Vec<HeapRegion>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragmentation_pct: Option<u32>,
}

impl HeapStatus {
    /// Used bytes as a percentage of the heap.
    #[must_use]
    pub fn used_pct(&self) -> usize {
        if self.heap_size == 0 {
            0
        } else {
            self.used * 100 / self.heap_size
        }
    }

    /// Requested bytes as a percentage of used bytes (header and rounding waste).
    #[must_use]
    pub fn utilisation_pct(&self) -> usize {
        if self.used == 0 {
            100
        } else {
            self.requested * 100 / self.used
        }
    }
}

impl fmt::Display for HeapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "heap size: {} bytes", self.heap_size)?;
        if let Some(regions) = &self.regions {
            for region in regions {
                match *region {
                    HeapRegion::Allocated {
                        offset,
                        size,
                        requested,
                    } => writeln!(
                        f,
                        "  allocated {offset:>8}: {size:>8} bytes ({requested} requested)"
                    )?,
                    HeapRegion::Free { offset, size, next } => match next {
                        Some(next) => {
                            writeln!(f, "  free      {offset:>8}: {size:>8} bytes, next {next}")?;
                        }
                        None => writeln!(f, "  free      {offset:>8}: {size:>8} bytes, end")?,
                    },
                }
            }
        }
        if let Some(pct) = self.fragmentation_pct {
            writeln!(f, "fragmentation: {pct}% ({} free nodes)", self.free_nodes)?;
        }
        writeln!(
            f,
            "used {} of {} bytes ({}%), {} available, utilisation {}%",
            self.used,
            self.heap_size,
            self.used_pct(),
            self.available,
            self.utilisation_pct()
        )?;
        write!(
            f,
            "{} allocations, {} releases, {} failures",
            self.allocations, self.releases, self.failures
        )
    }
}
