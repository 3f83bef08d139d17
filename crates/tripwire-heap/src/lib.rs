//! Portable first-fit free-list heap.
//!
//! `tripwire-heap` manages a caller-owned byte region as an offset-addressed,
//! singly-linked list of free nodes kept in ascending address order. It is
//! meant for targets where no platform allocator is available or where the
//! platform allocator is the thing under suspicion.
//!
//! # Layout
//!
//! - **Free node** (`NODE_SIZE` bytes): `size` (bytes following the node
//!   header) and `next` (offset of the next free node, or [`NIL`]).
//! - **Allocated block**: one header word holding the requested size,
//!   followed by the user bytes. Block sizes are rounded up to
//!   [`ALIGN_UNIT`] and never smaller than a node, so any released block can
//!   hold a node in place.
//!
//! Allocation is first-fit with splitting; release inserts in address order
//! and coalesces with both neighbours.

#![deny(unsafe_code)]

pub mod heap;
mod region;
pub mod status;

use thiserror::Error;

pub use heap::FreeListHeap;
pub use status::{HeapRegion, HeapStatus};

/// Machine word used for every on-region field.
pub const WORD: usize = 8;

/// Alignment unit for block sizes and returned pointers.
pub const ALIGN_UNIT: usize = WORD;

/// Free node header: `size` word + `next` word.
pub const NODE_SIZE: usize = 2 * WORD;

/// Allocated block header: one word holding the requested size.
pub const BLOCK_HEADER: usize = WORD;

/// Free-list terminator. Offset 0 is a legal node position, so the
/// terminator lives outside the addressable range.
pub const NIL: u64 = u64::MAX;

/// Failures reported by the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    /// The region cannot hold a single free node after alignment.
    #[error("region of {len} bytes cannot hold a free node")]
    RegionTooSmall { len: usize },
    /// No free node is large enough.
    #[error("heap exhausted: no free block for {requested} bytes")]
    Exhausted { requested: usize },
    /// The pointer was not produced by this heap.
    #[error("pointer at offset {offset:?} was not allocated from this heap")]
    ForeignPointer { offset: Option<usize> },
    /// The block is already on the free list.
    #[error("block at offset {offset} is already free")]
    AlreadyFree { offset: usize },
}

/// Bytes a request of `requested` user bytes occupies, header included.
#[must_use]
pub const fn block_size(requested: usize) -> usize {
    let raw = requested.saturating_add(BLOCK_HEADER);
    let rounded = raw.saturating_add(ALIGN_UNIT - 1) / ALIGN_UNIT * ALIGN_UNIT;
    if rounded < NODE_SIZE { NODE_SIZE } else { rounded }
}
