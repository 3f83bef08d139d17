//! First-fit free-list allocator over a borrowed region.

use std::ptr::NonNull;

use crate::region::Region;
use crate::status::{HeapRegion, HeapStatus};
use crate::{ALIGN_UNIT, BLOCK_HEADER, HeapError, NIL, NODE_SIZE, block_size};

/// Callback invoked when an allocation-facing entry point fails.
pub type Reporter<'a> = Box<dyn FnMut(&HeapError) + Send + 'a>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Node {
    size: u64,
    next: u64,
}

/// Free-list heap manager.
///
/// The heap owns no memory of its own: it borrows the region for `'a` and
/// hands out pointers into it. Pointers stay valid until released or until
/// the heap is reset or dropped.
pub struct FreeListHeap<'a> {
    region: Region<'a>,
    front: u64,
    allocations: u64,
    releases: u64,
    failures: u64,
    live_requested: usize,
    reporter: Option<Reporter<'a>>,
}

impl std::fmt::Debug for FreeListHeap<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeListHeap")
            .field("heap_size", &self.region.len())
            .field("front", &self.front)
            .field("allocations", &self.allocations)
            .field("releases", &self.releases)
            .finish_non_exhaustive()
    }
}

impl<'a> FreeListHeap<'a> {
    /// Take over `bytes` and format it as a single free node.
    pub fn initialize(bytes: &'a mut [u8]) -> Result<Self, HeapError> {
        let len = bytes.len();
        let region = Region::new(bytes, ALIGN_UNIT);
        if region.len() < NODE_SIZE {
            return Err(HeapError::RegionTooSmall { len });
        }
        let mut heap = Self {
            region,
            front: 0,
            allocations: 0,
            releases: 0,
            failures: 0,
            live_requested: 0,
            reporter: None,
        };
        heap.reset();
        Ok(heap)
    }

    /// Forget every block and restore the single spanning free node.
    pub fn reset(&mut self) {
        let size = (self.region.len() - NODE_SIZE) as u64;
        self.set_node(0, Node { size, next: NIL });
        self.front = 0;
        self.allocations = 0;
        self.releases = 0;
        self.failures = 0;
        self.live_requested = 0;
    }

    /// Route failure reports to `reporter` instead of stderr.
    pub fn set_reporter(&mut self, reporter: impl FnMut(&HeapError) + Send + 'a) {
        self.reporter = Some(Box::new(reporter));
    }

    /// Drop failure reports entirely.
    pub fn silence(&mut self) {
        self.set_reporter(|_| {});
    }

    /// Managed bytes after alignment trimming.
    #[must_use]
    pub const fn heap_size(&self) -> usize {
        self.region.len()
    }

    /// Bytes not on the free list (block headers included).
    #[must_use]
    pub fn used(&self) -> usize {
        self.heap_size() - self.available()
    }

    /// Bytes on the free list (node headers included).
    #[must_use]
    pub fn available(&self) -> usize {
        self.free_nodes()
            .map(|(_, node)| node.size as usize + NODE_SIZE)
            .sum()
    }

    /// Allocate `n` bytes, reporting and returning `None` on exhaustion.
    pub fn allocate(&mut self, n: usize) -> Option<NonNull<u8>> {
        self.try_allocate(n).map_err(|err| self.report(err)).ok()
    }

    /// First-fit allocation of `n` user bytes.
    pub fn try_allocate(&mut self, n: usize) -> Result<NonNull<u8>, HeapError> {
        let size = block_size(n);
        let mut prev: Option<usize> = None;
        let mut cursor = self.front;

        while cursor != NIL {
            let offset = cursor as usize;
            let node = self.node(offset);
            let node_size = node.size as usize;

            let replacement = if size == node_size + NODE_SIZE {
                // Whole node, header included: unlink without leaving a residue.
                Some(node.next)
            } else if size <= node_size {
                let split = offset + size;
                self.set_node(
                    split,
                    Node {
                        size: (node_size - size) as u64,
                        next: node.next,
                    },
                );
                Some(split as u64)
            } else {
                None
            };

            if let Some(replacement) = replacement {
                match prev {
                    Some(p) => {
                        let mut pred = self.node(p);
                        pred.next = replacement;
                        self.set_node(p, pred);
                    }
                    None => self.front = replacement,
                }
                if replacement != NIL && replacement as usize == offset + size {
                    self.coalesce(replacement as usize);
                }
                self.region.write_u64(offset, n as u64);
                self.allocations += 1;
                self.live_requested += n;
                return Ok(self.region.pointer_at(offset + BLOCK_HEADER));
            }

            prev = Some(offset);
            cursor = node.next;
        }

        Err(HeapError::Exhausted { requested: n })
    }

    /// Allocate `count * size` zeroed bytes.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let Some(total) = count.checked_mul(size) else {
            self.report(HeapError::Exhausted {
                requested: usize::MAX,
            });
            return None;
        };
        let ptr = self.allocate(total)?;
        let user = self.region.offset_of(ptr)?;
        self.region.fill(user, total, 0);
        Some(ptr)
    }

    /// Return a block to the free list.
    pub fn release(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let (offset, requested) = self.block_at(ptr)?;
        let size = block_size(requested);
        let (prev, next) = self.insertion_point(offset, size)?;

        self.set_node(
            offset,
            Node {
                size: (size - NODE_SIZE) as u64,
                next,
            },
        );
        match prev {
            Some(p) => {
                let mut pred = self.node(p);
                pred.next = offset as u64;
                self.set_node(p, pred);
            }
            None => self.front = offset as u64,
        }
        self.coalesce(offset);
        if let Some(p) = prev {
            self.coalesce(p);
        }

        self.releases += 1;
        self.live_requested = self.live_requested.saturating_sub(requested);
        Ok(())
    }

    /// Allocate `n` bytes, move the old contents over, then release `ptr`.
    ///
    /// On failure the old block is untouched.
    pub fn resize(&mut self, ptr: Option<NonNull<u8>>, n: usize) -> Option<NonNull<u8>> {
        let Some(old) = ptr else {
            return self.allocate(n);
        };
        self.try_resize(old, n).map_err(|err| self.report(err)).ok()
    }

    pub fn try_resize(&mut self, old: NonNull<u8>, n: usize) -> Result<NonNull<u8>, HeapError> {
        let (offset, requested) = self.block_at(old)?;
        self.insertion_point(offset, block_size(requested))?;

        let fresh = self.try_allocate(n)?;
        let to = self
            .region
            .offset_of(fresh)
            .ok_or(HeapError::ForeignPointer { offset: None })?;
        self.region
            .copy_within(offset + BLOCK_HEADER, to, requested.min(n));
        self.release(old)?;
        Ok(fresh)
    }

    /// Requested size recorded for an allocated block.
    pub fn requested_size(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        self.block_at(ptr).map(|(_, requested)| requested)
    }

    /// Totals, plus a full region walk when `detailed`.
    ///
    /// # Panics
    ///
    /// The detailed walk asserts the free list and block headers agree; a
    /// mismatch means the region has been corrupted.
    #[must_use]
    pub fn status(&self, detailed: bool) -> HeapStatus {
        let heap_size = self.heap_size();
        let free_nodes = self.free_nodes().count();
        let available = self.available();
        let mut status = HeapStatus {
            heap_size,
            used: heap_size - available,
            available,
            requested: self.live_requested,
            allocations: self.allocations,
            releases: self.releases,
            failures: self.failures,
            free_nodes,
            regions: None,
            fragmentation_pct: None,
        };
        if detailed {
            status.regions = Some(self.walk());
            status.fragmentation_pct = Some(fragmentation_pct(free_nodes, heap_size));
        }
        status
    }

    fn walk(&self) -> Vec<HeapRegion> {
        let mut regions = Vec::new();
        let mut cursor = 0usize;
        let mut last_free_end: Option<usize> = None;

        for (offset, node) in self.free_nodes() {
            assert!(
                offset >= cursor,
                "free list out of order: node at {offset} behind cursor {cursor}"
            );
            assert!(
                last_free_end != Some(offset),
                "adjacent free nodes at {offset} were not coalesced"
            );
            let reached = self.walk_allocated(cursor, offset, &mut regions);
            assert_eq!(reached, offset, "allocated blocks overrun the free node at {offset}");
            let size = node.size as usize;
            let end = offset + NODE_SIZE + size;
            assert!(
                end <= self.heap_size(),
                "free node at {offset} runs past the heap end"
            );
            regions.push(HeapRegion::Free {
                offset,
                size,
                next: (node.next != NIL).then_some(node.next as usize),
            });
            cursor = end;
            last_free_end = Some(end);
        }
        let end = self.walk_allocated(cursor, self.heap_size(), &mut regions);
        assert_eq!(end, self.heap_size(), "allocated blocks overrun the heap end");
        regions
    }

    fn walk_allocated(&self, mut cursor: usize, limit: usize, regions: &mut Vec<HeapRegion>) -> usize {
        while cursor < limit {
            let requested = self.region.read_u64(cursor) as usize;
            let size = block_size(requested);
            assert!(
                cursor + size <= limit,
                "allocated block at {cursor} ({size} bytes) overlaps the next region at {limit}"
            );
            regions.push(HeapRegion::Allocated {
                offset: cursor,
                size,
                requested,
            });
            cursor += size;
        }
        cursor
    }

    fn block_at(&self, ptr: NonNull<u8>) -> Result<(usize, usize), HeapError> {
        let user = self
            .region
            .offset_of(ptr)
            .ok_or(HeapError::ForeignPointer { offset: None })?;
        if user < BLOCK_HEADER || user % ALIGN_UNIT != 0 {
            return Err(HeapError::ForeignPointer { offset: Some(user) });
        }
        let offset = user - BLOCK_HEADER;
        let requested = usize::try_from(self.region.read_u64(offset)).unwrap_or(usize::MAX);
        let fits = offset
            .checked_add(block_size(requested))
            .is_some_and(|end| end <= self.heap_size());
        if !fits {
            return Err(HeapError::ForeignPointer {
                offset: Some(offset),
            });
        }
        Ok((offset, requested))
    }

    /// Predecessor and successor of a block about to be freed.
    fn insertion_point(&self, offset: usize, size: usize) -> Result<(Option<usize>, u64), HeapError> {
        let mut prev: Option<usize> = None;
        let mut cursor = self.front;
        while cursor != NIL && (cursor as usize) < offset {
            prev = Some(cursor as usize);
            cursor = self.node(cursor as usize).next;
        }
        if prev.is_some_and(|p| p + NODE_SIZE + self.node(p).size as usize > offset) {
            return Err(HeapError::AlreadyFree { offset });
        }
        if cursor != NIL && (cursor as usize) < offset + size {
            return Err(HeapError::AlreadyFree { offset });
        }
        Ok((prev, cursor))
    }

    /// Absorb every free node that starts exactly where `offset` ends.
    fn coalesce(&mut self, offset: usize) {
        let mut node = self.node(offset);
        while node.next != NIL && offset + NODE_SIZE + node.size as usize == node.next as usize {
            let absorbed = self.node(node.next as usize);
            node.size += NODE_SIZE as u64 + absorbed.size;
            node.next = absorbed.next;
        }
        self.set_node(offset, node);
    }

    fn free_nodes(&self) -> impl Iterator<Item = (usize, Node)> + '_ {
        let mut cursor = self.front;
        std::iter::from_fn(move || {
            if cursor == NIL {
                return None;
            }
            let offset = cursor as usize;
            let node = self.node(offset);
            cursor = node.next;
            Some((offset, node))
        })
    }

    fn node(&self, offset: usize) -> Node {
        Node {
            size: self.region.read_u64(offset),
            next: self.region.read_u64(offset + 8),
        }
    }

    fn set_node(&mut self, offset: usize, node: Node) {
        self.region.write_u64(offset, node.size);
        self.region.write_u64(offset + 8, node.next);
    }

    fn report(&mut self, err: HeapError) {
        self.failures += 1;
        match self.reporter.as_mut() {
            Some(reporter) => reporter(&err),
            None => eprintln!("tripwire-heap: allocation failure: {err}"),
        }
    }
}

/// Free nodes as a percentage of the most nodes the heap could ever hold.
fn fragmentation_pct(free_nodes: usize, heap_size: usize) -> u32 {
    let max_nodes = (heap_size / NODE_SIZE).max(1);
    u32::try_from(free_nodes * 100 / max_nodes).unwrap_or(u32::MAX)
}
