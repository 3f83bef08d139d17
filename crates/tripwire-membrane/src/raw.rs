//! Underlying allocators the tracker delegates to.

#![allow(unsafe_code)]

use std::alloc::{Layout, alloc, dealloc};
use std::ptr::NonNull;

use tripwire_heap::FreeListHeap;

use crate::error::MembraneError;

/// Alignment of blocks from [`HostAllocator`].
pub const HOST_ALIGN: usize = 16;

/// Allocator boundary: hand out and take back raw byte ranges.
pub trait RawAllocator {
    /// Allocate `size` bytes, or `None` when the pool is exhausted.
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Return a block. An error means the pool refused it and the storage
    /// was not reclaimed.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this allocator with the same
    /// `size`, and must not be used afterwards.
    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), MembraneError>;

    /// Short label for reports.
    fn name(&self) -> &'static str;
}

/// The process allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostAllocator;

impl RawAllocator for HostAllocator {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size.max(1), HOST_ALIGN).ok()?;
        // SAFETY: layout has non-zero size.
        NonNull::new(unsafe { alloc(layout) })
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), MembraneError> {
        let layout = Layout::from_size_align(size.max(1), HOST_ALIGN)
            .map_err(|_| MembraneError::Layout { size })?;
        // SAFETY: caller guarantees ptr came from `allocate` with this size,
        // which used the same layout.
        unsafe { dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn name(&self) -> &'static str {
        "host"
    }
}

/// [`FreeListHeap`] as an underlying allocator.
///
/// The heap's own failure reports are silenced; the tracker reports
/// exhaustion with call-site context instead.
#[derive(Debug)]
pub struct HeapAllocator {
    heap: FreeListHeap<'static>,
}

impl HeapAllocator {
    /// Manage `region` for the rest of the process.
    pub fn new(region: &'static mut [u8]) -> Result<Self, MembraneError> {
        let mut heap = FreeListHeap::initialize(region)?;
        heap.silence();
        Ok(Self { heap })
    }

    /// Allocate a fresh region of `len` bytes and leak it into a heap.
    pub fn with_capacity(len: usize) -> Result<Self, MembraneError> {
        Self::new(Vec::leak(vec![0u8; len]))
    }

    #[must_use]
    pub fn heap(&self) -> &FreeListHeap<'static> {
        &self.heap
    }
}

impl RawAllocator for HeapAllocator {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.heap.allocate(size)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, _size: usize) -> Result<(), MembraneError> {
        self.heap.release(ptr)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "free-list heap"
    }
}
