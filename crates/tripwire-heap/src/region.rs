//! Raw access to the managed memory region.
//!
//! The heap never forms references into the region once it has been handed
//! over: allocated blocks belong to callers, who write through the pointers
//! they were given. All reads and writes here go through unaligned raw
//! pointer operations on offsets that the heap has already bounds-checked.

#![allow(unsafe_code)]

use std::marker::PhantomData;
use std::ptr::NonNull;

/// Borrowed, exclusively owned byte region addressed by offset.
pub(crate) struct Region<'a> {
    base: NonNull<u8>,
    len: usize,
    _borrow: PhantomData<&'a mut [u8]>,
}

// SAFETY: a `Region` is built from a unique `&'a mut [u8]`, so moving it to
// another thread moves that exclusive borrow with it.
unsafe impl Send for Region<'_> {}

impl<'a> Region<'a> {
    /// Take over `bytes`, skipping leading bytes so offset 0 is `align`-aligned.
    pub(crate) fn new(bytes: &'a mut [u8], align: usize) -> Self {
        let skew = bytes.as_ptr().align_offset(align).min(bytes.len());
        let usable = (bytes.len() - skew) / align * align;
        let tail = &mut bytes[skew..skew + usable];
        Self {
            base: NonNull::from(tail).cast::<u8>(),
            len: usable,
            _borrow: PhantomData,
        }
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn read_u64(&self, offset: usize) -> u64 {
        assert!(offset + 8 <= self.len, "region read past end at {offset}");
        // SAFETY: bounds checked above; the region is valid for `len` bytes.
        unsafe { self.base.as_ptr().add(offset).cast::<u64>().read_unaligned() }
    }

    pub(crate) fn write_u64(&mut self, offset: usize, value: u64) {
        assert!(offset + 8 <= self.len, "region write past end at {offset}");
        // SAFETY: bounds checked above; the region is valid for `len` bytes.
        unsafe {
            self.base
                .as_ptr()
                .add(offset)
                .cast::<u64>()
                .write_unaligned(value);
        }
    }

    /// Pointer to `offset` inside the region.
    pub(crate) fn pointer_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.len);
        // SAFETY: offset is within (or one past) the region, so the result
        // stays inside the same allocation and is non-null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Offset of `ptr` from the region base, if it points inside the region.
    pub(crate) fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let addr = ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        addr.checked_sub(base).filter(|&off| off < self.len)
    }

    pub(crate) fn fill(&mut self, offset: usize, len: usize, byte: u8) {
        assert!(offset + len <= self.len, "region fill past end at {offset}");
        // SAFETY: bounds checked above.
        unsafe { std::ptr::write_bytes(self.base.as_ptr().add(offset), byte, len) }
    }

    /// Copy `len` bytes between two offsets; ranges may overlap.
    pub(crate) fn copy_within(&mut self, from: usize, to: usize, len: usize) {
        assert!(from + len <= self.len && to + len <= self.len);
        // SAFETY: both ranges are inside the region; `copy` tolerates overlap.
        unsafe {
            std::ptr::copy(
                self.base.as_ptr().add(from),
                self.base.as_ptr().add(to),
                len,
            );
        }
    }
}
