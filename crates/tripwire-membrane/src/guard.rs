//! Buffer operation guard.
//!
//! Capacity-aware stand-ins for the C copy, fill, compare and scan
//! primitives. A buffer's capacity is the remainder of the tracked block it
//! points into when there is one, else what the caller declared, else
//! unknown. Writes beyond a known capacity are clamped and reported;
//! reads of poisoned or unterminated input are reported and answered with
//! a neutral result.
//!
//! # Safety
//!
//! Every primitive here dereferences raw pointers. Arguments must be null
//! or valid for the accesses the corresponding C function performs, with
//! declared capacities no larger than the real buffers. The guard only
//! narrows those accesses.

#![allow(unsafe_code)]

use std::ffi::c_int;
use std::ptr;

use crate::diag::ReportKind;
use crate::fs::FileSystem;
use crate::membrane::Membrane;
use crate::metrics::MembraneMetrics;
use crate::site::CallSite;
use crate::tracker::{AllocationClass, Fill};

/// Capacity the caller vouches for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Capacity {
    /// Nothing is known; only tracked blocks are bounded.
    #[default]
    Unknown,
    /// The buffer holds this many bytes.
    Declared(usize),
}

impl Capacity {
    #[must_use]
    pub const fn declared(self) -> Option<usize> {
        match self {
            Self::Unknown => None,
            Self::Declared(n) => Some(n),
        }
    }
}

/// What the guard does with a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Fits.
    Allow,
    /// Exceeds the destination; clamp to `effective_len`.
    Truncate,
    /// Fits, but the source buffer is larger than the destination.
    Warn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyDecision {
    pub disposition: Disposition,
    pub effective_len: usize,
}

/// Decide a write of `required` bytes into `available` bytes.
#[must_use]
pub fn decide_copy(
    required: usize,
    available: Option<usize>,
    source_hint: Option<usize>,
) -> CopyDecision {
    match (available, source_hint) {
        (Some(avail), _) if required > avail => CopyDecision {
            disposition: Disposition::Truncate,
            effective_len: avail,
        },
        (Some(avail), Some(source)) if source > avail => CopyDecision {
            disposition: Disposition::Warn,
            effective_len: required,
        },
        _ => CopyDecision {
            disposition: Disposition::Allow,
            effective_len: required,
        },
    }
}

/// One guarded write.
struct CopyPlan {
    /// Bytes the operation wants to write.
    required: usize,
    /// Bytes the destination can take.
    available: Option<usize>,
    /// Full size of the source buffer, for potential-overrun warnings.
    source_hint: Option<usize>,
    /// Bytes actually readable from the source.
    source_bytes: usize,
    /// Report label for `required`.
    what: &'static str,
    check_overlap: bool,
}

fn overlaps(a: *const u8, b: *const u8, len: usize) -> bool {
    let (a, b) = (a as usize, b as usize);
    len > 0 && a < b.saturating_add(len) && b < a.saturating_add(len)
}

/// Length of the string at `s`, scanning at most `limit` bytes.
///
/// # Safety
///
/// `s` must be readable for `limit` bytes or up to its terminator.
unsafe fn strnlen(s: *const u8, limit: usize) -> Option<usize> {
    // SAFETY: forwarded from the caller.
    (0..limit).find(|&i| unsafe { *s.add(i) } == 0)
}

impl<F: FileSystem> Membrane<F> {
    fn checks(&self) -> bool {
        self.config.mode.checks_enabled()
    }

    /// Best-known capacity of `ptr`.
    #[must_use]
    pub fn size_hint(&self, ptr: *const u8, declared: Capacity) -> Option<usize> {
        self.tracker.size_hint(ptr).or(declared.declared())
    }

    fn usage(&mut self, op: &str, site: CallSite<'_>, detail: impl Into<String>) {
        MembraneMetrics::inc(&self.journal.metrics.usage_errors);
        self.journal.report(ReportKind::Usage, op, site, detail);
    }

    /// Report and refuse a tracked block whose first word is still poisoned.
    fn reject_uninitialized(&mut self, op: &str, ptr: *const u8, site: CallSite<'_>) -> bool {
        if !self.tracker.is_uninitialized(ptr) {
            return false;
        }
        MembraneMetrics::inc(&self.journal.metrics.uninitialized_reads);
        let allocated = self
            .tracker
            .block(ptr)
            .map(|b| self.journal.describe(b.site))
            .unwrap_or_default();
        self.journal.report(
            ReportKind::Usage,
            op,
            site,
            format!("reading uninitialized memory allocated at {allocated}"),
        );
        true
    }

    /// Length of a string argument, or `None` after reporting why it cannot
    /// be read.
    unsafe fn checked_strlen(
        &mut self,
        op: &str,
        s: *const u8,
        declared: Capacity,
        site: CallSite<'_>,
    ) -> Option<usize> {
        if s.is_null() {
            self.usage(op, site, "null string argument");
            return None;
        }
        if self.reject_uninitialized(op, s, site) {
            return None;
        }
        match self.size_hint(s, declared) {
            // SAFETY: the string is readable for its known capacity.
            Some(limit) => match unsafe { strnlen(s, limit) } {
                Some(len) => Some(len),
                None => {
                    MembraneMetrics::inc(&self.journal.metrics.uninitialized_reads);
                    self.journal.report(
                        ReportKind::Usage,
                        op,
                        site,
                        format!("string not terminated within its {limit} bytes"),
                    );
                    None
                }
            },
            // SAFETY: no bound is known; the caller promises a terminated string.
            None => Some(unsafe { libc::strlen(s.cast()) }),
        }
    }

    /// Clamp, report and perform one write. Returns the effective length;
    /// `min(effective, source_bytes)` bytes are copied.
    unsafe fn guarded_copy(
        &mut self,
        op: &str,
        dst: *mut u8,
        src: *const u8,
        plan: &CopyPlan,
        site: CallSite<'_>,
    ) -> usize {
        let decision = decide_copy(plan.required, plan.available, plan.source_hint);
        match decision.disposition {
            Disposition::Truncate => {
                MembraneMetrics::inc(&self.journal.metrics.truncations);
                self.journal.report(
                    ReportKind::Overrun,
                    op,
                    site,
                    format!(
                        "target space {}, {} {}",
                        decision.effective_len, plan.what, plan.required
                    ),
                );
            }
            Disposition::Warn => {
                MembraneMetrics::inc(&self.journal.metrics.potential_overruns);
                self.journal.report(
                    ReportKind::PotentialOverrun,
                    op,
                    site,
                    format!(
                        "source space {} exceeds target space {}",
                        plan.source_hint.unwrap_or_default(),
                        plan.available.unwrap_or_default()
                    ),
                );
            }
            Disposition::Allow => {}
        }
        let len = decision.effective_len.min(plan.source_bytes);
        if plan.check_overlap && overlaps(dst, src, len) {
            self.usage(op, site, format!("source and target overlap within {len} bytes"));
        }
        // SAFETY: len fits the destination's known capacity (or the caller's
        // contract when unknown) and the source's readable bytes; `copy`
        // tolerates the overlap reported above.
        unsafe { ptr::copy(src, dst, len) };
        decision.effective_len
    }

    /// Guarded `memcpy`. Overlap is reported, then handled like `memmove`.
    ///
    /// # Safety
    ///
    /// See the [module documentation](self).
    pub unsafe fn memcpy(
        &mut self,
        dst: *mut u8,
        dst_cap: Capacity,
        src: *const u8,
        n: usize,
        site: CallSite<'_>,
    ) -> *mut u8 {
        // SAFETY: forwarded contract.
        unsafe { self.mem_copy("memcpy", dst, dst_cap, src, n, true, site) }
    }

    /// Guarded `memmove`.
    ///
    /// # Safety
    ///
    /// See the [module documentation](self).
    pub unsafe fn memmove(
        &mut self,
        dst: *mut u8,
        dst_cap: Capacity,
        src: *const u8,
        n: usize,
        site: CallSite<'_>,
    ) -> *mut u8 {
        // SAFETY: forwarded contract.
        unsafe { self.mem_copy("memmove", dst, dst_cap, src, n, false, site) }
    }

    #[allow(clippy::too_many_arguments)]
    unsafe fn mem_copy(
        &mut self,
        op: &str,
        dst: *mut u8,
        dst_cap: Capacity,
        src: *const u8,
        n: usize,
        check_overlap: bool,
        site: CallSite<'_>,
    ) -> *mut u8 {
        if !self.checks() {
            // SAFETY: passthrough under the caller's contract.
            unsafe { ptr::copy(src, dst, n) };
            return dst;
        }
        if n == 0 {
            return dst;
        }
        if dst.is_null() || src.is_null() {
            self.usage(op, site, format!("null argument copying {n} bytes"));
            return dst;
        }
        if self.reject_uninitialized(op, src, site) {
            return dst;
        }
        let plan = CopyPlan {
            required: n,
            available: self.size_hint(dst, dst_cap),
            source_hint: None,
            source_bytes: n,
            what: "copy length",
            check_overlap,
        };
        // SAFETY: forwarded contract, clamped by the plan.
        unsafe { self.guarded_copy(op, dst, src, &plan, site) };
        dst
    }

    /// Guarded `strcpy`. A clamped copy is not terminated.
    ///
    /// # Safety
    ///
    /// See the [module documentation](self).
    pub unsafe fn strcpy(
        &mut self,
        dst: *mut u8,
        dst_cap: Capacity,
        src: *const u8,
        src_cap: Capacity,
        site: CallSite<'_>,
    ) -> *mut u8 {
        // SAFETY: forwarded contract.
        unsafe { self.string_copy("strcpy", dst, dst_cap, src, src_cap, site) };
        dst
    }

    /// Guarded `stpcpy`: returns a pointer to the last byte written, the
    /// terminator when the copy was not clamped.
    ///
    /// # Safety
    ///
    /// See the [module documentation](self).
    pub unsafe fn stpcpy(
        &mut self,
        dst: *mut u8,
        dst_cap: Capacity,
        src: *const u8,
        src_cap: Capacity,
        site: CallSite<'_>,
    ) -> *mut u8 {
        // SAFETY: forwarded contract.
        let written = unsafe { self.string_copy("stpcpy", dst, dst_cap, src, src_cap, site) };
        // SAFETY: written bytes lie inside dst.
        unsafe { dst.add(written.saturating_sub(1)) }
    }

    unsafe fn string_copy(
        &mut self,
        op: &str,
        dst: *mut u8,
        dst_cap: Capacity,
        src: *const u8,
        src_cap: Capacity,
        site: CallSite<'_>,
    ) -> usize {
        if !self.checks() {
            // SAFETY: passthrough under the caller's contract.
            let len = unsafe { libc::strlen(src.cast()) } + 1;
            // SAFETY: as above.
            unsafe { ptr::copy(src, dst, len) };
            return len;
        }
        if dst.is_null() {
            self.usage(op, site, "null target");
            return 0;
        }
        // SAFETY: forwarded contract.
        let Some(len) = (unsafe { self.checked_strlen(op, src, src_cap, site) }) else {
            return 0;
        };
        let plan = CopyPlan {
            required: len + 1,
            available: self.size_hint(dst, dst_cap),
            source_hint: self.size_hint(src, src_cap),
            source_bytes: len + 1,
            what: "source length",
            check_overlap: true,
        };
        // SAFETY: forwarded contract, clamped by the plan.
        unsafe { self.guarded_copy(op, dst, src, &plan, site) }
    }

    /// Guarded `strncpy`: copies at most `n` bytes and pads with zeros up
    /// to `n`, both clamped to the destination.
    ///
    /// # Safety
    ///
    /// See the [module documentation](self).
    pub unsafe fn strncpy(
        &mut self,
        dst: *mut u8,
        dst_cap: Capacity,
        src: *const u8,
        src_cap: Capacity,
        n: usize,
        site: CallSite<'_>,
    ) -> *mut u8 {
        const OP: &str = "strncpy";
        if !self.checks() {
            // SAFETY: passthrough under the caller's contract.
            unsafe { libc::strncpy(dst.cast(), src.cast(), n) };
            return dst;
        }
        if n == 0 {
            return dst;
        }
        if dst.is_null() || src.is_null() {
            self.usage(OP, site, "null argument");
            return dst;
        }
        if self.reject_uninitialized(OP, src, site) {
            return dst;
        }
        let bound = self.size_hint(src, src_cap).map_or(n, |h| h.min(n));
        // SAFETY: src is readable for `bound` bytes or to its terminator.
        let len = unsafe { strnlen(src, bound) }.unwrap_or_else(|| {
            if bound < n {
                self.usage(OP, site, format!("source not terminated within its {bound} bytes"));
            }
            bound
        });
        let plan = CopyPlan {
            required: n,
            available: self.size_hint(dst, dst_cap),
            source_hint: None,
            source_bytes: len,
            what: "copy length",
            check_overlap: true,
        };
        // SAFETY: forwarded contract, clamped by the plan.
        let effective = unsafe { self.guarded_copy(OP, dst, src, &plan, site) };
        if effective > len {
            // SAFETY: [len, effective) lies inside the clamped destination.
            unsafe { ptr::write_bytes(dst.add(len), 0, effective - len) };
        }
        dst
    }

    /// Guarded `strcat`. A clamped append is not terminated.
    ///
    /// # Safety
    ///
    /// See the [module documentation](self).
    pub unsafe fn strcat(
        &mut self,
        dst: *mut u8,
        dst_cap: Capacity,
        src: *const u8,
        src_cap: Capacity,
        site: CallSite<'_>,
    ) -> *mut u8 {
        // SAFETY: forwarded contract.
        unsafe { self.append("strcat", dst, dst_cap, src, src_cap, None, site) };
        dst
    }

    /// Guarded `strncat`: appends at most `n` bytes and always terminates
    /// when the destination has room.
    ///
    /// # Safety
    ///
    /// See the [module documentation](self).
    pub unsafe fn strncat(
        &mut self,
        dst: *mut u8,
        dst_cap: Capacity,
        src: *const u8,
        src_cap: Capacity,
        n: usize,
        site: CallSite<'_>,
    ) -> *mut u8 {
        // SAFETY: forwarded contract.
        unsafe { self.append("strncat", dst, dst_cap, src, src_cap, Some(n), site) };
        dst
    }

    #[allow(clippy::too_many_arguments)]
    unsafe fn append(
        &mut self,
        op: &str,
        dst: *mut u8,
        dst_cap: Capacity,
        src: *const u8,
        src_cap: Capacity,
        limit: Option<usize>,
        site: CallSite<'_>,
    ) {
        if !self.checks() {
            // SAFETY: passthrough under the caller's contract.
            unsafe {
                match limit {
                    Some(n) => libc::strncat(dst.cast(), src.cast(), n),
                    None => libc::strcat(dst.cast(), src.cast()),
                };
            }
            return;
        }
        // SAFETY: forwarded contract.
        let Some(dst_len) = (unsafe { self.checked_strlen(op, dst, dst_cap, site) }) else {
            return;
        };
        let src_len = match limit {
            Some(n) => {
                if src.is_null() {
                    self.usage(op, site, "null string argument");
                    return;
                }
                if self.reject_uninitialized(op, src, site) {
                    return;
                }
                let bound = self.size_hint(src, src_cap).map_or(n, |h| h.min(n));
                // SAFETY: src is readable for `bound` bytes or to its terminator.
                unsafe { strnlen(src, bound) }.unwrap_or(bound)
            }
            // SAFETY: forwarded contract.
            None => match unsafe { self.checked_strlen(op, src, src_cap, site) } {
                Some(len) => len,
                None => return,
            },
        };
        let available = self
            .size_hint(dst, dst_cap)
            .map(|cap| cap.saturating_sub(dst_len));
        let plan = CopyPlan {
            required: src_len + 1,
            available,
            source_hint: limit.is_none().then(|| self.size_hint(src, src_cap)).flatten(),
            source_bytes: if limit.is_some() { src_len } else { src_len + 1 },
            what: "source length",
            check_overlap: true,
        };
        // SAFETY: dst_len < capacity, so the tail is inside dst.
        let tail = unsafe { dst.add(dst_len) };
        // SAFETY: forwarded contract, clamped by the plan.
        let effective = unsafe { self.guarded_copy(op, tail, src, &plan, site) };
        if limit.is_some() && effective > src_len {
            // SAFETY: effective bytes fit after dst_len.
            unsafe { *tail.add(src_len) = 0 };
        }
    }

    /// Guarded `memset`.
    ///
    /// # Safety
    ///
    /// See the [module documentation](self).
    pub unsafe fn memset(
        &mut self,
        dst: *mut u8,
        dst_cap: Capacity,
        byte: u8,
        n: usize,
        site: CallSite<'_>,
    ) -> *mut u8 {
        const OP: &str = "memset";
        let mut len = n;
        if self.checks() {
            if n == 0 {
                return dst;
            }
            if dst.is_null() {
                self.usage(OP, site, format!("null target filling {n} bytes"));
                return dst;
            }
            match self.size_hint(dst, dst_cap) {
                Some(avail) if n > avail => {
                    MembraneMetrics::inc(&self.journal.metrics.truncations);
                    self.journal.report(
                        ReportKind::Overrun,
                        OP,
                        site,
                        format!("target space {avail}, fill length {n}"),
                    );
                    len = avail;
                }
                _ => {}
            }
        }
        // SAFETY: len is clamped to the known capacity.
        unsafe { ptr::write_bytes(dst, byte, len) };
        dst
    }

    /// Neutral comparison result: which operands are present at all.
    fn neutral_compare(s1: *const u8, s2: *const u8) -> c_int {
        c_int::from(!s1.is_null()) - c_int::from(!s2.is_null())
    }

    /// Guarded `memcmp`. The length is clamped to both operands.
    ///
    /// # Safety
    ///
    /// See the [module documentation](self).
    pub unsafe fn memcmp(
        &mut self,
        s1: *const u8,
        s1_cap: Capacity,
        s2: *const u8,
        s2_cap: Capacity,
        n: usize,
        site: CallSite<'_>,
    ) -> c_int {
        const OP: &str = "memcmp";
        let mut len = n;
        if self.checks() {
            if n == 0 {
                return 0;
            }
            if s1.is_null() || s2.is_null() {
                self.usage(OP, site, "null operand");
                return Self::neutral_compare(s1, s2);
            }
            if self.reject_uninitialized(OP, s1, site) | self.reject_uninitialized(OP, s2, site) {
                return Self::neutral_compare(s1, s2);
            }
            let limit = [self.size_hint(s1, s1_cap), self.size_hint(s2, s2_cap)]
                .into_iter()
                .flatten()
                .min();
            match limit {
                Some(limit) if n > limit => {
                    MembraneMetrics::inc(&self.journal.metrics.truncations);
                    self.journal.report(
                        ReportKind::Overrun,
                        OP,
                        site,
                        format!("operand space {limit}, compare length {n}"),
                    );
                    len = limit;
                }
                _ => {}
            }
        }
        // SAFETY: both operands are readable for len bytes.
        unsafe { libc::memcmp(s1.cast(), s2.cast(), len) }
    }

    /// Guarded `strcmp`.
    ///
    /// # Safety
    ///
    /// See the [module documentation](self).
    pub unsafe fn strcmp(
        &mut self,
        s1: *const u8,
        s1_cap: Capacity,
        s2: *const u8,
        s2_cap: Capacity,
        site: CallSite<'_>,
    ) -> c_int {
        if self.checks() {
            // SAFETY: forwarded contract.
            let ok = unsafe {
                self.checked_strlen("strcmp", s1, s1_cap, site).is_some()
                    & self.checked_strlen("strcmp", s2, s2_cap, site).is_some()
            };
            if !ok {
                return Self::neutral_compare(s1, s2);
            }
        }
        // SAFETY: both strings are terminated.
        unsafe { libc::strcmp(s1.cast(), s2.cast()) }
    }

    /// Guarded `strncmp`. `n` is narrowed to the operands' known capacities.
    ///
    /// # Safety
    ///
    /// See the [module documentation](self).
    pub unsafe fn strncmp(
        &mut self,
        s1: *const u8,
        s1_cap: Capacity,
        s2: *const u8,
        s2_cap: Capacity,
        n: usize,
        site: CallSite<'_>,
    ) -> c_int {
        const OP: &str = "strncmp";
        let mut len = n;
        if self.checks() {
            if n == 0 {
                return 0;
            }
            if s1.is_null() || s2.is_null() {
                self.usage(OP, site, "null operand");
                return Self::neutral_compare(s1, s2);
            }
            if self.reject_uninitialized(OP, s1, site) | self.reject_uninitialized(OP, s2, site) {
                return Self::neutral_compare(s1, s2);
            }
            for hint in [self.size_hint(s1, s1_cap), self.size_hint(s2, s2_cap)]
                .into_iter()
                .flatten()
            {
                len = len.min(hint);
            }
        }
        // SAFETY: operands are readable for len bytes or to their terminators.
        unsafe { libc::strncmp(s1.cast(), s2.cast(), len) }
    }

    /// Guarded `strlen`. Zero for unreadable strings.
    ///
    /// # Safety
    ///
    /// See the [module documentation](self).
    pub unsafe fn strlen(&mut self, s: *const u8, cap: Capacity, site: CallSite<'_>) -> usize {
        if !self.checks() {
            // SAFETY: passthrough under the caller's contract.
            return unsafe { libc::strlen(s.cast()) };
        }
        // SAFETY: forwarded contract.
        unsafe { self.checked_strlen("strlen", s, cap, site) }.unwrap_or(0)
    }

    /// Guarded `strdup`. The copy is a tracked primary block.
    ///
    /// # Safety
    ///
    /// See the [module documentation](self).
    pub unsafe fn strdup(&mut self, s: *const u8, cap: Capacity, site: CallSite<'_>) -> *mut u8 {
        const OP: &str = "strdup";
        let len = if self.checks() {
            // SAFETY: forwarded contract.
            match unsafe { self.checked_strlen(OP, s, cap, site) } {
                Some(len) => len,
                None => return ptr::null_mut(),
            }
        } else {
            // SAFETY: passthrough under the caller's contract.
            unsafe { libc::strlen(s.cast()) }
        };
        let copy = self.tracker.allocate(
            AllocationClass::Primary,
            len + 1,
            Fill::Zeroed,
            OP,
            site,
            &mut self.journal,
        );
        if !copy.is_null() {
            // SAFETY: copy holds len + 1 bytes; s is terminated at len.
            unsafe { ptr::copy_nonoverlapping(s, copy, len + 1) };
        }
        copy
    }

    /// Guarded `strchr`.
    ///
    /// # Safety
    ///
    /// See the [module documentation](self).
    pub unsafe fn strchr(
        &mut self,
        s: *const u8,
        cap: Capacity,
        c: c_int,
        site: CallSite<'_>,
    ) -> *const u8 {
        // SAFETY: forwarded contract.
        if self.checks() && unsafe { self.checked_strlen("strchr", s, cap, site) }.is_none() {
            return ptr::null();
        }
        // SAFETY: s is terminated.
        unsafe { libc::strchr(s.cast(), c).cast_const().cast() }
    }

    /// Guarded `strrchr`.
    ///
    /// # Safety
    ///
    /// See the [module documentation](self).
    pub unsafe fn strrchr(
        &mut self,
        s: *const u8,
        cap: Capacity,
        c: c_int,
        site: CallSite<'_>,
    ) -> *const u8 {
        // SAFETY: forwarded contract.
        if self.checks() && unsafe { self.checked_strlen("strrchr", s, cap, site) }.is_none() {
            return ptr::null();
        }
        // SAFETY: s is terminated.
        unsafe { libc::strrchr(s.cast(), c).cast_const().cast() }
    }

    /// Both strings of a two-operand scan are readable.
    unsafe fn pair_readable(
        &mut self,
        op: &str,
        a: *const u8,
        a_cap: Capacity,
        b: *const u8,
        b_cap: Capacity,
        site: CallSite<'_>,
    ) -> bool {
        if !self.checks() {
            return true;
        }
        // SAFETY: forwarded contract.
        unsafe {
            self.checked_strlen(op, a, a_cap, site).is_some()
                & self.checked_strlen(op, b, b_cap, site).is_some()
        }
    }

    /// Guarded `strstr`.
    ///
    /// # Safety
    ///
    /// See the [module documentation](self).
    pub unsafe fn strstr(
        &mut self,
        haystack: *const u8,
        haystack_cap: Capacity,
        needle: *const u8,
        needle_cap: Capacity,
        site: CallSite<'_>,
    ) -> *const u8 {
        // SAFETY: forwarded contract.
        if !unsafe { self.pair_readable("strstr", haystack, haystack_cap, needle, needle_cap, site) } {
            return ptr::null();
        }
        // SAFETY: both strings are terminated.
        unsafe { libc::strstr(haystack.cast(), needle.cast()).cast_const().cast() }
    }

    /// Guarded `strpbrk`.
    ///
    /// # Safety
    ///
    /// See the [module documentation](self).
    pub unsafe fn strpbrk(
        &mut self,
        s: *const u8,
        s_cap: Capacity,
        accept: *const u8,
        accept_cap: Capacity,
        site: CallSite<'_>,
    ) -> *const u8 {
        // SAFETY: forwarded contract.
        if !unsafe { self.pair_readable("strpbrk", s, s_cap, accept, accept_cap, site) } {
            return ptr::null();
        }
        // SAFETY: both strings are terminated.
        unsafe { libc::strpbrk(s.cast(), accept.cast()).cast_const().cast() }
    }

    /// Guarded `strspn`.
    ///
    /// # Safety
    ///
    /// See the [module documentation](self).
    pub unsafe fn strspn(
        &mut self,
        s: *const u8,
        s_cap: Capacity,
        accept: *const u8,
        accept_cap: Capacity,
        site: CallSite<'_>,
    ) -> usize {
        // SAFETY: forwarded contract.
        if !unsafe { self.pair_readable("strspn", s, s_cap, accept, accept_cap, site) } {
            return 0;
        }
        // SAFETY: both strings are terminated.
        unsafe { libc::strspn(s.cast(), accept.cast()) }
    }

    /// Guarded `strcspn`.
    ///
    /// # Safety
    ///
    /// See the [module documentation](self).
    pub unsafe fn strcspn(
        &mut self,
        s: *const u8,
        s_cap: Capacity,
        reject: *const u8,
        reject_cap: Capacity,
        site: CallSite<'_>,
    ) -> usize {
        // SAFETY: forwarded contract.
        if !unsafe { self.pair_readable("strcspn", s, s_cap, reject, reject_cap, site) } {
            return 0;
        }
        // SAFETY: both strings are terminated.
        unsafe { libc::strcspn(s.cast(), reject.cast()) }
    }

    /// Clamp a read of `count` bytes into `dst` to its capacity.
    pub(crate) fn clamp_read(
        &mut self,
        op: &str,
        dst: *const u8,
        dst_cap: Capacity,
        count: usize,
        site: CallSite<'_>,
    ) -> usize {
        if !self.checks() {
            return count;
        }
        match self.size_hint(dst, dst_cap) {
            Some(avail) if count > avail => {
                MembraneMetrics::inc(&self.journal.metrics.truncations);
                self.journal.report(
                    ReportKind::Overrun,
                    op,
                    site,
                    format!("target space {avail}, read length {count}"),
                );
                avail
            }
            _ => count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decide_allows_fitting_writes() {
        let d = decide_copy(5, Some(8), None);
        assert_eq!(d.disposition, Disposition::Allow);
        assert_eq!(d.effective_len, 5);
    }

    #[test]
    fn decide_truncates_to_available() {
        let d = decide_copy(11, Some(8), Some(11));
        assert_eq!(d.disposition, Disposition::Truncate);
        assert_eq!(d.effective_len, 8);
    }

    #[test]
    fn decide_warns_on_large_source_buffer() {
        let d = decide_copy(4, Some(8), Some(64));
        assert_eq!(d.disposition, Disposition::Warn);
        assert_eq!(d.effective_len, 4);
    }

    #[test]
    fn decide_without_capacity_allows_everything() {
        let d = decide_copy(4096, None, Some(1));
        assert_eq!(d.disposition, Disposition::Allow);
    }

    #[test]
    fn exact_fit_is_allowed() {
        assert_eq!(decide_copy(8, Some(8), Some(8)).disposition, Disposition::Allow);
    }

    #[test]
    fn overlap_detection() {
        let buf = [0u8; 16];
        let p = buf.as_ptr();
        assert!(overlaps(p, p.wrapping_add(4), 8));
        assert!(!overlaps(p, p.wrapping_add(8), 8));
        assert!(!overlaps(p, p, 0));
    }

    #[test]
    fn strnlen_stops_at_limit() {
        let s = b"abc\0";
        // SAFETY: s is 4 readable bytes.
        unsafe {
            assert_eq!(strnlen(s.as_ptr(), 4), Some(3));
            assert_eq!(strnlen(s.as_ptr(), 2), None);
        }
    }
}
