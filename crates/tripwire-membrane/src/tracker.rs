//! Instrumented allocation tracker.
//!
//! Every tracked block is laid out as
//!
//! ```text
//! [ BlockHeader (HEADER_SIZE) ][ user bytes (n) ][ footer sentinel ]
//!                              ^ pointer handed to the caller
//! ```
//!
//! The header carries the guard sentinel, byte count, owning slot and
//! class, so a write just before the block is caught. The footer sentinel
//! catches writes just past it. Bookkeeping lives out of band in a slot
//! arena linked into a most-recent-first list; released addresses are
//! remembered in a bounded ledger so a second release can name the first.

#![allow(unsafe_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::ptr::{self, NonNull};

use serde::Serialize;

use crate::diag::ReportKind;
use crate::journal::Journal;
use crate::metrics::MembraneMetrics;
use crate::raw::RawAllocator;
use crate::site::{CallSite, StoredSite};

/// Header magic and footer value of a live block.
pub const GUARD_SENTINEL: u64 = 0x2468_1357_9BDF_0ACE;

/// First word of a block handed out without zero-initialization semantics.
pub const UNINIT_POISON: u64 = 0x2468_1357_2468_1357;

/// Written over the header magic and first word of a released block.
pub const RELEASED_POISON: u64 = 0xDEAD_1357_DEAD_2468;

/// Bytes in front of every user pointer.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Bytes after every user range.
pub const FOOTER_SIZE: usize = size_of::<u64>();

const WORD: usize = size_of::<u64>();

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct BlockHeader {
    magic: u64,
    byte_count: u64,
    slot: u32,
    class: u8,
    _reserved: [u8; 11],
}

/// Which pool a block came from. Releasing through the other pool's entry
/// point is a lifecycle error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationClass {
    Primary,
    Auxiliary,
}

impl AllocationClass {
    const fn tag(self) -> u8 {
        match self {
            Self::Primary => 1,
            Self::Auxiliary => 2,
        }
    }
}

impl fmt::Display for AllocationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Primary => "primary",
            Self::Auxiliary => "auxiliary",
        })
    }
}

/// How a fresh block's user bytes start out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    Zeroed,
    /// Zeroed, then the first word poisoned so reads before writes are caught.
    Poisoned,
}

/// Index of a record in the slot arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u32);

/// Bookkeeping for one live block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRecord {
    pub addr: usize,
    pub byte_count: usize,
    pub class: AllocationClass,
    pub site: StoredSite,
    next: Option<SlotId>,
}

#[derive(Debug, Clone, Copy)]
struct ReleasedBlock {
    byte_count: usize,
    site: StoredSite,
}

/// Bounded memory of recent releases, oldest evicted first.
#[derive(Debug)]
struct ReleaseLedger {
    order: VecDeque<usize>,
    entries: HashMap<usize, ReleasedBlock>,
    capacity: usize,
}

impl ReleaseLedger {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            entries: HashMap::new(),
            capacity,
        }
    }

    fn insert(&mut self, addr: usize, block: ReleasedBlock) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.insert(addr, block).is_none() {
            self.order.push_back(addr);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    /// Forget `addr` once it is live again.
    fn retire(&mut self, addr: usize) {
        if self.entries.remove(&addr).is_some() {
            self.order.retain(|&a| a != addr);
        }
    }

    fn get(&self, addr: usize) -> Option<ReleasedBlock> {
        self.entries.get(&addr).copied()
    }
}

/// Registry of live tracked blocks.
pub struct AllocationTracker {
    slots: Vec<Option<BlockRecord>>,
    free_slots: Vec<u32>,
    head: Option<SlotId>,
    by_addr: BTreeMap<usize, SlotId>,
    ledger: ReleaseLedger,
    primary: Box<dyn RawAllocator + Send>,
    auxiliary: Box<dyn RawAllocator + Send>,
    live_bytes: usize,
}

impl fmt::Debug for AllocationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationTracker")
            .field("live", &self.by_addr.len())
            .field("live_bytes", &self.live_bytes)
            .field("primary", &self.primary.name())
            .field("auxiliary", &self.auxiliary.name())
            .finish_non_exhaustive()
    }
}

impl AllocationTracker {
    pub fn new(
        primary: Box<dyn RawAllocator + Send>,
        auxiliary: Box<dyn RawAllocator + Send>,
        ledger_capacity: usize,
    ) -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            head: None,
            by_addr: BTreeMap::new(),
            ledger: ReleaseLedger::new(ledger_capacity),
            primary,
            auxiliary,
            live_bytes: 0,
        }
    }

    fn pool(&mut self, class: AllocationClass) -> &mut (dyn RawAllocator + Send) {
        match class {
            AllocationClass::Primary => self.primary.as_mut(),
            AllocationClass::Auxiliary => self.auxiliary.as_mut(),
        }
    }

    fn record(&self, id: SlotId) -> Option<BlockRecord> {
        self.slots.get(id.0 as usize).copied().flatten()
    }

    /// Live records in list order, paired with their slots.
    fn chain(&self) -> impl Iterator<Item = (SlotId, BlockRecord)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let id = cursor?;
            let record = self.record(id)?;
            cursor = record.next;
            Some((id, record))
        })
    }

    fn claim_slot(&mut self) -> Option<SlotId> {
        if let Some(index) = self.free_slots.pop() {
            return Some(SlotId(index));
        }
        let index = u32::try_from(self.slots.len()).ok()?;
        self.slots.push(None);
        Some(SlotId(index))
    }

    /// Allocate `n` tracked bytes from `class`'s pool. Null on failure.
    pub(crate) fn allocate(
        &mut self,
        class: AllocationClass,
        n: usize,
        fill: Fill,
        category: &str,
        site: CallSite<'_>,
        journal: &mut Journal,
    ) -> *mut u8 {
        let Some(total) = n.checked_add(HEADER_SIZE + FOOTER_SIZE) else {
            MembraneMetrics::inc(&journal.metrics.exhaustions);
            journal.report(
                ReportKind::Exhaustion,
                category,
                site,
                format!("request for {n} bytes overflows the block layout"),
            );
            return ptr::null_mut();
        };
        let Some(raw) = self.pool(class).allocate(total) else {
            MembraneMetrics::inc(&journal.metrics.exhaustions);
            let pool = self.pool(class).name();
            journal.report(
                ReportKind::Exhaustion,
                category,
                site,
                format!("{pool} pool exhausted allocating {n} bytes"),
            );
            return ptr::null_mut();
        };
        let Some(id) = self.claim_slot() else {
            // SAFETY: raw was just allocated from this pool with `total` bytes.
            let returned = unsafe { self.pool(class).release(raw, total) };
            MembraneMetrics::inc(&journal.metrics.exhaustions);
            journal.report(ReportKind::Exhaustion, category, site, "slot arena full");
            if let Err(err) = returned {
                MembraneMetrics::inc(&journal.metrics.corruptions);
                journal.report(ReportKind::Corruption, category, site, err.to_string());
            }
            return ptr::null_mut();
        };

        let header = BlockHeader {
            magic: GUARD_SENTINEL,
            byte_count: n as u64,
            slot: id.0,
            class: class.tag(),
            _reserved: [0; 11],
        };
        // SAFETY: raw is valid for `total` bytes: header, n user bytes, footer.
        let user = unsafe {
            raw.as_ptr().cast::<BlockHeader>().write_unaligned(header);
            let user = raw.as_ptr().add(HEADER_SIZE);
            ptr::write_bytes(user, 0, n);
            if fill == Fill::Poisoned && n >= WORD {
                user.cast::<u64>().write_unaligned(UNINIT_POISON);
            }
            user.add(n).cast::<u64>().write_unaligned(GUARD_SENTINEL);
            user
        };

        let addr = user as usize;
        let stored = journal.stamp(site);
        self.slots[id.0 as usize] = Some(BlockRecord {
            addr,
            byte_count: n,
            class,
            site: stored,
            next: self.head,
        });
        self.head = Some(id);
        self.by_addr.insert(addr, id);
        self.ledger.retire(addr);
        self.live_bytes += n;
        MembraneMetrics::inc(&journal.metrics.allocations);
        user
    }

    /// Release a tracked block through `class`'s entry point.
    pub(crate) fn release(
        &mut self,
        class: AllocationClass,
        ptr: *mut u8,
        category: &str,
        site: CallSite<'_>,
        journal: &mut Journal,
    ) {
        if ptr.is_null() {
            MembraneMetrics::inc(&journal.metrics.usage_errors);
            journal.report(ReportKind::Usage, category, site, "release of a null pointer");
            return;
        }
        let addr = ptr as usize;

        let mut prev: Option<SlotId> = None;
        let mut found = None;
        for (id, record) in self.chain() {
            if record.addr == addr {
                found = Some((id, record));
                break;
            }
            if !self.header_intact(id, &record) {
                MembraneMetrics::inc(&journal.metrics.corruptions);
                let allocated = journal.describe(record.site);
                journal.report(
                    ReportKind::Corruption,
                    category,
                    site,
                    format!(
                        "allocation list corrupted: header of the {}-byte block allocated at {allocated} is damaged; walk abandoned",
                        record.byte_count
                    ),
                );
                return;
            }
            prev = Some(id);
        }

        let Some((id, record)) = found else {
            MembraneMetrics::inc(&journal.metrics.bad_releases);
            let detail = match self.ledger.get(addr) {
                Some(earlier) => {
                    MembraneMetrics::inc(&journal.metrics.double_releases);
                    format!(
                        "bad release of {ptr:p}: possibly released before at {}, size {}",
                        journal.describe(earlier.site),
                        earlier.byte_count
                    )
                }
                None => format!("bad release of {ptr:p}: not a tracked block"),
            };
            journal.report(ReportKind::Lifecycle, category, site, detail);
            return;
        };

        let n = record.byte_count;
        let allocated = journal.describe(record.site);
        if !self.header_intact(id, &record) {
            MembraneMetrics::inc(&journal.metrics.corruptions);
            journal.report(
                ReportKind::Corruption,
                category,
                site,
                format!("header of the {n}-byte block allocated at {allocated} was overwritten"),
            );
        }
        // SAFETY: the block is live, so addr + n is its footer.
        let footer = unsafe { (addr as *const u8).add(n).cast::<u64>().read_unaligned() };
        if footer != GUARD_SENTINEL {
            MembraneMetrics::inc(&journal.metrics.corruptions);
            journal.report(
                ReportKind::Overrun,
                category,
                site,
                format!("the {n}-byte block allocated at {allocated} was written past its end"),
            );
        }

        self.unlink(prev, id, &record);
        let released_at = journal.stamp(site);
        self.ledger.insert(
            addr,
            ReleasedBlock {
                byte_count: n,
                site: released_at,
            },
        );

        if record.class != class {
            MembraneMetrics::inc(&journal.metrics.class_mismatches);
            journal.report(
                ReportKind::Lifecycle,
                category,
                site,
                format!(
                    "{} block of {n} bytes allocated at {allocated} released as {class}; storage not returned",
                    record.class
                ),
            );
            return;
        }

        // SAFETY: block still allocated; header and first word are inside it.
        let raw = unsafe {
            let raw = (addr as *mut u8).sub(HEADER_SIZE);
            raw.cast::<u64>().write_unaligned(RELEASED_POISON);
            if n >= WORD {
                (addr as *mut u8).cast::<u64>().write_unaligned(RELEASED_POISON);
            }
            NonNull::new_unchecked(raw)
        };
        // SAFETY: raw and total size match the original allocation from this pool.
        let returned =
            unsafe { self.pool(record.class).release(raw, n + HEADER_SIZE + FOOTER_SIZE) };
        match returned {
            Ok(()) => MembraneMetrics::inc(&journal.metrics.releases),
            Err(err) => {
                MembraneMetrics::inc(&journal.metrics.corruptions);
                let pool = self.pool(record.class).name();
                journal.report(
                    ReportKind::Corruption,
                    category,
                    site,
                    format!(
                        "{pool} pool refused the {n}-byte block allocated at {allocated}: {err}; storage not reclaimed"
                    ),
                );
            }
        }
    }

    /// Move a tracked block to a fresh zeroed block of `n` bytes.
    ///
    /// Null behaves as an allocation. On failure the old block is kept and
    /// null is returned.
    pub(crate) fn resize(
        &mut self,
        ptr: *mut u8,
        n: usize,
        category: &str,
        site: CallSite<'_>,
        journal: &mut Journal,
    ) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(AllocationClass::Primary, n, Fill::Zeroed, category, site, journal);
        }
        let Some(old) = self.block(ptr) else {
            MembraneMetrics::inc(&journal.metrics.bad_releases);
            let detail = match self.ledger.get(ptr as usize) {
                Some(earlier) => format!(
                    "resize of {ptr:p}: block was released at {}, size {}",
                    journal.describe(earlier.site),
                    earlier.byte_count
                ),
                None => format!("resize of {ptr:p}: not a tracked block"),
            };
            journal.report(ReportKind::Lifecycle, category, site, detail);
            return ptr::null_mut();
        };
        let fresh = self.allocate(old.class, n, Fill::Zeroed, category, site, journal);
        if fresh.is_null() {
            return fresh;
        }
        // SAFETY: both blocks are live and distinct; each holds at least the copied length.
        unsafe { ptr::copy_nonoverlapping(ptr.cast_const(), fresh, old.byte_count.min(n)) };
        self.release(old.class, ptr, category, site, journal);
        fresh
    }

    /// Report every live block. With `last`, framed as a leak report.
    /// Returns the number of blocks listed.
    pub(crate) fn report_all(&self, last: bool, journal: &mut Journal) -> usize {
        journal.note(
            "memory",
            if last {
                "MEMORY LEAKS:"
            } else {
                "Allocated Memory Blocks:"
            },
        );
        let mut listed = 0;
        for (id, record) in self.chain() {
            if !self.header_intact(id, &record) {
                MembraneMetrics::inc(&journal.metrics.corruptions);
                journal.diag.emit(
                    ReportKind::Corruption,
                    "memory",
                    None,
                    format!(
                        "allocation list corrupted at the {}-byte block allocated at {}; report abandoned",
                        record.byte_count,
                        journal.describe(record.site)
                    ),
                );
                return listed;
            }
            let line = format!(
                "Size {:>8} File {:>16} Line {}",
                record.byte_count,
                journal.name(record.site.file),
                record.site.line
            );
            journal.note("memory", line);
            listed += 1;
        }
        if listed == 0 {
            journal.note("memory", "(none)");
        }
        listed
    }

    fn header_intact(&self, id: SlotId, record: &BlockRecord) -> bool {
        // SAFETY: records in the list describe live blocks, each preceded by
        // HEADER_SIZE bytes of header.
        let header = unsafe {
            (record.addr as *const u8)
                .sub(HEADER_SIZE)
                .cast::<BlockHeader>()
                .read_unaligned()
        };
        header.magic == GUARD_SENTINEL
            && header.byte_count == record.byte_count as u64
            && header.slot == id.0
    }

    fn unlink(&mut self, prev: Option<SlotId>, id: SlotId, record: &BlockRecord) {
        match prev {
            Some(p) => {
                if let Some(pred) = self.slots[p.0 as usize].as_mut() {
                    pred.next = record.next;
                }
            }
            None => self.head = record.next,
        }
        self.slots[id.0 as usize] = None;
        self.free_slots.push(id.0);
        self.by_addr.remove(&record.addr);
        self.live_bytes -= record.byte_count;
    }

    /// Record of the live block starting exactly at `ptr`.
    #[must_use]
    pub fn block(&self, ptr: *const u8) -> Option<BlockRecord> {
        self.by_addr
            .get(&(ptr as usize))
            .and_then(|&id| self.record(id))
    }

    /// Bytes from `ptr` to the end of the live block containing it.
    #[must_use]
    pub fn size_hint(&self, ptr: *const u8) -> Option<usize> {
        let addr = ptr as usize;
        let (&start, &id) = self.by_addr.range(..=addr).next_back()?;
        let end = start + self.record(id)?.byte_count;
        (addr < end || addr == start).then(|| end - addr)
    }

    /// True when `ptr` starts a tracked block whose first word still holds
    /// the uninitialized poison.
    #[must_use]
    pub fn is_uninitialized(&self, ptr: *const u8) -> bool {
        match self.block(ptr) {
            // SAFETY: live block with at least one word.
            Some(record) if record.byte_count >= WORD => unsafe {
                ptr.cast::<u64>().read_unaligned() == UNINIT_POISON
            },
            _ => false,
        }
    }

    /// Live blocks, most recent first.
    #[must_use]
    pub fn live_blocks(&self) -> Vec<BlockRecord> {
        self.chain().map(|(_, record)| record).collect()
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.by_addr.len()
    }

    #[must_use]
    pub const fn live_bytes(&self) -> usize {
        self.live_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MembraneConfig;
    use crate::raw::HostAllocator;

    fn setup() -> (AllocationTracker, Journal) {
        let tracker = AllocationTracker::new(Box::new(HostAllocator), Box::new(HostAllocator), 16);
        let journal = Journal::new(&MembraneConfig::in_memory()).unwrap();
        (tracker, journal)
    }

    fn at(line: u32) -> CallSite<'static> {
        CallSite::new("tracker_case.c", line)
    }

    fn kinds(journal: &Journal) -> Vec<ReportKind> {
        journal.diag.reports().map(|r| r.kind).collect()
    }

    #[test]
    fn header_is_four_words() {
        assert_eq!(HEADER_SIZE, 32);
    }

    #[test]
    fn allocate_links_most_recent_first() {
        let (mut t, mut j) = setup();
        let a = t.allocate(AllocationClass::Primary, 8, Fill::Zeroed, "malloc", at(1), &mut j);
        let b = t.allocate(AllocationClass::Primary, 24, Fill::Zeroed, "malloc", at(2), &mut j);
        let blocks = t.live_blocks();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].addr, b as usize);
        assert_eq!(blocks[1].addr, a as usize);
        assert_eq!(t.live_bytes(), 32);
        t.release(AllocationClass::Primary, a, "free", at(3), &mut j);
        t.release(AllocationClass::Primary, b, "free", at(4), &mut j);
        assert_eq!(t.live_count(), 0);
        assert!(kinds(&j).is_empty());
    }

    #[test]
    fn poisoned_fill_marks_first_word_only() {
        let (mut t, mut j) = setup();
        let p = t.allocate(AllocationClass::Primary, 16, Fill::Poisoned, "malloc", at(1), &mut j);
        assert!(t.is_uninitialized(p));
        // SAFETY: p holds 16 bytes.
        let tail = unsafe { std::slice::from_raw_parts(p.add(8), 8) };
        assert!(tail.iter().all(|&b| b == 0));
        // SAFETY: p holds 16 bytes.
        unsafe { p.write(1) };
        assert!(!t.is_uninitialized(p));

        let small = t.allocate(AllocationClass::Primary, 4, Fill::Poisoned, "malloc", at(2), &mut j);
        assert!(!t.is_uninitialized(small));
        t.release(AllocationClass::Primary, p, "free", at(3), &mut j);
        t.release(AllocationClass::Primary, small, "free", at(4), &mut j);
    }

    #[test]
    fn size_hint_covers_interior_pointers() {
        let (mut t, mut j) = setup();
        let p = t.allocate(AllocationClass::Primary, 10, Fill::Zeroed, "malloc", at(1), &mut j);
        assert_eq!(t.size_hint(p), Some(10));
        // SAFETY: interior offsets of a 10-byte block.
        unsafe {
            assert_eq!(t.size_hint(p.add(4)), Some(6));
            assert_eq!(t.size_hint(p.add(10)), None);
        }
        let local = [0u8; 4];
        assert_eq!(t.size_hint(local.as_ptr()), None);
        t.release(AllocationClass::Primary, p, "free", at(2), &mut j);
        assert_eq!(t.size_hint(p), None);
    }

    #[test]
    fn class_mismatch_unlinks_without_releasing_storage() {
        let (mut t, mut j) = setup();
        let p = t.allocate(AllocationClass::Auxiliary, 8, Fill::Zeroed, "malloc_aux", at(1), &mut j);
        t.release(AllocationClass::Primary, p, "free", at(2), &mut j);
        assert_eq!(kinds(&j), vec![ReportKind::Lifecycle]);
        assert_eq!(t.live_count(), 0);
        assert_eq!(j.metrics.snapshot().class_mismatches, 1);
        let detail = &j.diag.reports().next().unwrap().detail;
        assert!(detail.contains("auxiliary block of 8 bytes"), "{detail}");
        assert!(detail.contains("released as primary"), "{detail}");
    }

    #[test]
    fn ledger_evicts_oldest_entries() {
        let mut ledger = ReleaseLedger::new(2);
        let site = StoredSite { file: None, line: 1 };
        for addr in [10, 20, 30] {
            ledger.insert(addr, ReleasedBlock { byte_count: 1, site });
        }
        assert!(ledger.get(10).is_none());
        assert!(ledger.get(20).is_some());
        ledger.retire(20);
        assert!(ledger.get(20).is_none());
        assert_eq!(ledger.order.len(), 1);
    }

    #[test]
    fn resize_of_null_allocates() {
        let (mut t, mut j) = setup();
        let p = t.resize(ptr::null_mut(), 12, "realloc", at(1), &mut j);
        assert!(!p.is_null());
        assert_eq!(t.block(p).map(|b| b.byte_count), Some(12));
        t.release(AllocationClass::Primary, p, "free", at(2), &mut j);
    }

    #[test]
    fn report_all_lists_live_blocks() {
        let (mut t, mut j) = setup();
        let p = t.allocate(AllocationClass::Primary, 40, Fill::Zeroed, "malloc", at(77), &mut j);
        assert_eq!(t.report_all(true, &mut j), 1);
        let lines: Vec<String> = j.diag.reports().map(|r| r.to_string()).collect();
        assert_eq!(lines[0], "MEMORY LEAKS:");
        assert_eq!(
            lines[1],
            format!("Size {:>8} File {:>16} Line 77", 40, "tracker_case.c")
        );
        t.release(AllocationClass::Primary, p, "free", at(78), &mut j);
    }
}
