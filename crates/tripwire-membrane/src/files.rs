//! File handle tracker.
//!
//! One slot per handle number records who opened it and, once closed, who
//! closed it. A closed slot keeps its closing site until the handle is
//! opened again, so a second close can name the first.

#![allow(unsafe_code)]

use std::io;

use crate::diag::ReportKind;
use crate::fs::{FileSystem, OpenMode};
use crate::guard::Capacity;
use crate::intern::NameId;
use crate::journal::Journal;
use crate::membrane::Membrane;
use crate::metrics::MembraneMetrics;
use crate::site::{CallSite, StoredSite};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleState {
    Open,
    Closed,
}

/// Provenance of one handle number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlot {
    pub name: Option<NameId>,
    pub opened: StoredSite,
    pub closed: Option<StoredSite>,
    pub state: HandleState,
}

/// Handle table over a [`FileSystem`].
#[derive(Debug)]
pub struct FileTracker<F> {
    fs: F,
    slots: Vec<Option<FileSlot>>,
    capacity: usize,
    trace: bool,
}

impl<F: FileSystem> FileTracker<F> {
    pub fn new(fs: F, capacity: usize, trace: bool) -> Self {
        Self {
            fs,
            slots: Vec::new(),
            capacity,
            trace,
        }
    }

    pub fn file_system(&self) -> &F {
        &self.fs
    }

    pub fn file_system_mut(&mut self) -> &mut F {
        &mut self.fs
    }

    fn index(&self, handle: i32) -> Option<usize> {
        usize::try_from(handle).ok().filter(|&i| i < self.capacity)
    }

    /// Slot recorded for `handle`, if any.
    #[must_use]
    pub fn slot(&self, handle: i32) -> Option<FileSlot> {
        self.index(handle)
            .and_then(|i| self.slots.get(i).copied().flatten())
    }

    /// Handles currently marked open.
    #[must_use]
    pub fn open_handles(&self) -> Vec<i32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Some(s) if s.state == HandleState::Open))
            .filter_map(|(i, _)| i32::try_from(i).ok())
            .collect()
    }

    pub(crate) fn open(
        &mut self,
        path: &str,
        mode: &str,
        site: CallSite<'_>,
        journal: &mut Journal,
    ) -> i32 {
        const OP: &str = "open";
        let mode = match OpenMode::parse(mode) {
            Ok(mode) => mode,
            Err(err) => {
                MembraneMetrics::inc(&journal.metrics.usage_errors);
                journal.report(ReportKind::Usage, OP, site, err.to_string());
                return -1;
            }
        };
        match self.fs.open(path, mode) {
            Ok(handle) => {
                MembraneMetrics::inc(&journal.metrics.file_opens);
                let name = journal.name_id(path);
                self.record_open(handle, name, OP, site, journal);
                handle
            }
            Err(err) => {
                journal.report(ReportKind::Info, OP, site, format!("cannot open `{path}': {err}"));
                -1
            }
        }
    }

    fn record_open(
        &mut self,
        handle: i32,
        name: Option<NameId>,
        op: &str,
        site: CallSite<'_>,
        journal: &mut Journal,
    ) {
        let Some(index) = self.index(handle) else {
            MembraneMetrics::inc(&journal.metrics.exhaustions);
            journal.report(
                ReportKind::Exhaustion,
                op,
                site,
                format!(
                    "handle {handle} is outside the {} tracked handles; left untracked",
                    self.capacity
                ),
            );
            return;
        };
        if self.slots.len() <= index {
            self.slots.resize(index + 1, None);
        }
        match self.slots[index] {
            Some(prior) if prior.state == HandleState::Open => {
                MembraneMetrics::inc(&journal.metrics.handle_reuses);
                let detail = format!(
                    "handle {handle} (`{}') reused without close; already open at {}",
                    journal.name(prior.name),
                    journal.describe(prior.opened)
                );
                journal.report(ReportKind::Lifecycle, op, site, detail);
            }
            _ => {}
        }
        self.slots[index] = Some(FileSlot {
            name,
            opened: journal.stamp(site),
            closed: None,
            state: HandleState::Open,
        });
        if self.trace {
            let detail = format!("opened `{}' as handle {handle}", journal.name(name));
            journal.report(ReportKind::Info, op, site, detail);
        }
    }

    /// Slot state for a handle inside the table. `None` outside it.
    fn tracked(&self, handle: i32) -> Option<Option<FileSlot>> {
        self.index(handle)
            .map(|i| self.slots.get(i).copied().flatten())
    }

    /// Display name and last close site of a slot that is not open.
    fn describe_not_open(slot: Option<FileSlot>, journal: &Journal) -> (String, String) {
        let name = slot.map_or_else(|| "?".to_string(), |s| journal.name(s.name).to_string());
        let closed = slot
            .and_then(|s| s.closed)
            .map_or_else(|| "?".to_string(), |site| journal.describe(site));
        (name, closed)
    }

    /// Close a handle. Handles inside the table must be open here; handles
    /// beyond it were reported when opened and are delegated as is.
    pub(crate) fn close(&mut self, handle: i32, site: CallSite<'_>, journal: &mut Journal) -> i32 {
        const OP: &str = "close";
        if handle < 0 {
            MembraneMetrics::inc(&journal.metrics.usage_errors);
            journal.report(ReportKind::Usage, OP, site, format!("illegal close of handle {handle}"));
            return -1;
        }
        match self.tracked(handle) {
            Some(Some(slot)) if slot.state == HandleState::Open => {
                let closed = journal.stamp(site);
                if let Some(entry) = self
                    .index(handle)
                    .and_then(|i| self.slots.get_mut(i))
                    .and_then(Option::as_mut)
                {
                    entry.state = HandleState::Closed;
                    entry.closed = Some(closed);
                }
                MembraneMetrics::inc(&journal.metrics.file_closes);
                if self.trace {
                    let detail = format!("closed `{}' (handle {handle})", journal.name(slot.name));
                    journal.report(ReportKind::Info, OP, site, detail);
                }
            }
            Some(slot) => {
                MembraneMetrics::inc(&journal.metrics.bad_closes);
                let (name, closed) = Self::describe_not_open(slot, journal);
                let detail = match slot {
                    Some(_) => format!("bad close of handle {handle} (`{name}'); already closed at {closed}"),
                    None => format!("bad close of handle {handle} (`{name}'); never opened, closed at {closed}"),
                };
                journal.report(ReportKind::Lifecycle, OP, site, detail);
                return -1;
            }
            None => {}
        }
        match self.fs.close(handle) {
            Ok(()) => 0,
            Err(err) => {
                journal.report(ReportKind::Info, OP, site, format!("close of handle {handle} failed: {err}"));
                -1
            }
        }
    }

    pub(crate) fn duplicate(
        &mut self,
        handle: i32,
        site: CallSite<'_>,
        journal: &mut Journal,
    ) -> i32 {
        const OP: &str = "dup";
        if handle < 0 {
            MembraneMetrics::inc(&journal.metrics.usage_errors);
            journal.report(ReportKind::Usage, OP, site, format!("illegal duplicate of handle {handle}"));
            return -1;
        }
        let source = match self.tracked(handle) {
            Some(Some(slot)) if slot.state == HandleState::Open => Some(slot),
            Some(slot) => {
                MembraneMetrics::inc(&journal.metrics.bad_closes);
                let (name, closed) = Self::describe_not_open(slot, journal);
                let detail = match slot {
                    Some(_) => format!("duplicate of handle {handle} (`{name}') which was closed at {closed}"),
                    None => format!("duplicate of handle {handle} (`{name}') which was never opened"),
                };
                journal.report(ReportKind::Lifecycle, OP, site, detail);
                return -1;
            }
            None => None,
        };
        match self.fs.duplicate(handle) {
            Ok(fresh) => {
                let name = match source {
                    Some(slot) => slot.name,
                    None => journal.name_id(&format!("handle {handle}")),
                };
                MembraneMetrics::inc(&journal.metrics.file_opens);
                self.record_open(fresh, name, OP, site, journal);
                fresh
            }
            Err(err) => {
                journal.report(ReportKind::Info, OP, site, format!("dup of handle {handle} failed: {err}"));
                -1
            }
        }
    }

    /// Validate a handle before reading. Stale handles are reported but
    /// still read from; negative handles are refused.
    pub(crate) fn check_read(
        &mut self,
        op: &str,
        handle: i32,
        site: CallSite<'_>,
        journal: &mut Journal,
    ) -> bool {
        if handle < 0 {
            MembraneMetrics::inc(&journal.metrics.usage_errors);
            journal.report(ReportKind::Usage, op, site, format!("read from illegal handle {handle}"));
            return false;
        }
        if let Some(slot) = self.slot(handle).filter(|s| s.state == HandleState::Closed) {
            let closed = slot
                .closed
                .map_or_else(|| "?".to_string(), |site| journal.describe(site));
            let detail = format!(
                "read from handle {handle} (`{}') closed at {closed}",
                journal.name(slot.name)
            );
            journal.report(ReportKind::Lifecycle, op, site, detail);
        }
        true
    }

    pub(crate) fn read_raw(&mut self, handle: i32, buf: &mut [u8]) -> io::Result<usize> {
        self.fs.read(handle, buf)
    }

    /// Report every open handle. With `last`, framed as a leak report.
    pub(crate) fn report_all(&self, last: bool, journal: &mut Journal) -> usize {
        journal.note("files", if last { "FILE LEAKS:" } else { "Open Files:" });
        let mut listed = 0;
        for (handle, slot) in self.slots.iter().enumerate() {
            let Some(slot) = slot.filter(|s| s.state == HandleState::Open) else {
                continue;
            };
            let line = format!(
                "File `{}' (handle {handle}) opened at {}",
                journal.name(slot.name),
                journal.describe(slot.opened)
            );
            journal.note("files", line);
            listed += 1;
        }
        if listed == 0 {
            journal.note("files", "(none)");
        }
        listed
    }
}

impl<F: FileSystem> Membrane<F> {
    /// Open `path` with an fopen-style `mode`. Returns the handle or -1.
    pub fn open(&mut self, path: &str, mode: &str, site: CallSite<'_>) -> i32 {
        self.files.open(path, mode, site, &mut self.journal)
    }

    /// Close a handle. Returns 0 or -1.
    pub fn close(&mut self, handle: i32, site: CallSite<'_>) -> i32 {
        self.files.close(handle, site, &mut self.journal)
    }

    /// Duplicate an open handle. Returns the new handle or -1.
    pub fn dup(&mut self, handle: i32, site: CallSite<'_>) -> i32 {
        self.files.duplicate(handle, site, &mut self.journal)
    }

    /// Guarded `read`: `count` is clamped to the buffer's capacity.
    ///
    /// # Safety
    ///
    /// `buf` must be null or writable for `count` bytes (or its declared
    /// capacity, when smaller).
    pub unsafe fn read(
        &mut self,
        handle: i32,
        buf: *mut u8,
        cap: Capacity,
        count: usize,
        site: CallSite<'_>,
    ) -> isize {
        const OP: &str = "read";
        if !self.files.check_read(OP, handle, site, &mut self.journal) {
            return -1;
        }
        if buf.is_null() {
            MembraneMetrics::inc(&self.journal.metrics.usage_errors);
            self.journal.report(ReportKind::Usage, OP, site, "null buffer");
            return 0;
        }
        let count = self.clamp_read(OP, buf, cap, count, site);
        // SAFETY: buf is writable for the clamped count.
        let target = unsafe { std::slice::from_raw_parts_mut(buf, count) };
        match self.files.read_raw(handle, target) {
            Ok(n) => isize::try_from(n).unwrap_or(isize::MAX),
            Err(err) => {
                self.journal
                    .report(ReportKind::Info, OP, site, format!("read from handle {handle} failed: {err}"));
                -1
            }
        }
    }

    /// Guarded `fread`: reads whole elements, clamped to the buffer.
    ///
    /// # Safety
    ///
    /// `buf` must be null or writable for `size * nitems` bytes (or its
    /// declared capacity, when smaller).
    pub unsafe fn fread(
        &mut self,
        buf: *mut u8,
        cap: Capacity,
        size: usize,
        nitems: usize,
        handle: i32,
        site: CallSite<'_>,
    ) -> usize {
        const OP: &str = "fread";
        if size == 0 {
            MembraneMetrics::inc(&self.journal.metrics.usage_errors);
            self.journal.report(ReportKind::Usage, OP, site, "element size of 0");
            return 0;
        }
        let Some(total) = size.checked_mul(nitems) else {
            MembraneMetrics::inc(&self.journal.metrics.usage_errors);
            self.journal
                .report(ReportKind::Usage, OP, site, format!("{nitems} elements of {size} bytes overflow"));
            return 0;
        };
        if !self.files.check_read(OP, handle, site, &mut self.journal) {
            return 0;
        }
        if buf.is_null() {
            MembraneMetrics::inc(&self.journal.metrics.usage_errors);
            self.journal.report(ReportKind::Usage, OP, site, "null buffer");
            return 0;
        }
        let bytes = self.clamp_read(OP, buf, cap, total, site);
        // SAFETY: buf is writable for the clamped byte count.
        let target = unsafe { std::slice::from_raw_parts_mut(buf, bytes) };
        let mut filled = 0;
        while filled < bytes {
            match self.files.read_raw(handle, &mut target[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) => {
                    self.journal
                        .report(ReportKind::Info, OP, site, format!("read from handle {handle} failed: {err}"));
                    break;
                }
            }
        }
        filled / size
    }

    /// Guarded `fgets`: reads at most `n - 1` bytes up to a newline and
    /// terminates. `n` is clamped to the buffer. Null at end of file.
    ///
    /// # Safety
    ///
    /// `buf` must be null or writable for `n` bytes (or its declared
    /// capacity, when smaller).
    pub unsafe fn fgets(
        &mut self,
        buf: *mut u8,
        cap: Capacity,
        n: usize,
        handle: i32,
        site: CallSite<'_>,
    ) -> *mut u8 {
        const OP: &str = "fgets";
        if !self.files.check_read(OP, handle, site, &mut self.journal) {
            return std::ptr::null_mut();
        }
        if buf.is_null() || n == 0 {
            MembraneMetrics::inc(&self.journal.metrics.usage_errors);
            self.journal
                .report(ReportKind::Usage, OP, site, format!("null or empty buffer ({n} bytes)"));
            return std::ptr::null_mut();
        }
        let n = self.clamp_read(OP, buf, cap, n, site);
        if n == 0 {
            return std::ptr::null_mut();
        }
        // SAFETY: buf is writable for the clamped count.
        let target = unsafe { std::slice::from_raw_parts_mut(buf, n) };
        let mut len = 0;
        let mut byte = [0u8; 1];
        while len + 1 < n {
            match self.files.read_raw(handle, &mut byte) {
                Ok(1) => {
                    target[len] = byte[0];
                    len += 1;
                    if byte[0] == b'\n' {
                        break;
                    }
                }
                Ok(_) => break,
                Err(err) => {
                    self.journal
                        .report(ReportKind::Info, OP, site, format!("read from handle {handle} failed: {err}"));
                    return std::ptr::null_mut();
                }
            }
        }
        target[len] = 0;
        if len == 0 && n > 1 {
            return std::ptr::null_mut();
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MembraneConfig;
    use crate::fs::MemoryFileSystem;

    fn setup() -> (FileTracker<MemoryFileSystem>, Journal) {
        let mut fs = MemoryFileSystem::new();
        fs.insert("in.txt", "line one\nline two\n");
        let journal = Journal::new(&MembraneConfig::in_memory()).unwrap();
        (FileTracker::new(fs, 8, false), journal)
    }

    fn at(line: u32) -> CallSite<'static> {
        CallSite::new("files_case.c", line)
    }

    #[test]
    fn open_then_close_is_silent() {
        let (mut t, mut j) = setup();
        let h = t.open("in.txt", "r", at(1), &mut j);
        assert_eq!(h, 3);
        assert_eq!(t.open_handles(), vec![3]);
        assert_eq!(t.close(h, at(2), &mut j), 0);
        assert!(t.open_handles().is_empty());
        assert_eq!(j.diag.reports().count(), 0);
        assert_eq!(t.slot(h).unwrap().closed.unwrap().line, 2);
    }

    #[test]
    fn invalid_mode_is_a_usage_error() {
        let (mut t, mut j) = setup();
        assert_eq!(t.open("in.txt", "z", at(1), &mut j), -1);
        assert_eq!(j.diag.count(ReportKind::Usage), 1);
    }

    #[test]
    fn missing_file_is_reported_with_os_text() {
        let (mut t, mut j) = setup();
        assert_eq!(t.open("nope.txt", "r", at(1), &mut j), -1);
        let report = j.diag.reports().next().unwrap();
        assert_eq!(report.kind, ReportKind::Info);
        assert!(report.detail.starts_with("cannot open `nope.txt'"));
    }

    #[test]
    fn handles_beyond_capacity_stay_untracked() {
        let (mut t, mut j) = setup();
        t.file_system_mut().force_next_handle(20);
        assert_eq!(t.open("in.txt", "r", at(1), &mut j), 20);
        assert_eq!(j.diag.count(ReportKind::Exhaustion), 1);
        assert!(t.slot(20).is_none());
        assert_eq!(t.close(20, at(2), &mut j), 0);
    }

    #[test]
    fn never_opened_handles_are_bad_closes() {
        let (mut t, mut j) = setup();
        assert_eq!(t.close(5, at(1), &mut j), -1);
        assert_eq!(t.duplicate(6, at(2), &mut j), -1);
        let details: Vec<_> = j.diag.reports().map(|r| r.detail.clone()).collect();
        assert_eq!(
            details,
            [
                "bad close of handle 5 (`?'); never opened, closed at ?",
                "duplicate of handle 6 (`?') which was never opened",
            ]
        );
        assert_eq!(j.diag.count(ReportKind::Lifecycle), 2);
        assert_eq!(j.metrics.snapshot().bad_closes, 2);
    }

    #[test]
    fn negative_handles_are_illegal() {
        let (mut t, mut j) = setup();
        assert_eq!(t.close(-1, at(1), &mut j), -1);
        assert_eq!(t.duplicate(-1, at(2), &mut j), -1);
        assert!(!t.check_read("read", -1, at(3), &mut j));
        assert_eq!(j.diag.count(ReportKind::Usage), 3);
    }

    #[test]
    fn duplicate_inherits_name() {
        let (mut t, mut j) = setup();
        let h = t.open("in.txt", "r", at(1), &mut j);
        let d = t.duplicate(h, at(2), &mut j);
        assert_eq!(d, 4);
        assert_eq!(t.slot(d).unwrap().name, t.slot(h).unwrap().name);
        assert_eq!(t.slot(d).unwrap().opened.line, 2);
    }

    #[test]
    fn trace_mode_logs_open_and_close() {
        let (t, mut j) = setup();
        let mut t = FileTracker::new(t.fs, 8, true);
        let h = t.open("in.txt", "r", at(1), &mut j);
        t.close(h, at(2), &mut j);
        let details: Vec<_> = j.diag.reports().map(|r| r.detail.clone()).collect();
        assert_eq!(details, ["opened `in.txt' as handle 3", "closed `in.txt' (handle 3)"]);
    }

    #[test]
    fn report_lists_open_handles() {
        let (mut t, mut j) = setup();
        t.open("in.txt", "r", at(9), &mut j);
        assert_eq!(t.report_all(true, &mut j), 1);
        let lines: Vec<String> = j.diag.reports().map(|r| r.to_string()).collect();
        assert_eq!(
            lines,
            ["FILE LEAKS:", "File `in.txt' (handle 3) opened at files_case.c, line 9"]
        );
    }
}
