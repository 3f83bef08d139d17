//! The wrapper facade.
//!
//! A [`Membrane`] owns one allocation tracker, one file tracker, the name
//! table and the diagnostic sink. Its methods stand in for the C allocation,
//! string and file primitives; each takes the [`CallSite`] of the wrapped
//! call.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::MembraneConfig;
use crate::diag::{Report, ReportKind};
use crate::error::MembraneError;
use crate::files::FileTracker;
use crate::fs::{FileSystem, PosixFileSystem};
use crate::journal::Journal;
use crate::metrics::{MembraneMetrics, MetricsSnapshot};
use crate::raw::{HostAllocator, RawAllocator};
use crate::site::CallSite;
use crate::tracker::{AllocationClass, AllocationTracker, Fill};

/// Diagnostic layer over an allocator pair and a file system.
#[derive(Debug)]
pub struct Membrane<F: FileSystem = PosixFileSystem> {
    pub(crate) config: MembraneConfig,
    pub(crate) journal: Journal,
    pub(crate) tracker: AllocationTracker,
    pub(crate) files: FileTracker<F>,
    torn_down: bool,
}

impl Membrane<PosixFileSystem> {
    /// Host allocator for both pools and the host's file descriptors.
    pub fn new(config: MembraneConfig) -> Result<Self, MembraneError> {
        Self::with_file_system(config, PosixFileSystem)
    }
}

impl<F: FileSystem> Membrane<F> {
    /// Host allocator for both pools over `fs`.
    pub fn with_file_system(config: MembraneConfig, fs: F) -> Result<Self, MembraneError> {
        Self::with_parts(config, fs, Box::new(HostAllocator), Box::new(HostAllocator))
    }

    pub fn with_parts(
        config: MembraneConfig,
        fs: F,
        primary: Box<dyn RawAllocator + Send>,
        auxiliary: Box<dyn RawAllocator + Send>,
    ) -> Result<Self, MembraneError> {
        let journal = Journal::new(&config)?;
        let tracker = AllocationTracker::new(primary, auxiliary, config.release_ledger);
        let files = FileTracker::new(fs, config.handle_capacity, config.trace_files);
        Ok(Self {
            config,
            journal,
            tracker,
            files,
            torn_down: false,
        })
    }

    /// Tracked `malloc`. The first word is poisoned until written.
    pub fn malloc(&mut self, n: usize, site: CallSite<'_>) -> *mut u8 {
        self.tracker.allocate(
            AllocationClass::Primary,
            n,
            Fill::Poisoned,
            "malloc",
            site,
            &mut self.journal,
        )
    }

    /// Tracked `calloc`.
    pub fn calloc(&mut self, count: usize, size: usize, site: CallSite<'_>) -> *mut u8 {
        self.zeroed(AllocationClass::Primary, "calloc", count, size, site)
    }

    /// Tracked `realloc`. Null behaves as `calloc` of `n` bytes; on failure
    /// the old block stays live and null is returned.
    pub fn realloc(&mut self, ptr: *mut u8, n: usize, site: CallSite<'_>) -> *mut u8 {
        self.tracker
            .resize(ptr, n, "realloc", site, &mut self.journal)
    }

    /// Tracked `free`.
    pub fn free(&mut self, ptr: *mut u8, site: CallSite<'_>) {
        self.tracker.release(
            AllocationClass::Primary,
            ptr,
            "free",
            site,
            &mut self.journal,
        );
    }

    /// Allocate from the auxiliary pool.
    pub fn malloc_aux(&mut self, n: usize, site: CallSite<'_>) -> *mut u8 {
        self.tracker.allocate(
            AllocationClass::Auxiliary,
            n,
            Fill::Poisoned,
            "malloc_aux",
            site,
            &mut self.journal,
        )
    }

    pub fn calloc_aux(&mut self, count: usize, size: usize, site: CallSite<'_>) -> *mut u8 {
        self.zeroed(AllocationClass::Auxiliary, "calloc_aux", count, size, site)
    }

    /// Release into the auxiliary pool. A primary block is reported and
    /// forgotten without returning its storage.
    pub fn free_aux(&mut self, ptr: *mut u8, site: CallSite<'_>) {
        self.tracker.release(
            AllocationClass::Auxiliary,
            ptr,
            "free_aux",
            site,
            &mut self.journal,
        );
    }

    fn zeroed(
        &mut self,
        class: AllocationClass,
        op: &str,
        count: usize,
        size: usize,
        site: CallSite<'_>,
    ) -> *mut u8 {
        let Some(n) = count.checked_mul(size) else {
            MembraneMetrics::inc(&self.journal.metrics.usage_errors);
            self.journal.report(
                ReportKind::Usage,
                op,
                site,
                format!("{count} elements of {size} bytes overflow"),
            );
            return std::ptr::null_mut();
        };
        self.tracker
            .allocate(class, n, Fill::Zeroed, op, site, &mut self.journal)
    }

    #[must_use]
    pub fn config(&self) -> &MembraneConfig {
        &self.config
    }

    #[must_use]
    pub fn tracker(&self) -> &AllocationTracker {
        &self.tracker
    }

    #[must_use]
    pub fn files(&self) -> &FileTracker<F> {
        &self.files
    }

    pub fn file_system_mut(&mut self) -> &mut F {
        self.files.file_system_mut()
    }

    /// Retained reports, oldest first.
    pub fn reports(&self) -> impl Iterator<Item = &Report> {
        self.journal.diag.reports()
    }

    /// Retained reports of one kind.
    #[must_use]
    pub fn count(&self, kind: ReportKind) -> usize {
        self.journal.diag.count(kind)
    }

    pub fn drain_reports(&mut self) -> Vec<Report> {
        self.journal.diag.drain()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.journal.metrics.snapshot()
    }

    /// List live blocks and open files. With `last`, framed as leaks.
    /// Returns the number of entries listed.
    pub fn report(&mut self, last: bool) -> usize {
        let blocks = self.tracker.report_all(last, &mut self.journal);
        let files = self.files.report_all(last, &mut self.journal);
        blocks + files
    }

    /// Final leak report and flush. Runs once; later calls return `None`.
    pub fn teardown(&mut self) -> Option<usize> {
        if self.torn_down {
            return None;
        }
        self.torn_down = true;
        let stamp = utc_timestamp(SystemTime::now());
        self.journal
            .note("teardown", format!("END-OF-PROGRAM DEBUG LOG {stamp}"));
        let leaks = self.report(true);
        self.journal.note("teardown", "END OF LOG");
        if let Err(err) = self.journal.diag.flush() {
            eprintln!("tripwire: flushing the diagnostic log failed: {err}");
        }
        Some(leaks)
    }
}

/// `YYYY-MM-DD HH:MM:SS UTC`.
fn utc_timestamp(now: SystemTime) -> String {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    let days = i64::try_from(secs / 86_400).unwrap_or(0);
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{year:04}-{month:02}-{day:02} {:02}:{:02}:{:02} UTC",
        rem / 3600,
        rem % 3600 / 60,
        rem % 60
    )
}

/// Days since 1970-01-01 to a proleptic Gregorian date.
const fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFileSystem;
    use std::time::Duration;

    fn membrane() -> Membrane<MemoryFileSystem> {
        Membrane::with_file_system(MembraneConfig::in_memory(), MemoryFileSystem::new()).unwrap()
    }

    fn at(line: u32) -> CallSite<'static> {
        CallSite::new("membrane_case.c", line)
    }

    #[test]
    fn civil_dates() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(59), (1970, 3, 1));
        assert_eq!(civil_from_days(11_016), (2000, 2, 29));
        assert_eq!(civil_from_days(19_723), (2024, 1, 1));
    }

    #[test]
    fn timestamp_format() {
        let t = UNIX_EPOCH + Duration::from_secs(86_400 + 3_661);
        assert_eq!(utc_timestamp(t), "1970-01-02 01:01:01 UTC");
    }

    #[test]
    fn calloc_overflow_is_a_usage_error() {
        let mut m = membrane();
        assert!(m.calloc(usize::MAX, 2, at(1)).is_null());
        assert_eq!(m.count(ReportKind::Usage), 1);
        assert_eq!(m.tracker().live_count(), 0);
    }

    #[test]
    #[allow(unsafe_code)]
    fn calloc_zero_fills() {
        let mut m = membrane();
        let p = m.calloc(4, 4, at(1));
        // SAFETY: p addresses 16 bytes.
        let bytes = unsafe { std::slice::from_raw_parts(p, 16) };
        assert!(bytes.iter().all(|&b| b == 0));
        m.free(p, at(2));
        assert_eq!(m.metrics().releases, 1);
    }

    #[test]
    fn aux_blocks_released_as_primary_are_reported_and_forgotten() {
        let mut m = membrane();
        let p = m.malloc_aux(24, at(1));
        m.free(p, at(2));
        assert_eq!(m.count(ReportKind::Lifecycle), 1);
        assert_eq!(m.metrics().class_mismatches, 1);
        assert_eq!(m.tracker().live_count(), 0);
        let q = m.calloc_aux(2, 8, at(3));
        m.free_aux(q, at(4));
        assert_eq!(m.count(ReportKind::Lifecycle), 1);
        m.free_aux(p, at(5));
        let report = m.reports().last().unwrap();
        assert_eq!(report.kind, ReportKind::Lifecycle);
        assert!(report
            .detail
            .ends_with("possibly released before at membrane_case.c, line 2, size 24"));
        assert_eq!(m.metrics().double_releases, 1);
    }

    #[test]
    fn teardown_runs_once() {
        let mut m = membrane();
        let _leak = m.malloc(10, at(7));
        assert_eq!(m.teardown(), Some(1));
        assert_eq!(m.teardown(), None);
        let lines: Vec<String> = m.reports().map(ToString::to_string).collect();
        assert!(lines[0].starts_with("END-OF-PROGRAM DEBUG LOG "));
        assert_eq!(lines[1], "MEMORY LEAKS:");
        assert_eq!(
            lines[2],
            format!("Size {:>8} File {:>16} Line 7", 10, "membrane_case.c")
        );
        assert_eq!(lines[3], "FILE LEAKS:");
        assert_eq!(lines[4], "(none)");
        assert_eq!(lines[5], "END OF LOG");
    }
}
