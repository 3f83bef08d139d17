use tripwire_membrane::{
    CallSite, HeapAllocator, HostAllocator, Membrane, MembraneConfig, MemoryFileSystem, ReportKind,
};

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

fn membrane() -> Membrane<MemoryFileSystem> {
    Membrane::with_file_system(MembraneConfig::in_memory(), MemoryFileSystem::new()).unwrap()
}

fn at(line: u32) -> CallSite<'static> {
    CallSite::new("tracker.c", line)
}

fn fill(ptr: *mut u8, len: usize, byte: u8) {
    // SAFETY: callers pass a live tracked block of at least `len` bytes.
    unsafe { std::ptr::write_bytes(ptr, byte, len) };
}

fn all_equal(ptr: *const u8, len: usize, byte: u8) -> bool {
    // SAFETY: callers pass a live tracked block of at least `len` bytes.
    let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
    bytes.iter().all(|&b| b == byte)
}

#[test]
fn balanced_sequence_reports_no_leaks() {
    let mut m = membrane();
    let a = m.malloc(10, at(1));
    let b = m.calloc(3, 7, at(2));
    let a = m.realloc(a, 40, at(3));
    m.free(b, at(4));
    m.free(a, at(5));
    assert_eq!(m.tracker().live_count(), 0);
    assert_eq!(m.tracker().live_bytes(), 0);
    assert_eq!(m.reports().count(), 0);
    assert_eq!(m.teardown(), Some(0));
    let lines: Vec<String> = m.reports().map(ToString::to_string).collect();
    assert_eq!(lines[1..], ["MEMORY LEAKS:", "(none)", "FILE LEAKS:", "(none)", "END OF LOG"]);
}

#[test]
fn report_lists_exactly_the_live_blocks() {
    let mut m = membrane();
    let a = m.malloc(10, at(1));
    let b = m.malloc(200, at(2));
    let c = m.malloc(3000, at(3));
    m.free(b, at(4));
    assert_eq!(m.report(false), 2);
    let lines: Vec<String> = m.reports().map(ToString::to_string).collect();
    assert_eq!(
        lines,
        [
            "Allocated Memory Blocks:".to_string(),
            format!("Size {:>8} File {:>16} Line 3", 3000, "tracker.c"),
            format!("Size {:>8} File {:>16} Line 1", 10, "tracker.c"),
            "Open Files:".to_string(),
            "(none)".to_string(),
        ]
    );
    m.free(a, at(5));
    m.free(c, at(6));
}

#[test]
fn writing_past_the_end_is_reported_at_release() {
    let mut m = membrane();
    let p = m.malloc(16, at(1));
    fill(p, 17, 0xAB);
    m.free(p, at(2));
    let reports = m.drain_reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind, ReportKind::Overrun);
    assert_eq!(reports[0].site.as_deref(), Some("tracker.c, line 2"));
    assert_eq!(
        reports[0].detail,
        "the 16-byte block allocated at tracker.c, line 1 was written past its end"
    );
    assert_eq!(m.tracker().live_count(), 0);
    assert_eq!(m.metrics().releases, 1);
}

#[test]
fn writing_up_to_the_boundary_is_silent() {
    let mut m = membrane();
    for n in [1, 7, 8, 9, 64, 1000] {
        let p = m.malloc(n, at(1));
        fill(p, n, 0xCD);
        m.free(p, at(2));
    }
    assert_eq!(m.reports().count(), 0);
}

#[test]
fn foreign_pointer_is_a_bad_release() {
    let mut m = membrane();
    let live = m.malloc(32, at(1));
    let mut local = [0u8; 16];
    m.free(local.as_mut_ptr(), at(2));
    assert_eq!(m.count(ReportKind::Lifecycle), 1);
    let report = m.reports().next().unwrap();
    assert!(report.detail.ends_with("not a tracked block"));
    assert_eq!(m.tracker().live_count(), 1);
    assert_eq!(m.tracker().block(live).unwrap().byte_count, 32);
    assert_eq!(m.metrics().bad_releases, 1);
}

#[test]
fn second_release_cites_the_first() {
    let mut m = membrane();
    let p = m.malloc(24, at(1));
    m.free(p, at(2));
    assert_eq!(m.reports().count(), 0);
    m.free(p, at(3));
    let report = m.reports().next().unwrap();
    assert_eq!(report.kind, ReportKind::Lifecycle);
    assert_eq!(report.site.as_deref(), Some("tracker.c, line 3"));
    assert!(report
        .detail
        .ends_with("possibly released before at tracker.c, line 2, size 24"));
    assert_eq!(m.metrics().double_releases, 1);
}

#[test]
fn null_release_is_a_usage_error() {
    let mut m = membrane();
    m.free(std::ptr::null_mut(), at(1));
    assert_eq!(m.count(ReportKind::Usage), 1);
}

#[test]
fn damaged_header_halts_the_walk() {
    let mut m = membrane();
    let older = m.malloc(16, at(1));
    let newer = m.malloc(16, at(2));
    // SAFETY: the header sits in front of the block inside the same allocation.
    unsafe { newer.sub(tripwire_membrane::tracker::HEADER_SIZE).write_bytes(0, 8) };
    m.free(older, at(3));
    assert_eq!(m.count(ReportKind::Corruption), 1);
    assert_eq!(m.tracker().live_count(), 2);
    assert_eq!(m.report(true), 0);
    assert_eq!(m.count(ReportKind::Corruption), 2);
}

#[test]
fn heap_backed_pool_exhausts_and_recovers() {
    let heap = HeapAllocator::with_capacity(1024).unwrap();
    let mut m = Membrane::with_parts(
        MembraneConfig::in_memory(),
        MemoryFileSystem::new(),
        Box::new(heap),
        Box::new(HostAllocator),
    )
    .unwrap();
    let mut blocks = Vec::new();
    loop {
        let p = m.malloc(100, at(1));
        if p.is_null() {
            break;
        }
        fill(p, 100, 0x11);
        blocks.push(p);
    }
    assert!(!blocks.is_empty());
    assert_eq!(m.count(ReportKind::Exhaustion), 1);
    for p in blocks.drain(..) {
        m.free(p, at(2));
    }
    let p = m.malloc(100, at(3));
    assert!(!p.is_null());
    m.free(p, at(4));
    assert_eq!(m.tracker().live_count(), 0);
}

#[test]
fn pool_refusal_after_an_overrun_is_reported() {
    let heap = HeapAllocator::with_capacity(1024).unwrap();
    let mut m = Membrane::with_parts(
        MembraneConfig::in_memory(),
        MemoryFileSystem::new(),
        Box::new(heap),
        Box::new(HostAllocator),
    )
    .unwrap();
    let a = m.malloc(8, at(1));
    let b = m.malloc(8, at(2));
    // Runs past a's footer into the pool's header for b.
    fill(a, 24, 0xFF);
    m.free(a, at(3));
    m.free(b, at(4));
    let reports = m.drain_reports();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].kind, ReportKind::Overrun);
    assert_eq!(reports[1].kind, ReportKind::Corruption);
    assert_eq!(reports[1].site.as_deref(), Some("tracker.c, line 4"));
    assert!(reports[1]
        .detail
        .starts_with("free-list heap pool refused the 8-byte block allocated at tracker.c, line 2: "));
    assert!(reports[1].detail.ends_with("storage not reclaimed"));
    let metrics = m.metrics();
    assert_eq!(metrics.releases, 1);
    assert_eq!(metrics.corruptions, 2);
    assert_eq!(m.tracker().live_count(), 0);
}

#[test]
fn deterministic_sequences_preserve_contents() {
    let mut m = membrane();
    let mut rng = XorShift64::new(0x7269_7077_6972_6521);
    let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();

    for step in 0..2_000u32 {
        match rng.gen_range_usize(0, 9) {
            0..=3 => {
                let n = rng.gen_range_usize(1, 512);
                let byte = (step % 251) as u8;
                let p = if rng.next_u64() % 2 == 0 {
                    m.malloc(n, at(step))
                } else {
                    let p = m.calloc(1, n, at(step));
                    assert!(all_equal(p, n, 0));
                    p
                };
                fill(p, n, byte);
                live.push((p, n, byte));
            }
            4..=5 if !live.is_empty() => {
                let index = rng.gen_range_usize(0, live.len() - 1);
                let (p, n, byte) = live[index];
                let grown = rng.gen_range_usize(1, 768);
                let q = m.realloc(p, grown, at(step));
                assert!(all_equal(q, n.min(grown), byte));
                fill(q, grown, byte);
                live[index] = (q, grown, byte);
            }
            _ if !live.is_empty() => {
                let index = rng.gen_range_usize(0, live.len() - 1);
                let (p, n, byte) = live.swap_remove(index);
                assert!(all_equal(p, n, byte));
                m.free(p, at(step));
            }
            _ => {}
        }
        assert_eq!(m.tracker().live_count(), live.len());
    }

    for (p, _, _) in live.drain(..) {
        m.free(p, at(9_999));
    }
    assert_eq!(m.reports().count(), 0);
    assert_eq!(m.tracker().live_bytes(), 0);
    let metrics = m.metrics();
    assert_eq!(metrics.allocations, metrics.releases);
}
