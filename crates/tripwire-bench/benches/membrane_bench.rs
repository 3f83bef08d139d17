//! Membrane overhead benchmarks.
//!
//! Tracked allocation against the raw host allocator, and guarded string
//! copies against the passthrough mode.

use criterion::{Criterion, criterion_group, criterion_main};
use tripwire_membrane::{
    CallSite, Capacity, GuardMode, Membrane, MembraneConfig, MemoryFileSystem,
};

const SITE: CallSite<'static> = CallSite::new("bench.c", 1);

fn membrane(mode: GuardMode) -> Membrane<MemoryFileSystem> {
    let config = MembraneConfig {
        mode,
        retained_reports: 0,
        ..MembraneConfig::in_memory()
    };
    Membrane::with_file_system(config, MemoryFileSystem::new()).expect("membrane")
}

fn bench_host_malloc(c: &mut Criterion) {
    c.bench_function("host_malloc_free_64", |b| {
        b.iter(|| {
            // SAFETY: the block is freed immediately.
            unsafe {
                let p = libc::malloc(criterion::black_box(64));
                libc::free(p);
            }
        });
    });
}

fn bench_tracked_malloc(c: &mut Criterion) {
    let mut m = membrane(GuardMode::Guarded);
    c.bench_function("tracked_malloc_free_64", |b| {
        b.iter(|| {
            let p = m.malloc(criterion::black_box(64), SITE);
            m.free(p, SITE);
        });
    });
}

fn bench_tracked_release_deep_list(c: &mut Criterion) {
    let mut m = membrane(GuardMode::Guarded);
    let held: Vec<_> = (0..1024).map(|_| m.calloc(1, 32, SITE)).collect();
    c.bench_function("tracked_release_behind_1024_live", |b| {
        b.iter(|| {
            let p = m.calloc(1, 32, SITE);
            m.free(p, SITE);
        });
    });
    for p in held {
        m.free(p, SITE);
    }
}

fn bench_strcpy(c: &mut Criterion) {
    let src = *b"a moderately sized source string\0";
    for (name, mode) in [("strcpy_guarded", GuardMode::Guarded), ("strcpy_off", GuardMode::Off)] {
        let mut m = membrane(mode);
        let mut dst = [0u8; 64];
        c.bench_function(name, |b| {
            b.iter(|| {
                // SAFETY: dst holds 64 bytes and src is terminated.
                unsafe {
                    m.strcpy(
                        dst.as_mut_ptr(),
                        Capacity::Declared(64),
                        src.as_ptr(),
                        Capacity::Declared(src.len()),
                        SITE,
                    )
                }
            });
        });
    }
}

criterion_group!(
    benches,
    bench_host_malloc,
    bench_tracked_malloc,
    bench_tracked_release_deep_list,
    bench_strcpy
);
criterion_main!(benches);
