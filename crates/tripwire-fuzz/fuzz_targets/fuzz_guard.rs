#![no_main]
use libfuzzer_sys::fuzz_target;
use tripwire_membrane::{CallSite, Capacity, Membrane, MembraneConfig, MemoryFileSystem};

const SITE: CallSite<'static> = CallSite::new("fuzz.c", 1);

fuzz_target!(|data: &[u8]| {
    // Arbitrary source bytes copied into tracked and declared buffers.
    // The guard must keep every write inside the destination.
    if data.len() < 2 {
        return;
    }
    let config = MembraneConfig {
        retained_reports: 0,
        ..MembraneConfig::in_memory()
    };
    let Ok(mut m) = Membrane::with_file_system(config, MemoryFileSystem::new()) else {
        return;
    };
    let cap = usize::from(data[0] % 64) + 1;
    let mut src = data[1..].to_vec();
    src.push(0);

    let tracked = m.calloc(1, cap, SITE);
    let mut local = vec![0u8; cap];
    // SAFETY: src is terminated; both destinations hold `cap` bytes.
    unsafe {
        m.strcpy(tracked, Capacity::Unknown, src.as_ptr(), Capacity::Declared(src.len()), SITE);
        m.strcat(tracked, Capacity::Unknown, src.as_ptr(), Capacity::Declared(src.len()), SITE);
        m.memcpy(local.as_mut_ptr(), Capacity::Declared(cap), src.as_ptr(), src.len(), SITE);
        m.strncpy(local.as_mut_ptr(), Capacity::Declared(cap), src.as_ptr(), Capacity::Declared(src.len()), src.len(), SITE);
        let _ = m.strlen(local.as_ptr(), Capacity::Declared(cap), SITE);
    }
    m.free(tracked, SITE);
    assert_eq!(m.metrics().corruptions, 0);
});
