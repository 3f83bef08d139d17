#![no_main]
use libfuzzer_sys::fuzz_target;
use tripwire_heap::FreeListHeap;

fuzz_target!(|data: &[u8]| {
    // Drive the heap with an arbitrary op stream; the detailed walk asserts
    // list order, coalescing and bounds after every step.
    let mut backing = vec![0u8; 4096];
    let Ok(mut heap) = FreeListHeap::initialize(&mut backing) else {
        return;
    };
    heap.silence();
    let mut live = Vec::new();

    for pair in data.chunks(2) {
        let op = pair[0];
        let arg = usize::from(pair.get(1).copied().unwrap_or(0)) * 8;
        match op % 4 {
            0 | 1 => {
                if let Some(p) = heap.allocate(arg) {
                    live.push(p);
                }
            }
            2 if !live.is_empty() => {
                let p = live.swap_remove(usize::from(op) % live.len());
                assert!(heap.release(p).is_ok());
                // Second release must be refused, not corrupt the list.
                assert!(heap.release(p).is_err());
            }
            3 if !live.is_empty() => {
                let index = usize::from(op) % live.len();
                if let Some(q) = heap.resize(Some(live[index]), arg) {
                    live[index] = q;
                }
            }
            _ => {}
        }
        let _ = heap.status(true);
    }

    for p in live {
        assert!(heap.release(p).is_ok());
    }
    assert_eq!(heap.used(), 0);
});
