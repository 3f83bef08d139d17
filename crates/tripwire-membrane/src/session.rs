//! Process-wide membrane.
//!
//! Created on first use from the `TRIPWIRE_*` environment variables. Creation
//! registers an exit hook that writes the final leak report and flushes the
//! diagnostic log.

#![allow(unsafe_code)]

use std::sync::Once;

use parking_lot::Mutex;

use crate::config::{Destination, MembraneConfig};
use crate::membrane::Membrane;

static GLOBAL: Mutex<Option<Membrane>> = parking_lot::const_mutex(None);
static EXIT_HOOK: Once = Once::new();

extern "C" fn teardown_at_exit() {
    // A thread exiting while holding the lock forfeits the final report.
    if let Some(mut guard) = GLOBAL.try_lock() {
        if let Some(membrane) = guard.as_mut() {
            membrane.teardown();
        }
    }
}

fn build() -> Option<Membrane> {
    EXIT_HOOK.call_once(|| {
        // SAFETY: teardown_at_exit is a plain extern "C" fn with no arguments.
        if unsafe { libc::atexit(teardown_at_exit) } != 0 {
            eprintln!("tripwire: could not register the exit report");
        }
    });
    let config = MembraneConfig::from_env();
    match Membrane::new(config.clone()) {
        Ok(membrane) => Some(membrane),
        Err(err) => {
            eprintln!("tripwire: {err}; reporting to stderr");
            Membrane::new(MembraneConfig {
                destination: Destination::Stderr,
                ..config
            })
            .ok()
        }
    }
}

/// Run `f` against the process-wide membrane, creating it if needed.
/// `None` only when no diagnostic destination could be opened.
pub fn with_global<R>(f: impl FnOnce(&mut Membrane) -> R) -> Option<R> {
    let mut guard = GLOBAL.lock();
    if guard.is_none() {
        *guard = build();
    }
    guard.as_mut().map(f)
}

/// Run the final report now instead of at exit. `None` if the global
/// membrane was never created or has already been torn down.
pub fn teardown_global() -> Option<usize> {
    GLOBAL.lock().as_mut().and_then(Membrane::teardown)
}
