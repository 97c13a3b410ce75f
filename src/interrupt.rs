//! Host interrupt handling for `main`.
//!
//! Handlers only set an atomic flag; the drive loop in `main` polls it
//! and issues the halt from the runtime thread. Keeping the handler to a
//! single store is what makes it async-signal-safe.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// True once SIGINT or SIGTERM has been received.
pub(crate) fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

#[cfg(unix)]
#[allow(unsafe_code)]
pub(crate) fn install() {
    extern "C" fn on_interrupt(_signum: libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }
    // SAFETY: the handler performs a single atomic store, which is
    // async-signal-safe; no allocation, locking, or runtime access.
    unsafe {
        libc::signal(libc::SIGINT, on_interrupt as usize);
        libc::signal(libc::SIGTERM, on_interrupt as usize);
    }
}

#[cfg(not(unix))]
pub(crate) fn install() {}
