//! Signal handling.
//!
//! SIGINT, SIGTERM, SIGHUP, and SIGALRM set [`shutdown_requested`]'s atomic
//! flag; SIGPIPE and SIGCHLD are ignored. All other signals are expected to
//! be blocked on worker threads by the process bootstrap (out of scope,
//! spec.md §1) before [`install`] is called.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Installs the handlers described above. Safe to call once at startup.
pub fn install() {
    unsafe {
        install_flag_handler(libc::SIGINT);
        install_flag_handler(libc::SIGTERM);
        install_flag_handler(libc::SIGHUP);
        install_flag_handler(libc::SIGALRM);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGCHLD, libc::SIG_IGN);
    }
}

/// True once a shutdown signal has been observed. All four schedulers poll
/// this on every iteration and drain rather than block when it flips.
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

#[cfg(test)]
pub(crate) fn reset_for_test() {
    SHUTDOWN.store(false, Ordering::Relaxed);
}

unsafe fn install_flag_handler(signum: libc::c_int) {
    libc::signal(signum, on_shutdown_signal as libc::sighandler_t);
}

// Async-signal-safe: touches only a single atomic store.
extern "C" fn on_shutdown_signal(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_clear_and_can_be_set() {
        reset_for_test();
        assert!(!shutdown_requested());
        SHUTDOWN.store(true, Ordering::Relaxed);
        assert!(shutdown_requested());
        reset_for_test();
    }
}
