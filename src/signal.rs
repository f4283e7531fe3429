//! Unix signal handling (SIGINT).
//!
//! The first SIGINT only sets a flag, so watch mode can stop between
//! rebuilds and still write out pending debug traces.  The handler restores
//! the default action, so a second SIGINT kills the process.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
fn sigint_action(handler: libc::sighandler_t) {
    // Safety: registering a signal handler is libc unsafe code.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler;
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
    }
}

#[cfg(unix)]
extern "C" fn sigint_handler(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
    sigint_action(libc::SIG_DFL);
}

#[cfg(unix)]
pub fn register_sigint() {
    sigint_action(sigint_handler as extern "C" fn(libc::c_int) as libc::sighandler_t);
}

#[cfg(not(unix))]
pub fn register_sigint() {}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}
