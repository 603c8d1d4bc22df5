// src/os/signals.rs

//! Crash/diagnostic signal handling.
//!
//! Fatal-fault signals (SIGSEGV, SIGILL, SIGBUS, SIGFPE) get a handler
//! that writes a symbolic call stack to stderr and then terminates the
//! process. SIGQUIT and SIGUSR1 share the handler as diagnostic triggers:
//! they dump the stack and return. The handler body is allocation-free and
//! touches no shared mutable state beyond a single atomic re-entrancy
//! guard, so it is safe under asynchronous delivery on any thread.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use log::{debug, warn};
use once_cell::sync::Lazy;

const MAX_FRAMES: usize = 128;

/// Guards against a crash inside the crash handler recursing forever.
static IN_CRASH_HANDLER: AtomicBool = AtomicBool::new(false);

const HANDLED_SIGNALS: [libc::c_int; 6] = [
    libc::SIGSEGV,
    libc::SIGILL,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGQUIT,
    libc::SIGUSR1,
];

struct SavedActions([libc::sigaction; HANDLED_SIGNALS.len()]);

// Plain C data captured from sigaction; carried only to restore later.
unsafe impl Send for SavedActions {}

/// `Some` while our handlers are installed. The saved-state flag making
/// install/uninstall idempotent.
static SAVED: Lazy<Mutex<Option<SavedActions>>> = Lazy::new(|| Mutex::new(None));

extern "C" fn handle_crash(sig: libc::c_int) {
    if IN_CRASH_HANDLER.swap(true, Ordering::SeqCst) {
        // A crash inside the handler is swallowed, not recursed into.
        return;
    }

    // Async-signal-safe only from here: write(2) and the backtrace family.
    // No logging, no formatting, no allocation.
    static HEADER: &[u8] = b"pixeld: caught fatal or diagnostic signal, call stack:\n";
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            HEADER.as_ptr().cast(),
            HEADER.len(),
        );
        let mut frames = [std::ptr::null_mut::<libc::c_void>(); MAX_FRAMES];
        let depth = libc::backtrace(frames.as_mut_ptr(), MAX_FRAMES as libc::c_int);
        libc::backtrace_symbols_fd(frames.as_ptr(), depth, libc::STDERR_FILENO);
    }

    IN_CRASH_HANDLER.store(false, Ordering::SeqCst);

    if sig != libc::SIGQUIT && sig != libc::SIGUSR1 {
        // A true fault: terminate without running atexit machinery.
        unsafe { libc::_exit(255) };
    }
}

/// Installs the crash handlers, saving the previous dispositions. A second
/// call while installed is a no-op.
pub fn install() -> Result<()> {
    let mut saved = SAVED.lock().unwrap_or_else(|e| e.into_inner());
    if saved.is_some() {
        debug!("Crash handlers already installed");
        return Ok(());
    }

    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = handle_crash as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    action.sa_flags = 0;

    let mut old_actions: [libc::sigaction; HANDLED_SIGNALS.len()] =
        unsafe { mem::zeroed() };
    for (sig, old) in HANDLED_SIGNALS.iter().zip(old_actions.iter_mut()) {
        if unsafe { libc::sigaction(*sig, &action, old) } != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("Failed to install handler for signal {sig}"));
        }
    }

    *saved = Some(SavedActions(old_actions));
    debug!("Crash handlers installed");
    Ok(())
}

/// Restores the dispositions saved by `install`. A no-op when nothing is
/// installed.
pub fn uninstall() {
    let mut saved = SAVED.lock().unwrap_or_else(|e| e.into_inner());
    let Some(SavedActions(old_actions)) = saved.take() else {
        return;
    };
    for (sig, old) in HANDLED_SIGNALS.iter().zip(old_actions.iter()) {
        if unsafe { libc::sigaction(*sig, old, std::ptr::null_mut()) } != 0 {
            warn!(
                "Failed to restore handler for signal {sig}: {}",
                std::io::Error::last_os_error()
            );
        }
    }
    debug!("Crash handlers restored");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent_and_diagnostic_signal_survives() {
        install().unwrap();
        install().unwrap();

        // SIGUSR1 is a log-only diagnostic trigger: the handler dumps a
        // stack to stderr and the process continues.
        unsafe { libc::raise(libc::SIGUSR1) };

        uninstall();
        uninstall();
    }
}
