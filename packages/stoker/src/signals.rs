//! Signal receipt latched into a single atomic, consumed at the event-loop
//! iteration boundary. Handlers do nothing beyond the store.

use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

use crate::error::{Result, StokerError};

static SIG_RECV: AtomicI32 = AtomicI32::new(0);

extern "C" fn signal_latch(sig: libc::c_int) {
    SIG_RECV.store(sig, Ordering::Relaxed);
}

/// Installs the latch for the lifecycle signals. No SA_RESTART: delivery
/// interrupts the demultiplexer wait so the loop sees the flag promptly.
pub fn install() -> Result<()> {
    let latch = SigAction::new(
        SigHandler::Handler(signal_latch),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [
        Signal::SIGHUP,
        Signal::SIGINT,
        Signal::SIGQUIT,
        Signal::SIGTERM,
        Signal::SIGCHLD,
    ] {
        unsafe { sigaction(sig, &latch) }.map_err(|e| StokerError::sys("sigaction", e))?;
    }

    // A channel peer can disappear mid-write.
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGPIPE, &ignore) }
        .map_err(|e| StokerError::sys("sigaction", e))?;

    Ok(())
}

/// The signal received since the last [`clear`], if any.
pub fn pending() -> Option<Signal> {
    match SIG_RECV.load(Ordering::Relaxed) {
        0 => None,
        raw => Signal::try_from(raw).ok(),
    }
}

pub fn clear() {
    SIG_RECV.store(0, Ordering::Relaxed);
}

/// Whether the pending signal is one of the shutdown set. Role runners
/// without their own signal plumbing poll this.
pub fn shutdown_requested() -> bool {
    matches!(
        pending(),
        Some(Signal::SIGINT | Signal::SIGQUIT | Signal::SIGTERM)
    )
}

#[cfg(test)]
pub(crate) fn latch_for_test(sig: Signal) {
    SIG_RECV.store(sig as i32, Ordering::Relaxed);
}
