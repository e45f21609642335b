//! Process-level platform knobs.

use core_affinity::CoreId;
use log::{info, warn};

/// Pins the calling thread to a physical core. The reactor is single
/// threaded, so pinning it removes scheduler migration jitter.
pub fn pin_thread_to_core(core_id: usize) -> bool {
    let core = CoreId { id: core_id };
    if core_affinity::set_for_current(core) {
        info!("reactor thread pinned to physical core {}", core_id);
        true
    } else {
        warn!("failed to pin reactor thread to core {}", core_id);
        false
    }
}

/// Ignores SIGPIPE so a dead peer surfaces as EPIPE from write(2) instead of
/// killing the process.
pub fn ignore_sigpipe() {
    use nix::sys::signal::{signal, SigHandler, Signal};
    // SAFETY: SIG_IGN for SIGPIPE is process-global and async-signal-safe.
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}
