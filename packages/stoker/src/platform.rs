//! Best-effort platform niceties for worker processes.

#[cfg(target_os = "linux")]
use log::{debug, warn};

/// Sets the process name shown by ps/top. Best-effort.
#[cfg(target_os = "linux")]
pub fn set_proctitle(name: &str) {
    use std::ffi::CString;

    let Ok(title) = CString::new(name) else {
        return;
    };
    if let Err(e) = nix::sys::prctl::set_name(&title) {
        debug!("prctl(PR_SET_NAME): {e}");
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_proctitle(_name: &str) {}

/// Pins the calling process to one CPU.
#[cfg(target_os = "linux")]
pub fn set_affinity(cpu: u16) {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    if let Err(e) = set.set(cpu as usize) {
        warn!("cpu {cpu} outside the affinity set: {e}");
        return;
    }
    if let Err(e) = sched_setaffinity(Pid::from_raw(0), &set) {
        warn!("cannot pin worker to cpu {cpu}: {e}");
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_affinity(_cpu: u16) {}
