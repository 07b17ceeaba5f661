use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What the supervisor does when a general worker dies abnormally.
/// Reserved-role loss always terminates regardless of this setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPolicy {
    /// Respawn the dead worker into the same slot.
    Restart,
    /// Bring the whole supervisor down.
    Terminate,
}

/// Tunables for the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of general workers. Zero means one per detected CPU.
    pub worker_count: u16,

    /// Pin each general worker to a CPU.
    pub set_affinity: bool,

    /// Accept batching knob. Reserved, currently informational.
    pub accept_threshold: u32,

    /// RLIMIT_NOFILE target for workers, raised at drop time by the number
    /// of descriptors the process already has open.
    pub rlimit_nofiles: u32,

    /// Per-worker connection load gate: at or above this the accept lock
    /// is released.
    pub max_connections: u32,

    /// Per-worker in-flight HTTP load gate.
    pub http_request_limit: u32,

    pub policy: WorkerPolicy,

    /// Keep the current uid instead of switching to `runas_user`.
    pub skip_runas: bool,

    /// chdir into `root_path` instead of chrooting to it.
    pub skip_chroot: bool,

    pub runas_user: Option<String>,

    /// Worker filesystem root. Defaults to the working directory.
    pub root_path: Option<PathBuf>,

    /// Connections idle longer than this are swept.
    pub idle_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: 0,
            set_affinity: true,
            accept_threshold: 16,
            rlimit_nofiles: 768,
            max_connections: 512,
            http_request_limit: 1000,
            policy: WorkerPolicy::Restart,
            skip_runas: false,
            skip_chroot: false,
            runas_user: None,
            root_path: None,
            idle_timeout_ms: 10_000,
        }
    }
}

impl Config {
    /// Number of general workers after applying the CPU-count default.
    pub fn effective_worker_count(&self) -> u16 {
        if self.worker_count == 0 {
            num_cpus::get() as u16
        } else {
            self.worker_count
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.accept_threshold, 16);
        assert_eq!(cfg.rlimit_nofiles, 768);
        assert_eq!(cfg.max_connections, 512);
        assert_eq!(cfg.policy, WorkerPolicy::Restart);
        assert!(cfg.set_affinity);
        assert!(!cfg.skip_runas);
    }

    #[test]
    fn zero_worker_count_uses_cpu_count() {
        let cfg = Config::default();
        assert_eq!(cfg.effective_worker_count() as usize, num_cpus::get());

        let cfg = Config {
            worker_count: 5,
            ..Config::default()
        };
        assert_eq!(cfg.effective_worker_count(), 5);
    }

    #[test]
    fn policy_deserializes_lowercase() {
        let cfg: Config = serde_json::from_value(serde_json::json!({
            "worker_count": 2,
            "policy": "terminate"
        }))
        .expect("config should deserialize");
        assert_eq!(cfg.worker_count, 2);
        assert_eq!(cfg.policy, WorkerPolicy::Terminate);
        assert_eq!(cfg.max_connections, 512);
    }
}
