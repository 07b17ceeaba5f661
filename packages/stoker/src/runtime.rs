//! Seams to everything the core deliberately does not implement: the user
//! runtime hooks, the HTTP protocol engine, the cooperative task scheduler
//! and the reserved-role process bodies.

use log::debug;

use crate::msg::Channel;

/// A named entry point resolved at startup and invoked at a lifecycle
/// edge. Absence is not an error.
pub type Hook = Box<dyn FnMut()>;

#[derive(Default)]
pub struct RuntimeHooks {
    /// Runs once after handler registration, before the first iteration.
    pub configure: Option<Hook>,
    /// Runs after configure; the module-load edge.
    pub onload: Option<Hook>,
    /// Runs on SIGHUP.
    pub reload: Option<Hook>,
    /// Runs once when the loop exits, before subsystem teardown.
    pub teardown: Option<Hook>,
    /// Final step of the privilege drop.
    pub sandbox: Option<Hook>,
}

impl RuntimeHooks {
    pub(crate) fn run(hook: &mut Option<Hook>, name: &str) {
        if let Some(hook) = hook {
            debug!("running {name} hook");
            hook();
        }
    }
}

/// The HTTP protocol engine, driven once per loop iteration.
pub trait HttpEngine {
    /// Requests currently in flight; the second accept-lock load gate.
    fn in_flight(&self) -> u32;

    /// One quantum of protocol work.
    fn process(&mut self, _now: u64) {}

    /// Advances scheduled outbound client work.
    fn run_scheduled(&mut self, _now: u64) {}

    fn teardown(&mut self) {}
}

/// The cooperative task scheduler, driven once per loop iteration.
pub trait TaskScheduler {
    /// Whether any task can make progress without new I/O; shortens the
    /// demultiplexer wait.
    fn pending(&self) -> bool;

    fn run(&mut self, _now: u64) {}

    /// Reaps subprocesses the scheduler may have spawned (SIGCHLD edge).
    fn reap_children(&mut self) {}

    fn teardown(&mut self) {}
}

/// Engine placeholders for deployments without the optional subsystems.
pub struct NoHttp;

impl HttpEngine for NoHttp {
    fn in_flight(&self) -> u32 {
        0
    }
}

pub struct NoTasks;

impl TaskScheduler for NoTasks {
    fn pending(&self) -> bool {
        false
    }
}

/// Body of a reserved-role process. Receives the worker side of the
/// control channel; the process exits when it returns.
pub type RoleRunner = Box<dyn FnOnce(Channel)>;

/// The reserved roles the embedder provides. The key manager being present
/// is what activates certificate and entropy traffic in the workers.
#[derive(Default)]
pub struct RoleRunners {
    pub keymgr: Option<RoleRunner>,
    pub acme: Option<RoleRunner>,
}
