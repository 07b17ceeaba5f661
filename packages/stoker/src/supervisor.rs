//! The supervisor: owns the shared region and the descriptor table, forks
//! the pool, reaps exited children under the restart/terminate policy,
//! recovers the accept lock from crashed holders and routes control
//! messages between the workers.

use std::collections::HashMap;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use mio::{Events, Interest, Poll, Token};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};

use crate::config::{Config, WorkerPolicy};
use crate::error::{Result, StokerError};
use crate::event::adopt_listeners;
use crate::msg::{ADDR_ALL, ADDR_PARENT, Channel, Frame, MsgKind};
use crate::runtime::RoleRunners;
use crate::shm::SharedRegion;
use crate::signals;
use crate::worker::{Worker, WorkerParts, WorkerRole};
use crate::{WORKER_SOLO_COUNT, platform};

/// Reserved slot indices; general workers occupy the rest.
pub const KEYMGR_IDX: u16 = 0;
pub const ACME_IDX: u16 = 1;
pub const WORKER_BASE: u16 = 2;

/// Everything the embedding application plugs into the pool. Listeners
/// and engines cross into the workers by fork inheritance.
#[derive(Default)]
pub struct ServerParts {
    pub listeners: Vec<std::net::TcpListener>,
    pub roles: RoleRunners,
    pub worker: WorkerParts,
}

/// Supervisor-side view of one worker slot. Slot identity is stable for
/// the supervisor's lifetime; only the process behind it changes.
struct Slot {
    role: WorkerRole,
    cpu: u16,
    pid: Option<Pid>,
    channel: Option<Channel>,
    draining: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum ReapAction {
    /// Clean exit: mark not-running, leave the slot empty.
    ClearSlot,
    /// Reserved-role loss: supervisor-wide termination, policy ignored.
    Escalate,
    /// Crash under the TERMINATE policy.
    Terminate,
    /// Crash under the RESTART policy: respawn into the same slot.
    Restart,
}

/// Classifies a child exit. `clean` means a zero exit status; signal
/// deaths are never clean.
fn reap_decision(role: WorkerRole, clean: bool, policy: WorkerPolicy) -> ReapAction {
    if clean {
        return ReapAction::ClearSlot;
    }
    if !role.is_general() {
        return ReapAction::Escalate;
    }
    match policy {
        WorkerPolicy::Terminate => ReapAction::Terminate,
        WorkerPolicy::Restart => ReapAction::Restart,
    }
}

pub struct Supervisor {
    cfg: Config,
    total: u16,
    region: Arc<SharedRegion>,
    slots: Vec<Slot>,
    parts: ServerParts,
    keymgr_active: bool,
    acme_configured: bool,
    poll: Option<Poll>,
    events: Events,
    handler_errors: HashMap<String, u32>,
    started: bool,
    quitting: bool,
}

impl Supervisor {
    /// Builds the shared region and the descriptor table. Must run in the
    /// process that will supervise, before any fork.
    pub fn new(cfg: Config, parts: ServerParts) -> Result<Self> {
        let generals = cfg.effective_worker_count();
        // The reserved slots exist even when the roles are not started.
        let total = generals + 2;
        let region = Arc::new(SharedRegion::create(total as usize)?);

        let cpus = (num_cpus::get() as u16).max(1);
        if generals > cpus {
            debug!("more workers ({generals}) than cpus ({cpus})");
        }

        let mut slots = Vec::with_capacity(total as usize);
        slots.push(Slot {
            role: WorkerRole::KeyMgr,
            cpu: 0,
            pid: None,
            channel: None,
            draining: false,
        });
        slots.push(Slot {
            role: WorkerRole::Acme,
            cpu: 0,
            pid: None,
            channel: None,
            draining: false,
        });
        let mut cpu = 1u16;
        for id in 1..=generals {
            if cpu >= cpus {
                cpu = 0;
            }
            slots.push(Slot {
                role: WorkerRole::General(id),
                cpu,
                pid: None,
                channel: None,
                draining: false,
            });
            cpu += 1;
        }

        let keymgr_active = parts.roles.keymgr.is_some();
        let acme_configured = parts.roles.acme.is_some();

        Ok(Self {
            cfg,
            total,
            region,
            slots,
            parts,
            keymgr_active,
            acme_configured,
            poll: None,
            events: Events::with_capacity(256),
            handler_errors: HashMap::new(),
            started: false,
            quitting: false,
        })
    }

    pub fn worker_count(&self) -> u16 {
        self.total
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// Spawns the pool: general workers first, then ACME if configured,
    /// then the key manager.
    pub fn start(&mut self) -> Result<()> {
        self.started = true;
        info!(
            "starting {} workers on {} cpus",
            self.total - 2,
            num_cpus::get()
        );
        for idx in WORKER_BASE..self.total {
            self.spawn(idx, false)?;
        }
        if self.keymgr_active {
            if self.acme_configured {
                self.spawn(ACME_IDX, false)?;
            }
            self.spawn(KEYMGR_IDX, false)?;
        }
        Ok(())
    }

    /// One socketpair plus fork. A spawn failure is fatal. The child never
    /// returns from this call.
    fn spawn(&mut self, idx: u16, restarted: bool) -> Result<()> {
        if idx >= self.total {
            return Err(StokerError::BadSlot(idx));
        }
        let (sup_side, wrk_side) = Channel::pair()?;
        let (role, cpu) = {
            let slot = &self.slots[idx as usize];
            (slot.role, slot.cpu)
        };

        // Shared state must be in place before the child can look at it.
        {
            let shared = self.region.slot(idx as usize);
            shared.reset();
            shared.set_restarted(restarted);
            shared.set_running(true);
        }

        match unsafe { fork() }.map_err(StokerError::Spawn)? {
            ForkResult::Child => {
                drop(sup_side);
                self.child_entry(role, idx, cpu, wrk_side)
            }
            ForkResult::Parent { child } => {
                drop(wrk_side);
                self.region.slot(idx as usize).set_pid(child.as_raw());
                debug!("spawned worker {} (pid {})", role.name(), child);
                let slot = &mut self.slots[idx as usize];
                slot.pid = Some(child);
                slot.channel = Some(sup_side);
                slot.draining = false;
                self.register_channel(idx)?;
                Ok(())
            }
        }
    }

    /// The forked child: reserved roles hand off to their runner, general
    /// workers build and run the event loop. Never returns.
    fn child_entry(&mut self, role: WorkerRole, idx: u16, cpu: u16, channel: Channel) -> ! {
        match role {
            WorkerRole::KeyMgr | WorkerRole::Acme => {
                platform::set_proctitle(&role.name());
                if let Err(e) = signals::install() {
                    error!("{}: {e}", role.name());
                    process::exit(1);
                }
                // take() only touches this child's copy-on-write memory.
                let runner = match role {
                    WorkerRole::KeyMgr => self.parts.roles.keymgr.take(),
                    _ => self.parts.roles.acme.take(),
                };
                match runner {
                    Some(runner) => {
                        runner(channel);
                        process::exit(0);
                    }
                    None => {
                        error!("{} slot spawned without a runner", role.name());
                        process::exit(1);
                    }
                }
            }
            WorkerRole::General(_) => {
                let parts = std::mem::take(&mut self.parts);
                let listeners = match adopt_listeners(parts.listeners) {
                    Ok(listeners) => listeners,
                    Err(e) => {
                        error!("worker {} startup: {e}", role.name());
                        process::exit(1);
                    }
                };
                let worker = Worker::new(
                    self.cfg.clone(),
                    role,
                    idx,
                    cpu,
                    self.total,
                    Arc::clone(&self.region),
                    channel,
                    listeners,
                    parts.worker,
                    self.keymgr_active,
                );
                match worker {
                    Ok(mut worker) => match worker.run() {
                        Ok(()) => process::exit(0),
                        Err(e) => {
                            error!("worker {}: {e}", role.name());
                            process::exit(1);
                        }
                    },
                    Err(e) => {
                        error!("worker {} startup: {e}", role.name());
                        process::exit(1);
                    }
                }
            }
        }
    }

    fn register_channel(&mut self, idx: u16) -> Result<()> {
        let Some(poll) = self.poll.as_ref() else {
            return Ok(());
        };
        if let Some(channel) = self.slots[idx as usize].channel.as_mut() {
            poll.registry()
                .register(channel.stream_mut(), Token(idx as usize), Interest::READABLE)
                .map_err(StokerError::Io)?;
        }
        Ok(())
    }

    fn deregister_channel(&mut self, idx: u16) {
        let Some(poll) = self.poll.as_ref() else {
            return;
        };
        if let Some(channel) = self.slots[idx as usize].channel.as_mut() {
            let _ = poll.registry().deregister(channel.stream_mut());
        }
    }

    /// Consumes every currently-exited child without blocking.
    pub fn reap(&mut self) {
        loop {
            match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return,
                Ok(WaitStatus::Exited(pid, status)) => {
                    self.reaper(pid, status == 0, format!("status {status}"));
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    self.reaper(pid, false, format!("signal {sig}"));
                }
                Ok(_) => continue,
                Err(nix::Error::ECHILD) => return,
                Err(nix::Error::EINTR) => continue,
                Err(e) => {
                    error!("failed to wait for children: {e}");
                    return;
                }
            }
        }
    }

    fn lock_in_use(&self) -> bool {
        !self.parts.listeners.is_empty() && self.total != WORKER_SOLO_COUNT
    }

    fn reaper(&mut self, pid: Pid, clean: bool, cause: String) {
        let Some(idx) = self.slots.iter().position(|s| s.pid == Some(pid)) else {
            debug!("reaped unknown child {pid}");
            return;
        };
        let role = self.slots[idx].role;
        let draining = self.slots[idx].draining;
        info!("worker {} ({pid}) exited ({cause})", role.name());

        self.region.slot(idx).set_running(false);
        self.slots[idx].pid = None;

        if clean || draining {
            self.deregister_channel(idx as u16);
            self.slots[idx].channel = None;
            return;
        }

        let handler = self.region.slot(idx).active_handler();
        let notes = self.region.slot(idx).drain_log();
        if !notes.is_empty() {
            info!("last diagnostics from {}: {notes}", role.name());
        }
        warn!(
            "worker {} (pid: {pid}) (hdlr: {}) gone",
            role.name(),
            handler.as_deref().unwrap_or("none")
        );

        match reap_decision(role, clean, self.cfg.policy) {
            ReapAction::ClearSlot => unreachable!("clean exits return above"),
            ReapAction::Escalate => {
                error!("keymgr or acme process gone, stopping");
                self.deregister_channel(idx as u16);
                self.slots[idx].channel = None;
                self.initiate_shutdown();
            }
            action => {
                // A dead holder must not wedge its peers.
                if self.lock_in_use() && self.region.accept_lock().holder() == pid.as_raw() {
                    if !self.region.accept_lock().release() {
                        warn!("releasing dead holder's lock: lock word was not held");
                    }
                    self.region.slot(idx).set_has_lock(false);
                }

                if let Some(name) = handler {
                    let errors = self.handler_errors.entry(name.clone()).or_insert(0);
                    *errors += 1;
                    info!("handler {name} has caused {errors} error(s)");
                }

                match action {
                    ReapAction::Terminate => {
                        info!("worker policy is 'terminate', stopping");
                        self.deregister_channel(idx as u16);
                        self.slots[idx].channel = None;
                        self.initiate_shutdown();
                    }
                    _ => {
                        info!("restarting worker {}", role.name());
                        self.deregister_channel(idx as u16);
                        self.slots[idx].channel = None;
                        if let Err(e) = self.spawn(idx as u16, true) {
                            error!("respawn of worker {} failed: {e}", role.name());
                            self.initiate_shutdown();
                        }
                    }
                }
            }
        }
    }

    fn initiate_shutdown(&mut self) {
        if self.quitting {
            return;
        }
        self.quitting = true;
        self.dispatch_signal(Signal::SIGTERM);
    }

    /// Broadcasts a signal to every live worker. Delivery failures are
    /// logged and non-fatal.
    pub fn dispatch_signal(&self, sig: Signal) {
        for slot in &self.slots {
            if let Some(pid) = slot.pid {
                if let Err(e) = kill(pid, sig) {
                    warn!("kill({pid}, {sig}): {e}");
                }
            }
        }
    }

    /// The supervisor main loop: reap, route, drive shutdown. Returns once
    /// every child is gone.
    pub fn run(&mut self) -> Result<()> {
        signals::install()?;
        if self.poll.is_none() {
            self.poll = Some(Poll::new()?);
            // Channels of workers spawned before run() picked a poll.
            for idx in 0..self.slots.len() {
                self.register_channel(idx as u16)?;
            }
        }
        if !self.started {
            self.start()?;
        }

        loop {
            if let Some(sig) = signals::pending() {
                match sig {
                    Signal::SIGCHLD => {}
                    Signal::SIGINT | Signal::SIGQUIT | Signal::SIGTERM => {
                        if !self.quitting {
                            info!("shutdown requested");
                            self.initiate_shutdown();
                        }
                    }
                    other => debug!("supervisor ignoring signal {other}"),
                }
                signals::clear();
            }

            self.reap();

            if let Some(poll) = self.poll.as_mut() {
                match poll.poll(&mut self.events, Some(Duration::from_millis(100))) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(StokerError::Io(e)),
                }
            }

            let ready: Vec<usize> = self.events.iter().map(|ev| ev.token().0).collect();
            for idx in ready {
                self.pump_slot(idx);
            }

            if self.quitting && self.slots.iter().all(|s| s.pid.is_none()) {
                break;
            }
        }

        self.shutdown();
        Ok(())
    }

    fn pump_slot(&mut self, idx: usize) {
        let frames = match self.slots.get_mut(idx).and_then(|s| s.channel.as_mut()) {
            Some(channel) => {
                channel.flush();
                channel.drain()
            }
            None => return,
        };
        for frame in frames {
            self.route(idx, frame);
        }
    }

    /// Supervisor-side routing: point-to-point towards the reserved roles
    /// and addressed general workers, fan-out for ALL_WORKERS (skipping
    /// the sender so it cannot reabsorb its own hint).
    fn route(&mut self, from: usize, frame: Frame) {
        match frame.dst {
            ADDR_PARENT => self.handle_parent_msg(from, frame),
            ADDR_ALL => {
                for idx in 0..self.slots.len() {
                    if idx == from {
                        continue;
                    }
                    let slot = &mut self.slots[idx];
                    if !slot.role.is_general() || slot.pid.is_none() {
                        continue;
                    }
                    if let Some(channel) = slot.channel.as_mut() {
                        channel.send_frame(&frame);
                    }
                }
            }
            addr => {
                let target = self
                    .slots
                    .iter_mut()
                    .find(|s| s.role.addr() == addr && s.pid.is_some());
                match target.and_then(|s| s.channel.as_mut()) {
                    Some(channel) => {
                        channel.send_frame(&frame);
                    }
                    None => debug!("dropping control message for absent address {addr}"),
                }
            }
        }
    }

    fn handle_parent_msg(&mut self, from: usize, frame: Frame) {
        match frame.msg_kind() {
            Some(MsgKind::Shutdown) => {
                self.slots[from].draining = true;
                if !self.quitting {
                    info!(
                        "worker {} announced shutdown, stopping",
                        self.slots[from].role.name()
                    );
                    self.initiate_shutdown();
                }
            }
            other => debug!("unhandled parent message {other:?}"),
        }
    }

    /// Blocking drain: waits for every running child. The shared region
    /// goes away with the supervisor.
    pub fn shutdown(&mut self) {
        info!("waiting for workers to drain and shutdown");
        for idx in 0..self.slots.len() {
            let Some(pid) = self.slots[idx].pid else {
                continue;
            };
            loop {
                match waitpid(pid, None) {
                    Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
                    Ok(_) => continue,
                    Err(nix::Error::EINTR) => continue,
                    Err(nix::Error::ECHILD) => break,
                    Err(e) => {
                        warn!("waitpid({pid}): {e}");
                        break;
                    }
                }
            }
            self.slots[idx].pid = None;
            self.region.slot(idx).set_running(false);
            info!("worker {} exited", self.slots[idx].role.name());
        }
    }

    #[cfg(test)]
    fn wire_slot_for_test(&mut self, idx: usize, pid: i32) -> Channel {
        // Fake pids sit far above the kernel's pid_max so a stray kill()
        // can only fail with ESRCH.
        let (sup_side, wrk_side) = Channel::pair().expect("socketpair");
        self.slots[idx].pid = Some(Pid::from_raw(0x7000_0000 + pid));
        self.slots[idx].channel = Some(sup_side);
        wrk_side
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RoleRunner;

    fn test_supervisor(generals: u16) -> Supervisor {
        let cfg = Config {
            worker_count: generals,
            ..Config::default()
        };
        Supervisor::new(cfg, ServerParts::default()).expect("supervisor")
    }

    #[test]
    fn slot_layout_reserves_roles_and_numbers_generals() {
        let sup = test_supervisor(3);
        assert_eq!(sup.worker_count(), 5);
        assert_eq!(sup.slots[KEYMGR_IDX as usize].role, WorkerRole::KeyMgr);
        assert_eq!(sup.slots[ACME_IDX as usize].role, WorkerRole::Acme);
        assert_eq!(sup.slots[2].role, WorkerRole::General(1));
        assert_eq!(sup.slots[3].role, WorkerRole::General(2));
        assert_eq!(sup.slots[4].role, WorkerRole::General(3));
        assert_eq!(sup.region().slot_count(), 5);
    }

    #[test]
    fn keymgr_activation_follows_the_role_runners() {
        let sup = test_supervisor(1);
        assert!(!sup.keymgr_active);

        let runner: RoleRunner = Box::new(|_channel| {});
        let parts = ServerParts {
            roles: RoleRunners {
                keymgr: Some(runner),
                acme: None,
            },
            ..ServerParts::default()
        };
        let sup = Supervisor::new(Config::default(), parts).expect("supervisor");
        assert!(sup.keymgr_active);
        assert!(!sup.acme_configured);
    }

    #[test]
    fn reap_decisions_follow_role_and_policy() {
        // Clean exits clear the slot whatever the role.
        assert_eq!(
            reap_decision(WorkerRole::General(1), true, WorkerPolicy::Restart),
            ReapAction::ClearSlot
        );
        assert_eq!(
            reap_decision(WorkerRole::KeyMgr, true, WorkerPolicy::Restart),
            ReapAction::ClearSlot
        );

        // Reserved-role loss escalates regardless of policy.
        assert_eq!(
            reap_decision(WorkerRole::KeyMgr, false, WorkerPolicy::Restart),
            ReapAction::Escalate
        );
        assert_eq!(
            reap_decision(WorkerRole::Acme, false, WorkerPolicy::Terminate),
            ReapAction::Escalate
        );

        // General crashes follow the configured policy.
        assert_eq!(
            reap_decision(WorkerRole::General(2), false, WorkerPolicy::Restart),
            ReapAction::Restart
        );
        assert_eq!(
            reap_decision(WorkerRole::General(2), false, WorkerPolicy::Terminate),
            ReapAction::Terminate
        );
    }

    #[test]
    fn broadcast_fans_out_to_generals_except_the_sender() {
        let mut sup = test_supervisor(3);
        let mut wrk_a = sup.wire_slot_for_test(2, 1001);
        let mut wrk_b = sup.wire_slot_for_test(3, 1002);
        let mut wrk_c = sup.wire_slot_for_test(4, 1003);
        let mut keymgr = sup.wire_slot_for_test(KEYMGR_IDX as usize, 1000);

        let frame = Frame {
            kind: MsgKind::AcceptAvailable as u8,
            src: 1,
            dst: ADDR_ALL,
            payload: bytes::Bytes::new(),
        };
        sup.route(2, frame);

        assert!(wrk_a.drain().is_empty(), "sender must not hear its own hint");
        assert_eq!(wrk_b.drain().len(), 1);
        assert_eq!(wrk_c.drain().len(), 1);
        assert!(keymgr.drain().is_empty(), "broadcast is generals-only");
    }

    #[test]
    fn addressed_delivery_reaches_the_reserved_roles() {
        let mut sup = test_supervisor(2);
        let mut keymgr = sup.wire_slot_for_test(KEYMGR_IDX as usize, 1000);
        let _wrk = sup.wire_slot_for_test(2, 1001);

        let frame = Frame {
            kind: MsgKind::EntropyReq as u8,
            src: 1,
            dst: crate::msg::ADDR_KEYMGR,
            payload: bytes::Bytes::new(),
        };
        sup.route(2, frame);

        let got = keymgr.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].msg_kind(), Some(MsgKind::EntropyReq));
        assert_eq!(got[0].src, 1);
    }

    #[test]
    fn keymgr_responses_route_back_to_the_requesting_worker() {
        let mut sup = test_supervisor(2);
        let _keymgr = sup.wire_slot_for_test(KEYMGR_IDX as usize, 1000);
        let mut wrk_a = sup.wire_slot_for_test(2, 1001);
        let mut wrk_b = sup.wire_slot_for_test(3, 1002);

        let frame = Frame {
            kind: MsgKind::EntropyResp as u8,
            src: crate::msg::ADDR_KEYMGR,
            dst: 1,
            payload: bytes::Bytes::from(vec![0u8; 16]),
        };
        sup.route(KEYMGR_IDX as usize, frame);

        assert_eq!(wrk_a.drain().len(), 1);
        assert!(wrk_b.drain().is_empty());
    }

    #[test]
    fn unroutable_addresses_are_dropped() {
        let mut sup = test_supervisor(1);
        let frame = Frame {
            kind: MsgKind::Certificate as u8,
            src: 1,
            dst: 42,
            payload: bytes::Bytes::new(),
        };
        // No slot with that address: logged and dropped, no panic.
        sup.route(2, frame);
    }

    #[test]
    fn worker_shutdown_message_initiates_global_shutdown() {
        let mut sup = test_supervisor(2);
        let _wrk = sup.wire_slot_for_test(2, 1001);

        assert!(!sup.quitting);
        let frame = Frame {
            kind: MsgKind::Shutdown as u8,
            src: 1,
            dst: ADDR_PARENT,
            payload: bytes::Bytes::new(),
        };
        sup.route(2, frame);
        assert!(sup.quitting);
        assert!(sup.slots[2].draining);
    }
}
