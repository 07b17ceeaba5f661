//! The per-worker process: one synchronous event loop interleaving I/O
//! readiness, timer expiry, cooperative task progress, control messages
//! and signal-driven lifecycle transitions, coupled to the shared accept
//! lock before and after every demultiplexer wait.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::config::Config;
use crate::conn::ConnectionTable;
use crate::error::Result;
use crate::event::{Demux, Listener, TOKEN_CHANNEL};
use crate::keymgr::{self, ENTROPY_LEN, KeymgrState};
use crate::msg::{ADDR_ACME, ADDR_ALL, ADDR_KEYMGR, ADDR_PARENT, Channel, Frame, MsgKind, MsgRegistry};
use crate::privsep;
use crate::runtime::{HttpEngine, NoHttp, NoTasks, RuntimeHooks, TaskScheduler};
use crate::shm::{SharedRegion, SharedSlot};
use crate::signals;
use crate::timer::{TimerList, now_ms};
use crate::{RESEED_INTERVAL_MS, WORKER_SOLO_COUNT, platform};

/// Deadline shortenings applied when no timer bounds the wait.
const WAIT_SIGNAL_MS: u64 = 10;
const WAIT_TASK_MS: u64 = 10;
const WAIT_HTTP_MS: u64 = 100;

/// How often the connection inactivity sweep may run.
const CONN_SWEEP_EVERY_MS: u64 = 500;

/// Logical identity of a process in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    /// Holds private keys, answers certificate and entropy requests.
    KeyMgr,
    /// Performs ACME certificate acquisition.
    Acme,
    /// Serves connections; the id is 1..K.
    General(u16),
}

impl WorkerRole {
    /// Wire address of this role in control-frame headers.
    pub fn addr(&self) -> u16 {
        match self {
            WorkerRole::KeyMgr => ADDR_KEYMGR,
            WorkerRole::Acme => ADDR_ACME,
            WorkerRole::General(id) => *id,
        }
    }

    pub fn name(&self) -> String {
        match self {
            WorkerRole::KeyMgr => "keymgr".to_string(),
            WorkerRole::Acme => "acme".to_string(),
            WorkerRole::General(id) => format!("wrk {id}"),
        }
    }

    pub fn is_general(&self) -> bool {
        matches!(self, WorkerRole::General(_))
    }
}

/// The engine seams a general worker drives; everything here crosses the
/// fork by memory inheritance.
pub struct WorkerParts {
    pub domains: keymgr::DomainTable,
    pub http: Box<dyn HttpEngine>,
    pub tasks: Box<dyn TaskScheduler>,
    pub hooks: RuntimeHooks,
}

impl Default for WorkerParts {
    fn default() -> Self {
        Self {
            domains: keymgr::DomainTable::new(),
            http: Box::new(NoHttp),
            tasks: Box::new(NoTasks),
            hooks: RuntimeHooks::default(),
        }
    }
}

/// Upper bound for one demultiplexer wait. A scheduled timer always wins;
/// with none, pending work shortens an otherwise unbounded sleep and the
/// smallest applicable bound is used.
fn wait_timeout(
    next_timer_ms: Option<u64>,
    signal_pending: bool,
    http_in_flight: bool,
    tasks_pending: bool,
) -> Option<Duration> {
    if let Some(ms) = next_timer_ms {
        return Some(Duration::from_millis(ms));
    }
    let mut bound: Option<u64> = None;
    let mut shorten = |ms: u64| {
        bound = Some(bound.map_or(ms, |cur| cur.min(ms)));
    };
    if signal_pending {
        shorten(WAIT_SIGNAL_MS);
    }
    if tasks_pending {
        shorten(WAIT_TASK_MS);
    }
    if http_in_flight {
        shorten(WAIT_HTTP_MS);
    }
    bound.map(Duration::from_millis)
}

/// Either load gate tripping forces the holder to release.
fn overloaded(active: u32, max_connections: u32, in_flight: u32, request_limit: u32) -> bool {
    active >= max_connections || in_flight >= request_limit
}

/// A general worker process. Every per-process subsystem is owned here and
/// passed into the helpers explicitly; there is exactly one of these per
/// process.
pub struct Worker {
    pub cfg: Config,
    pub role: WorkerRole,
    pub idx: u16,
    pub cpu: u16,
    pub pid: Pid,
    total_workers: u16,
    region: Arc<SharedRegion>,
    channel: Channel,
    demux: Demux,
    listeners: Vec<Listener>,
    conns: ConnectionTable,
    timers: TimerList,
    http: Box<dyn HttpEngine>,
    tasks: Box<dyn TaskScheduler>,
    hooks: RuntimeHooks,
    keymgr_active: bool,
    pub keymgr: KeymgrState,
    registry: MsgRegistry<Worker>,
    has_lock: bool,
    had_lock: bool,
    accept_avail: bool,
    notify_pending: bool,
    no_lock: bool,
    quit: bool,
    next_conn_sweep: u64,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        role: WorkerRole,
        idx: u16,
        cpu: u16,
        total_workers: u16,
        region: Arc<SharedRegion>,
        channel: Channel,
        listeners: Vec<Listener>,
        parts: WorkerParts,
        keymgr_active: bool,
    ) -> Result<Self> {
        let idle_timeout = cfg.idle_timeout_ms;
        Ok(Self {
            cfg,
            role,
            idx,
            cpu,
            pid: nix::unistd::getpid(),
            total_workers,
            region,
            channel,
            demux: Demux::new()?,
            listeners,
            conns: ConnectionTable::new(idle_timeout),
            timers: TimerList::new(),
            http: parts.http,
            tasks: parts.tasks,
            hooks: parts.hooks,
            keymgr_active,
            keymgr: KeymgrState::new(parts.domains),
            registry: MsgRegistry::new(),
            has_lock: false,
            had_lock: false,
            accept_avail: true,
            notify_pending: false,
            no_lock: false,
            quit: false,
            next_conn_sweep: 0,
        })
    }

    /// The whole life of a general worker: prelude, loop, teardown.
    pub fn run(&mut self) -> Result<()> {
        self.prelude()?;
        self.main_loop();
        self.teardown();
        Ok(())
    }

    fn prelude(&mut self) -> Result<()> {
        platform::set_proctitle(&self.role.name());
        if self.cfg.set_affinity {
            platform::set_affinity(self.cpu);
        }
        signals::install()?;

        privsep::drop_privileges(&self.cfg, &mut self.hooks.sandbox)?;

        if self.keymgr_active {
            self.registry.register(MsgKind::Crl, handle_keymgr_response);
            self.registry.register(MsgKind::EntropyResp, handle_entropy_response);
            self.registry.register(MsgKind::Certificate, handle_keymgr_response);
            self.registry
                .register(MsgKind::AcmeChallengeSetCert, handle_keymgr_response);
            self.registry
                .register(MsgKind::AcmeChallengeClearCert, handle_keymgr_response);

            if self.slot().restarted() {
                self.send(MsgKind::CertificateReq, ADDR_KEYMGR, &[]);
            }
        }
        self.registry.register(MsgKind::AcceptAvailable, handle_accept_available);

        if self.listeners.is_empty() {
            self.no_lock = true;
        }

        self.demux.register_channel(self.channel.stream_mut())?;

        info!(
            "worker {} started (cpu#{}, pid#{})",
            self.role.name(),
            self.cpu,
            self.pid
        );
        debug!(
            "accept threshold {} (reserved), lock {}",
            self.cfg.accept_threshold,
            if self.lock_bypassed() { "bypassed" } else { "active" },
        );

        RuntimeHooks::run(&mut self.hooks.configure, "configure");
        RuntimeHooks::run(&mut self.hooks.onload, "onload");
        self.slot().set_restarted(false);
        Ok(())
    }

    fn main_loop(&mut self) {
        loop {
            let mut now = now_ms();

            if self.keymgr_active
                && now.saturating_sub(self.keymgr.last_entropy_request) > RESEED_INTERVAL_MS
            {
                self.send(MsgKind::EntropyReq, ADDR_KEYMGR, &[]);
                self.keymgr.last_entropy_request = now;
            }

            if !self.has_lock && self.accept_avail && self.acceptlock_obtain() {
                self.accept_avail = false;
                if !self.had_lock {
                    self.had_lock = true;
                    self.enable_accept();
                }
            }

            // A deferred peer notification is retried until it fits.
            if self.notify_pending {
                self.broadcast_accept_available();
            }
            self.channel.flush();

            let timeout = wait_timeout(
                self.timers.next_run(now),
                signals::pending().is_some(),
                self.http.in_flight() > 0,
                self.tasks.pending(),
            );
            if let Err(e) = self.demux.wait(timeout) {
                warn!("event wait: {e}");
            }
            now = now_ms();

            self.service_events(now);

            if self.has_lock {
                self.acceptlock_release();
            }
            if !self.has_lock && self.had_lock {
                self.had_lock = false;
                self.disable_accept();
            }

            if let Some(sig) = signals::pending() {
                match sig {
                    Signal::SIGHUP => {
                        info!("reload requested");
                        RuntimeHooks::run(&mut self.hooks.reload, "reload");
                    }
                    Signal::SIGINT | Signal::SIGQUIT | Signal::SIGTERM => self.quit = true,
                    Signal::SIGCHLD => self.tasks.reap_children(),
                    other => debug!("ignoring signal {other}"),
                }
                signals::clear();
            }

            if self.quit {
                break;
            }

            self.timers.run(now);
            self.http.run_scheduled(now);
            self.http.process(now);
            self.tasks.run(now);

            if self.next_conn_sweep <= now {
                self.conns.check_timeouts(now);
                self.next_conn_sweep = now + CONN_SWEEP_EVERY_MS;
            }
            self.conns.prune(&mut self.demux);
        }
    }

    fn service_events(&mut self, now: u64) {
        let mut channel_ready = false;
        let mut ready_listeners = Vec::new();
        let mut ready_conns = Vec::new();
        for event in self.demux.events() {
            let token = event.token();
            if token == TOKEN_CHANNEL {
                channel_ready = true;
            } else if Demux::is_listener_token(token) {
                ready_listeners.push(token);
            } else {
                ready_conns.push((token, event.is_read_closed() || event.is_write_closed()));
            }
        }

        if channel_ready {
            self.channel.flush();
            let frames = self.channel.drain();
            let registry = std::mem::take(&mut self.registry);
            for frame in &frames {
                registry.dispatch(self, frame);
            }
            self.registry = registry;
        }

        if self.has_lock {
            for token in ready_listeners {
                let Some(pos) = self.listeners.iter().position(|l| l.token == token) else {
                    continue;
                };
                self.conns
                    .accept_from(&mut self.listeners[pos], &mut self.demux, now);
            }
        }

        for (token, closed) in ready_conns {
            if closed {
                self.conns.mark_disconnected(token);
            } else {
                self.conns.touch(token, now);
            }
        }
    }

    fn lock_bypassed(&self) -> bool {
        self.total_workers == WORKER_SOLO_COUNT || self.no_lock
    }

    /// Mirrors the shared lock into `has_lock`. Solo pools and
    /// listener-less workers skip the shared word entirely.
    fn acceptlock_obtain(&mut self) -> bool {
        if self.has_lock {
            return true;
        }
        if self.lock_bypassed() {
            self.set_has_lock(true);
            return true;
        }
        if self.conns.active() >= self.cfg.max_connections {
            return false;
        }
        if self.http.in_flight() >= self.cfg.http_request_limit {
            return false;
        }
        if self.region.accept_lock().try_acquire(self.pid.as_raw()) {
            self.set_has_lock(true);
            debug!("worker {} acquired the accept lock", self.role.name());
            return true;
        }
        false
    }

    /// Runs after each demultiplexer wait, at most once per iteration.
    /// Lets go of the lock when either load gate trips so less-loaded
    /// peers can take over.
    fn acceptlock_release(&mut self) {
        if self.lock_bypassed() || !self.has_lock {
            return;
        }
        if !overloaded(
            self.conns.active(),
            self.cfg.max_connections,
            self.http.in_flight(),
            self.cfg.http_request_limit,
        ) {
            return;
        }
        debug!("worker {} busy, releasing the accept lock", self.role.name());
        self.unlock_and_notify();
    }

    /// Voluntary busy signal for long-running handlers: give up the accept
    /// lock immediately so peers can contend.
    pub fn make_busy(&mut self) {
        if self.lock_bypassed() {
            return;
        }
        if self.has_lock {
            self.unlock_and_notify();
        }
    }

    fn unlock_and_notify(&mut self) {
        if !self.region.accept_lock().release() {
            warn!("accept lock release: lock word was not held");
        }
        self.set_has_lock(false);
        self.notify_pending = true;
        self.broadcast_accept_available();
    }

    fn broadcast_accept_available(&mut self) {
        if self
            .channel
            .send(MsgKind::AcceptAvailable, self.role.addr(), ADDR_ALL, &[])
        {
            self.notify_pending = false;
        }
    }

    fn enable_accept(&mut self) {
        if let Err(e) = self.demux.arm_accept(&mut self.listeners) {
            warn!("failed to arm listeners: {e}");
        }
    }

    fn disable_accept(&mut self) {
        if let Err(e) = self.demux.disarm_accept(&mut self.listeners) {
            warn!("failed to disarm listeners: {e}");
        }
    }

    fn set_has_lock(&mut self, on: bool) {
        self.has_lock = on;
        self.slot().set_has_lock(on);
    }

    fn slot(&self) -> &SharedSlot {
        self.region.slot(self.idx as usize)
    }

    fn send(&mut self, kind: MsgKind, dst: u16, payload: &[u8]) -> bool {
        let src = self.role.addr();
        self.channel.send(kind, src, dst, payload)
    }

    /// Publishes the handler about to execute, for crash attribution.
    pub fn set_active_handler(&self, name: Option<&str>) {
        self.slot().set_active_handler(name);
    }

    /// Appends a line to the slot's diagnostic buffer the supervisor
    /// drains on abnormal exit.
    pub fn log_note(&self, line: &str) {
        self.slot().log_note(line);
    }

    fn teardown(&mut self) {
        RuntimeHooks::run(&mut self.hooks.teardown, "teardown");

        // Do not take the lock to the grave.
        self.make_busy();

        self.send(MsgKind::Shutdown, ADDR_PARENT, &[]);
        self.channel.flush();

        // Reverse order of initialization.
        if self.had_lock {
            self.disable_accept();
            self.had_lock = false;
        }
        self.conns.clear(&mut self.demux);
        self.http.teardown();
        self.tasks.teardown();
        self.timers.clear();
        self.keymgr.domains.clear();

        info!("worker {} shutting down", self.role.name());
    }
}

fn handle_accept_available(worker: &mut Worker, _frame: &Frame) {
    worker.accept_avail = true;
}

fn handle_entropy_response(worker: &mut Worker, frame: &Frame) {
    if frame.payload.len() != ENTROPY_LEN {
        warn!(
            "invalid entropy response (got:{} - wanted:{ENTROPY_LEN})",
            frame.payload.len()
        );
        return;
    }
    worker.keymgr.entropy.reseed(&frame.payload);
}

fn handle_keymgr_response(worker: &mut Worker, frame: &Frame) {
    let Some(kind) = frame.msg_kind() else {
        return;
    };
    keymgr::install_response(&mut worker.keymgr.domains, kind, &frame.payload);
}
