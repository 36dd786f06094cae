//! Monitor backends and the launch path they share.
//!
//! Both monitors follow the same setup: obtain the sandboxee from the fork
//! server, run the start-up hook, ship the IPC endpoints, the working
//! directory and the compiled policy, then wait for the sandboxee's ready
//! message and apply resource limits. They differ only in the event loop
//! that follows.

pub mod ptrace;
pub mod unotify;

use crate::client::CLIENT_READY;
use crate::comms::Comms;
use crate::error::{InternalFailure, SetupFailure};
use crate::executor::Executor;
use crate::fork_client::SandboxeeProcess;
use crate::notify::Notify;
use crate::policy::Policy;
use crate::result::{ExecutionResult, FinalStatus, Reason, ResourceUsage};
use crate::util::Notification;
use crate::{Result, WardenError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Waits briefly for a task to enter a stop, leaving it waitable for the
/// regular event loop (`WNOWAIT`).
pub(crate) fn wait_for_task_stop(pid: nix::unistd::Pid, timeout: std::time::Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        // SAFETY: zeroed siginfo is valid out-param storage.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: out-pointer references live storage; WNOWAIT leaves the
        // task waitable.
        let ret = unsafe {
            libc::waitid(
                libc::P_PID,
                pid.as_raw() as libc::id_t,
                std::ptr::from_mut(&mut info),
                libc::WSTOPPED | libc::WNOWAIT | libc::WNOHANG,
            )
        };
        // SAFETY: si_pid is valid for child-state siginfo records.
        if ret == 0 && unsafe { info.si_pid() } == pid.as_raw() {
            return true;
        }
        if ret == -1 || std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}

/// Which monitoring backend supervises a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorKind {
    /// `PTRACE_SEIZE` + `PTRACE_O_TRACESECCOMP` event loop.
    Ptrace,
    /// seccomp user-notification event loop; never ptrace-attaches.
    Unotify,
}

/// State shared between a monitor's event-loop thread and the façade.
pub(crate) struct MonitorCore {
    pub kind: MonitorKind,
    pub executor: Mutex<Executor>,
    pub policy: Policy,
    pub notify: Mutex<Box<dyn Notify>>,
    pub comms: Arc<Comms>,
    pub result: Mutex<ExecutionResult>,
    pub process: Mutex<Option<SandboxeeProcess>>,
    pub setup_ok: AtomicBool,
    pub setup_notification: Notification,
    pub done_notification: Notification,
    /// True until the initial execveat transition is observed.
    pub wait_for_execveat: AtomicBool,
    /// Wall-time deadline in [`crate::util::now_millis`] time; 0 disarms.
    pub wall_deadline_ms: AtomicU64,
    pub external_kill_request: AtomicBool,
    pub dump_stack_request: AtomicBool,
    /// Set for the nested unwind sandbox, where stack traces must never
    /// recurse.
    pub is_unwind_sandbox: bool,
    /// Grace period between a kill request and giving up on a clean reap.
    pub graceful_kill_timeout: std::time::Duration,
}

impl MonitorCore {
    pub(crate) fn new(
        executor: Executor,
        policy: Policy,
        notify: Box<dyn Notify>,
        kind: MonitorKind,
    ) -> Self {
        let comms = executor.comms();
        let wall_limit = executor.limits().get_wall_time_limit();
        let wall_deadline_ms = if wall_limit.is_zero() {
            0
        } else {
            crate::util::deadline_after(wall_limit)
        };
        let is_unwind_sandbox = executor.is_unwind_executor();
        Self {
            kind,
            executor: Mutex::new(executor),
            policy,
            notify: Mutex::new(notify),
            comms,
            result: Mutex::new(ExecutionResult::new()),
            process: Mutex::new(None),
            setup_ok: AtomicBool::new(false),
            setup_notification: Notification::new(),
            done_notification: Notification::new(),
            // The unwind helper never execs; there is no transition to wait
            // for.
            wait_for_execveat: AtomicBool::new(!is_unwind_sandbox),
            wall_deadline_ms: AtomicU64::new(wall_deadline_ms),
            external_kill_request: AtomicBool::new(false),
            dump_stack_request: AtomicBool::new(false),
            is_unwind_sandbox,
            graceful_kill_timeout: std::time::Duration::from_secs(1),
        }
    }

    /// Records the terminal status; the first write wins.
    pub(crate) fn set_exit_status(&self, status: FinalStatus, reason: Reason) {
        self.result.lock().set_exit_status(status, reason);
    }

    pub(crate) fn final_status(&self) -> FinalStatus {
        self.result.lock().final_status()
    }

    pub(crate) fn setup_failed(&self, failure: SetupFailure) {
        self.set_exit_status(FinalStatus::SetupError, Reason::Setup(failure));
    }

    pub(crate) fn internal_error(&self, failure: InternalFailure) {
        self.set_exit_status(FinalStatus::InternalError, Reason::Internal(failure));
    }

    /// Spawns the sandboxee and performs the shared half of the handshake:
    /// start-up hook, IPC descriptors, cwd, policy. The monitor-specific
    /// half (ready message, limits, attach) follows in the caller.
    pub(crate) fn launch_common(&self) -> Result<()> {
        let process = {
            let mut executor = self.executor.lock();
            match executor.start_sub_process(self.kind, &self.policy) {
                Ok(process) => process,
                Err(e) => {
                    tracing::error!(error = %e, "starting sandboxee failed");
                    let failure = match e {
                        WardenError::Setup(failure) => failure,
                        _ => SetupFailure::Subprocess,
                    };
                    self.setup_failed(failure);
                    return Err(e);
                }
            }
        };
        let main_pid = process.main_pid;
        *self.process.lock() = Some(process);

        if !self.notify.lock().event_started(main_pid, &self.comms) {
            self.setup_failed(SetupFailure::Notify);
            return Err(WardenError::Setup(SetupFailure::Notify));
        }
        let send_ipc = { self.executor.lock().take_ipc().send_fds_over_comms(&self.comms) };
        if let Err(e) = send_ipc {
            tracing::error!(error = %e, "sending IPC descriptors failed");
            self.setup_failed(SetupFailure::Ipc);
            return Err(e);
        }
        let cwd = self.executor.lock().cwd().clone();
        if let Err(e) = self.comms.send_string(&cwd) {
            tracing::error!(error = %e, "sending cwd failed");
            self.setup_failed(SetupFailure::Cwd);
            return Err(e);
        }
        if let Err(e) = self.policy.send(&self.comms, self.kind) {
            tracing::error!(error = %e, "sending policy failed");
            self.setup_failed(SetupFailure::Policy);
            return Err(e);
        }
        Ok(())
    }

    /// Waits for the sandboxee's ready message.
    pub(crate) fn wait_for_ready(&self) -> Result<()> {
        match self.comms.recv_u32() {
            Ok(CLIENT_READY) => Ok(()),
            Ok(other) => {
                tracing::error!(got = other, "unexpected readiness message");
                self.setup_failed(SetupFailure::Wait);
                Err(WardenError::Setup(SetupFailure::Wait))
            }
            Err(e) => {
                tracing::error!(error = %e, "waiting for sandboxee readiness failed");
                self.setup_failed(SetupFailure::Wait);
                Err(e)
            }
        }
    }

    /// Applies the executor's rlimits to the sandboxee.
    pub(crate) fn apply_limits(&self) -> Result<()> {
        let main_pid = self.main_pid();
        let limits = self.executor.lock().limits().clone();
        if let Err(e) = limits.apply(main_pid) {
            tracing::error!(error = %e, "applying limits failed");
            self.setup_failed(SetupFailure::Limits);
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn main_pid(&self) -> nix::unistd::Pid {
        self.process
            .lock()
            .as_ref()
            .map_or(nix::unistd::Pid::from_raw(-1), |p| p.main_pid)
    }

    pub(crate) fn init_pid(&self) -> Option<nix::unistd::Pid> {
        self.process.lock().as_ref().and_then(|p| p.init_pid)
    }

    /// Kills whatever the run produced; used when setup fails.
    pub(crate) fn kill_remains(&self) {
        let process = self.process.lock();
        if let Some(process) = process.as_ref() {
            let target = process.init_pid.unwrap_or(process.main_pid);
            let _ = nix::sys::signal::kill(target, nix::sys::signal::Signal::SIGKILL);
        }
    }

    /// Final bookkeeping: monitor rusage, the finished hook, and waking
    /// everyone blocked on the result.
    pub(crate) fn on_done(&self) {
        if self.done_notification.has_been_notified() {
            return;
        }
        // SAFETY: zeroed rusage is valid out-param storage.
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
        // SAFETY: out-pointer to live storage.
        if unsafe { libc::getrusage(libc::RUSAGE_THREAD, std::ptr::from_mut(&mut rusage)) } == 0 {
            self.result
                .lock()
                .set_rusage_monitor(ResourceUsage::from(&rusage));
        }
        {
            let result = self.result.lock();
            self.notify.lock().event_finished(&result);
        }
        self.done_notification.notify();
    }

    /// Whether this run may launch the nested unwind sandbox.
    pub(crate) fn stack_trace_collection_possible(&self) -> bool {
        if self.is_unwind_sandbox {
            return false;
        }
        self.policy.namespaces().is_some()
    }

    pub(crate) fn should_collect_stack_trace(&self, status: FinalStatus) -> bool {
        let flags = self.policy.stack_traces();
        match status {
            FinalStatus::Violation => flags.on_violation,
            FinalStatus::Signaled => flags.on_signal,
            FinalStatus::Timeout => flags.on_timeout,
            FinalStatus::ExternalKill => flags.on_kill,
            FinalStatus::Ok => flags.on_exit,
            _ => false,
        }
    }
}
