//! The user-facing façade: bundles an executor, a policy and a notify hook
//! into one supervised run.

use crate::executor::Executor;
use crate::monitor::ptrace::PtraceMonitor;
use crate::monitor::unotify::UnotifyMonitor;
use crate::monitor::{MonitorCore, MonitorKind};
use crate::notify::{DefaultNotify, Notify};
use crate::policy::Policy;
use crate::result::ExecutionResult;
use crate::{Result, WardenError};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

enum AnyMonitor {
    Ptrace(Arc<PtraceMonitor>),
    Unotify(Arc<UnotifyMonitor>),
}

impl AnyMonitor {
    fn core(&self) -> &MonitorCore {
        match self {
            Self::Ptrace(monitor) => &monitor.core,
            Self::Unotify(monitor) => &monitor.core,
        }
    }

    fn kill(&self) {
        match self {
            Self::Ptrace(monitor) => monitor.kill(),
            Self::Unotify(monitor) => monitor.kill(),
        }
    }

    fn dump_stack_trace(&self) {
        match self {
            Self::Ptrace(monitor) => monitor.dump_stack_trace(),
            Self::Unotify(monitor) => monitor.dump_stack_trace(),
        }
    }

    fn set_wall_time_limit(&self, limit: Duration) {
        match self {
            Self::Ptrace(monitor) => monitor.set_wall_time_limit(limit),
            Self::Unotify(monitor) => monitor.set_wall_time_limit(limit),
        }
    }
}

struct Pending {
    executor: Executor,
    policy: Policy,
    notify: Box<dyn Notify>,
    custom_notify: bool,
    graceful_kill_timeout: Option<Duration>,
}

/// One sandboxed run of one binary.
///
/// ```no_run
/// use warden_core::{Executor, PolicyBuilder, Sandbox};
///
/// let executor = Executor::new("/bin/true", &["true"])?;
/// let policy = PolicyBuilder::new()
///     .allow_static_startup()
///     .allow_exit()
///     .try_build()?;
/// let mut sandbox = Sandbox::new(executor, policy);
/// let result = sandbox.run();
/// println!("{result}");
/// # Ok::<(), warden_core::WardenError>(())
/// ```
pub struct Sandbox {
    pending: Option<Pending>,
    monitor: Option<AnyMonitor>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    kind: MonitorKind,
    comms: Arc<crate::comms::Comms>,
}

impl Sandbox {
    /// Pairs an executor with a policy under the default (ptrace) monitor.
    #[must_use]
    pub fn new(executor: Executor, policy: Policy) -> Self {
        Self::build(executor, policy, Box::new(DefaultNotify), false)
    }

    /// Like [`Sandbox::new`] with a custom event hook.
    #[must_use]
    pub fn with_notify(executor: Executor, policy: Policy, notify: Box<dyn Notify>) -> Self {
        Self::build(executor, policy, notify, true)
    }

    fn build(
        executor: Executor,
        policy: Policy,
        notify: Box<dyn Notify>,
        custom_notify: bool,
    ) -> Self {
        let comms = executor.comms();
        Self {
            pending: Some(Pending {
                executor,
                policy,
                notify,
                custom_notify,
                graceful_kill_timeout: None,
            }),
            monitor: None,
            thread: Mutex::new(None),
            kind: MonitorKind::Ptrace,
            comms,
        }
    }

    /// Overrides the grace period between a kill request and the monitor
    /// falling back to forced reaping. Must be called before the run starts.
    pub fn set_graceful_kill_timeout(&mut self, timeout: Duration) {
        if let Some(pending) = self.pending.as_mut() {
            pending.graceful_kill_timeout = Some(timeout);
        }
    }

    /// Switches to the user-notification monitor. Requires namespaces and
    /// rejects configurations only the ptrace backend can serve.
    pub fn enable_unotify_monitor(&mut self) -> Result<()> {
        let pending = self
            .pending
            .as_ref()
            .ok_or_else(|| WardenError::Policy("sandbox already running".into()))?;
        if pending.policy.namespaces().is_none() {
            return Err(WardenError::Policy(
                "the unotify monitor requires namespaces".into(),
            ));
        }
        let flags = pending.policy.stack_traces();
        if flags.on_signal || flags.on_exit {
            return Err(WardenError::Policy(
                "stack traces on signal/exit are not supported by the unotify monitor".into(),
            ));
        }
        if pending.custom_notify {
            return Err(WardenError::Policy(
                "custom notify hooks are not supported by the unotify monitor".into(),
            ));
        }
        self.kind = MonitorKind::Unotify;
        Ok(())
    }

    /// Runs to completion.
    pub fn run(&mut self) -> ExecutionResult {
        self.run_async();
        self.await_result()
    }

    /// Starts the monitor thread and waits for sandboxee setup. Returns
    /// false when setup failed; the reason is in the eventual result.
    pub fn run_async(&mut self) -> bool {
        let Some(pending) = self.pending.take() else {
            return self
                .monitor
                .as_ref()
                .is_some_and(|m| m.core().setup_ok.load(Ordering::Acquire));
        };
        let mut core =
            MonitorCore::new(pending.executor, pending.policy, pending.notify, self.kind);
        if let Some(timeout) = pending.graceful_kill_timeout {
            core.graceful_kill_timeout = timeout;
        }
        let (monitor, handle) = match self.kind {
            MonitorKind::Ptrace => {
                let monitor = PtraceMonitor::new(core);
                let runner = Arc::clone(&monitor);
                let handle = std::thread::Builder::new()
                    .name("warden-monitor".into())
                    .spawn(move || runner.run())
                    .expect("spawning monitor thread");
                (AnyMonitor::Ptrace(monitor), handle)
            }
            MonitorKind::Unotify => {
                let monitor = UnotifyMonitor::new(core);
                let runner = Arc::clone(&monitor);
                let handle = std::thread::Builder::new()
                    .name("warden-monitor".into())
                    .spawn(move || runner.run())
                    .expect("spawning monitor thread");
                (AnyMonitor::Unotify(monitor), handle)
            }
        };
        *self.thread.lock() = Some(handle);
        self.monitor = Some(monitor);
        let monitor = self.monitor.as_ref().expect("just set");
        monitor.core().setup_notification.wait();
        monitor.core().setup_ok.load(Ordering::Acquire)
    }

    /// Blocks until the run is over and hands out the result.
    pub fn await_result(&mut self) -> ExecutionResult {
        let Some(monitor) = self.monitor.as_ref() else {
            // Never started.
            return ExecutionResult::new();
        };
        monitor.core().done_notification.wait();
        self.join_thread();
        std::mem::take(&mut *monitor.core().result.lock())
    }

    /// Like [`Sandbox::await_result`], failing if the run is not over
    /// within `timeout`.
    pub fn await_result_with_timeout(&mut self, timeout: Duration) -> Result<ExecutionResult> {
        let Some(monitor) = self.monitor.as_ref() else {
            return Err(WardenError::Policy("sandbox was never started".into()));
        };
        if !monitor.core().done_notification.wait_timeout(timeout) {
            return Err(WardenError::ResultTimeout);
        }
        self.join_thread();
        Ok(std::mem::take(&mut *monitor.core().result.lock()))
    }

    fn join_thread(&self) {
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Requests termination; idempotent and non-blocking.
    pub fn kill(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.kill();
        } else {
            tracing::warn!("kill() before the sandbox was started");
        }
    }

    /// Asks the monitor to log the sandboxee's current stack.
    pub fn dump_stack_trace(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.dump_stack_trace();
        }
    }

    /// Re-arms (or, with zero, disarms) the wall-time limit.
    pub fn set_walltime_limit(&self, limit: Duration) {
        if let Some(monitor) = &self.monitor {
            monitor.set_wall_time_limit(limit);
        }
    }

    /// True once the final result is available.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.monitor
            .as_ref()
            .is_some_and(|m| m.core().done_notification.has_been_notified())
    }

    /// PID of the sandboxee, once running.
    #[must_use]
    pub fn pid(&self) -> Option<Pid> {
        self.monitor.as_ref().and_then(|m| {
            let pid = m.core().main_pid();
            (pid.as_raw() > 0).then_some(pid)
        })
    }

    /// The supervisor end of the sandboxee channel, for application RPC
    /// once setup completed.
    #[must_use]
    pub fn comms(&self) -> Arc<crate::comms::Comms> {
        Arc::clone(&self.comms)
    }
}
