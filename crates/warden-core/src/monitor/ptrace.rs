//! The ptrace-based monitor: seizes every sandboxee task with seccomp
//! tracing enabled and drives a waitpid event loop until the run ends.

use super::MonitorCore;
use crate::client::MONITOR_READY_PTRACE;
use crate::error::{InternalFailure, SetupFailure};
use crate::notify::{TraceAction, ViolationKind};
use crate::pid_waiter::{PidWaiter, PidWaiterNotifier};
use crate::regs::Regs;
use crate::result::{FinalStatus, Reason, ResourceUsage};
use crate::syscall::{CpuArch, Syscall};
use crate::util::{self, INFINITE_FUTURE};
use crate::{Result, WardenError};
use nix::sys::ptrace;
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

const ATTACH_DEADLINE: Duration = Duration::from_secs(2);
const ATTACH_INITIAL_RETRY: Duration = Duration::from_millis(1);
const ATTACH_MAX_RETRY: Duration = Duration::from_millis(20);
const ATTACH_MAX_RELISTS: usize = 3;
/// Window for collecting straggler events after the sandboxee is gone.
const GRACEFUL_EXIT_WINDOW: Duration = Duration::from_millis(200);

const SYSCALL_EXIT_SIGNAL: i32 = libc::SIGTRAP | 0x80;

fn ptrace_event(status: i32) -> i32 {
    (status >> 16) & 0xff
}

/// Continues a stopped tracee, delivering `signal` if non-zero. A tracee
/// that died in the meantime is not an error.
fn continue_process(pid: Pid, signal: i32) {
    let sig = (signal != 0).then(|| nix::sys::signal::Signal::try_from(signal).ok()).flatten();
    match ptrace::cont(pid, sig) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::error!(%pid, error = %e, "ptrace(PTRACE_CONT) failed"),
    }
}

/// Restarts a tracee so it stops again at the next syscall exit.
fn complete_syscall(pid: Pid) {
    match ptrace::syscall(pid, None) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::error!(%pid, error = %e, "ptrace(PTRACE_SYSCALL) failed"),
    }
}

/// Acknowledges a group-stop without resuming the tracee, so job control
/// keeps working. Not wrapped by nix.
fn listen_process(pid: Pid) {
    // SAFETY: PTRACE_LISTEN takes no address/data arguments.
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_LISTEN,
            pid.as_raw(),
            std::ptr::null_mut::<libc::c_void>(),
            0,
        )
    };
    if ret == -1 && nix::errno::Errno::last() != nix::errno::Errno::ESRCH {
        tracing::error!(%pid, "ptrace(PTRACE_LISTEN) failed");
    }
}

struct LoopState {
    syscalls_in_progress: HashMap<i32, Syscall>,
    timed_out: bool,
    external_kill: bool,
    network_violation: bool,
    should_dump_stack: bool,
    hard_deadline_ms: u64,
    sandboxee_exited: bool,
}

pub(crate) struct PtraceMonitor {
    pub(crate) core: MonitorCore,
    waiter_notifier: Mutex<Option<PidWaiterNotifier>>,
}

impl PtraceMonitor {
    pub(crate) fn new(core: MonitorCore) -> Arc<Self> {
        Arc::new(Self {
            core,
            waiter_notifier: Mutex::new(None),
        })
    }

    pub(crate) fn kill(&self) {
        self.core.external_kill_request.store(true, Ordering::Release);
        self.notify_monitor();
    }

    pub(crate) fn dump_stack_trace(&self) {
        self.core.dump_stack_request.store(true, Ordering::Release);
        self.notify_monitor();
    }

    pub(crate) fn set_wall_time_limit(&self, limit: Duration) {
        let deadline = if limit.is_zero() {
            0
        } else {
            util::deadline_after(limit)
        };
        self.core.wall_deadline_ms.store(deadline, Ordering::Release);
        self.notify_monitor();
    }

    fn notify_monitor(&self) {
        if let Some(notifier) = self.waiter_notifier.lock().as_ref() {
            notifier.notify();
        }
    }

    /// The monitor thread body.
    pub(crate) fn run(&self) {
        let setup = self.setup();
        self.core.setup_ok.store(setup.is_ok(), Ordering::Release);
        self.core.setup_notification.notify();
        if setup.is_err() {
            self.core.kill_remains();
            self.core.on_done();
            return;
        }
        self.event_loop();
        self.core.on_done();
    }

    fn setup(&self) -> Result<()> {
        self.core.launch_common()?;
        self.core.wait_for_ready()?;
        self.core.apply_limits()?;
        // Attaching must be the very last step: once a task is
        // ptrace-stopped it cannot progress through the comms handshake.
        if let Err(e) = self.init_ptrace_attach() {
            tracing::error!(error = %e, "ptrace attach failed");
            self.core.setup_failed(SetupFailure::Ptrace);
            return Err(e);
        }
        // The socketpair is buffered, so this cannot deadlock even if the
        // sandboxee is already ptrace-stopped.
        if let Err(e) = self.core.comms.send_u32(MONITOR_READY_PTRACE) {
            self.core.setup_failed(SetupFailure::Connection);
            return Err(e);
        }
        Ok(())
    }

    fn try_attach(
        tasks: &BTreeSet<i32>,
        deadline: std::time::Instant,
        attached: &mut BTreeSet<i32>,
    ) -> Result<()> {
        let options = ptrace::Options::PTRACE_O_TRACESYSGOOD
            | ptrace::Options::PTRACE_O_TRACEFORK
            | ptrace::Options::PTRACE_O_TRACEVFORK
            | ptrace::Options::PTRACE_O_TRACEVFORKDONE
            | ptrace::Options::PTRACE_O_TRACECLONE
            | ptrace::Options::PTRACE_O_TRACEEXEC
            | ptrace::Options::PTRACE_O_TRACEEXIT
            | ptrace::Options::PTRACE_O_TRACESECCOMP
            | ptrace::Options::PTRACE_O_EXITKILL;
        let mut pending: Vec<i32> = tasks.iter().copied().collect();
        let mut retries = 0usize;
        while !pending.is_empty() {
            let mut retry = Vec::new();
            for task in pending {
                if attached.contains(&task) {
                    continue;
                }
                match ptrace::seize(Pid::from_raw(task), options) {
                    Ok(()) => {
                        attached.insert(task);
                    }
                    // A task wrapping up its exit can report EPERM for a
                    // moment; try again until the deadline.
                    Err(nix::errno::Errno::EPERM) => {
                        tracing::warn!(task, "PTRACE_SEIZE returned EPERM, retrying");
                        retry.push(task);
                    }
                    // Exited between listing and seizing.
                    Err(nix::errno::Errno::ESRCH) => {
                        tracing::warn!(task, "task exited before it could be seized");
                    }
                    Err(e) => {
                        return Err(WardenError::Nix(e));
                    }
                }
            }
            if !retry.is_empty() {
                if std::time::Instant::now() >= deadline {
                    return Err(WardenError::Setup(SetupFailure::Ptrace));
                }
                let backoff = ATTACH_INITIAL_RETRY * (1 << retries.min(10)) as u32;
                std::thread::sleep(backoff.min(ATTACH_MAX_RETRY));
                retries += 1;
            }
            pending = retry;
        }
        Ok(())
    }

    fn init_ptrace_attach(&self) -> Result<()> {
        if let Some(init_pid) = self.core.init_pid() {
            ptrace::seize(init_pid, ptrace::Options::PTRACE_O_EXITKILL)?;
        }
        let main_pid = self.core.main_pid();
        let mut tasks = util::list_tasks(main_pid)?;
        if !tasks.contains(&main_pid.as_raw()) {
            return Err(WardenError::Setup(SetupFailure::Ptrace));
        }
        if tasks.len() > 1 {
            tracing::warn!(
                %main_pid,
                threads = tasks.len(),
                "sandboxee had threads before the filter was installed"
            );
        }
        let deadline = std::time::Instant::now() + ATTACH_DEADLINE;
        let mut attached = BTreeSet::new();
        for relist in 0..=ATTACH_MAX_RELISTS {
            if tasks == attached {
                return Ok(());
            }
            if relist > 0 {
                tracing::error!(
                    %main_pid,
                    attempt = relist,
                    "sandboxee spawned threads while attaching"
                );
            }
            Self::try_attach(&tasks, deadline, &mut attached)?;
            tasks = util::list_tasks(main_pid)?;
        }
        if tasks == attached {
            Ok(())
        } else {
            // The task list kept growing while we attached.
            Err(WardenError::Setup(SetupFailure::Ptrace))
        }
    }

    fn kill_sandboxee(&self, state: &mut LoopState) -> bool {
        let main_pid = self.core.main_pid();
        tracing::debug!(%main_pid, "sending SIGKILL to the sandboxee");
        if nix::sys::signal::kill(main_pid, nix::sys::signal::Signal::SIGKILL).is_err() {
            self.core.internal_error(InternalFailure::Kill);
            return false;
        }
        if state.hard_deadline_ms == INFINITE_FUTURE {
            state.hard_deadline_ms = util::deadline_after(self.core.graceful_kill_timeout);
        }
        true
    }

    fn interrupt_sandboxee(&self) -> bool {
        if ptrace::interrupt(self.core.main_pid()).is_err() {
            self.core.internal_error(InternalFailure::Interrupt);
            return false;
        }
        true
    }

    fn event_loop(&self) {
        let mut waiter = PidWaiter::new();
        let main_pid = self.core.main_pid();
        waiter.set_priority_pid(main_pid);
        *self.waiter_notifier.lock() = Some(waiter.notifier());

        let mut state = LoopState {
            syscalls_in_progress: HashMap::new(),
            timed_out: false,
            external_kill: false,
            network_violation: false,
            should_dump_stack: false,
            hard_deadline_ms: INFINITE_FUTURE,
            sandboxee_exited: false,
        };

        while self.core.final_status() == FinalStatus::Unset {
            let now = util::now_millis();
            if now >= state.hard_deadline_ms {
                tracing::warn!(
                    timed_out = state.timed_out,
                    external_kill = state.external_kill,
                    "hard deadline exceeded"
                );
                self.core
                    .set_exit_status(FinalStatus::Timeout, Reason::ExitCode(0));
                break;
            }
            let wall_deadline = self.core.wall_deadline_ms.load(Ordering::Acquire);
            if wall_deadline != 0 && now >= wall_deadline && !state.timed_out {
                tracing::debug!("wall-time limit hit");
                state.timed_out = true;
                if !self.kill_sandboxee(&mut state) {
                    break;
                }
            }
            if self.core.dump_stack_request.swap(false, Ordering::AcqRel) {
                state.should_dump_stack = true;
                if !self.interrupt_sandboxee() {
                    break;
                }
            }
            if self.core.external_kill_request.swap(false, Ordering::AcqRel)
                && !state.external_kill
            {
                state.external_kill = true;
                if !self.kill_sandboxee(&mut state) {
                    break;
                }
            }

            let mut effective_deadline = state.hard_deadline_ms;
            if wall_deadline != 0 && state.hard_deadline_ms == INFINITE_FUTURE {
                effective_deadline = wall_deadline;
            }
            waiter.set_deadline(effective_deadline);

            let event = match waiter.wait() {
                Ok(None) | Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::ECHILD) => {
                    tracing::error!("all children gone without a main exit event");
                    self.core.internal_error(InternalFailure::Child);
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "waitpid failed");
                    continue;
                }
                Ok(Some(event)) => event,
            };

            let pid = event.pid;
            let status = event.status;
            if libc::WIFEXITED(status) {
                tracing::debug!(%pid, code = libc::WEXITSTATUS(status), "task exited");
                if pid == main_pid {
                    if self.core.wait_for_execveat.load(Ordering::Acquire) {
                        // Exited before ever reaching the target binary.
                        self.core.setup_failed(SetupFailure::Monitor);
                    } else {
                        self.core.set_exit_status(
                            FinalStatus::Ok,
                            Reason::ExitCode(libc::WEXITSTATUS(status)),
                        );
                        self.core
                            .result
                            .lock()
                            .set_rusage_sandboxee(ResourceUsage::from(&event.rusage));
                    }
                    state.sandboxee_exited = true;
                }
            } else if libc::WIFSIGNALED(status) {
                tracing::debug!(
                    %pid,
                    signal = libc::WTERMSIG(status),
                    "task terminated by signal"
                );
                if pid == main_pid {
                    self.core
                        .result
                        .lock()
                        .set_rusage_sandboxee(ResourceUsage::from(&event.rusage));
                    self.set_kill_status(&state, libc::WTERMSIG(status));
                    state.sandboxee_exited = true;
                }
            } else if libc::WIFSTOPPED(status) {
                self.state_process_stopped(pid, status, &mut state);
            }
        }

        if !state.sandboxee_exited {
            self.drain_after_exit(&mut waiter, &state);
        }
    }

    /// Status priority when the main process died by signal: network
    /// violation, then external kill, then timeout, then the raw signal.
    fn set_kill_status(&self, state: &LoopState, signal: i32) {
        if state.network_violation {
            self.core
                .set_exit_status(FinalStatus::Violation, Reason::NetworkViolation);
        } else if state.external_kill {
            self.core
                .set_exit_status(FinalStatus::ExternalKill, Reason::ExitCode(0));
        } else if state.timed_out {
            self.core
                .set_exit_status(FinalStatus::Timeout, Reason::ExitCode(0));
        } else {
            self.core
                .set_exit_status(FinalStatus::Signaled, Reason::Signal(signal));
        }
    }

    /// Bounded wait for remaining events once the verdict is in; everything
    /// still alive dies with the monitor through PTRACE_O_EXITKILL.
    fn drain_after_exit(&self, waiter: &mut PidWaiter, _state: &LoopState) {
        let main_pid = self.core.main_pid();
        let deadline = util::deadline_after(GRACEFUL_EXIT_WINDOW);
        loop {
            if util::now_millis() >= deadline {
                tracing::warn!("waiting for sandboxee exit timed out");
                break;
            }
            waiter.set_deadline(deadline);
            let event = match waiter.wait() {
                Ok(None) | Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => break,
                Ok(Some(event)) => event,
            };
            if event.pid == main_pid
                && (libc::WIFEXITED(event.status) || libc::WIFSIGNALED(event.status))
            {
                self.core
                    .result
                    .lock()
                    .set_rusage_sandboxee(ResourceUsage::from(&event.rusage));
                break;
            }
            let _ = nix::sys::signal::kill(main_pid, nix::sys::signal::Signal::SIGKILL);
            if libc::WIFSTOPPED(event.status) {
                continue_process(event.pid, 0);
            }
        }
    }

    fn fetch_regs(&self, pid: Pid) -> Option<Regs> {
        let mut regs = Regs::new(pid);
        match regs.fetch() {
            Ok(()) => Some(regs),
            Err(e) if e.is_process_gone() => {
                tracing::warn!(%pid, "task gone while fetching registers");
                None
            }
            Err(e) => {
                tracing::error!(%pid, error = %e, "fetching registers failed");
                self.core.internal_error(InternalFailure::Fetch);
                None
            }
        }
    }

    fn state_process_stopped(&self, pid: Pid, status: i32, state: &mut LoopState) {
        let stopsig = libc::WSTOPSIG(status);
        let is_syscall_exit = stopsig == SYSCALL_EXIT_SIGNAL;
        if ptrace_event(status) == 0 && !is_syscall_exit {
            // Ordinary signal delivery; relay it.
            tracing::debug!(%pid, signal = stopsig, "signal delivered to tracee");
            self.core.notify.lock().event_signal(pid, stopsig);
            continue_process(pid, stopsig);
            return;
        }

        let event_msg = match ptrace::getevent(pid) {
            Ok(msg) => msg,
            Err(nix::errno::Errno::ESRCH) => {
                // The kernel does not guarantee the event stays retrievable.
                tracing::debug!(%pid, "event message gone");
                return;
            }
            Err(e) => {
                tracing::error!(%pid, error = %e, "ptrace(PTRACE_GETEVENTMSG) failed");
                self.core.internal_error(InternalFailure::GetEvent);
                return;
            }
        };

        if pid == self.core.main_pid()
            && state.should_dump_stack
            && self.core.policy.namespaces().is_some()
        {
            state.should_dump_stack = false;
            if let Some(regs) = self.fetch_regs(pid) {
                match self.collect_stack_trace(&regs) {
                    Ok(trace) => {
                        tracing::info!(%pid, stack = ?trace, "sandboxee stack");
                    }
                    Err(e) => tracing::warn!(%pid, error = %e, "could not dump stack"),
                }
            }
        }

        if is_syscall_exit {
            self.event_syscall_exit(pid, state);
            return;
        }

        match ptrace_event(status) {
            libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK | libc::PTRACE_EVENT_CLONE => {
                self.event_new_process(pid, event_msg as i64, state);
            }
            libc::PTRACE_EVENT_VFORK_DONE => continue_process(pid, 0),
            libc::PTRACE_EVENT_EXEC => self.event_exec(pid, state),
            libc::PTRACE_EVENT_EXIT => self.event_exit(pid, event_msg as i32, state),
            libc::PTRACE_EVENT_STOP => Self::event_stop(pid, stopsig),
            libc::PTRACE_EVENT_SECCOMP => self.event_seccomp(pid, event_msg as i64, state),
            event => {
                tracing::error!(%pid, event, event_msg, "unknown ptrace event");
            }
        }
    }

    fn event_seccomp(&self, pid: Pid, event_msg: i64, state: &mut LoopState) {
        // An exited process can leave its exit status in the event message
        // before we see the exit event; ignore out-of-range tags.
        let Ok(tag) = u32::try_from(event_msg) else {
            tracing::warn!(%pid, event_msg, "seccomp event with unusable message");
            return;
        };
        let Some(arch) = CpuArch::from_trace_tag(tag) else {
            tracing::warn!(%pid, tag, "seccomp event for unknown architecture tag");
            return;
        };
        let Some(mut regs) = self.fetch_regs(pid) else {
            return;
        };
        let syscall = regs.to_syscall(arch);
        if arch != CpuArch::host() {
            self.action_violation(&mut regs, &syscall, ViolationKind::ArchitectureSwitch);
            return;
        }
        self.action_process_syscall(&mut regs, &syscall, state);
    }

    fn action_process_syscall(&self, regs: &mut Regs, syscall: &Syscall, state: &mut LoopState) {
        let pid = regs.pid();
        // Before the execveat transition the policy is considered inactive;
        // let the one magic execveat through.
        if syscall.nr() == libc::SYS_execveat as u64
            && self.core.wait_for_execveat.load(Ordering::Acquire)
        {
            tracing::debug!(%pid, "permitting the initial execveat");
            continue_process(pid, 0);
            return;
        }

        match self.core.notify.lock().event_syscall_trace(syscall) {
            TraceAction::Allow => {
                continue_process(pid, 0);
            }
            TraceAction::InspectAfterReturn => {
                // The entry is dropped again if the process exits without a
                // syscall-exit stop (eg. a sibling execve).
                state
                    .syscalls_in_progress
                    .insert(pid.as_raw(), syscall.clone());
                complete_syscall(pid);
            }
            TraceAction::Deny => {
                if self.core.policy.track_all_syscalls {
                    tracing::info!(%pid, syscall = %syscall.description(), "tracked");
                    continue_process(pid, 0);
                    return;
                }
                self.action_violation(regs, syscall, ViolationKind::Syscall);
            }
        }
    }

    fn action_violation(&self, regs: &mut Regs, syscall: &Syscall, kind: ViolationKind) {
        let pid = regs.pid();
        if self.core.is_unwind_sandbox {
            tracing::error!(syscall = %syscall.description(), "violation inside the unwinder");
        } else {
            tracing::error!(
                %pid,
                prog = %util::prog_name(pid),
                syscall = %syscall.description(),
                "SANDBOX VIOLATION"
            );
        }
        self.core.notify.lock().event_syscall_violation(syscall, kind);
        self.core
            .set_exit_status(FinalStatus::Violation, Reason::SyscallNr(syscall.nr()));
        {
            let mut result = self.core.result.lock();
            result.set_syscall(syscall.clone());
        }
        self.set_additional_result_info(regs.clone());
        // The process dies anyway; rewriting the return value just makes
        // sure the syscall cannot take effect meanwhile.
        if let Err(e) = regs.skip_syscall_return_value(-(libc::ENOSYS as i64)) {
            if !e.is_process_gone() {
                tracing::error!(%pid, error = %e, "rewriting syscall result failed");
            }
        }
    }

    fn set_additional_result_info(&self, regs: Regs) {
        let pid = regs.pid();
        {
            let mut result = self.core.result.lock();
            result.set_prog_name(util::prog_name(pid));
            result.set_proc_maps(util::read_proc_maps(pid));
            result.set_regs(regs.clone());
        }
        let status = self.core.final_status();
        if !self.core.should_collect_stack_trace(status) {
            tracing::debug!("stack trace collection disabled for this status");
            return;
        }
        if self.core.policy.collect_all_threads() {
            self.collect_all_thread_stack_traces(&regs);
        } else {
            match self.collect_stack_trace(&regs) {
                Ok(trace) => self.core.result.lock().set_stack_trace(trace),
                Err(e) => tracing::warn!(error = %e, "could not obtain stack trace"),
            }
        }
    }

    fn collect_stack_trace(&self, regs: &Regs) -> Result<Vec<String>> {
        if !self.core.stack_trace_collection_possible() {
            return Err(WardenError::StackTrace(
                "collection not possible in this configuration".into(),
            ));
        }
        let mounts = self
            .core
            .policy
            .namespaces()
            .map(|ns| ns.mounts.clone())
            .unwrap_or_default();
        crate::stack_trace::get_stack_trace(regs, &mounts)
    }

    /// Interrupts every sibling task and captures each stack on a
    /// best-effort basis; the interrupted stops are consumed by the main
    /// loop later.
    fn collect_all_thread_stack_traces(&self, violating: &Regs) {
        let main = violating.pid();
        let mut tasks = util::list_tasks(main).unwrap_or_default();
        tasks.remove(&main.as_raw());

        let mut fetch_tasks = vec![main];
        let deadline = std::time::Instant::now() + Duration::from_millis(500);
        for task in tasks {
            if std::time::Instant::now() >= deadline {
                tracing::error!("interrupting all threads timed out, skipping the rest");
                break;
            }
            let pid = Pid::from_raw(task);
            if ptrace::interrupt(pid).is_err() {
                continue;
            }
            if super::wait_for_task_stop(pid, Duration::from_millis(10)) {
                fetch_tasks.push(pid);
            }
        }

        let mut traces = Vec::new();
        for task in fetch_tasks {
            let regs = if task == main {
                violating.clone()
            } else {
                match self.fetch_regs(task) {
                    Some(regs) => regs,
                    None => continue,
                }
            };
            match self.collect_stack_trace(&regs) {
                Ok(trace) => {
                    if task == main {
                        self.core.result.lock().set_stack_trace(trace.clone());
                    }
                    traces.push((task.as_raw(), trace));
                }
                Err(e) => tracing::warn!(%task, error = %e, "could not obtain stack trace"),
            }
        }
        self.core.result.lock().set_thread_stack_traces(traces);
    }

    fn event_syscall_exit(&self, pid: Pid, state: &mut LoopState) {
        let Some(syscall) = state.syscalls_in_progress.remove(&pid.as_raw()) else {
            tracing::error!(%pid, "syscall-exit stop without a syscall in progress");
            self.core.internal_error(InternalFailure::Inspect);
            return;
        };
        let Some(regs) = self.fetch_regs(pid) else {
            return;
        };
        self.core
            .notify
            .lock()
            .event_syscall_return(&syscall, regs.return_value());
        continue_process(pid, 0);
    }

    /// fork/vfork/clone do not produce syscall-exit stops for the parent;
    /// the new child's PID arrives as the event message instead.
    fn event_new_process(&self, pid: Pid, child_pid: i64, state: &mut LoopState) {
        if let Some(syscall) = state.syscalls_in_progress.get(&pid.as_raw()) {
            let nr = syscall.nr();
            let creates_process = nr == libc::SYS_clone as u64
                || nr == libc::SYS_clone3 as u64
                || {
                    #[cfg(not(target_arch = "aarch64"))]
                    {
                        nr == libc::SYS_fork as u64 || nr == libc::SYS_vfork as u64
                    }
                    #[cfg(target_arch = "aarch64")]
                    {
                        false
                    }
                };
            if !creates_process {
                tracing::error!(
                    %pid,
                    syscall = %syscall.description(),
                    "new-process event while inspecting a non-clone syscall"
                );
                self.core.internal_error(InternalFailure::Inspect);
                return;
            }
            let syscall = state
                .syscalls_in_progress
                .remove(&pid.as_raw())
                .expect("entry just observed");
            self.core
                .notify
                .lock()
                .event_syscall_return(&syscall, child_pid);
        }
        continue_process(pid, 0);
    }

    fn event_exec(&self, pid: Pid, state: &mut LoopState) {
        if self.core.wait_for_execveat.swap(false, Ordering::AcqRel) {
            tracing::debug!(%pid, "execveat transition complete, sandbox active");
        } else if let Some(syscall) = state.syscalls_in_progress.remove(&pid.as_raw()) {
            // execve does not produce a syscall-exit stop either.
            let nr = syscall.nr();
            if nr == libc::SYS_execve as u64 || nr == libc::SYS_execveat as u64 {
                self.core.notify.lock().event_syscall_return(&syscall, 0);
            } else {
                tracing::error!(
                    %pid,
                    syscall = %syscall.description(),
                    "exec event while inspecting a non-exec syscall"
                );
                self.core.internal_error(InternalFailure::Inspect);
                return;
            }
        }
        continue_process(pid, 0);
    }

    fn event_exit(&self, pid: Pid, event_msg: i32, state: &mut LoopState) {
        state.syscalls_in_progress.remove(&pid.as_raw());

        let main_pid = self.core.main_pid();
        let collect_on_exit = self.core.policy.stack_traces().on_exit;
        if libc::WIFEXITED(event_msg) && (!collect_on_exit || pid != main_pid) {
            continue_process(pid, 0);
            return;
        }

        // A task killed by SIGSYS is the delayed notification of a
        // kernel-enforced seccomp kill.
        let is_seccomp =
            libc::WIFSIGNALED(event_msg) && libc::WTERMSIG(event_msg) == libc::SIGSYS;
        let regs = if is_seccomp || pid == main_pid {
            match self.fetch_regs(pid) {
                Some(regs) => Some(regs),
                None => return,
            }
        } else {
            None
        };

        if is_seccomp {
            tracing::debug!(%pid, "violation uncovered via the exit event");
            let mut regs = regs.expect("fetched above");
            let syscall = regs.to_syscall(CpuArch::host());
            self.action_violation(&mut regs, &syscall, ViolationKind::Syscall);
            return;
        }

        if pid == main_pid {
            if state.network_violation {
                self.core
                    .set_exit_status(FinalStatus::Violation, Reason::NetworkViolation);
            } else if state.external_kill {
                self.core
                    .set_exit_status(FinalStatus::ExternalKill, Reason::ExitCode(0));
            } else if state.timed_out {
                self.core
                    .set_exit_status(FinalStatus::Timeout, Reason::ExitCode(0));
            } else if libc::WIFEXITED(event_msg) {
                self.core.set_exit_status(
                    FinalStatus::Ok,
                    Reason::ExitCode(libc::WEXITSTATUS(event_msg)),
                );
            } else {
                self.core.set_exit_status(
                    FinalStatus::Signaled,
                    Reason::Signal(libc::WTERMSIG(event_msg)),
                );
            }
            if let Some(regs) = regs {
                self.set_additional_result_info(regs);
            }
        }
        continue_process(pid, 0);
    }

    /// Group-stops are acknowledged with PTRACE_LISTEN so the task stays
    /// stopped but job control still works.
    fn event_stop(pid: Pid, stopsig: i32) {
        if matches!(
            stopsig,
            libc::SIGSTOP | libc::SIGTSTP | libc::SIGTTIN | libc::SIGTTOU
        ) {
            tracing::debug!(%pid, signal = stopsig, "group stop");
            listen_process(pid);
        } else {
            // Synthetic stop from one of the TRACE options.
            continue_process(pid, 0);
        }
    }
}
