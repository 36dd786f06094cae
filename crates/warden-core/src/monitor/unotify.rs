//! The seccomp user-notification monitor: supervises without ever
//! ptrace-attaching. Denied syscalls surface as synchronous up-calls on the
//! notify fd; the sandboxee's exit arrives on the init helper's status pipe.

use super::MonitorCore;
use crate::client::MONITOR_READY_UNOTIFY;
use crate::error::{InternalFailure, SetupFailure};
use crate::notify::{TraceAction, ViolationKind};
use crate::regs::Regs;
use crate::result::{FinalStatus, Reason, ResourceUsage};
use crate::syscall::{CpuArch, Syscall};
use crate::util;
use crate::{Result, WardenError, bpf};
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

// seccomp notify ioctls, fixed-layout since kernel 5.0.
const SECCOMP_IOCTL_NOTIF_RECV: libc::c_ulong = 0xc050_2100;
const SECCOMP_IOCTL_NOTIF_SEND: libc::c_ulong = 0xc018_2101;
const SECCOMP_USER_NOTIF_FLAG_CONTINUE: u32 = 1;

/// Longest poll slice; external requests re-arm it via the eventfd.
const MAX_POLL_WAIT: Duration = Duration::from_secs(30);
const STATUS_PIPE_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether `SECCOMP_USER_NOTIF_FLAG_CONTINUE` is available (kernel 5.5+).
fn continue_supported() -> bool {
    let Ok(uts) = nix::sys::utsname::uname() else {
        return false;
    };
    let release = uts.release().to_string_lossy();
    let mut parts = release.split(['.', '-']);
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor) >= (5, 5)
}

/// Receives one notification; `Ok(None)` for the benign races (interrupted,
/// or the notifying task died).
fn notif_recv(fd: &OwnedFd) -> Result<Option<libc::seccomp_notif>> {
    // SAFETY: zeroed seccomp_notif is the required pre-call state.
    let mut req: libc::seccomp_notif = unsafe { std::mem::zeroed() };
    // SAFETY: the out-pointer matches the ioctl's expected layout.
    let ret = unsafe {
        libc::ioctl(
            fd.as_raw_fd(),
            SECCOMP_IOCTL_NOTIF_RECV,
            std::ptr::from_mut(&mut req),
        )
    };
    if ret == -1 {
        return match nix::errno::Errno::last() {
            nix::errno::Errno::EINTR | nix::errno::Errno::EAGAIN | nix::errno::Errno::ENOENT => {
                Ok(None)
            }
            errno => Err(WardenError::Nix(errno)),
        };
    }
    Ok(Some(req))
}

/// Answers a notification with CONTINUE, letting the syscall proceed.
fn notif_respond_continue(fd: &OwnedFd, id: u64) -> Result<()> {
    let mut resp = libc::seccomp_notif_resp {
        id,
        val: 0,
        error: 0,
        flags: SECCOMP_USER_NOTIF_FLAG_CONTINUE,
    };
    // SAFETY: the in-pointer matches the ioctl's expected layout.
    let ret = unsafe {
        libc::ioctl(
            fd.as_raw_fd(),
            SECCOMP_IOCTL_NOTIF_SEND,
            std::ptr::from_mut(&mut resp),
        )
    };
    if ret == -1 {
        return match nix::errno::Errno::last() {
            // The task died or the notification was superseded.
            nix::errno::Errno::ENOENT | nix::errno::Errno::ECANCELED => Ok(()),
            errno => Err(WardenError::Nix(errno)),
        };
    }
    Ok(())
}

struct LoopState {
    timed_out: bool,
    external_kill: bool,
    network_violation: bool,
}

pub(crate) struct UnotifyMonitor {
    pub(crate) core: MonitorCore,
    notify_fd: Mutex<Option<OwnedFd>>,
    event_fd: Mutex<Option<OwnedFd>>,
    /// The unsubstituted program, re-evaluated on every notification.
    original_program: Mutex<Vec<bpf::sock_filter>>,
}

impl UnotifyMonitor {
    pub(crate) fn new(core: MonitorCore) -> Arc<Self> {
        Arc::new(Self {
            core,
            notify_fd: Mutex::new(None),
            event_fd: Mutex::new(None),
            original_program: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn kill(&self) {
        self.core.external_kill_request.store(true, Ordering::Release);
        self.wake();
    }

    pub(crate) fn dump_stack_trace(&self) {
        self.core.dump_stack_request.store(true, Ordering::Release);
        self.wake();
    }

    pub(crate) fn set_wall_time_limit(&self, limit: Duration) {
        let deadline = if limit.is_zero() {
            0
        } else {
            util::deadline_after(limit)
        };
        self.core.wall_deadline_ms.store(deadline, Ordering::Release);
        self.wake();
    }

    fn wake(&self) {
        if let Some(fd) = self.event_fd.lock().as_ref() {
            let one = 1u64.to_ne_bytes();
            let _ = nix::unistd::write(fd, &one);
        }
    }

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
        self.kill_init();
        self.core.on_done();
    }

    fn setup(&self) -> Result<()> {
        self.core.launch_common()?;

        // The client installs the filter with NEW_LISTENER and hands the
        // notify fd back before reporting ready.
        match self.core.comms.recv_fd() {
            Ok(fd) => *self.notify_fd.lock() = Some(fd),
            Err(e) => {
                tracing::error!(error = %e, "receiving the notify fd failed");
                self.core.setup_failed(SetupFailure::Notify);
                return Err(e);
            }
        }
        self.core.wait_for_ready()?;
        self.core.apply_limits()?;

        *self.original_program.lock() = self.core.policy.program()?;

        // SAFETY: plain eventfd creation; on success we own the descriptor.
        let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if efd == -1 {
            self.core.setup_failed(SetupFailure::Notify);
            return Err(WardenError::Io(std::io::Error::last_os_error()));
        }
        // SAFETY: fresh descriptor from the kernel.
        *self.event_fd.lock() = Some(unsafe {
            <OwnedFd as std::os::unix::io::FromRawFd>::from_raw_fd(efd)
        });

        if self.core.process.lock().as_ref().is_none_or(|p| p.status_fd.is_none()) {
            tracing::error!("unotify monitor without a status pipe");
            self.core.setup_failed(SetupFailure::Notify);
            return Err(WardenError::Setup(SetupFailure::Notify));
        }

        if let Err(e) = self.core.comms.send_u32(MONITOR_READY_UNOTIFY) {
            self.core.setup_failed(SetupFailure::Connection);
            return Err(e);
        }
        Ok(())
    }

    fn event_loop(&self) {
        let mut state = LoopState {
            timed_out: false,
            external_kill: false,
            network_violation: false,
        };

        while self.core.final_status() == FinalStatus::Unset {
            let now = util::now_millis();
            let wall_deadline = self.core.wall_deadline_ms.load(Ordering::Acquire);
            if wall_deadline != 0 && now >= wall_deadline {
                tracing::debug!("wall-time limit hit");
                state.timed_out = true;
                self.maybe_get_stack_trace(FinalStatus::Timeout);
                self.kill_sandboxee();
                self.set_exit_status_from_status_pipe(&state);
                break;
            }
            if self.core.external_kill_request.swap(false, Ordering::AcqRel) {
                state.external_kill = true;
                self.maybe_get_stack_trace(FinalStatus::ExternalKill);
                self.kill_sandboxee();
                self.set_exit_status_from_status_pipe(&state);
                break;
            }
            if self.core.dump_stack_request.swap(false, Ordering::AcqRel) {
                match self.stack_trace_via_attach(self.core.main_pid()) {
                    Ok(trace) => tracing::info!(stack = ?trace, "sandboxee stack"),
                    Err(e) => tracing::warn!(error = %e, "could not dump stack"),
                }
            }

            let timeout = if wall_deadline == 0 {
                MAX_POLL_WAIT
            } else {
                Duration::from_millis(wall_deadline.saturating_sub(now)).min(MAX_POLL_WAIT)
            };

            let (status_ready, status_hup, notify_ready, event_ready) = {
                let process = self.core.process.lock();
                let notify_fd = self.notify_fd.lock();
                let event_fd = self.event_fd.lock();
                let Some(status_fd) = process.as_ref().and_then(|p| p.status_fd.as_ref()) else {
                    self.core.internal_error(InternalFailure::Monitor);
                    break;
                };
                let (Some(notify_fd), Some(event_fd)) =
                    (notify_fd.as_ref(), event_fd.as_ref())
                else {
                    self.core.internal_error(InternalFailure::Monitor);
                    break;
                };
                let mut fds = [
                    PollFd::new(status_fd.as_fd(), PollFlags::POLLIN),
                    PollFd::new(notify_fd.as_fd(), PollFlags::POLLIN),
                    PollFd::new(event_fd.as_fd(), PollFlags::POLLIN),
                ];
                let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);
                match nix::poll::poll(&mut fds, timeout) {
                    Ok(0) => continue,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        tracing::error!(error = %e, "poll failed");
                        self.core.internal_error(InternalFailure::Monitor);
                        break;
                    }
                    Ok(_) => (
                        fds[0].revents().is_some_and(|r| r.contains(PollFlags::POLLIN)),
                        fds[0].revents().is_some_and(|r| r.contains(PollFlags::POLLHUP)),
                        fds[1].revents().is_some_and(|r| r.contains(PollFlags::POLLIN)),
                        fds[2].revents().is_some_and(|r| r.contains(PollFlags::POLLIN)),
                    ),
                }
            };

            if event_ready {
                if let Some(fd) = self.event_fd.lock().as_ref() {
                    let mut buf = [0u8; 8];
                    let _ = nix::unistd::read(fd, &mut buf);
                }
                continue;
            }
            if status_ready {
                self.set_exit_status_from_status_pipe(&state);
                break;
            }
            if status_hup {
                tracing::error!("status pipe hangup before an exit record");
                self.core.internal_error(InternalFailure::Monitor);
                break;
            }
            if notify_ready {
                self.handle_unotify(&mut state);
            }
        }
    }

    fn kill_sandboxee(&self) {
        let _ = nix::sys::signal::kill(self.core.main_pid(), nix::sys::signal::Signal::SIGKILL);
    }

    fn kill_init(&self) {
        if let Some(init) = self.core.init_pid() {
            let _ = nix::sys::signal::kill(init, nix::sys::signal::Signal::SIGKILL);
        }
    }

    fn allow_via_unotify(&self, id: u64) {
        if !continue_supported() {
            tracing::error!("SECCOMP_USER_NOTIF_FLAG_CONTINUE not supported by this kernel");
            self.core.internal_error(InternalFailure::Notify);
            return;
        }
        let notify_fd = self.notify_fd.lock();
        let Some(fd) = notify_fd.as_ref() else {
            self.core.internal_error(InternalFailure::Notify);
            return;
        };
        if let Err(e) = notif_respond_continue(fd, id) {
            tracing::error!(error = %e, "responding to notification failed");
            self.core.internal_error(InternalFailure::Notify);
        }
    }

    fn handle_unotify(&self, state: &mut LoopState) {
        let req = {
            let notify_fd = self.notify_fd.lock();
            let Some(fd) = notify_fd.as_ref() else {
                self.core.internal_error(InternalFailure::Notify);
                return;
            };
            match notif_recv(fd) {
                Ok(Some(req)) => req,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(error = %e, "receiving notification failed");
                    self.core.internal_error(InternalFailure::Notify);
                    return;
                }
            }
        };

        let pid = Pid::from_raw(req.pid as i32);
        let syscall = Syscall::from_seccomp_data(pid, &req.data);

        // The initial execveat arrives here instead of as a ptrace event.
        if self.core.wait_for_execveat.load(Ordering::Acquire)
            && syscall.nr() == libc::SYS_execveat as u64
        {
            tracing::debug!(%pid, "permitting the initial execveat");
            self.core.wait_for_execveat.store(false, Ordering::Release);
            self.allow_via_unotify(req.id);
            return;
        }

        let policy_ret = {
            let program = self.original_program.lock();
            bpf::evaluate(&program, &req.data)
        };
        let policy_ret = match policy_ret {
            Ok(ret) => ret,
            Err(e) => {
                tracing::error!(error = %e, "re-evaluating the policy failed");
                self.core.internal_error(InternalFailure::Notify);
                return;
            }
        };

        if self.core.policy.track_all_syscalls {
            tracing::info!(%pid, syscall = %syscall.description(), "tracked");
            self.allow_via_unotify(req.id);
            return;
        }

        let host_trace = libc::SECCOMP_RET_TRACE | u32::from(CpuArch::host().trace_tag());
        let action = if policy_ret == host_trace {
            self.core.notify.lock().event_syscall_trace(&syscall)
        } else if policy_ret == libc::SECCOMP_RET_ALLOW {
            TraceAction::Allow
        } else {
            TraceAction::Deny
        };

        match action {
            TraceAction::Allow => self.allow_via_unotify(req.id),
            TraceAction::Deny => self.handle_violation(&syscall, state),
            TraceAction::InspectAfterReturn => {
                tracing::error!("InspectAfterReturn is not supported by the unotify monitor");
                self.core.internal_error(InternalFailure::Notify);
            }
        }
    }

    fn handle_violation(&self, syscall: &Syscall, _state: &mut LoopState) {
        let kind = if syscall.arch() == CpuArch::host() {
            ViolationKind::Syscall
        } else {
            ViolationKind::ArchitectureSwitch
        };
        tracing::error!(
            pid = %syscall.pid(),
            prog = %util::prog_name(syscall.pid()),
            syscall = %syscall.description(),
            "SANDBOX VIOLATION"
        );
        self.core.notify.lock().event_syscall_violation(syscall, kind);
        self.maybe_get_stack_trace(FinalStatus::Violation);
        self.core
            .set_exit_status(FinalStatus::Violation, Reason::SyscallNr(syscall.nr()));
        {
            let mut result = self.core.result.lock();
            result.set_prog_name(util::prog_name(syscall.pid()));
            result.set_proc_maps(util::read_proc_maps(syscall.pid()));
            result.set_syscall(syscall.clone());
        }
        self.kill_sandboxee();
    }

    /// Reads the `(si_code, si_status, rusage)` record the init helper
    /// writes when the sandboxee exits.
    fn set_exit_status_from_status_pipe(&self, state: &LoopState) {
        let mut buf = vec![0u8; 8 + std::mem::size_of::<libc::rusage>()];
        let deadline = std::time::Instant::now() + STATUS_PIPE_READ_TIMEOUT;
        let mut read = 0usize;
        {
            let process = self.core.process.lock();
            let Some(fd) = process.as_ref().and_then(|p| p.status_fd.as_ref()) else {
                self.core.internal_error(InternalFailure::Monitor);
                return;
            };
            while read < buf.len() && std::time::Instant::now() < deadline {
                let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
                let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                let timeout = PollTimeout::try_from(remaining).unwrap_or(PollTimeout::MAX);
                match nix::poll::poll(&mut fds, timeout) {
                    Ok(0) | Err(nix::errno::Errno::EINTR) => continue,
                    Err(_) => break,
                    Ok(_) => {}
                }
                match nix::unistd::read(fd, &mut buf[read..]) {
                    Ok(0) => break,
                    Ok(n) => read += n,
                    Err(nix::errno::Errno::EINTR) => {}
                    Err(_) => break,
                }
            }
        }
        if read < buf.len() {
            tracing::error!(read, "short read from the status pipe");
            self.core.internal_error(InternalFailure::Monitor);
            return;
        }

        let si_code = i32::from_ne_bytes(buf[0..4].try_into().unwrap());
        let si_status = i32::from_ne_bytes(buf[4..8].try_into().unwrap());
        // SAFETY: the buffer carries a raw rusage written by the init
        // helper in the same ABI.
        let rusage: libc::rusage = unsafe {
            std::ptr::read_unaligned(buf[8..].as_ptr().cast::<libc::rusage>())
        };
        self.core
            .result
            .lock()
            .set_rusage_sandboxee(ResourceUsage::from(&rusage));

        if si_code == libc::CLD_EXITED {
            self.core
                .set_exit_status(FinalStatus::Ok, Reason::ExitCode(si_status));
        } else if si_code == libc::CLD_KILLED || si_code == libc::CLD_DUMPED {
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
                    .set_exit_status(FinalStatus::Signaled, Reason::Signal(si_status));
            }
        } else {
            tracing::error!(si_code, "unexpected exit code from the status pipe");
            self.core.internal_error(InternalFailure::Monitor);
        }
    }

    fn maybe_get_stack_trace(&self, status: FinalStatus) {
        if !self.core.should_collect_stack_trace(status)
            || !self.core.stack_trace_collection_possible()
        {
            return;
        }
        match self.stack_trace_via_attach(self.core.main_pid()) {
            Ok(trace) => self.core.result.lock().set_stack_trace(trace),
            Err(e) => tracing::warn!(error = %e, "could not obtain stack trace"),
        }
    }

    /// Briefly attaches to fetch registers, since this monitor has no
    /// ptrace relationship otherwise.
    fn stack_trace_via_attach(&self, pid: Pid) -> Result<Vec<String>> {
        nix::sys::ptrace::seize(pid, nix::sys::ptrace::Options::empty())?;
        let result = (|| {
            nix::sys::ptrace::interrupt(pid)?;
            if !super::wait_for_task_stop(pid, Duration::from_millis(100)) {
                return Err(WardenError::StackTrace("task did not stop".into()));
            }
            let mut regs = Regs::new(pid);
            regs.fetch()?;
            let mounts = self
                .core
                .policy
                .namespaces()
                .map(|ns| ns.mounts.clone())
                .unwrap_or_default();
            crate::stack_trace::get_stack_trace(&regs, &mounts)
        })();
        let _ = nix::sys::ptrace::detach(pid, None);
        result
    }
}
