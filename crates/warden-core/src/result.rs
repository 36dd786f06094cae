//! Final outcome of one supervised run.

use crate::error::{InternalFailure, SetupFailure};
use crate::regs::Regs;
use crate::syscall::Syscall;
use crate::{Result, WardenError};
use std::time::Duration;

/// Terminal classification of a run. Written at most once; later writes are
/// dropped so racing kill/timeout/exit observations keep the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStatus {
    Unset,
    Ok,
    SetupError,
    Violation,
    Signaled,
    Timeout,
    ExternalKill,
    InternalError,
}

/// Why the run ended, refining [`FinalStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Unset,
    /// Exit code for `Ok`.
    ExitCode(i32),
    /// Terminating signal for `Signaled`.
    Signal(i32),
    /// Violating syscall number for `Violation`.
    SyscallNr(u64),
    /// Network-proxy-driven violation, distinguished from syscall ones.
    NetworkViolation,
    Setup(SetupFailure),
    Internal(InternalFailure),
}

/// Resource usage snapshot extracted from `struct rusage`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub user_time: Duration,
    pub system_time: Duration,
    pub max_rss_kib: i64,
}

impl From<&libc::rusage> for ResourceUsage {
    fn from(ru: &libc::rusage) -> Self {
        let tv = |t: libc::timeval| {
            Duration::from_secs(t.tv_sec.max(0) as u64)
                + Duration::from_micros(t.tv_usec.max(0) as u64)
        };
        Self {
            user_time: tv(ru.ru_utime),
            system_time: tv(ru.ru_stime),
            max_rss_kib: ru.ru_maxrss,
        }
    }
}

/// Everything the supervisor learned about one run: terminal status, the
/// violating syscall if any, captured registers and memory maps, stack
/// traces, and resource usage of both the sandboxee and the monitor.
#[derive(Debug, Default)]
pub struct ExecutionResult {
    final_status: Option<(FinalStatus, Reason)>,
    syscall: Option<Syscall>,
    regs: Option<Regs>,
    prog_name: Option<String>,
    proc_maps: Option<String>,
    stack_trace: Vec<String>,
    thread_stack_traces: Vec<(i32, Vec<String>)>,
    rusage_monitor: Option<ResourceUsage>,
    rusage_sandboxee: Option<ResourceUsage>,
    network_violation: Option<String>,
}

impl ExecutionResult {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the terminal status. A second call is a no-op; the first
    /// observation wins.
    pub fn set_exit_status(&mut self, status: FinalStatus, reason: Reason) {
        if let Some((prior, _)) = self.final_status {
            tracing::debug!(?prior, ?status, "final status already set, keeping first");
            return;
        }
        self.final_status = Some((status, reason));
    }

    #[must_use]
    pub fn final_status(&self) -> FinalStatus {
        self.final_status.map_or(FinalStatus::Unset, |(s, _)| s)
    }

    #[must_use]
    pub fn reason(&self) -> Reason {
        self.final_status.map_or(Reason::Unset, |(_, r)| r)
    }

    /// Numeric reason code: exit code, signal number, or syscall number
    /// depending on the final status.
    #[must_use]
    pub fn reason_code(&self) -> u64 {
        match self.reason() {
            Reason::Unset => 0,
            Reason::ExitCode(code) => code as u64,
            Reason::Signal(sig) => sig as u64,
            Reason::SyscallNr(nr) => nr,
            // Large sentinel, distinguishable from any syscall number.
            Reason::NetworkViolation => u64::from(u32::MAX),
            Reason::Setup(failure) => failure as u64,
            Reason::Internal(failure) => failure as u64,
        }
    }

    pub fn set_syscall(&mut self, syscall: Syscall) {
        self.syscall = Some(syscall);
    }

    #[must_use]
    pub fn syscall(&self) -> Option<&Syscall> {
        self.syscall.as_ref()
    }

    pub fn set_regs(&mut self, regs: Regs) {
        self.regs = Some(regs);
    }

    #[must_use]
    pub fn regs(&self) -> Option<&Regs> {
        self.regs.as_ref()
    }

    pub fn set_prog_name(&mut self, name: String) {
        self.prog_name = Some(name);
    }

    #[must_use]
    pub fn prog_name(&self) -> Option<&str> {
        self.prog_name.as_deref()
    }

    pub fn set_proc_maps(&mut self, maps: String) {
        self.proc_maps = Some(maps);
    }

    #[must_use]
    pub fn proc_maps(&self) -> Option<&str> {
        self.proc_maps.as_deref()
    }

    pub fn set_stack_trace(&mut self, trace: Vec<String>) {
        self.stack_trace = trace;
    }

    #[must_use]
    pub fn stack_trace(&self) -> &[String] {
        &self.stack_trace
    }

    pub fn set_thread_stack_traces(&mut self, traces: Vec<(i32, Vec<String>)>) {
        self.thread_stack_traces = traces;
    }

    #[must_use]
    pub fn thread_stack_traces(&self) -> &[(i32, Vec<String>)] {
        &self.thread_stack_traces
    }

    pub fn set_rusage_monitor(&mut self, rusage: ResourceUsage) {
        self.rusage_monitor = Some(rusage);
    }

    #[must_use]
    pub fn rusage_monitor(&self) -> Option<ResourceUsage> {
        self.rusage_monitor
    }

    pub fn set_rusage_sandboxee(&mut self, rusage: ResourceUsage) {
        self.rusage_sandboxee = Some(rusage);
    }

    #[must_use]
    pub fn rusage_sandboxee(&self) -> Option<ResourceUsage> {
        self.rusage_sandboxee
    }

    pub fn set_network_violation(&mut self, message: String) {
        self.network_violation = Some(message);
    }

    #[must_use]
    pub fn network_violation(&self) -> Option<&str> {
        self.network_violation.as_deref()
    }

    /// Maps the final status onto a crate error: `Ok` succeeds, `Timeout`
    /// reports the deadline, everything else is surfaced as-is.
    pub fn ok(&self) -> Result<()> {
        match self.final_status() {
            FinalStatus::Ok => Ok(()),
            FinalStatus::Timeout => Err(WardenError::ResultTimeout),
            status => Err(WardenError::Policy(format!(
                "sandbox run failed: {}",
                self.describe_status(status)
            ))),
        }
    }

    fn describe_status(&self, status: FinalStatus) -> String {
        match status {
            FinalStatus::Unset => "UNSET".into(),
            FinalStatus::Ok => format!("OK, exit code {}", self.reason_code()),
            FinalStatus::SetupError => match self.reason() {
                Reason::Setup(failure) => format!("SETUP_ERROR: {failure}"),
                _ => "SETUP_ERROR".into(),
            },
            FinalStatus::Violation => match &self.syscall {
                Some(syscall) => format!("VIOLATION: {}", syscall.description()),
                None => format!("VIOLATION, reason code {}", self.reason_code()),
            },
            FinalStatus::Signaled => {
                format!(
                    "SIGNALED with {}",
                    crate::util::signal_name(self.reason_code() as i32)
                )
            }
            FinalStatus::Timeout => "TIMEOUT".into(),
            FinalStatus::ExternalKill => "EXTERNAL_KILL".into(),
            FinalStatus::InternalError => match self.reason() {
                Reason::Internal(failure) => format!("INTERNAL_ERROR: {failure}"),
                _ => "INTERNAL_ERROR".into(),
            },
        }
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe_status(self.final_status()))?;
        if let Some(name) = &self.prog_name {
            write!(f, " (prog: '{name}')")?;
        }
        if !self.stack_trace.is_empty() {
            write!(f, " stack: [{}]", self.stack_trace.join(" -> "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::CpuArch;
    use nix::unistd::Pid;

    #[test]
    fn final_status_is_monotonic() {
        let mut result = ExecutionResult::new();
        assert_eq!(result.final_status(), FinalStatus::Unset);
        result.set_exit_status(FinalStatus::Timeout, Reason::ExitCode(0));
        result.set_exit_status(FinalStatus::ExternalKill, Reason::ExitCode(0));
        assert_eq!(result.final_status(), FinalStatus::Timeout);
    }

    #[test]
    fn reason_codes_follow_the_status() {
        let mut result = ExecutionResult::new();
        result.set_exit_status(FinalStatus::Violation, Reason::SyscallNr(101));
        assert_eq!(result.reason_code(), 101);
    }

    #[test]
    fn ok_conversion() {
        let mut ok = ExecutionResult::new();
        ok.set_exit_status(FinalStatus::Ok, Reason::ExitCode(0));
        assert!(ok.ok().is_ok());

        let mut timeout = ExecutionResult::new();
        timeout.set_exit_status(FinalStatus::Timeout, Reason::ExitCode(0));
        assert!(matches!(
            timeout.ok().unwrap_err(),
            WardenError::ResultTimeout
        ));
    }

    #[test]
    fn violation_rendering_names_the_syscall() {
        let mut result = ExecutionResult::new();
        result.set_exit_status(FinalStatus::Violation, Reason::SyscallNr(101));
        result.set_syscall(Syscall::new(
            CpuArch::X8664,
            101,
            [1, 2, 3, 4, 0, 0],
            Pid::from_raw(10),
            0,
            0,
        ));
        let rendered = result.to_string();
        assert!(rendered.contains("VIOLATION"));
        assert!(rendered.contains("ptrace"));
    }

    #[test]
    fn rusage_conversion_rounds_sanely() {
        // SAFETY: zeroed rusage is valid plain data.
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        ru.ru_utime.tv_sec = 1;
        ru.ru_utime.tv_usec = 500_000;
        ru.ru_maxrss = 2048;
        let usage = ResourceUsage::from(&ru);
        assert_eq!(usage.user_time, Duration::from_millis(1500));
        assert_eq!(usage.max_rss_kib, 2048);
    }
}
