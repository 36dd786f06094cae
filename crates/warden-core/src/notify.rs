//! User-overridable event hook invoked by the monitors.

use crate::comms::Comms;
use crate::result::ExecutionResult;
use crate::syscall::Syscall;
use nix::unistd::Pid;

/// What the monitor should do with a trapped syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceAction {
    /// Let the syscall run.
    Allow,
    /// Let the syscall run, then deliver its return value through
    /// [`Notify::event_syscall_return`]. Ptrace monitor only.
    InspectAfterReturn,
    /// Treat it as a policy violation.
    Deny,
}

/// Classification carried alongside a violation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// A syscall the policy forbids.
    Syscall,
    /// A syscall issued through a non-host architecture's entry path.
    ArchitectureSwitch,
}

/// Receives lifecycle events for one sandboxed run. All methods have benign
/// defaults; override the ones of interest.
#[allow(unused_variables)]
pub trait Notify: Send {
    /// The sandboxee exists but has not yet been released past its initial
    /// execveat. Returning false aborts the run with a setup error.
    fn event_started(&mut self, pid: Pid, comms: &Comms) -> bool {
        true
    }

    /// A syscall was trapped by a TRACE action in the policy.
    fn event_syscall_trace(&mut self, syscall: &Syscall) -> TraceAction {
        TraceAction::Deny
    }

    /// Return value of a syscall previously answered with
    /// [`TraceAction::InspectAfterReturn`].
    fn event_syscall_return(&mut self, syscall: &Syscall, return_value: i64) {}

    /// A (non-stopping) signal was delivered to a sandboxee thread.
    fn event_signal(&mut self, pid: Pid, signal: i32) {}

    /// The run ended in a policy violation.
    fn event_syscall_violation(&mut self, syscall: &Syscall, kind: ViolationKind) {}

    /// The final result is complete.
    fn event_finished(&mut self, result: &ExecutionResult) {}
}

/// Hook that denies trapped syscalls and ignores everything else.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultNotify;

impl Notify for DefaultNotify {}
