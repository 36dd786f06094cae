//! Final seccomp policy: the engine prologue, the user clauses, and the
//! fail-closed tail, assembled into one validated BPF program.

use crate::bpf::{self, BpfLabels, sock_filter};
use crate::comms::Comms;
use crate::monitor::MonitorKind;
use crate::namespaces::NamespaceSpec;
use crate::syscall::{
    AUDIT_ARCH_AARCH64, AUDIT_ARCH_I386, AUDIT_ARCH_PPC64LE, AUDIT_ARCH_X86_64, CpuArch,
};
use crate::{Result, WardenError};

/// Magic sixth execveat argument marking the fork server's one-time control
/// transfer into the target binary. Not a secret, merely a discriminator so
/// the monitor is not consulted for ordinary execveat calls.
pub const EXECVEAT_MAGIC: u64 = 0x921c_2c34;

/// Which stack traces to collect, by terminating event.
#[derive(Debug, Clone, Copy)]
pub struct StackTracePolicy {
    pub on_violation: bool,
    pub on_signal: bool,
    pub on_timeout: bool,
    pub on_kill: bool,
    pub on_exit: bool,
}

impl Default for StackTracePolicy {
    fn default() -> Self {
        Self {
            on_violation: true,
            on_signal: false,
            on_timeout: false,
            on_kill: false,
            on_exit: false,
        }
    }
}

/// A compiled sandbox policy: BPF clauses, namespace spec, retained
/// capabilities, and the stack-trace policy. Built via
/// [`PolicyBuilder`](crate::PolicyBuilder), consumed by one monitor.
pub struct Policy {
    pub(crate) user_policy: Vec<sock_filter>,
    pub(crate) namespaces: Option<NamespaceSpec>,
    pub(crate) capabilities: Vec<String>,
    pub(crate) stack_traces: StackTracePolicy,
    pub(crate) track_all_syscalls: bool,
    pub(crate) collect_all_threads: bool,
}

impl Policy {
    /// The prologue every emitted program starts with: the architecture
    /// check, the execveat unlock, and the universal denies.
    fn default_policy() -> Result<Vec<sock_filter>> {
        let mut l = BpfLabels::new();
        let mut prog = Vec::new();

        // A syscall from a non-host architecture is reported to the monitor
        // with the architecture tag as trace data.
        prog.push(bpf::load_arch());
        prog.extend(bpf::jeq32(
            CpuArch::host_audit_arch(),
            l.jump("past_arch_check"),
        ));
        prog.extend(bpf::jeq32(
            AUDIT_ARCH_X86_64,
            bpf::trace(CpuArch::X8664.trace_tag()),
        ));
        prog.extend(bpf::jeq32(
            AUDIT_ARCH_I386,
            bpf::trace(CpuArch::X86.trace_tag()),
        ));
        prog.extend(bpf::jeq32(
            AUDIT_ARCH_PPC64LE,
            bpf::trace(CpuArch::Ppc64Le.trace_tag()),
        ));
        prog.extend(bpf::jeq32(
            AUDIT_ARCH_AARCH64,
            bpf::trace(CpuArch::Aarch64.trace_tag()),
        ));
        prog.push(bpf::trace(CpuArch::Unknown.trace_tag()));
        prog.push(l.label("past_arch_check"));

        // One-time unlock for the fork server's execveat into the target.
        // BPF has no state, so the magic argument merely routes the call to
        // the monitor, which tracks whether the transfer already happened.
        prog.push(bpf::load_syscall_nr());
        prog.extend(bpf::jne32(
            libc::SYS_execveat as u32,
            l.jump("past_execveat"),
        ));
        prog.push(bpf::arg32(4));
        prog.extend(bpf::jne32(
            libc::AT_EMPTY_PATH as u32,
            l.jump("past_execveat"),
        ));
        prog.push(bpf::arg32(5));
        prog.extend(bpf::jne32(EXECVEAT_MAGIC as u32, l.jump("past_execveat")));
        prog.push(bpf::trace(CpuArch::host().trace_tag()));
        prog.push(l.label("past_execveat"));

        // Unsafe regardless of user policy.
        prog.push(bpf::load_syscall_nr());
        prog.extend(bpf::jeq32(libc::SYS_ptrace as u32, bpf::kill()));
        prog.extend(bpf::jeq32(libc::SYS_bpf as u32, bpf::kill()));

        // clone with CLONE_UNTRACED would escape the ptrace monitor.
        prog.extend(bpf::jne32(
            libc::SYS_clone as u32,
            l.jump("past_clone_untraced"),
        ));
        prog.push(bpf::arg32(0));
        prog.extend(bpf::ja32(libc::CLONE_UNTRACED as u32, bpf::kill()));
        prog.push(l.label("past_clone_untraced"));

        bpf::resolve_jumps(&l, &mut prog)?;
        Ok(prog)
    }

    /// Debug program tracing every syscall instead of filtering.
    fn tracking_policy() -> Vec<sock_filter> {
        let mut prog = Vec::new();
        prog.push(bpf::load_arch());
        prog.extend(bpf::jeq32(
            AUDIT_ARCH_X86_64,
            bpf::trace(CpuArch::X8664.trace_tag()),
        ));
        prog.extend(bpf::jeq32(
            AUDIT_ARCH_I386,
            bpf::trace(CpuArch::X86.trace_tag()),
        ));
        prog.extend(bpf::jeq32(
            AUDIT_ARCH_PPC64LE,
            bpf::trace(CpuArch::Ppc64Le.trace_tag()),
        ));
        prog.extend(bpf::jeq32(
            AUDIT_ARCH_AARCH64,
            bpf::trace(CpuArch::Aarch64.trace_tag()),
        ));
        prog.push(bpf::trace(CpuArch::Unknown.trace_tag()));
        prog
    }

    /// The final program: prologue, user clauses in insertion order, and a
    /// default KILL so unlisted syscalls fail closed.
    pub fn program(&self) -> Result<Vec<sock_filter>> {
        if self.track_all_syscalls {
            return Ok(Self::tracking_policy());
        }
        let mut prog = Self::default_policy()?;
        // Reload the syscall number in case a user clause left something
        // else in the accumulator.
        prog.push(bpf::load_syscall_nr());
        prog.extend(self.user_policy.iter().cloned());
        prog.push(bpf::kill());
        if prog.len() > bpf::BPF_MAXINSNS {
            return Err(WardenError::Bpf(format!(
                "policy has {} instructions, the kernel caps filters at {}",
                prog.len(),
                bpf::BPF_MAXINSNS
            )));
        }
        Ok(prog)
    }

    /// The user-notify variant: every KILL and every host-architecture
    /// TRACE becomes `USER_NOTIF`, so denied syscalls surface as up-calls
    /// instead of killing the sandboxee.
    pub fn program_for_unotify(&self) -> Result<Vec<sock_filter>> {
        let mut prog = self.program()?;
        for insn in &mut prog {
            if bpf::is_kill(insn) || bpf::is_trace(insn, CpuArch::host().trace_tag()) {
                *insn = bpf::user_notif();
            }
        }
        Ok(prog)
    }

    /// Ships the program appropriate for `kind` as a byte blob.
    pub(crate) fn send(&self, comms: &Comms, kind: MonitorKind) -> Result<()> {
        let prog = match kind {
            MonitorKind::Ptrace => self.program()?,
            MonitorKind::Unotify => self.program_for_unotify()?,
        };
        comms.send_bytes(&crate::client::serialize_program(&prog))
    }

    #[must_use]
    pub fn namespaces(&self) -> Option<&NamespaceSpec> {
        self.namespaces.as_ref()
    }

    #[must_use]
    pub fn stack_traces(&self) -> &StackTracePolicy {
        &self.stack_traces
    }

    #[must_use]
    pub const fn collect_all_threads(&self) -> bool {
        self.collect_all_threads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::SECCOMP_RET_USER_NOTIF;
    use crate::policy_builder::PolicyBuilder;

    fn eval(policy: &Policy, nr: i64, args: [u64; 6]) -> u32 {
        let data = libc::seccomp_data {
            nr: nr as i32,
            arch: CpuArch::host_audit_arch(),
            instruction_pointer: 0,
            args,
        };
        bpf::evaluate(&policy.program().unwrap(), &data).unwrap()
    }

    #[test]
    fn default_program_fails_closed() {
        let policy = PolicyBuilder::new().try_build().unwrap();
        assert_eq!(
            eval(&policy, libc::SYS_getpid, [0; 6]),
            libc::SECCOMP_RET_KILL_THREAD
        );
    }

    #[test]
    fn prologue_denies_ptrace_bpf_and_untraced_clone_despite_allows() {
        let policy = PolicyBuilder::new()
            .allow_syscall(libc::SYS_ptrace as u64)
            .allow_syscall(libc::SYS_bpf as u64)
            .allow_syscall(libc::SYS_clone as u64)
            .try_build()
            .unwrap();
        assert_eq!(
            eval(&policy, libc::SYS_ptrace, [0; 6]),
            libc::SECCOMP_RET_KILL_THREAD
        );
        assert_eq!(
            eval(&policy, libc::SYS_bpf, [0; 6]),
            libc::SECCOMP_RET_KILL_THREAD
        );
        let mut args = [0u64; 6];
        args[0] = libc::CLONE_UNTRACED as u64;
        assert_eq!(
            eval(&policy, libc::SYS_clone, args),
            libc::SECCOMP_RET_KILL_THREAD
        );
        // Plain clone remains subject to the user allow.
        assert_eq!(
            eval(&policy, libc::SYS_clone, [0; 6]),
            libc::SECCOMP_RET_ALLOW
        );
    }

    #[test]
    fn cross_architecture_syscalls_are_traced_with_their_tag() {
        let policy = PolicyBuilder::new().try_build().unwrap();
        let data = libc::seccomp_data {
            nr: 1,
            arch: AUDIT_ARCH_I386,
            instruction_pointer: 0,
            args: [0; 6],
        };
        let ret = bpf::evaluate(&policy.program().unwrap(), &data).unwrap();
        assert_eq!(
            ret,
            libc::SECCOMP_RET_TRACE | u32::from(CpuArch::X86.trace_tag())
        );
    }

    #[test]
    fn execveat_magic_routes_to_the_monitor() {
        let policy = PolicyBuilder::new().try_build().unwrap();
        let mut args = [0u64; 6];
        args[4] = libc::AT_EMPTY_PATH as u64;
        args[5] = EXECVEAT_MAGIC;
        assert_eq!(
            eval(&policy, libc::SYS_execveat, args),
            libc::SECCOMP_RET_TRACE | u32::from(CpuArch::host().trace_tag())
        );
        // Without the magic the call falls through to the default KILL.
        args[5] = 0;
        assert_eq!(
            eval(&policy, libc::SYS_execveat, args),
            libc::SECCOMP_RET_KILL_THREAD
        );
    }

    #[test]
    fn unotify_variant_substitutes_kill_and_host_trace() {
        let policy = PolicyBuilder::new()
            .allow_syscall(libc::SYS_exit_group as u64)
            .try_build()
            .unwrap();
        let prog = policy.program_for_unotify().unwrap();
        let data = libc::seccomp_data {
            nr: libc::SYS_getpid as i32,
            arch: CpuArch::host_audit_arch(),
            instruction_pointer: 0,
            args: [0; 6],
        };
        assert_eq!(bpf::evaluate(&prog, &data).unwrap(), SECCOMP_RET_USER_NOTIF);
        // Allows survive the substitution.
        let data = libc::seccomp_data {
            nr: libc::SYS_exit_group as i32,
            arch: CpuArch::host_audit_arch(),
            instruction_pointer: 0,
            args: [0; 6],
        };
        assert_eq!(
            bpf::evaluate(&prog, &data).unwrap(),
            libc::SECCOMP_RET_ALLOW
        );
        // Foreign-architecture traces are left untouched.
        let data = libc::seccomp_data {
            nr: 1,
            arch: AUDIT_ARCH_I386,
            instruction_pointer: 0,
            args: [0; 6],
        };
        assert_eq!(
            bpf::evaluate(&prog, &data).unwrap(),
            libc::SECCOMP_RET_TRACE | u32::from(CpuArch::X86.trace_tag())
        );
    }
}
