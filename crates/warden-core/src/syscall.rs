//! Syscall identification across audit architectures.

use crate::syscall_table;
use nix::unistd::Pid;

/// Syscall architecture as seen by seccomp. The discriminants are the values
/// carried in `SECCOMP_RET_DATA` by the policy prologue's TRACE returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CpuArch {
    Unknown = 0,
    X8664 = 1,
    X86 = 2,
    Ppc64Le = 3,
    Aarch64 = 4,
}

pub const AUDIT_ARCH_X86_64: u32 = 0xC000_003E;
pub const AUDIT_ARCH_I386: u32 = 0x4000_0003;
pub const AUDIT_ARCH_PPC64LE: u32 = 0xC000_0015;
pub const AUDIT_ARCH_AARCH64: u32 = 0xC000_00B7;

impl CpuArch {
    /// Architecture of the supervisor binary itself.
    #[must_use]
    pub const fn host() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Self::X8664
        }
        #[cfg(target_arch = "aarch64")]
        {
            Self::Aarch64
        }
        #[cfg(target_arch = "powerpc64")]
        {
            Self::Ppc64Le
        }
        #[cfg(not(any(
            target_arch = "x86_64",
            target_arch = "aarch64",
            target_arch = "powerpc64"
        )))]
        {
            Self::Unknown
        }
    }

    /// The kernel audit-arch word for this architecture, if defined.
    #[must_use]
    pub const fn audit_arch(self) -> Option<u32> {
        match self {
            Self::X8664 => Some(AUDIT_ARCH_X86_64),
            Self::X86 => Some(AUDIT_ARCH_I386),
            Self::Ppc64Le => Some(AUDIT_ARCH_PPC64LE),
            Self::Aarch64 => Some(AUDIT_ARCH_AARCH64),
            Self::Unknown => None,
        }
    }

    /// The audit-arch word of the host, as compared in the BPF prologue.
    #[must_use]
    pub const fn host_audit_arch() -> u32 {
        match Self::host().audit_arch() {
            Some(arch) => arch,
            None => 0,
        }
    }

    #[must_use]
    pub fn from_audit_arch(word: u32) -> Self {
        match word {
            AUDIT_ARCH_X86_64 => Self::X8664,
            AUDIT_ARCH_I386 => Self::X86,
            AUDIT_ARCH_PPC64LE => Self::Ppc64Le,
            AUDIT_ARCH_AARCH64 => Self::Aarch64,
            _ => Self::Unknown,
        }
    }

    /// Decodes the `SECCOMP_RET_DATA` tag produced by the policy prologue.
    #[must_use]
    pub const fn from_trace_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::Unknown),
            1 => Some(Self::X8664),
            2 => Some(Self::X86),
            3 => Some(Self::Ppc64Le),
            4 => Some(Self::Aarch64),
            _ => None,
        }
    }

    #[must_use]
    pub const fn trace_tag(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::X8664 => "x86_64",
            Self::X86 => "x86",
            Self::Ppc64Le => "ppc64le",
            Self::Aarch64 => "aarch64",
            Self::Unknown => "unknown",
        }
    }
}

/// One observed syscall: architecture, number, the six argument registers,
/// plus the issuing thread and its stack/instruction pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Syscall {
    arch: CpuArch,
    nr: u64,
    args: [u64; 6],
    pid: Pid,
    sp: u64,
    ip: u64,
}

impl Syscall {
    #[must_use]
    pub const fn new(arch: CpuArch, nr: u64, args: [u64; 6], pid: Pid, sp: u64, ip: u64) -> Self {
        Self {
            arch,
            nr,
            args,
            pid,
            sp,
            ip,
        }
    }

    /// Builds a syscall from the kernel's `seccomp_data`, as received on the
    /// user-notify path.
    #[must_use]
    pub fn from_seccomp_data(pid: Pid, data: &libc::seccomp_data) -> Self {
        Self {
            arch: CpuArch::from_audit_arch(data.arch),
            nr: data.nr as u64,
            args: data.args,
            pid,
            sp: 0,
            ip: data.instruction_pointer,
        }
    }

    #[must_use]
    pub const fn arch(&self) -> CpuArch {
        self.arch
    }

    #[must_use]
    pub const fn nr(&self) -> u64 {
        self.nr
    }

    #[must_use]
    pub const fn args(&self) -> &[u64; 6] {
        &self.args
    }

    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub const fn stack_pointer(&self) -> u64 {
        self.sp
    }

    #[must_use]
    pub const fn instruction_pointer(&self) -> u64 {
        self.ip
    }

    /// Name of the syscall in this architecture's table.
    #[must_use]
    pub fn name(&self) -> String {
        syscall_table::lookup(self.arch, self.nr)
            .map_or_else(|| format!("unknown-syscall-{}", self.nr), |e| e.0.to_string())
    }

    /// Number of meaningful arguments, six when unknown.
    #[must_use]
    pub fn num_args(&self) -> usize {
        syscall_table::lookup(self.arch, self.nr).map_or(6, |e| usize::from(e.1))
    }

    /// Human-readable rendering used in violation logs.
    #[must_use]
    pub fn description(&self) -> String {
        let args = self.args[..self.num_args()]
            .iter()
            .map(|a| format!("{a:#x}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "{} [{}]({args}) IP: {:#x}, STACK: {:#x}",
            self.name(),
            self.nr,
            self.ip,
            self.sp
        )
    }
}

impl std::fmt::Display for Syscall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.arch.name(), self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_arch_has_an_audit_word() {
        assert!(CpuArch::host().audit_arch().is_some());
        assert_eq!(
            CpuArch::from_audit_arch(CpuArch::host_audit_arch()),
            CpuArch::host()
        );
    }

    #[test]
    fn trace_tags_round_trip() {
        for arch in [
            CpuArch::Unknown,
            CpuArch::X8664,
            CpuArch::X86,
            CpuArch::Ppc64Le,
            CpuArch::Aarch64,
        ] {
            assert_eq!(CpuArch::from_trace_tag(u32::from(arch.trace_tag())), Some(arch));
        }
        assert_eq!(CpuArch::from_trace_tag(99), None);
    }

    #[test]
    fn x86_64_names_resolve() {
        let sys = Syscall::new(CpuArch::X8664, 0, [0; 6], Pid::from_raw(1), 0, 0);
        assert_eq!(sys.name(), "read");
        let sys = Syscall::new(CpuArch::X8664, 101, [0; 6], Pid::from_raw(1), 0, 0);
        assert_eq!(sys.name(), "ptrace");
    }

    #[test]
    fn i386_table_differs_from_x86_64() {
        // exit is 1 on i386, 60 on x86_64.
        let sys = Syscall::new(CpuArch::X86, 1, [0; 6], Pid::from_raw(1), 0, 0);
        assert_eq!(sys.name(), "exit");
        let sys = Syscall::new(CpuArch::X8664, 60, [0; 6], Pid::from_raw(1), 0, 0);
        assert_eq!(sys.name(), "exit");
    }

    #[test]
    fn unknown_numbers_render_with_their_value() {
        let sys = Syscall::new(CpuArch::X8664, 99_999, [0; 6], Pid::from_raw(1), 0, 0);
        assert_eq!(sys.name(), "unknown-syscall-99999");
        assert!(sys.description().contains("99999"));
    }

    #[test]
    fn description_limits_argument_count() {
        let sys = Syscall::new(
            CpuArch::X8664,
            60, // exit(status)
            [7, 1, 2, 3, 4, 5],
            Pid::from_raw(1),
            0x1000,
            0x2000,
        );
        let desc = sys.description();
        assert!(desc.starts_with("exit [60](0x7)"));
        assert!(desc.contains("IP: 0x2000"));
    }
}
