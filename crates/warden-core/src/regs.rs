//! General-purpose register snapshots of stopped tracees.
//!
//! Fetched and stored through `PTRACE_GETREGSET`/`PTRACE_SETREGSET` with an
//! explicit iovec; the nix wrappers do not cover the regset interface on all
//! architectures.

use crate::syscall::{CpuArch, Syscall};
use crate::{Result, WardenError};
use nix::unistd::Pid;

// Not exposed by every libc flavor.
const NT_PRSTATUS: libc::c_int = 1;

/// Register snapshot of one thread, in the host architecture's layout.
#[derive(Clone)]
pub struct Regs {
    pid: Pid,
    user: libc::user_regs_struct,
}

impl std::fmt::Debug for Regs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Regs")
            .field("pid", &self.pid)
            .field("ip", &self.instruction_pointer())
            .field("sp", &self.stack_pointer())
            .finish()
    }
}

impl Regs {
    #[must_use]
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            // SAFETY: user_regs_struct is plain data; all-zero is a valid
            // (if meaningless) value until fetch() fills it.
            user: unsafe { std::mem::zeroed() },
        }
    }

    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Reads the registers of the (stopped) thread.
    pub fn fetch(&mut self) -> Result<()> {
        let mut iov = libc::iovec {
            iov_base: std::ptr::from_mut(&mut self.user).cast::<libc::c_void>(),
            iov_len: std::mem::size_of::<libc::user_regs_struct>(),
        };
        // SAFETY: iovec points at storage of the advertised size.
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                self.pid.as_raw(),
                NT_PRSTATUS,
                std::ptr::from_mut(&mut iov),
            )
        };
        if ret == -1 {
            return Err(WardenError::Nix(nix::errno::Errno::last()));
        }
        Ok(())
    }

    /// Writes the (possibly modified) registers back to the thread.
    pub fn store(&self) -> Result<()> {
        let mut user = self.user;
        let mut iov = libc::iovec {
            iov_base: std::ptr::from_mut(&mut user).cast::<libc::c_void>(),
            iov_len: std::mem::size_of::<libc::user_regs_struct>(),
        };
        // SAFETY: as in fetch(); the kernel only reads from the iovec here.
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET,
                self.pid.as_raw(),
                NT_PRSTATUS,
                std::ptr::from_mut(&mut iov),
            )
        };
        if ret == -1 {
            return Err(WardenError::Nix(nix::errno::Errno::last()));
        }
        Ok(())
    }

    /// Serializes the raw register block, as shipped to the unwinder.
    #[must_use]
    pub fn raw_bytes(&self) -> Vec<u8> {
        let size = std::mem::size_of::<libc::user_regs_struct>();
        let mut out = vec![0u8; size];
        // SAFETY: user_regs_struct is plain data of exactly `size` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(
                std::ptr::from_ref(&self.user).cast::<u8>(),
                out.as_mut_ptr(),
                size,
            );
        }
        out
    }

    /// Rebuilds a snapshot from [`Regs::raw_bytes`] output.
    pub fn from_raw_bytes(pid: Pid, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != std::mem::size_of::<libc::user_regs_struct>() {
            return Err(WardenError::Internal(
                crate::error::InternalFailure::Fetch,
            ));
        }
        let mut regs = Self::new(pid);
        // SAFETY: length checked above; user_regs_struct is plain data.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                std::ptr::from_mut(&mut regs.user).cast::<u8>(),
                bytes.len(),
            );
        }
        Ok(regs)
    }

    #[cfg(target_arch = "x86_64")]
    #[must_use]
    pub const fn instruction_pointer(&self) -> u64 {
        self.user.rip
    }

    #[cfg(target_arch = "x86_64")]
    #[must_use]
    pub const fn stack_pointer(&self) -> u64 {
        self.user.rsp
    }

    #[cfg(target_arch = "x86_64")]
    #[must_use]
    pub const fn frame_pointer(&self) -> u64 {
        self.user.rbp
    }

    #[cfg(target_arch = "x86_64")]
    #[must_use]
    pub const fn return_value(&self) -> i64 {
        self.user.rax as i64
    }

    /// Interprets the snapshot as a syscall entry under the given
    /// architecture's calling convention. A 64-bit task that entered the
    /// kernel through the 32-bit gate still reports its arguments in the
    /// 32-bit convention registers.
    #[cfg(target_arch = "x86_64")]
    #[must_use]
    pub fn to_syscall(&self, arch: CpuArch) -> Syscall {
        let u = &self.user;
        let (nr, args) = match arch {
            CpuArch::X86 => (
                u.orig_rax,
                [u.rbx, u.rcx, u.rdx, u.rsi, u.rdi, u.rbp],
            ),
            _ => (u.orig_rax, [u.rdi, u.rsi, u.rdx, u.r10, u.r8, u.r9]),
        };
        Syscall::new(arch, nr, args, self.pid, u.rsp, u.rip)
    }

    /// Rewrites the pending syscall to fail with the given return value; the
    /// syscall number register is clobbered so the kernel executes nothing.
    #[cfg(target_arch = "x86_64")]
    pub fn skip_syscall_return_value(&mut self, value: i64) -> Result<()> {
        self.user.orig_rax = u64::MAX;
        self.user.rax = value as u64;
        self.store()
    }

    #[cfg(target_arch = "aarch64")]
    #[must_use]
    pub const fn instruction_pointer(&self) -> u64 {
        self.user.pc
    }

    #[cfg(target_arch = "aarch64")]
    #[must_use]
    pub const fn stack_pointer(&self) -> u64 {
        self.user.sp
    }

    #[cfg(target_arch = "aarch64")]
    #[must_use]
    pub const fn frame_pointer(&self) -> u64 {
        self.user.regs[29]
    }

    #[cfg(target_arch = "aarch64")]
    #[must_use]
    pub const fn return_value(&self) -> i64 {
        self.user.regs[0] as i64
    }

    #[cfg(target_arch = "aarch64")]
    #[must_use]
    pub fn to_syscall(&self, arch: CpuArch) -> Syscall {
        let u = &self.user;
        let nr = u.regs[8];
        let args = [u.regs[0], u.regs[1], u.regs[2], u.regs[3], u.regs[4], u.regs[5]];
        Syscall::new(arch, nr, args, self.pid, u.sp, u.pc)
    }

    #[cfg(target_arch = "aarch64")]
    pub fn skip_syscall_return_value(&mut self, value: i64) -> Result<()> {
        self.user.regs[8] = u64::MAX;
        self.user.regs[0] = value as u64;
        self.store()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_bytes_round_trip() {
        let regs = Regs::new(Pid::from_raw(1));
        let bytes = regs.raw_bytes();
        assert_eq!(bytes.len(), std::mem::size_of::<libc::user_regs_struct>());
        let back = Regs::from_raw_bytes(Pid::from_raw(1), &bytes).unwrap();
        assert_eq!(back.raw_bytes(), bytes);
    }

    #[test]
    fn bad_raw_length_is_rejected() {
        assert!(Regs::from_raw_bytes(Pid::from_raw(1), &[0u8; 3]).is_err());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn syscall_conventions_differ_between_arches() {
        let mut regs = Regs::new(Pid::from_raw(7));
        regs.user.orig_rax = 60;
        regs.user.rdi = 1;
        regs.user.rbx = 2;
        let native = regs.to_syscall(CpuArch::X8664);
        assert_eq!(native.args()[0], 1);
        let compat = regs.to_syscall(CpuArch::X86);
        assert_eq!(compat.args()[0], 2);
    }
}
