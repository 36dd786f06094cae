//! Sandboxee-side support: receives the policy and IPC endpoints over the
//! supervisor channel, installs the seccomp filter, and performs the
//! readiness handshake. Runs between fork and execveat inside the fork
//! server's child.

use crate::bpf::sock_filter;
use crate::comms::Comms;
use crate::ipc::ReceivedFdMap;
use crate::monitor::MonitorKind;
use crate::{Result, WardenError};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Sent by the sandboxee once the filter is installed.
pub const CLIENT_READY: u32 = 0x0A0B_0C01;
/// Sent by the ptrace monitor once every task is seized.
pub const MONITOR_READY_PTRACE: u32 = 0x0A0B_0C02;
/// Sent by the unotify monitor once the notify fd is wired up.
pub const MONITOR_READY_UNOTIFY: u32 = 0x0A0B_0C03;

// Filter flags for the raw seccomp(2) call; TSYNC_ESRCH is required to
// combine TSYNC with NEW_LISTENER and is missing from libc.
const SECCOMP_FILTER_FLAG_TSYNC: libc::c_ulong = 1;
const SECCOMP_FILTER_FLAG_NEW_LISTENER: libc::c_ulong = 8;
const SECCOMP_FILTER_FLAG_TSYNC_ESRCH: libc::c_ulong = 16;

/// Serializes a filter program into the byte blob shipped over comms.
#[must_use]
pub fn serialize_program(prog: &[sock_filter]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prog.len() * 8);
    for insn in prog {
        out.extend_from_slice(&insn.code.to_ne_bytes());
        out.push(insn.jt);
        out.push(insn.jf);
        out.extend_from_slice(&insn.k.to_ne_bytes());
    }
    out
}

/// Parses the byte blob back into a filter program.
pub fn parse_program(bytes: &[u8]) -> Result<Vec<sock_filter>> {
    if bytes.len() % 8 != 0 {
        return Err(WardenError::Bpf(format!(
            "policy blob has odd size {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| sock_filter {
            code: u16::from_ne_bytes([chunk[0], chunk[1]]),
            jt: chunk[2],
            jf: chunk[3],
            k: u32::from_ne_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
        })
        .collect())
}

fn install_with_listener(prog: &[sock_filter]) -> Result<OwnedFd> {
    let fprog = libc::sock_fprog {
        len: prog.len() as u16,
        filter: prog.as_ptr().cast_mut().cast::<libc::sock_filter>(),
    };
    // SAFETY: fprog points at a live program; the kernel copies it.
    let fd = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            libc::SECCOMP_SET_MODE_FILTER,
            SECCOMP_FILTER_FLAG_TSYNC
                | SECCOMP_FILTER_FLAG_TSYNC_ESRCH
                | SECCOMP_FILTER_FLAG_NEW_LISTENER,
            std::ptr::from_ref(&fprog),
        )
    };
    if fd < 0 {
        return Err(WardenError::Io(std::io::Error::last_os_error()));
    }
    // SAFETY: a successful NEW_LISTENER call returns a fresh descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// The in-sandboxee protocol driver.
pub struct Client<'c> {
    comms: &'c Comms,
    fd_map: ReceivedFdMap,
}

impl<'c> Client<'c> {
    #[must_use]
    pub fn new(comms: &'c Comms) -> Self {
        Self {
            comms,
            fd_map: ReceivedFdMap::default(),
        }
    }

    /// Receives the fd mappings and the working directory. Must run before
    /// the filter is installed; both involve syscalls the policy is unlikely
    /// to allow.
    pub fn prepare_environment(&mut self) -> Result<()> {
        self.fd_map = ReceivedFdMap::receive_over_comms(self.comms)?;
        let cwd = self.comms.recv_string()?;
        if !cwd.is_empty() {
            nix::unistd::chdir(cwd.as_str())?;
        }
        Ok(())
    }

    /// Environment entry describing the received fd map.
    #[must_use]
    pub fn fd_map_env_entry(&self) -> String {
        self.fd_map.env_entry()
    }

    /// Descriptors that must survive fd sanitization.
    #[must_use]
    pub fn kept_fds(&self) -> Vec<RawFd> {
        self.fd_map.fds()
    }

    /// Receives the policy blob and installs it across all threads. Under
    /// the unotify monitor the listener fd is created here and passed back
    /// to the supervisor.
    pub fn enable_sandbox(&mut self, kind: MonitorKind) -> Result<()> {
        let blob = self.comms.recv_bytes()?;
        let prog = parse_program(&blob)?;
        nix::sys::prctl::set_no_new_privs()?;
        match kind {
            MonitorKind::Ptrace => {
                seccompiler::apply_filter_all_threads(&prog)
                    .map_err(|e| WardenError::Policy(format!("installing filter: {e}")))?;
            }
            MonitorKind::Unotify => {
                let listener = install_with_listener(&prog)?;
                self.comms.send_fd(listener.as_raw_fd())?;
            }
        }
        self.comms.send_u32(CLIENT_READY)?;
        Ok(())
    }

    /// Blocks until the monitor finishes its own setup. Returns the
    /// monitor-ready message received.
    pub fn wait_for_monitor(&self) -> Result<u32> {
        let msg = self.comms.recv_u32()?;
        if msg != MONITOR_READY_PTRACE && msg != MONITOR_READY_UNOTIFY {
            return Err(WardenError::Comms(format!(
                "unexpected monitor-ready message {msg:#x}"
            )));
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf;

    #[test]
    fn program_blob_round_trips() {
        let prog = vec![
            bpf::load_syscall_nr(),
            bpf::jump_insn(0x15, 42, 1, 0),
            bpf::allow(),
            bpf::kill(),
        ];
        let blob = serialize_program(&prog);
        assert_eq!(blob.len(), 32);
        assert_eq!(parse_program(&blob).unwrap(), prog);
    }

    #[test]
    fn truncated_blob_is_rejected() {
        assert!(parse_program(&[0u8; 9]).is_err());
    }
}
