//! Named descriptor pairs shared between the supervisor and a sandboxee.
//!
//! Each mapping is a socketpair: the supervisor keeps one end, the sandboxee
//! receives the other at a caller-chosen descriptor number. The name→number
//! map travels to the sandboxee in the `WARDEN_FD_MAPPINGS` environment
//! variable as comma-separated `name=fd` pairs.

use crate::comms::Comms;
use crate::{Result, WardenError};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

/// Environment variable carrying the fd-name map into the sandboxee.
pub const FD_MAPPINGS_ENV: &str = "WARDEN_FD_MAPPINGS";

struct FdMapEntry {
    name: String,
    remote_fd: RawFd,
    to_send: OwnedFd,
}

/// Supervisor-side collection of fd mappings for one sandboxee.
#[derive(Default)]
pub struct Ipc {
    fd_map: Vec<FdMapEntry>,
}

impl Ipc {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a socketpair mapped to `remote_fd` under `name` in the
    /// sandboxee and returns the supervisor's end.
    pub fn receive_fd(&mut self, remote_fd: RawFd, name: &str) -> Result<OwnedFd> {
        if self.fd_map.iter().any(|e| e.remote_fd == remote_fd) {
            return Err(WardenError::Comms(format!(
                "fd {remote_fd} is already mapped"
            )));
        }
        let (local, remote) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        tracing::debug!(name, remote_fd, "registered fd mapping");
        self.fd_map.push(FdMapEntry {
            name: name.to_string(),
            remote_fd,
            to_send: remote,
        });
        Ok(local)
    }

    /// Ships every mapping across the sandboxee channel; consumes the
    /// sandboxee-side ends.
    pub(crate) fn send_fds_over_comms(&mut self, comms: &Comms) -> Result<()> {
        comms.send_u32(self.fd_map.len() as u32)?;
        for entry in self.fd_map.drain(..) {
            comms.send_i32(entry.remote_fd)?;
            comms.send_string(&entry.name)?;
            comms.send_fd(entry.to_send.as_raw_fd())?;
        }
        Ok(())
    }
}

/// Sandboxee-side mirror: receives the mappings and renders the env var.
#[derive(Default)]
pub struct ReceivedFdMap {
    entries: Vec<(String, RawFd)>,
}

impl ReceivedFdMap {
    /// Receives the supervisor's mappings, pinning each fd at its requested
    /// number.
    pub fn receive_over_comms(comms: &Comms) -> Result<Self> {
        let count = comms.recv_u32()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let target = comms.recv_i32()?;
            let name = comms.recv_string()?;
            let fd = comms.recv_fd()?;
            let raw = fd.as_raw_fd();
            if raw != target {
                // SAFETY: dup2 closes any previous occupant of target; the
                // original closes when `fd` drops.
                let ret = unsafe { libc::dup2(raw, target) };
                if ret == -1 {
                    return Err(WardenError::Io(std::io::Error::last_os_error()));
                }
            } else {
                std::mem::forget(fd);
            }
            entries.push((name, target));
        }
        Ok(Self { entries })
    }

    /// All received descriptor numbers, used to exempt them from fd
    /// sanitization.
    #[must_use]
    pub fn fds(&self) -> Vec<RawFd> {
        self.entries.iter().map(|(_, fd)| *fd).collect()
    }

    /// `NAME=VALUE` environment entry encoding the map.
    #[must_use]
    pub fn env_entry(&self) -> String {
        let joined = self
            .entries
            .iter()
            .map(|(name, fd)| format!("{name}={fd}"))
            .collect::<Vec<_>>()
            .join(",");
        format!("{FD_MAPPINGS_ENV}={joined}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_remote_fds_are_rejected() {
        let mut ipc = Ipc::new();
        let _first = ipc.receive_fd(100, "data").unwrap();
        assert!(ipc.receive_fd(100, "other").is_err());
    }

    #[test]
    fn mappings_cross_a_comms_channel() {
        let (sup, sbx) = Comms::pair().unwrap();
        let mut ipc = Ipc::new();
        let local = ipc.receive_fd(333, "logs").unwrap();

        let sender = std::thread::spawn(move || {
            let mut ipc = ipc;
            ipc.send_fds_over_comms(&sup).unwrap();
            local
        });
        let received = ReceivedFdMap::receive_over_comms(&sbx).unwrap();
        let local = sender.join().unwrap();
        assert_eq!(received.fds(), vec![333]);
        assert_eq!(received.env_entry(), "WARDEN_FD_MAPPINGS=logs=333");

        // The mapped pair is connected: bytes written at fd 333 arrive at
        // the supervisor's end.
        nix::unistd::write(
            // SAFETY: fd 333 was just installed by dup2.
            unsafe { std::os::unix::io::BorrowedFd::borrow_raw(333) },
            b"hi",
        )
        .unwrap();
        let mut buf = [0u8; 2];
        nix::unistd::read(&local, &mut buf).unwrap();
        assert_eq!(&buf, b"hi");
        let _ = nix::unistd::close(333);
    }
}
