//! Supervisor-side handle to the fork server.

use crate::comms::Comms;
use crate::fork_server::{ForkMode, ForkRequest};
use crate::monitor::MonitorKind;
use crate::{Result, WardenError};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::os::unix::io::{OwnedFd, RawFd};

/// A sandboxee as seen from the supervisor.
///
/// `init_pid` is set only when a fresh PID namespace was created; it names
/// the tiny reaper inside it. `status_fd` is set only under the unotify
/// monitor; the reaper writes `(si_code, si_status, rusage)` to it when the
/// sandboxee exits.
#[derive(Debug)]
pub struct SandboxeeProcess {
    pub init_pid: Option<Pid>,
    pub main_pid: Pid,
    pub status_fd: Option<OwnedFd>,
}

/// Client end of the fork-server channel. Requests are transactions of
/// several messages, so the whole exchange is serialized.
pub struct ForkClient {
    comms: Comms,
    transaction: Mutex<()>,
    server_pid: Pid,
}

impl ForkClient {
    pub(crate) const fn new(comms: Comms, server_pid: Pid) -> Self {
        Self {
            comms,
            transaction: Mutex::new(()),
            server_pid,
        }
    }

    #[must_use]
    pub const fn server_pid(&self) -> Pid {
        self.server_pid
    }

    /// Asks the fork server for one sandboxee.
    ///
    /// `comms_fd` becomes the sandboxee's end of the supervisor channel;
    /// `exec_fd` carries the target binary for the execve modes;
    /// `user_ns_fd` carries the target's user namespace for the unwind mode.
    pub fn send_request(
        &self,
        request: &ForkRequest,
        exec_fd: Option<RawFd>,
        comms_fd: RawFd,
        user_ns_fd: Option<RawFd>,
    ) -> Result<SandboxeeProcess> {
        let _transaction = self.transaction.lock();
        self.comms.send_msg(request)?;
        self.comms.send_fd(comms_fd)?;
        if matches!(
            request.mode,
            ForkMode::ForkExecve | ForkMode::ForkExecveSandbox
        ) {
            let fd = exec_fd.ok_or_else(|| {
                WardenError::ForkServer("execve mode without a binary fd".into())
            })?;
            self.comms.send_fd(fd)?;
        }
        if request.mode == ForkMode::JoinSandboxUnwind {
            let fd = user_ns_fd.ok_or_else(|| {
                WardenError::ForkServer("unwind mode without a user namespace fd".into())
            })?;
            self.comms.send_fd(fd)?;
        }

        let init_pid = self.comms.recv_i32()?;
        let main_pid = self.comms.recv_i32()?;
        if main_pid <= 0 {
            return Err(WardenError::ForkServer(format!(
                "fork server failed to spawn (pid {main_pid})"
            )));
        }
        let status_fd = if request.monitor_kind == MonitorKind::Unotify {
            Some(self.comms.recv_fd()?)
        } else {
            None
        };
        Ok(SandboxeeProcess {
            init_pid: (init_pid > 0).then(|| Pid::from_raw(init_pid)),
            main_pid: Pid::from_raw(main_pid),
            status_fd,
        })
    }
}
