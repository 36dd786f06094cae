//! Describes what to run inside the sandbox and owns the sandboxee channel
//! until a monitor takes over.

use crate::comms::Comms;
use crate::error::SetupFailure;
use crate::fork_client::SandboxeeProcess;
use crate::fork_server::{ForkMode, ForkRequest, global_fork_client};
use crate::ipc::Ipc;
use crate::limits::Limits;
use crate::monitor::MonitorKind;
use crate::policy::Policy;
use crate::{Result, WardenError};
use nix::unistd::Pid;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Launch description: target binary, argv/envp, limits and IPC endpoints.
pub struct Executor {
    path: Option<PathBuf>,
    exec_fd: Option<OwnedFd>,
    args: Vec<String>,
    envs: Vec<String>,
    cwd: String,
    limits: Limits,
    ipc: Ipc,
    comms: Option<Arc<Comms>>,
    client_comms_fd: Option<OwnedFd>,
    libunwind_target: Option<Pid>,
    started: bool,
}

impl Executor {
    /// Prepares to run `path` with the given arguments. The binary is
    /// opened immediately so later path shuffling cannot swap it.
    pub fn new(path: impl AsRef<Path>, args: &[&str]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let exec_fd = nix::fcntl::open(
            &path,
            nix::fcntl::OFlag::O_PATH | nix::fcntl::OFlag::O_CLOEXEC,
            nix::sys::stat::Mode::empty(),
        )?;
        let (supervisor, client) = Comms::pair()?;
        Ok(Self {
            path: Some(path),
            exec_fd: Some(exec_fd),
            args: args.iter().map(ToString::to_string).collect(),
            envs: std::env::vars().map(|(k, v)| format!("{k}={v}")).collect(),
            cwd: String::new(),
            limits: Limits::default(),
            ipc: Ipc::new(),
            comms: Some(Arc::new(supervisor)),
            client_comms_fd: Some(client.into_fd()),
            libunwind_target: None,
            started: false,
        })
    }

    /// Internal mode for the stack tracer: no binary, the fork server joins
    /// `target`'s user namespace and serves one unwind request.
    pub(crate) fn for_unwind_of(target: Pid) -> Result<Self> {
        let (supervisor, client) = Comms::pair()?;
        Ok(Self {
            path: None,
            exec_fd: None,
            args: Vec::new(),
            envs: Vec::new(),
            cwd: String::new(),
            limits: Limits::default(),
            ipc: Ipc::new(),
            comms: Some(Arc::new(supervisor)),
            client_comms_fd: Some(client.into_fd()),
            libunwind_target: Some(target),
            started: false,
        })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Working directory inside the sandbox; empty keeps the fork server's.
    pub fn set_cwd(&mut self, cwd: impl Into<String>) -> &mut Self {
        self.cwd = cwd.into();
        self
    }

    pub fn set_env(&mut self, key: &str, value: &str) -> &mut Self {
        self.envs.push(format!("{key}={value}"));
        self
    }

    /// Replaces the inherited environment entirely.
    pub fn clear_env(&mut self) -> &mut Self {
        self.envs.clear();
        self
    }

    pub fn set_limits(&mut self, limits: Limits) -> &mut Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub const fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn ipc_mut(&mut self) -> &mut Ipc {
        &mut self.ipc
    }

    pub(crate) fn take_ipc(&mut self) -> Ipc {
        std::mem::take(&mut self.ipc)
    }

    pub(crate) const fn cwd(&self) -> &String {
        &self.cwd
    }

    pub(crate) const fn is_unwind_executor(&self) -> bool {
        self.libunwind_target.is_some()
    }

    /// The supervisor end of the sandboxee channel.
    pub(crate) fn comms(&self) -> Arc<Comms> {
        Arc::clone(self.comms.as_ref().expect("comms present until started"))
    }

    /// Asks the fork server for the sandboxee process.
    pub(crate) fn start_sub_process(
        &mut self,
        kind: MonitorKind,
        policy: &Policy,
    ) -> Result<SandboxeeProcess> {
        if self.started {
            return Err(WardenError::ForkServer("executor already started".into()));
        }
        if !self.cwd.is_empty() && !Path::new(&self.cwd).is_dir() {
            // A missing cwd is the caller's configuration mistake, surfaced
            // as a setup error before the sandboxee ever runs.
            return Err(WardenError::Setup(SetupFailure::Cwd));
        }

        let (mode, user_ns_fd) = match self.libunwind_target {
            Some(target) => {
                let ns = nix::fcntl::open(
                    format!("/proc/{target}/ns/user").as_str(),
                    nix::fcntl::OFlag::O_RDONLY | nix::fcntl::OFlag::O_CLOEXEC,
                    nix::sys::stat::Mode::empty(),
                )?;
                (ForkMode::JoinSandboxUnwind, Some(ns))
            }
            None => (ForkMode::ForkExecveSandbox, None),
        };

        let request = ForkRequest {
            mode,
            args: self.args.clone(),
            envs: self.envs.clone(),
            namespaces: policy.namespaces().cloned(),
            capabilities: policy.capabilities.clone(),
            monitor_kind: kind,
        };

        let client_fd = self
            .client_comms_fd
            .take()
            .ok_or_else(|| WardenError::ForkServer("sandboxee channel already used".into()))?;
        let process = global_fork_client()?.send_request(
            &request,
            self.exec_fd.as_ref().map(AsRawFd::as_raw_fd),
            client_fd.as_raw_fd(),
            user_ns_fd.as_ref().map(|fd: &OwnedFd| fd.as_raw_fd()),
        )?;
        self.exec_fd = None;
        self.started = true;
        tracing::debug!(
            main_pid = process.main_pid.as_raw(),
            init_pid = ?process.init_pid,
            "sandboxee spawned"
        );
        Ok(process)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_the_binary_up_front() {
        let executor = Executor::new("/bin/true", &["true"]).unwrap();
        assert!(executor.exec_fd.is_some());
        assert_eq!(executor.path().unwrap(), Path::new("/bin/true"));
    }

    #[test]
    fn missing_binary_fails_immediately() {
        assert!(Executor::new("/definitely/not/here", &[]).is_err());
    }

    #[test]
    fn env_manipulation() {
        let mut executor = Executor::new("/bin/true", &[]).unwrap();
        executor.clear_env().set_env("MODE", "test");
        assert_eq!(executor.envs, vec!["MODE=test".to_string()]);
    }
}
