//! The fork server: a helper process that spawns sandboxees in a known-clean
//! state.
//!
//! Started once per supervisor (lazily, on first use) by forking; it then
//! serves fork requests over a dedicated comms channel. Each request clones
//! a child with the requested namespace flags, sets up mounts, capabilities
//! and the in-namespace init reaper, runs the sandboxee-side handshake, and
//! finally execveat()s the target with the magic argument the policy
//! prologue recognizes.

use crate::client::Client;
use crate::comms::{CLIENT_COMMS_FD, Comms};
use crate::fork_client::ForkClient;
use crate::monitor::MonitorKind;
use crate::namespaces::NamespaceSpec;
use crate::policy::EXECVEAT_MAGIC;
use crate::util;
use crate::{Result, WardenError, bpf, sanitizer};
use nix::sched::CloneFlags;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Setting this to `1` suppresses automatic fork-server startup; it is also
/// passed to sandboxees so they never start nested fork servers.
pub const NO_FORK_SERVER_ENV: &str = "WARDEN_NO_FORK_SERVER";

/// Descriptor number the target binary is parked at inside the child, above
/// the range IPC mappings use.
const TARGET_EXEC_FD: RawFd = 1022;

/// What the fork server should do with the new child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForkMode {
    /// Clean child that runs the registered worker entry under the sandbox.
    Fork,
    /// execveat the target without sandboxing.
    ForkExecve,
    /// Full sandbox setup, then execveat the target.
    ForkExecveSandbox,
    /// Join the target's user namespace and serve one unwind request.
    JoinSandboxUnwind,
}

/// One fork request, shipped over the fork-server channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkRequest {
    pub mode: ForkMode,
    pub args: Vec<String>,
    pub envs: Vec<String>,
    pub namespaces: Option<NamespaceSpec>,
    /// Capability names (`CAP_*`) to retain; everything else is dropped.
    pub capabilities: Vec<String>,
    pub monitor_kind: MonitorKind,
}

type WorkerEntry = fn(&Comms) -> i32;

static WORKER_ENTRY: OnceCell<WorkerEntry> = OnceCell::new();

/// Registers the function [`ForkMode::Fork`] children run after sandbox
/// setup. Must be called before the first fork request using that mode.
pub fn set_worker_entry(entry: WorkerEntry) {
    let _ = WORKER_ENTRY.set(entry);
}

/// The process-wide fork client, starting the fork server on first use.
///
/// Start this before spawning threads when possible: the server is created
/// by forking the current process.
pub fn global_fork_client() -> Result<&'static ForkClient> {
    static GLOBAL: OnceCell<ForkClient> = OnceCell::new();
    if std::env::var(NO_FORK_SERVER_ENV).as_deref() == Ok("1") {
        return Err(WardenError::ForkServer(format!(
            "fork server disabled via {NO_FORK_SERVER_ENV}"
        )));
    }
    GLOBAL.get_or_try_init(start_fork_server)
}

/// Eagerly starts the global fork server; call early in main().
pub fn ensure_started() {
    if let Err(e) = global_fork_client() {
        tracing::warn!(error = %e, "fork server not started");
    }
}

fn start_fork_server() -> Result<ForkClient> {
    let (server_comms, client_comms) = Comms::pair()?;
    // SAFETY: the child immediately enters the fork-server loop and never
    // returns into library code of this process.
    let pid = unsafe { util::fork_with_flags(libc::SIGCHLD as u64) }?;
    if pid.as_raw() == 0 {
        drop(client_comms);
        ForkServer::new(server_comms).run();
    }
    drop(server_comms);
    tracing::debug!(server_pid = pid.as_raw(), "fork server started");
    Ok(ForkClient::new(client_comms, pid))
}

/// Server side of the fork protocol; lives in its own process.
pub struct ForkServer {
    comms: Comms,
}

impl ForkServer {
    #[must_use]
    pub const fn new(comms: Comms) -> Self {
        Self { comms }
    }

    /// Serves fork requests until the supervisor goes away.
    pub fn run(self) -> ! {
        if let Err(e) = Self::initialize() {
            tracing::error!(error = %e, "fork server initialization failed");
            std::process::exit(1);
        }
        loop {
            if let Err(e) = self.serve_request() {
                if self.comms.is_terminated() {
                    std::process::exit(0);
                }
                tracing::error!(error = %e, "fork request failed");
                std::process::exit(1);
            }
        }
    }

    fn initialize() -> Result<()> {
        // Die with the supervisor, adopt orphaned grandchildren, auto-reap
        // terminated children, and survive stray terminals.
        nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)?;
        nix::sys::prctl::set_child_subreaper(true)?;
        let reap = SigAction::new(
            SigHandler::SigDfl,
            SaFlags::SA_NOCLDWAIT,
            SigSet::empty(),
        );
        // SAFETY: installing a default disposition with SA_NOCLDWAIT.
        unsafe { nix::sys::signal::sigaction(Signal::SIGCHLD, &reap) }?;
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        // SAFETY: ignoring SIGTERM is always sound.
        unsafe { nix::sys::signal::sigaction(Signal::SIGTERM, &ignore) }?;
        nix::sys::prctl::set_name(c"warden-forksrv")?;
        Ok(())
    }

    fn serve_request(&self) -> Result<()> {
        let request: ForkRequest = self.comms.recv_msg()?;
        let comms_fd = self.comms.recv_fd()?;
        let mut exec_fd = None;
        if matches!(
            request.mode,
            ForkMode::ForkExecve | ForkMode::ForkExecveSandbox
        ) {
            // Park the binary above the range client fd mappings may claim.
            let received = self.comms.recv_fd()?;
            // SAFETY: dup2 closes any previous occupant of the target slot.
            let ret = unsafe { libc::dup2(received.as_raw_fd(), TARGET_EXEC_FD) };
            if ret == -1 {
                return Err(WardenError::Io(std::io::Error::last_os_error()));
            }
            // SAFETY: we own the fresh duplicate.
            exec_fd = Some(unsafe { OwnedFd::from_raw_fd(TARGET_EXEC_FD) });
        }
        let mut user_ns_fd = None;
        if request.mode == ForkMode::JoinSandboxUnwind {
            user_ns_fd = Some(self.comms.recv_fd()?);
        }

        // The init helper forwards the in-namespace child's PID through this
        // pair as credentials, which the kernel translates for us.
        let (signal_parent, signal_child) = Comms::pair()?;
        signal_parent.enable_cred_passing()?;
        signal_child.enable_cred_passing()?;

        let new_pid_ns = request
            .namespaces
            .as_ref()
            .is_some_and(|ns| ns.pid && request.mode != ForkMode::JoinSandboxUnwind);
        let mut status_pipe = None;
        if request.monitor_kind == MonitorKind::Unotify && new_pid_ns {
            status_pipe = Some(nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?);
        }

        let clone_flags = if request.mode == ForkMode::JoinSandboxUnwind {
            CloneFlags::empty()
        } else {
            request
                .namespaces
                .as_ref()
                .map(NamespaceSpec::clone_flags)
                .unwrap_or_else(CloneFlags::empty)
        };
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();

        let flags = clone_flags.bits() as u64
            | libc::CLONE_UNTRACED as u64
            | libc::SIGCHLD as u64;
        // SAFETY: the fork server is single-threaded; the child path only
        // runs LaunchChild, which execs or exits.
        let pid = unsafe { util::fork_with_flags(flags) }?;
        if pid.as_raw() == 0 {
            drop(signal_parent);
            let status_write = status_pipe.map(|(read, write)| {
                drop(read);
                write
            });
            Self::launch_child(
                &request,
                comms_fd,
                uid,
                gid,
                user_ns_fd,
                &signal_child,
                status_write,
            );
        }
        drop(signal_child);
        drop(comms_fd);
        drop(exec_fd);
        drop(user_ns_fd);

        let mut init_pid = 0;
        let mut main_pid = pid.as_raw();
        if clone_flags.contains(CloneFlags::CLONE_NEWPID) {
            // The direct child became the init helper; the sandboxee is its
            // child and announces itself via SCM_CREDENTIALS.
            init_pid = pid.as_raw();
            match signal_parent.recv_creds() {
                Ok(creds) => main_pid = creds.pid(),
                Err(e) => {
                    tracing::error!(error = %e, "receiving sandboxee pid failed");
                    let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
                    main_pid = -1;
                }
            }
        }

        self.comms.send_i32(init_pid)?;
        self.comms.send_i32(main_pid)?;
        if let Some((read, write)) = status_pipe {
            drop(write);
            self.comms.send_fd(read.as_raw_fd())?;
        }
        Ok(())
    }

    /// Child-side setup; never returns.
    fn launch_child(
        request: &ForkRequest,
        comms_fd: OwnedFd,
        uid: u32,
        gid: u32,
        user_ns_fd: Option<OwnedFd>,
        signal: &Comms,
        status_write: Option<OwnedFd>,
    ) -> ! {
        match Self::launch_child_inner(request, comms_fd, uid, gid, user_ns_fd, signal, status_write)
        {
            Ok(code) => std::process::exit(code),
            Err(e) => {
                tracing::error!(error = %e, "sandboxee setup failed");
                std::process::exit(1);
            }
        }
    }

    fn launch_child_inner(
        request: &ForkRequest,
        comms_fd: OwnedFd,
        uid: u32,
        gid: u32,
        user_ns_fd: Option<OwnedFd>,
        signal: &Comms,
        status_write: Option<OwnedFd>,
    ) -> Result<i32> {
        if request.mode == ForkMode::JoinSandboxUnwind {
            let ns_fd = user_ns_fd
                .ok_or_else(|| WardenError::ForkServer("unwind without user ns fd".into()))?;
            nix::sched::setns(&ns_fd, CloneFlags::CLONE_NEWUSER)?;
            drop(ns_fd);
            nix::sched::unshare(
                CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWIPC | CloneFlags::CLONE_NEWUTS,
            )?;
        }

        let will_execve = matches!(
            request.mode,
            ForkMode::ForkExecve | ForkMode::ForkExecveSandbox
        );
        let mut envs = request.envs.clone();
        envs.push(format!("{NO_FORK_SERVER_ENV}=1"));

        // Pin the supervisor channel at its well-known number, then drop
        // every descriptor the sandboxee has no business inheriting.
        let comms = Comms::from_fd(comms_fd).move_to_fd(CLIENT_COMMS_FD)?;
        let mut keep: BTreeSet<RawFd> = [0, 1, 2, CLIENT_COMMS_FD, signal.fd()].into();
        if will_execve {
            keep.insert(TARGET_EXEC_FD);
        }
        if let Some(fd) = &status_write {
            keep.insert(fd.as_raw_fd());
        }
        sanitizer::close_all_fds_except(&keep)?;

        if request.mode == ForkMode::JoinSandboxUnwind {
            if let Some(ns) = &request.namespaces {
                ns.mounts.apply_and_pivot()?;
            }
        } else if let Some(ns) = &request.namespaces {
            ns.initialize_in_child(uid, gid)?;
        }

        Self::apply_capabilities(&request.capabilities)?;

        if request.namespaces.as_ref().is_some_and(|ns| ns.pid)
            && request.mode != ForkMode::JoinSandboxUnwind
        {
            // Only the sandboxee returns from this.
            Self::run_init_process(signal, status_write)?;
        }

        match request.mode {
            ForkMode::ForkExecve => {
                let (argv, envp) = Self::exec_vectors(&request.args, &envs)?;
                let err = util::execveat_with_magic(TARGET_EXEC_FD, &argv, &envp, EXECVEAT_MAGIC);
                Err(WardenError::Io(err))
            }
            ForkMode::ForkExecveSandbox => {
                let mut client = Client::new(&comms);
                client.prepare_environment()?;
                envs.push(client.fd_map_env_entry());
                let (argv, envp) = Self::exec_vectors(&request.args, &envs)?;
                client.enable_sandbox(request.monitor_kind)?;
                client.wait_for_monitor()?;
                // Nothing but the execveat itself may run from here on; the
                // policy counts on this exact control transfer.
                let err = util::execveat_with_magic(TARGET_EXEC_FD, &argv, &envp, EXECVEAT_MAGIC);
                Err(WardenError::Io(err))
            }
            ForkMode::JoinSandboxUnwind => {
                let mut client = Client::new(&comms);
                client.prepare_environment()?;
                client.enable_sandbox(request.monitor_kind)?;
                client.wait_for_monitor()?;
                crate::unwind::serve_unwind_request(&comms)?;
                Ok(0)
            }
            ForkMode::Fork => {
                let mut client = Client::new(&comms);
                client.prepare_environment()?;
                client.enable_sandbox(request.monitor_kind)?;
                client.wait_for_monitor()?;
                WORKER_ENTRY.get().map_or_else(
                    || {
                        tracing::error!("no worker entry registered for ForkMode::Fork");
                        Ok(1)
                    },
                    |entry| Ok(entry(&comms)),
                )
            }
        }
    }

    fn exec_vectors(args: &[String], envs: &[String]) -> Result<(Vec<CString>, Vec<CString>)> {
        let convert = |items: &[String]| -> Result<Vec<CString>> {
            items
                .iter()
                .map(|s| {
                    CString::new(s.as_bytes()).map_err(|_| {
                        WardenError::ForkServer(format!("NUL byte in exec argument '{s}'"))
                    })
                })
                .collect()
        };
        Ok((convert(args)?, convert(envs)?))
    }

    fn apply_capabilities(requested: &[String]) -> Result<()> {
        use caps::{CapSet, Capability, CapsHashSet};
        let mut set = CapsHashSet::new();
        for name in requested {
            let cap: Capability = name
                .parse()
                .map_err(|_| WardenError::ForkServer(format!("unknown capability '{name}'")))?;
            set.insert(cap);
        }
        for capset in [CapSet::Effective, CapSet::Permitted, CapSet::Inheritable] {
            caps::set(None, capset, &set)
                .map_err(|e| WardenError::ForkServer(format!("applying capabilities: {e}")))?;
        }
        Ok(())
    }

    /// Forks the real sandboxee and turns the current process into the PID
    /// namespace's init: a reaper that only waits and exits, with its own
    /// four-syscall seccomp policy. Returns only in the sandboxee.
    fn run_init_process(signal: &Comms, status_write: Option<OwnedFd>) -> Result<()> {
        // SAFETY: single-threaded at this point; both sides only use
        // fork-safe operations before exec/exit.
        match unsafe { nix::unistd::fork() }? {
            nix::unistd::ForkResult::Child => {
                // The sandboxee. Announce our namespace-translated pid and
                // drop the status pipe; only init writes to it.
                signal.send_creds()?;
                drop(status_write);
                Ok(())
            }
            nix::unistd::ForkResult::Parent { child } => {
                Self::init_process_loop(child, status_write);
            }
        }
    }

    fn init_process_loop(sandboxee: Pid, status_write: Option<OwnedFd>) -> ! {
        let _ = nix::unistd::chdir("/");
        let _ = nix::unistd::setsid();
        let _ = nix::sys::prctl::set_pdeathsig(Signal::SIGKILL);
        let _ = nix::sys::prctl::set_name(c"warden-init");

        let mut keep = BTreeSet::new();
        if let Some(fd) = &status_write {
            keep.insert(fd.as_raw_fd());
        }
        let _ = sanitizer::close_all_fds_except(&keep);

        if Self::apply_init_policy(status_write.is_some()).is_err() {
            std::process::exit(1);
        }

        let mut main_status: Option<(i32, libc::rusage)> = None;
        loop {
            let mut status: libc::c_int = 0;
            // SAFETY: zeroed rusage is valid out-param storage.
            let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
            // SAFETY: out-pointers reference live stack storage.
            let ret = unsafe {
                libc::wait4(
                    -1,
                    std::ptr::from_mut(&mut status),
                    nix::sys::wait::WaitPidFlag::__WALL.bits(),
                    std::ptr::from_mut(&mut rusage),
                )
            };
            if ret == sandboxee.as_raw()
                && (libc::WIFEXITED(status) || libc::WIFSIGNALED(status))
            {
                main_status = Some((status, rusage));
            }
            if ret == -1 {
                let errno = nix::errno::Errno::last();
                if errno == nix::errno::Errno::EINTR {
                    continue;
                }
                if errno == nix::errno::Errno::ECHILD {
                    if let (Some(fd), Some((status, rusage))) = (&status_write, &main_status) {
                        Self::write_status(fd, *status, rusage);
                    }
                    std::process::exit(0);
                }
                std::process::exit(1);
            }
        }
    }

    /// Serializes `(si_code, si_status, rusage)` in host byte order.
    fn write_status(fd: &OwnedFd, status: i32, rusage: &libc::rusage) {
        let (si_code, si_status) = if libc::WIFEXITED(status) {
            (libc::CLD_EXITED, libc::WEXITSTATUS(status))
        } else if libc::WCOREDUMP(status) {
            (libc::CLD_DUMPED, libc::WTERMSIG(status))
        } else {
            (libc::CLD_KILLED, libc::WTERMSIG(status))
        };
        let mut buf = Vec::with_capacity(8 + std::mem::size_of::<libc::rusage>());
        buf.extend_from_slice(&si_code.to_ne_bytes());
        buf.extend_from_slice(&si_status.to_ne_bytes());
        // SAFETY: rusage is plain data.
        let raw = unsafe {
            std::slice::from_raw_parts(
                std::ptr::from_ref(rusage).cast::<u8>(),
                std::mem::size_of::<libc::rusage>(),
            )
        };
        buf.extend_from_slice(raw);
        let _ = nix::unistd::write(fd, &buf);
    }

    fn apply_init_policy(with_status_pipe: bool) -> Result<()> {
        let mut prog = vec![bpf::load_arch()];
        prog.extend(bpf::jne32(crate::syscall::CpuArch::host_audit_arch(), bpf::kill()));
        prog.push(bpf::load_syscall_nr());
        prog.extend(bpf::syscall_nr(libc::SYS_wait4 as u32, bpf::allow()));
        prog.extend(bpf::syscall_nr(libc::SYS_waitid as u32, bpf::allow()));
        prog.extend(bpf::syscall_nr(libc::SYS_exit as u32, bpf::allow()));
        prog.extend(bpf::syscall_nr(libc::SYS_exit_group as u32, bpf::allow()));
        if with_status_pipe {
            prog.extend(bpf::syscall_nr(libc::SYS_write as u32, bpf::allow()));
        }
        prog.push(bpf::kill());
        nix::sys::prctl::set_no_new_privs()?;
        seccompiler::apply_filter(&prog)
            .map_err(|e| WardenError::Policy(format!("init policy: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_requests_serialize() {
        let request = ForkRequest {
            mode: ForkMode::ForkExecveSandbox,
            args: vec!["/bin/true".into()],
            envs: vec!["A=b".into()],
            namespaces: Some(NamespaceSpec::default()),
            capabilities: vec!["CAP_SYS_PTRACE".into()],
            monitor_kind: MonitorKind::Ptrace,
        };
        let bytes = rmp_serde::to_vec(&request).unwrap();
        let back: ForkRequest = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back.mode, ForkMode::ForkExecveSandbox);
        assert_eq!(back.args, request.args);
        assert_eq!(back.capabilities, request.capabilities);
    }

    #[test]
    fn init_policy_assembles_within_limits() {
        // The init reaper's allowlist must stay a valid, tiny program.
        let mut prog = vec![bpf::load_arch()];
        prog.extend(bpf::jne32(crate::syscall::CpuArch::host_audit_arch(), bpf::kill()));
        prog.push(bpf::load_syscall_nr());
        prog.extend(bpf::syscall_nr(libc::SYS_wait4 as u32, bpf::allow()));
        prog.push(bpf::kill());
        assert!(prog.len() < 16);
        let data = libc::seccomp_data {
            nr: libc::SYS_wait4 as i32,
            arch: crate::syscall::CpuArch::host_audit_arch(),
            instruction_pointer: 0,
            args: [0; 6],
        };
        assert_eq!(
            bpf::evaluate(&prog, &data).unwrap(),
            libc::SECCOMP_RET_ALLOW
        );
        let data = libc::seccomp_data {
            nr: libc::SYS_openat as i32,
            arch: crate::syscall::CpuArch::host_audit_arch(),
            instruction_pointer: 0,
            args: [0; 6],
        };
        assert_eq!(
            bpf::evaluate(&prog, &data).unwrap(),
            libc::SECCOMP_RET_KILL_THREAD
        );
    }
}
