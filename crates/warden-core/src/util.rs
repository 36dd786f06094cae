//! Small process and syscall helpers shared across the supervisor.

use crate::{Result, WardenError};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Process start reference used to express deadlines as plain millisecond
/// offsets. Monotonic, never wraps in practice.
static PROCESS_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since the first call into this module.
pub fn now_millis() -> u64 {
    u64::try_from(PROCESS_EPOCH.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Sentinel for "no deadline".
pub const INFINITE_FUTURE: u64 = u64::MAX;

/// Converts a duration from now into an absolute millisecond deadline.
pub fn deadline_after(d: Duration) -> u64 {
    now_millis().saturating_add(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// One-shot notification usable across threads.
///
/// Mirrors the pattern of a bool guarded by a mutex with a condvar; once
/// notified it stays notified.
#[derive(Default)]
pub struct Notification {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Notification {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut fired = self.state.lock();
        *fired = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut fired = self.state.lock();
        while !*fired {
            self.cond.wait(&mut fired);
        }
    }

    /// Waits up to `timeout`; returns whether the notification fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut fired = self.state.lock();
        while !*fired {
            if self.cond.wait_until(&mut fired, deadline).timed_out() {
                return *fired;
            }
        }
        true
    }

    #[must_use]
    pub fn has_been_notified(&self) -> bool {
        *self.state.lock()
    }
}

/// Thread id of the calling thread.
#[must_use]
pub fn gettid() -> Pid {
    nix::unistd::gettid()
}

/// Sends `sig` to a specific thread of a specific process.
pub fn tgkill(tgid: Pid, tid: Pid, sig: i32) -> Result<()> {
    // SAFETY: plain syscall with integer arguments.
    let ret = unsafe { libc::syscall(libc::SYS_tgkill, tgid.as_raw(), tid.as_raw(), sig) };
    if ret == -1 {
        return Err(WardenError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Forks the current process with extra clone flags, sharing the parent's
/// stack the way fork(2) does. Returns `Pid::from_raw(0)` in the child.
///
/// # Safety
/// As with fork(2) in a multi-threaded process, the child may only call
/// async-signal-safe functions until it execs or exits.
pub unsafe fn fork_with_flags(flags: u64) -> Result<Pid> {
    // SAFETY: clone without CLONE_VM and with a null stack behaves like
    // fork(2); the remaining argument slots are ignored when null.
    let ret = unsafe { libc::syscall(libc::SYS_clone, flags, 0u64, 0u64, 0u64, 0u64) };
    if ret == -1 {
        return Err(WardenError::Io(std::io::Error::last_os_error()));
    }
    Ok(Pid::from_raw(ret as libc::pid_t))
}

/// Issues execveat(2) with the magic sixth argument the seccomp prologue
/// recognizes as the supervised control transfer. Only returns on failure.
pub fn execveat_with_magic(
    exec_fd: RawFd,
    argv: &[CString],
    envp: &[CString],
    magic: u64,
) -> std::io::Error {
    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());
    let mut envp_ptrs: Vec<*const libc::c_char> = envp.iter().map(|e| e.as_ptr()).collect();
    envp_ptrs.push(std::ptr::null());
    let empty = c"";
    // SAFETY: pointers stay alive across the call; on success the call does
    // not return at all.
    unsafe {
        libc::syscall(
            libc::SYS_execveat,
            exec_fd,
            empty.as_ptr(),
            argv_ptrs.as_ptr(),
            envp_ptrs.as_ptr(),
            libc::AT_EMPTY_PATH,
            magic,
        );
    }
    std::io::Error::last_os_error()
}

/// Lists the task (thread) ids of a process from procfs.
pub fn list_tasks(pid: Pid) -> Result<BTreeSet<i32>> {
    let dir = format!("/proc/{pid}/task");
    let mut tasks = BTreeSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() {
            tasks.insert(tid);
        }
    }
    Ok(tasks)
}

/// Lists all file descriptors currently open in this process.
pub fn list_open_fds() -> Result<BTreeSet<RawFd>> {
    let mut fds = BTreeSet::new();
    for entry in std::fs::read_dir("/proc/self/fd")? {
        let entry = entry?;
        if let Ok(fd) = entry.file_name().to_string_lossy().parse::<RawFd>() {
            fds.insert(fd);
        }
    }
    Ok(fds)
}

/// Full contents of `/proc/<pid>/maps`, empty on error.
#[must_use]
pub fn read_proc_maps(pid: Pid) -> String {
    std::fs::read_to_string(format!("/proc/{pid}/maps")).unwrap_or_default()
}

/// Short program name of a process, empty on error.
#[must_use]
pub fn prog_name(pid: Pid) -> String {
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .map(|s| s.trim_end().to_string())
        .unwrap_or_default()
}

/// Command line of a process with NUL separators turned into spaces.
#[must_use]
pub fn cmdline(pid: Pid) -> String {
    std::fs::read_to_string(format!("/proc/{pid}/cmdline"))
        .map(|s| s.replace('\0', " ").trim_end().to_string())
        .unwrap_or_default()
}

/// Reads a single field from `/proc/<pid>/status`.
#[must_use]
pub fn proc_status_line(pid: Pid, key: &str) -> String {
    let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) else {
        return String::new();
    };
    status
        .lines()
        .find_map(|line| {
            line.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix(':'))
                .map(|rest| rest.trim().to_string())
        })
        .unwrap_or_default()
}

/// Human-readable signal name for logs.
#[must_use]
pub fn signal_name(sig: i32) -> String {
    nix::sys::signal::Signal::try_from(sig)
        .map_or_else(|_| format!("signal {sig}"), |s| s.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_fires_once_and_stays() {
        let n = Notification::new();
        assert!(!n.has_been_notified());
        n.notify();
        assert!(n.has_been_notified());
        n.wait();
        assert!(n.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn notification_wait_timeout_expires() {
        let n = Notification::new();
        assert!(!n.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn own_task_list_contains_self() {
        let tasks = list_tasks(nix::unistd::getpid()).unwrap();
        assert!(tasks.contains(&nix::unistd::getpid().as_raw()));
    }

    #[test]
    fn open_fds_contain_stdio() {
        let fds = list_open_fds().unwrap();
        assert!(fds.contains(&0));
        assert!(fds.contains(&1));
    }

    #[test]
    fn deadlines_are_monotonic() {
        let a = now_millis();
        let b = deadline_after(Duration::from_millis(50));
        assert!(b >= a + 50);
    }
}
