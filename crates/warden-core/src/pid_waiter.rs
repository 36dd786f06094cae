//! Batched, priority-aware waitpid wrapper used by the monitors.
//!
//! waitpid(2) is biased towards newer threads; a sandboxee spawning children
//! at a high rate could starve the main PID's exit event. Events are drained
//! in batches and handed out one at a time, with the priority PID re-checked
//! periodically during a drain.

use crate::deadline::{DeadlineManager, DeadlineRegistration};
use crate::util::{self, INFINITE_FUTURE};
use nix::sys::wait::WaitPidFlag;
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const MAX_BATCH: usize = 1000;
const PRIORITY_CHECK_PERIOD: usize = 100;

/// One reaped event.
pub struct WaitEvent {
    pub pid: Pid,
    pub status: i32,
    pub rusage: libc::rusage,
}

/// Wakes a [`PidWaiter`] blocked in waitpid from another thread.
#[derive(Clone)]
pub struct PidWaiterNotifier {
    notified: Arc<AtomicBool>,
    registration: Arc<DeadlineRegistration<'static>>,
    // Orders notification against the waiter's deadline re-arm; without it a
    // notification landing between the notified-flag check and the re-arm
    // would be absorbed until the next deadline.
    sync: Arc<Mutex<()>>,
}

impl PidWaiterNotifier {
    /// Forces the waiter's next (or current) blocking wait to return
    /// immediately so its owner re-examines its state.
    pub fn notify(&self) {
        let _guard = self.sync.lock();
        self.notified.store(true, Ordering::Release);
        self.registration.set_deadline(0);
    }
}

/// Non-blocking batched waiter owned by one monitor thread.
pub struct PidWaiter {
    priority_pid: Pid,
    deadline_ms: u64,
    notified: Arc<AtomicBool>,
    registration: Arc<DeadlineRegistration<'static>>,
    sync: Arc<Mutex<()>>,
    statuses: VecDeque<WaitEvent>,
    last_errno: i32,
}

impl PidWaiter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            priority_pid: Pid::from_raw(-1),
            deadline_ms: INFINITE_FUTURE,
            notified: Arc::new(AtomicBool::new(false)),
            registration: Arc::new(DeadlineRegistration::new(DeadlineManager::global())),
            sync: Arc::new(Mutex::new(())),
            statuses: VecDeque::new(),
            last_errno: 0,
        }
    }

    /// The PID whose events must not be starved; checked first during every
    /// priority-check period of a drain.
    pub fn set_priority_pid(&mut self, pid: Pid) {
        self.priority_pid = pid;
    }

    /// Deadline for the next blocking [`PidWaiter::wait`] call.
    pub fn set_deadline(&mut self, deadline_ms: u64) {
        self.deadline_ms = deadline_ms;
    }

    /// Handle for waking this waiter from other threads.
    #[must_use]
    pub fn notifier(&self) -> PidWaiterNotifier {
        PidWaiterNotifier {
            notified: Arc::clone(&self.notified),
            registration: Arc::clone(&self.registration),
            sync: Arc::clone(&self.sync),
        }
    }

    /// Returns the next `(pid, status, rusage)` event, `Ok(None)` when no
    /// event is pending, or the waitpid errno (`ECHILD` once every child is
    /// gone; `EINTR` when the deadline or a notification interrupted the
    /// blocking wait).
    pub fn wait(&mut self) -> std::result::Result<Option<WaitEvent>, nix::errno::Errno> {
        self.refill_statuses();
        if let Some(event) = self.statuses.pop_front() {
            return Ok(Some(event));
        }
        if self.last_errno == 0 {
            return Ok(None);
        }
        let errno = nix::errno::Errno::from_raw(self.last_errno);
        self.last_errno = 0;
        Err(errno)
    }

    /// One wait4 probe. Returns true when an event or error was recorded.
    fn check_status(&mut self, pid: Pid, blocking: bool) -> bool {
        let mut flags = WaitPidFlag::__WNOTHREAD | WaitPidFlag::__WALL | WaitPidFlag::WUNTRACED;
        if !blocking {
            flags |= WaitPidFlag::WNOHANG;
        }
        let mut status: libc::c_int = 0;
        // SAFETY: zeroed rusage is valid out-param storage.
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
        // SAFETY: all out-pointers reference live stack storage.
        let ret = unsafe {
            libc::wait4(
                pid.as_raw(),
                std::ptr::from_mut(&mut status),
                flags.bits(),
                std::ptr::from_mut(&mut rusage),
            )
        };
        match ret {
            -1 => {
                self.last_errno = nix::errno::Errno::last_raw();
                true
            }
            0 => false,
            child => {
                self.statuses.push_back(WaitEvent {
                    pid: Pid::from_raw(child),
                    status,
                    rusage,
                });
                true
            }
        }
    }

    fn refill_statuses(&mut self) {
        if !self.statuses.is_empty() {
            self.notified.store(false, Ordering::Release);
            return;
        }
        let any_pid = Pid::from_raw(-1);
        for i in 0..MAX_BATCH {
            if self.last_errno != 0 {
                break;
            }
            let should_check_priority =
                self.priority_pid.as_raw() != -1 && i % PRIORITY_CHECK_PERIOD == 0;
            if should_check_priority && self.check_status(self.priority_pid, false) {
                self.notified.store(false, Ordering::Release);
                return;
            }
            if !self.check_status(any_pid, false) {
                break;
            }
        }
        let should_block = {
            let _guard = self.sync.lock();
            let armed = self.statuses.is_empty()
                && self.last_errno == 0
                && self.deadline_ms != 0
                && !self.notified.swap(false, Ordering::AcqRel);
            if armed {
                self.registration.set_deadline(self.deadline_ms);
            }
            armed
        };
        if should_block {
            // The deadline signal interrupts the blocking wait with EINTR.
            let mut recorded: Option<(i32, i32, libc::rusage)> = None;
            self.registration.execute_blocking_syscall(|| {
                let flags =
                    WaitPidFlag::__WNOTHREAD | WaitPidFlag::__WALL | WaitPidFlag::WUNTRACED;
                let mut status: libc::c_int = 0;
                // SAFETY: zeroed rusage is valid out-param storage.
                let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
                // SAFETY: all out-pointers reference live stack storage.
                let ret = unsafe {
                    libc::wait4(
                        -1,
                        std::ptr::from_mut(&mut status),
                        flags.bits(),
                        std::ptr::from_mut(&mut rusage),
                    )
                };
                recorded = Some((ret, status, rusage));
            });
            match recorded {
                Some((-1, ..)) => self.last_errno = nix::errno::Errno::last_raw(),
                Some((child, status, rusage)) if child > 0 => {
                    self.statuses.push_back(WaitEvent {
                        pid: Pid::from_raw(child),
                        status,
                        rusage,
                    });
                }
                _ => {}
            }
        }
        self.notified.store(false, Ordering::Release);
    }
}

impl Default for PidWaiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reaps_children_and_reports_echild() {
        let mut waiter = PidWaiter::new();
        waiter.set_deadline(util::deadline_after(Duration::from_secs(2)));

        let children: Vec<_> = (0..3)
            .map(|_| {
                std::process::Command::new("/bin/true")
                    .spawn()
                    .expect("spawning /bin/true")
            })
            .collect();
        let mut expected: std::collections::BTreeSet<i32> =
            children.iter().map(|c| c.id() as i32).collect();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !expected.is_empty() {
            assert!(std::time::Instant::now() < deadline, "children not reaped");
            match waiter.wait() {
                Ok(Some(event)) => {
                    assert!(libc::WIFEXITED(event.status));
                    expected.remove(&event.pid.as_raw());
                }
                Ok(None) => {}
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => panic!("unexpected wait error: {e}"),
            }
        }

        // With every child reaped the kernel reports ECHILD.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            assert!(std::time::Instant::now() < deadline, "no ECHILD observed");
            waiter.set_deadline(util::deadline_after(Duration::from_millis(100)));
            match waiter.wait() {
                Err(nix::errno::Errno::ECHILD) => break,
                Ok(_) | Err(_) => {}
            }
        }
    }

    #[test]
    fn notifier_unblocks_a_waiting_thread() {
        let mut waiter = PidWaiter::new();
        waiter.set_deadline(INFINITE_FUTURE);
        let notifier = waiter.notifier();
        notifier.notify();
        // The notification is consumed without blocking; with no children we
        // observe ECHILD or no event, never a hang.
        let start = std::time::Instant::now();
        let _ = waiter.wait();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
