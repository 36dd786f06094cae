//! Wall-clock deadline delivery for blocking syscalls.
//!
//! One helper thread watches a queue of registrations sorted by absolute
//! deadline (rounded up to a 10 ms resolution). When a deadline fires while
//! its owner sits in a blocking syscall, the thread is signaled with a
//! dedicated realtime signal whose no-op handler makes the syscall return
//! `EINTR`; the signal repeats every resolution tick until the blocking call
//! returns, closing the race between signaling and actually entering the
//! syscall.

use crate::util::{self, INFINITE_FUTURE};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Deadline granularity; also the re-signal period.
pub const RESOLUTION: Duration = Duration::from_millis(10);
const RESOLUTION_MS: u64 = 10;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

/// The signal reserved for deadline delivery, installed exactly once per
/// process and never used for anything else.
fn deadline_signal() -> i32 {
    static SIGNAL: Lazy<i32> = Lazy::new(|| {
        // SAFETY: the handler body is trivially async-signal-safe (it does
        // nothing); its only purpose is interrupting syscalls.
        let sig = libc::SIGRTMAX() - 1;
        unsafe {
            signal_hook::low_level::register(sig, || {}).expect("registering deadline signal");
        }
        sig
    });
    *SIGNAL
}

fn round_up(deadline_ms: u64) -> u64 {
    if deadline_ms == INFINITE_FUTURE {
        return INFINITE_FUTURE;
    }
    deadline_ms.div_ceil(RESOLUTION_MS) * RESOLUTION_MS
}

#[derive(Debug)]
struct RegState {
    deadline_ms: u64,
    tid: Option<nix::unistd::Pid>,
    in_blocking_fn: bool,
    expired: bool,
    queue_key: Option<(u64, u64)>,
}

struct Registration {
    seq: u64,
    state: Mutex<RegState>,
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

struct Queue {
    entries: BTreeMap<(u64, u64), Arc<Registration>>,
    cancelled: bool,
}

/// Engine delivering deadline notifications; normally used through the
/// process-wide [`DeadlineManager::global`] instance.
pub struct DeadlineManager {
    shared: Arc<Shared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DeadlineManager {
    /// The process-wide instance, started lazily on first use.
    pub fn global() -> &'static Self {
        static GLOBAL: Lazy<DeadlineManager> = Lazy::new(|| DeadlineManager::new("deadline-manager"));
        &GLOBAL
    }

    /// Starts a dedicated manager; tests use private instances.
    #[must_use]
    pub fn new(name: &str) -> Self {
        deadline_signal();
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                entries: BTreeMap::new(),
                cancelled: false,
            }),
            wakeup: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(&thread_shared))
            .expect("spawning deadline manager thread");
        Self {
            shared,
            thread: Some(thread),
        }
    }

    fn run(shared: &Shared) {
        let own_pid = nix::unistd::getpid();
        let mut queue = shared.queue.lock();
        loop {
            if queue.cancelled {
                return;
            }
            let next = queue.entries.keys().next().copied();
            match next {
                None => shared.wakeup.wait(&mut queue),
                Some((deadline_ms, _)) => {
                    let now = util::now_millis();
                    if now < deadline_ms {
                        let timeout = Duration::from_millis(deadline_ms - now);
                        let deadline = std::time::Instant::now() + timeout;
                        let _ = shared.wakeup.wait_until(&mut queue, deadline);
                        continue;
                    }
                    let next_tick = round_up(now.saturating_add(RESOLUTION_MS));
                    while let Some((&key, _)) = queue.entries.first_key_value() {
                        if key.0 > now {
                            break;
                        }
                        let entry = queue.entries.remove(&key).expect("key just observed");
                        let mut state = entry.state.lock();
                        state.expired = true;
                        state.queue_key = None;
                        if state.in_blocking_fn {
                            if let Some(tid) = state.tid {
                                if let Err(e) = util::tgkill(own_pid, tid, deadline_signal()) {
                                    tracing::warn!(?tid, error = %e, "deadline signal failed");
                                }
                            }
                            // Re-signal at the next tick until the blocking
                            // call actually returns.
                            state.deadline_ms = next_tick;
                            state.queue_key = Some((next_tick, entry.seq));
                            drop(state);
                            queue.entries.insert((next_tick, entry.seq), entry);
                        }
                    }
                }
            }
        }
    }

    fn adjust(&self, registration: &Arc<Registration>, deadline_ms: u64) {
        let rounded = round_up(deadline_ms);
        let mut queue = self.shared.queue.lock();
        let mut state = registration.state.lock();
        if let Some(key) = state.queue_key.take() {
            queue.entries.remove(&key);
        }
        state.deadline_ms = rounded;
        state.expired = false;
        if rounded != INFINITE_FUTURE {
            state.queue_key = Some((rounded, registration.seq));
            drop(state);
            queue.entries.insert((rounded, registration.seq), Arc::clone(registration));
        }
        drop(queue);
        self.wake();
    }

    fn remove(&self, registration: &Arc<Registration>) {
        let mut queue = self.shared.queue.lock();
        let mut state = registration.state.lock();
        if let Some(key) = state.queue_key.take() {
            queue.entries.remove(&key);
        }
        drop(state);
        drop(queue);
        self.wake();
    }

    fn wake(&self) {
        self.shared.wakeup.notify_all();
    }
}

impl Drop for DeadlineManager {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.cancelled = true;
        }
        self.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Per-thread handle for interrupting one blocking syscall at a preset time.
///
/// The blocking call itself must only ever run on the owning thread; the
/// deadline may be updated from any thread.
pub struct DeadlineRegistration<'m> {
    manager: &'m DeadlineManager,
    registration: Arc<Registration>,
    last_deadline: AtomicU64,
}

impl<'m> DeadlineRegistration<'m> {
    #[must_use]
    pub fn new(manager: &'m DeadlineManager) -> Self {
        Self {
            manager,
            registration: Arc::new(Registration {
                seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(RegState {
                    deadline_ms: INFINITE_FUTURE,
                    tid: None,
                    in_blocking_fn: false,
                    expired: false,
                    queue_key: None,
                }),
            }),
            last_deadline: AtomicU64::new(INFINITE_FUTURE),
        }
    }

    /// Sets the absolute deadline in [`util::now_millis`] time;
    /// [`INFINITE_FUTURE`] disarms. Callable from any thread.
    pub fn set_deadline(&self, deadline_ms: u64) {
        if self.last_deadline.swap(deadline_ms, Ordering::AcqRel) == deadline_ms {
            return;
        }
        self.manager.adjust(&self.registration, deadline_ms);
    }

    /// Runs `blocking_fn`, arranging for the deadline signal to interrupt
    /// it. The function is skipped entirely when the deadline has already
    /// expired.
    pub fn execute_blocking_syscall(&self, blocking_fn: impl FnOnce()) {
        {
            let mut state = self.registration.state.lock();
            state.tid = Some(util::gettid());
            if state.expired || state.deadline_ms <= util::now_millis() {
                return;
            }
            state.in_blocking_fn = true;
        }
        blocking_fn();
        let mut state = self.registration.state.lock();
        state.in_blocking_fn = false;
    }
}

impl Drop for DeadlineRegistration<'_> {
    fn drop(&mut self) {
        self.manager.remove(&self.registration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn rounding_goes_up_to_resolution() {
        assert_eq!(round_up(1), 10);
        assert_eq!(round_up(10), 10);
        assert_eq!(round_up(11), 20);
        assert_eq!(round_up(INFINITE_FUTURE), INFINITE_FUTURE);
    }

    #[test]
    fn expired_deadline_skips_the_blocking_fn() {
        let manager = DeadlineManager::new("test-expired");
        let reg = DeadlineRegistration::new(&manager);
        reg.set_deadline(util::now_millis().saturating_sub(100));
        std::thread::sleep(2 * RESOLUTION);
        let mut ran = false;
        reg.execute_blocking_syscall(|| ran = true);
        assert!(!ran);
    }

    #[test]
    fn interrupts_a_blocking_read() {
        let manager = DeadlineManager::new("test-interrupt");
        let reg = DeadlineRegistration::new(&manager);
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        reg.set_deadline(util::deadline_after(Duration::from_millis(50)));

        let start = std::time::Instant::now();
        let mut last_err = None;
        reg.execute_blocking_syscall(|| {
            let mut buf = [0u8; 1];
            loop {
                match nix::unistd::read(&read_end, &mut buf) {
                    Err(e) => {
                        last_err = Some(e);
                        break;
                    }
                    Ok(_) => {}
                }
            }
        });
        let elapsed = start.elapsed();
        assert_eq!(last_err, Some(nix::errno::Errno::EINTR));
        assert!(elapsed >= Duration::from_millis(40), "returned too early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "returned too late: {elapsed:?}");
    }

    #[test]
    fn disarming_prevents_interruption() {
        let manager = DeadlineManager::new("test-disarm");
        let reg = DeadlineRegistration::new(&manager);
        reg.set_deadline(util::deadline_after(Duration::from_millis(30)));
        reg.set_deadline(INFINITE_FUTURE);
        let mut ran = false;
        reg.execute_blocking_syscall(|| ran = true);
        assert!(ran);
    }
}
