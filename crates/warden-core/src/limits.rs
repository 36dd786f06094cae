//! Resource limits applied to the sandboxee before its event loop starts.

use crate::{Result, WardenError};
use nix::unistd::Pid;
use std::time::Duration;

/// rlimits plus the supervisor-enforced wall-time limit.
#[derive(Debug, Clone)]
pub struct Limits {
    rlimit_as: u64,
    rlimit_cpu: u64,
    rlimit_fsize: u64,
    rlimit_nofile: u64,
    rlimit_core: u64,
    wall_time_limit: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            rlimit_as: libc::RLIM_INFINITY,
            rlimit_cpu: 1024,
            rlimit_fsize: 8 << 30,
            rlimit_nofile: 1024,
            rlimit_core: 0,
            wall_time_limit: Duration::from_secs(120),
        }
    }
}

impl Limits {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn rlimit_as(mut self, bytes: u64) -> Self {
        self.rlimit_as = bytes;
        self
    }

    #[must_use]
    pub const fn rlimit_cpu(mut self, seconds: u64) -> Self {
        self.rlimit_cpu = seconds;
        self
    }

    #[must_use]
    pub const fn rlimit_fsize(mut self, bytes: u64) -> Self {
        self.rlimit_fsize = bytes;
        self
    }

    #[must_use]
    pub const fn rlimit_nofile(mut self, count: u64) -> Self {
        self.rlimit_nofile = count;
        self
    }

    #[must_use]
    pub const fn rlimit_core(mut self, bytes: u64) -> Self {
        self.rlimit_core = bytes;
        self
    }

    /// Zero disarms the wall-time timer.
    #[must_use]
    pub const fn wall_time_limit(mut self, limit: Duration) -> Self {
        self.wall_time_limit = limit;
        self
    }

    #[must_use]
    pub const fn get_wall_time_limit(&self) -> Duration {
        self.wall_time_limit
    }

    /// Applies every rlimit to the target process via prlimit(2).
    pub fn apply(&self, pid: Pid) -> Result<()> {
        self.apply_one(pid, libc::RLIMIT_AS, self.rlimit_as)?;
        self.apply_one(pid, libc::RLIMIT_CPU, self.rlimit_cpu)?;
        self.apply_one(pid, libc::RLIMIT_FSIZE, self.rlimit_fsize)?;
        self.apply_one(pid, libc::RLIMIT_NOFILE, self.rlimit_nofile)?;
        self.apply_one(pid, libc::RLIMIT_CORE, self.rlimit_core)?;
        Ok(())
    }

    fn apply_one(&self, pid: Pid, resource: libc::__rlimit_resource_t, value: u64) -> Result<()> {
        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: out-pointer to a valid rlimit struct.
        let ret = unsafe {
            libc::prlimit(pid.as_raw(), resource, std::ptr::null(), &mut current)
        };
        if ret == 0 && value > current.rlim_max {
            // Raising past the hard cap would fail; stick with the current
            // (already stricter) limits.
            tracing::warn!(
                resource,
                wanted = value,
                hard_cap = current.rlim_max,
                "requested limit above hard cap, keeping current"
            );
            return Ok(());
        }
        let wanted = libc::rlimit {
            rlim_cur: value,
            rlim_max: value,
        };
        // SAFETY: in-pointer to a valid rlimit struct.
        let ret = unsafe { libc::prlimit(pid.as_raw(), resource, &wanted, std::ptr::null_mut()) };
        if ret == -1 {
            return Err(WardenError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_chain() {
        let limits = Limits::new()
            .rlimit_as(1 << 30)
            .rlimit_cpu(10)
            .wall_time_limit(Duration::from_secs(1));
        assert_eq!(limits.get_wall_time_limit(), Duration::from_secs(1));
        assert_eq!(limits.rlimit_as, 1 << 30);
    }

    #[test]
    fn applies_to_self_without_raising_hard_caps() {
        // Applying the defaults to ourselves must not error even where the
        // hard caps are lower than the defaults.
        Limits::new().apply(nix::unistd::getpid()).unwrap();
    }
}
