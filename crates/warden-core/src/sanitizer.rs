//! Descriptor hygiene for freshly forked sandboxees.

use crate::util;
use crate::{Result, WardenError};
use std::collections::BTreeSet;
use std::os::unix::io::{BorrowedFd, RawFd};

/// Closes every open descriptor not in `keep`.
pub fn close_all_fds_except(keep: &BTreeSet<RawFd>) -> Result<()> {
    let open = util::list_open_fds()?;
    for fd in open {
        if keep.contains(&fd) {
            continue;
        }
        // The snapshot can contain the (already closed) directory fd used to
        // read /proc/self/fd; EBADF is expected there.
        let _ = nix::unistd::close(fd);
    }
    Ok(())
}

/// Marks every open descriptor not in `keep` close-on-exec.
pub fn mark_all_fds_cloexec(keep: &BTreeSet<RawFd>) -> Result<()> {
    use nix::fcntl::{FcntlArg, FdFlag, fcntl};
    for fd in util::list_open_fds()? {
        if keep.contains(&fd) {
            continue;
        }
        // SAFETY: fd comes from the live /proc/self/fd listing.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(e) = fcntl(borrowed, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)) {
            if e != nix::errno::Errno::EBADF {
                return Err(WardenError::Nix(e));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn cloexec_marking_skips_kept_fds() {
        use nix::fcntl::{FcntlArg, fcntl};
        let file = std::fs::File::open("/proc/self/status").unwrap();
        let fd = file.as_raw_fd();
        let keep: BTreeSet<RawFd> = [0, 1, 2, fd].into_iter().collect();
        mark_all_fds_cloexec(&keep).unwrap();
        let flags = fcntl(&file, FcntlArg::F_GETFD).unwrap();
        assert_eq!(flags & libc::FD_CLOEXEC, 0, "kept fd must stay inheritable");
    }
}
