//! Fluent builder for sandbox policies.
//!
//! BPF clauses are emitted in insertion order and the first match wins:
//! re-adding a syscall through `allow_syscall`/`block_syscall_with_errno`
//! is a no-op, which keeps the composite helpers freely stackable.

use crate::bpf::{self, BpfLabels, sock_filter};
use crate::mounts::MountTree;
use crate::namespaces::NamespaceSpec;
use crate::policy::{Policy, StackTracePolicy};
use crate::{Result, WardenError};
use std::collections::BTreeSet;
use std::path::Path;

#[cfg(target_arch = "x86_64")]
const ARCH_SET_FS: u32 = 0x1002;

/// Builds a [`Policy`] one clause at a time.
///
/// Errors raised along the way are deferred: the first one is kept and
/// reported by [`PolicyBuilder::try_build`], so call chains stay fluent.
pub struct PolicyBuilder {
    user_policy: Vec<sock_filter>,
    handled_syscalls: BTreeSet<u64>,
    error: Option<WardenError>,
    use_namespaces: bool,
    mounts: MountTree,
    hostname: Option<String>,
    allow_unrestricted_networking: bool,
    capabilities: Vec<String>,
    stack_traces: StackTracePolicy,
    track_all_syscalls: bool,
    collect_all_threads: bool,
}

impl Default for PolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            user_policy: Vec::new(),
            handled_syscalls: BTreeSet::new(),
            error: None,
            use_namespaces: true,
            mounts: MountTree::new(),
            hostname: None,
            allow_unrestricted_networking: false,
            capabilities: Vec::new(),
            stack_traces: StackTracePolicy::default(),
            track_all_syscalls: false,
            collect_all_threads: false,
        }
    }

    fn set_error(&mut self, error: WardenError) {
        tracing::error!(%error, "policy builder error");
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Unconditionally allows one syscall. No-op if the number was already
    /// handled by an allow or errno-block.
    #[must_use]
    pub fn allow_syscall(mut self, nr: u64) -> Self {
        if self.handled_syscalls.insert(nr) {
            self.user_policy
                .extend(bpf::syscall_nr(nr as u32, bpf::allow()));
        }
        self
    }

    #[must_use]
    pub fn allow_syscalls(mut self, nrs: &[u64]) -> Self {
        for &nr in nrs {
            self = self.allow_syscall(nr);
        }
        self
    }

    /// Denies one syscall by making it fail with `error` instead of running.
    #[must_use]
    pub fn block_syscall_with_errno(mut self, nr: u64, error: i32) -> Self {
        if self.handled_syscalls.insert(nr) {
            self.user_policy
                .extend(bpf::syscall_nr(nr as u32, bpf::errno(error as u16)));
        }
        self
    }

    /// Runs `policy` only when the syscall number matches one of `nrs`. The
    /// snippet sees the first argument-load state and may use labels from
    /// the passed scope; it falls through to later clauses on no match.
    #[must_use]
    pub fn add_policy_on_syscalls_with<F>(mut self, nrs: &[u64], f: F) -> Self
    where
        F: FnOnce(&mut BpfLabels) -> Vec<sock_filter>,
    {
        let mut l = BpfLabels::new();
        let mut out = Vec::new();
        for &nr in nrs {
            out.extend(bpf::syscall_nr(nr as u32, l.jump("do_policy")));
        }
        out.push(l.jump("dont_do_policy"));
        out.push(l.label("do_policy"));
        out.extend(f(&mut l));
        // Syscall-number reload keeps the accumulator contract for the next
        // clause when the snippet falls through.
        out.push(bpf::load_syscall_nr());
        out.push(l.label("dont_do_policy"));
        if let Err(e) = bpf::resolve_jumps(&l, &mut out) {
            self.set_error(e);
            return self;
        }
        self.user_policy.extend(out);
        self
    }

    #[must_use]
    pub fn add_policy_on_syscalls(self, nrs: &[u64], policy: Vec<sock_filter>) -> Self {
        self.add_policy_on_syscalls_with(nrs, move |_| policy)
    }

    #[must_use]
    pub fn add_policy_on_syscall(self, nr: u64, policy: Vec<sock_filter>) -> Self {
        self.add_policy_on_syscalls(&[nr], policy)
    }

    #[must_use]
    pub fn add_policy_on_syscall_with<F>(self, nr: u64, f: F) -> Self
    where
        F: FnOnce(&mut BpfLabels) -> Vec<sock_filter>,
    {
        self.add_policy_on_syscalls_with(&[nr], f)
    }

    /// Attaches a snippet to whichever mmap variant this platform uses.
    #[must_use]
    pub fn add_policy_on_mmap_with<F>(self, f: F) -> Self
    where
        F: FnOnce(&mut BpfLabels) -> Vec<sock_filter>,
    {
        self.add_policy_on_syscall_with(libc::SYS_mmap as u64, f)
    }

    /// Appends an unconditional ALLOW; everything not matched earlier is
    /// let through. For debugging only.
    #[must_use]
    pub fn danger_default_allow_all(mut self) -> Self {
        self.user_policy.push(bpf::allow());
        self
    }

    /// Emits a program that traces every syscall instead of filtering, so
    /// the monitor can log them. For debugging only.
    #[must_use]
    pub const fn danger_track_all_syscalls(mut self) -> Self {
        self.track_all_syscalls = true;
        self
    }

    // ---- composite allow helpers ----

    #[must_use]
    pub fn allow_exit(self) -> Self {
        self.allow_syscalls(&[libc::SYS_exit as u64, libc::SYS_exit_group as u64])
    }

    #[must_use]
    pub fn allow_mmap(self) -> Self {
        self.allow_syscall(libc::SYS_mmap as u64)
    }

    #[must_use]
    pub fn allow_open(self) -> Self {
        #[cfg(not(target_arch = "aarch64"))]
        let this = self.allow_syscall(libc::SYS_open as u64);
        #[cfg(target_arch = "aarch64")]
        let this = self;
        this.allow_syscall(libc::SYS_openat as u64)
    }

    #[must_use]
    pub fn allow_stat(self) -> Self {
        #[cfg(not(target_arch = "aarch64"))]
        let this = self.allow_syscalls(&[
            libc::SYS_stat as u64,
            libc::SYS_lstat as u64,
        ]);
        #[cfg(target_arch = "aarch64")]
        let this = self;
        this.allow_syscalls(&[
            libc::SYS_fstat as u64,
            libc::SYS_newfstatat as u64,
            libc::SYS_statfs as u64,
        ])
    }

    #[must_use]
    pub fn allow_read(self) -> Self {
        self.allow_syscalls(&[
            libc::SYS_read as u64,
            libc::SYS_readv as u64,
            libc::SYS_preadv as u64,
            libc::SYS_pread64 as u64,
        ])
    }

    #[must_use]
    pub fn allow_write(self) -> Self {
        self.allow_syscalls(&[
            libc::SYS_write as u64,
            libc::SYS_writev as u64,
            libc::SYS_pwritev as u64,
            libc::SYS_pwrite64 as u64,
        ])
    }

    #[must_use]
    pub fn allow_readdir(self) -> Self {
        #[cfg(not(target_arch = "aarch64"))]
        let this = self.allow_syscall(libc::SYS_getdents as u64);
        #[cfg(target_arch = "aarch64")]
        let this = self;
        this.allow_syscall(libc::SYS_getdents64 as u64)
    }

    #[must_use]
    pub fn allow_safe_fcntl(self) -> Self {
        let mut policy = vec![bpf::arg32(1)];
        for cmd in [
            libc::F_GETFD,
            libc::F_SETFD,
            libc::F_GETFL,
            libc::F_SETFL,
            libc::F_GETLK,
            libc::F_SETLK,
            libc::F_SETLKW,
            libc::F_DUPFD,
            libc::F_DUPFD_CLOEXEC,
        ] {
            policy.extend(bpf::jeq32(cmd as u32, bpf::allow()));
        }
        self.add_policy_on_syscall(libc::SYS_fcntl as u64, policy)
    }

    #[must_use]
    pub fn allow_fork(self) -> Self {
        #[cfg(not(target_arch = "aarch64"))]
        let this = self.allow_syscalls(&[libc::SYS_fork as u64, libc::SYS_vfork as u64]);
        #[cfg(target_arch = "aarch64")]
        let this = self;
        this.allow_syscall(libc::SYS_clone as u64)
    }

    #[must_use]
    pub fn allow_wait(self) -> Self {
        self.allow_syscalls(&[libc::SYS_wait4 as u64, libc::SYS_waitid as u64])
    }

    #[must_use]
    pub fn allow_handle_signals(self) -> Self {
        self.allow_syscalls(&[
            libc::SYS_rt_sigaction as u64,
            libc::SYS_rt_sigreturn as u64,
            libc::SYS_rt_sigprocmask as u64,
            libc::SYS_sigaltstack as u64,
        ])
    }

    #[must_use]
    pub fn allow_tcgets(self) -> Self {
        self.add_policy_on_syscall(
            libc::SYS_ioctl as u64,
            {
                let mut p = vec![bpf::arg32(1)];
                p.extend(bpf::jeq32(libc::TCGETS as u32, bpf::allow()));
                p
            },
        )
    }

    #[must_use]
    pub fn allow_time(self) -> Self {
        #[cfg(not(target_arch = "aarch64"))]
        let this = self.allow_syscall(libc::SYS_time as u64);
        #[cfg(target_arch = "aarch64")]
        let this = self;
        this.allow_syscalls(&[
            libc::SYS_gettimeofday as u64,
            libc::SYS_clock_gettime as u64,
        ])
    }

    #[must_use]
    pub fn allow_sleep(self) -> Self {
        self.allow_syscalls(&[
            libc::SYS_clock_nanosleep as u64,
            libc::SYS_nanosleep as u64,
        ])
    }

    #[must_use]
    pub fn allow_get_ids(self) -> Self {
        self.allow_syscalls(&[
            libc::SYS_getuid as u64,
            libc::SYS_geteuid as u64,
            libc::SYS_getresuid as u64,
            libc::SYS_getgid as u64,
            libc::SYS_getegid as u64,
            libc::SYS_getresgid as u64,
            libc::SYS_getgroups as u64,
        ])
    }

    #[must_use]
    pub fn allow_get_pids(self) -> Self {
        self.allow_syscalls(&[
            libc::SYS_getpid as u64,
            libc::SYS_getppid as u64,
            libc::SYS_gettid as u64,
        ])
    }

    #[must_use]
    pub fn allow_get_rlimit(self) -> Self {
        self.allow_syscalls(&[libc::SYS_getrlimit as u64, libc::SYS_prlimit64 as u64])
    }

    #[must_use]
    pub fn allow_set_rlimit(self) -> Self {
        self.allow_syscall(libc::SYS_setrlimit as u64)
    }

    #[must_use]
    pub fn allow_get_random(self) -> Self {
        let mut policy = vec![bpf::arg32(2)];
        policy.extend(bpf::jeq32(0, bpf::allow()));
        policy.extend(bpf::jeq32(libc::GRND_NONBLOCK, bpf::allow()));
        self.add_policy_on_syscall(libc::SYS_getrandom as u64, policy)
    }

    /// Allows one futex operation regardless of the private/clock flag bits.
    #[must_use]
    pub fn allow_futex_op(self, op: i32) -> Self {
        let mut policy = vec![bpf::arg32(1), bpf::and32(libc::FUTEX_CMD_MASK as u32)];
        policy.extend(bpf::jeq32(
            (op & libc::FUTEX_CMD_MASK) as u32,
            bpf::allow(),
        ));
        self.add_policy_on_syscall(libc::SYS_futex as u64, policy)
    }

    #[must_use]
    pub fn allow_limited_madvise(self) -> Self {
        let mut policy = vec![bpf::arg32(2)];
        for advice in [libc::MADV_DONTNEED, libc::MADV_REMOVE, libc::MADV_NOHUGEPAGE] {
            policy.extend(bpf::jeq32(advice as u32, bpf::allow()));
        }
        self.add_policy_on_syscall(libc::SYS_madvise as u64, policy)
    }

    #[must_use]
    pub fn allow_system_malloc(self) -> Self {
        let this = self.allow_syscalls(&[libc::SYS_munmap as u64, libc::SYS_brk as u64]);
        let this = this.add_policy_on_syscall(libc::SYS_mremap as u64, {
            let mut p = vec![bpf::arg32(3)];
            p.extend(bpf::jeq32(libc::MREMAP_MAYMOVE as u32, bpf::allow()));
            p
        });
        this.add_policy_on_mmap_with(|l| {
            let mut p = vec![bpf::arg32(2)];
            p.extend(bpf::jeq32(libc::PROT_NONE as u32, l.jump("prot_none")));
            p.extend(bpf::jne32(
                (libc::PROT_READ | libc::PROT_WRITE) as u32,
                l.jump("mmap_end"),
            ));
            p.push(bpf::arg32(3));
            p.extend(bpf::jeq32(
                (libc::MAP_ANONYMOUS | libc::MAP_PRIVATE) as u32,
                bpf::allow(),
            ));
            p.push(l.jump("mmap_end"));
            p.push(l.label("prot_none"));
            p.push(bpf::arg32(3));
            p.extend(bpf::jeq32(
                (libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_NORESERVE) as u32,
                bpf::allow(),
            ));
            p.push(l.label("mmap_end"));
            p
        })
    }

    #[must_use]
    pub fn allow_tcmalloc(self) -> Self {
        let this = self
            .allow_time()
            .allow_syscalls(&[
                libc::SYS_munmap as u64,
                libc::SYS_nanosleep as u64,
                libc::SYS_brk as u64,
                libc::SYS_mincore as u64,
                libc::SYS_rseq as u64,
            ])
            .allow_futex_op(libc::FUTEX_WAKE)
            .allow_limited_madvise();
        let this = this.add_policy_on_syscall(libc::SYS_mprotect as u64, {
            let mut p = vec![bpf::arg32(2)];
            p.extend(bpf::jeq32(
                (libc::PROT_READ | libc::PROT_WRITE) as u32,
                bpf::allow(),
            ));
            p.extend(bpf::jeq32(libc::PROT_NONE as u32, bpf::allow()));
            p
        });
        this.add_policy_on_mmap_with(|l| {
            let mut p = vec![bpf::arg32(2)];
            p.extend(bpf::jeq32(libc::PROT_NONE as u32, l.jump("prot_none")));
            p.extend(bpf::jne32(
                (libc::PROT_READ | libc::PROT_WRITE) as u32,
                l.jump("mmap_end"),
            ));
            p.push(bpf::arg32(3));
            p.extend(bpf::jne32(
                (libc::MAP_ANONYMOUS | libc::MAP_PRIVATE) as u32,
                l.jump("mmap_end"),
            ));
            p.push(bpf::allow());
            p.push(l.label("prot_none"));
            p.push(bpf::arg32(3));
            p.extend(bpf::jeq32(
                (libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_NORESERVE) as u32,
                bpf::allow(),
            ));
            p.extend(bpf::jeq32(
                (libc::MAP_ANONYMOUS | libc::MAP_PRIVATE) as u32,
                bpf::allow(),
            ));
            p.push(l.label("mmap_end"));
            p
        })
    }

    #[must_use]
    pub fn allow_scudo_malloc(self) -> Self {
        let this = self
            .allow_time()
            .allow_syscalls(&[libc::SYS_munmap as u64, libc::SYS_nanosleep as u64])
            .allow_futex_op(libc::FUTEX_WAKE)
            .allow_limited_madvise()
            .allow_get_random();
        this.add_policy_on_mmap_with(|l| {
            let mut p = vec![bpf::arg32(2)];
            p.extend(bpf::jeq32(libc::PROT_NONE as u32, l.jump("prot_none")));
            p.extend(bpf::jne32(
                (libc::PROT_READ | libc::PROT_WRITE) as u32,
                l.jump("mmap_end"),
            ));
            p.push(bpf::arg32(3));
            p.extend(bpf::jeq32(
                (libc::MAP_PRIVATE | libc::MAP_FIXED | libc::MAP_ANONYMOUS) as u32,
                bpf::allow(),
            ));
            p.extend(bpf::jeq32(
                (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u32,
                bpf::allow(),
            ));
            p.push(l.jump("mmap_end"));
            p.push(l.label("prot_none"));
            p.push(bpf::arg32(3));
            p.extend(bpf::jeq32(
                (libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_NORESERVE) as u32,
                bpf::allow(),
            ));
            p.push(l.label("mmap_end"));
            p
        })
    }

    #[must_use]
    pub fn allow_static_startup(mut self) -> Self {
        self = self.allow_get_rlimit().allow_syscalls(&[
            libc::SYS_uname as u64,
            libc::SYS_brk as u64,
            libc::SYS_set_tid_address as u64,
            libc::SYS_set_robust_list as u64,
        ]);
        self = self.allow_futex_op(libc::FUTEX_WAIT_BITSET);
        self = self.add_policy_on_syscall(libc::SYS_rt_sigaction as u64, {
            // The realtime signals libc uses internally.
            let mut p = vec![bpf::arg32(0)];
            p.extend(bpf::jeq32(libc::SIGRTMIN() as u32, bpf::allow()));
            p.extend(bpf::jeq32(libc::SIGRTMIN() as u32 + 1, bpf::allow()));
            p
        });
        self = self.add_policy_on_syscall(libc::SYS_rt_sigprocmask as u64, {
            let mut p = vec![bpf::arg32(0)];
            p.extend(bpf::jeq32(libc::SIG_UNBLOCK as u32, bpf::allow()));
            p
        });
        #[cfg(target_arch = "x86_64")]
        {
            self = self.add_policy_on_syscall(libc::SYS_arch_prctl as u64, {
                let mut p = vec![bpf::arg32(0)];
                p.extend(bpf::jeq32(ARCH_SET_FS, bpf::allow()));
                p
            });
            self = self.block_syscall_with_errno(libc::SYS_readlink as u64, libc::ENOENT);
        }
        self
    }

    #[must_use]
    pub fn allow_dynamic_startup(self) -> Self {
        let this = self
            .allow_read()
            .allow_stat()
            .allow_syscalls(&[
                libc::SYS_lseek as u64,
                libc::SYS_close as u64,
                libc::SYS_munmap as u64,
            ])
            .add_policy_on_syscall(libc::SYS_mprotect as u64, {
                let mut p = vec![bpf::arg32(2)];
                for prot in [
                    libc::PROT_READ,
                    libc::PROT_NONE,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::PROT_READ | libc::PROT_EXEC,
                ] {
                    p.extend(bpf::jeq32(prot as u32, bpf::allow()));
                }
                p
            })
            .allow_static_startup();
        this.add_policy_on_mmap_with(|l| {
            let mut p = vec![bpf::arg32(2)];
            p.extend(bpf::jeq32(
                (libc::PROT_READ | libc::PROT_EXEC) as u32,
                l.jump("prot_exec"),
            ));
            p.extend(bpf::jeq32(
                (libc::PROT_READ | libc::PROT_WRITE) as u32,
                l.jump("prot_read_write"),
            ));
            p.extend(bpf::jne32(libc::PROT_READ as u32, l.jump("mmap_end")));
            p.push(bpf::arg32(3));
            p.extend(bpf::jeq32(libc::MAP_PRIVATE as u32, bpf::allow()));
            p.push(l.jump("mmap_end"));
            p.push(l.label("prot_read_write"));
            p.push(bpf::arg32(3));
            p.extend(bpf::jeq32(
                (libc::MAP_FILE | libc::MAP_PRIVATE | libc::MAP_FIXED | libc::MAP_DENYWRITE)
                    as u32,
                bpf::allow(),
            ));
            p.extend(bpf::jeq32(
                (libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_FIXED) as u32,
                bpf::allow(),
            ));
            p.extend(bpf::jeq32(
                (libc::MAP_ANONYMOUS | libc::MAP_PRIVATE) as u32,
                bpf::allow(),
            ));
            p.push(l.jump("mmap_end"));
            p.push(l.label("prot_exec"));
            p.push(bpf::arg32(3));
            p.extend(bpf::jeq32(
                (libc::MAP_FILE | libc::MAP_PRIVATE | libc::MAP_DENYWRITE) as u32,
                bpf::allow(),
            ));
            p.push(l.label("mmap_end"));
            p
        })
    }

    /// Everything a sandboxee needs to forward tracing output: write
    /// syscalls, allocator support, and abort on fatal errors.
    #[must_use]
    pub fn allow_log_forwarding(self) -> Self {
        let this = self
            .allow_write()
            .allow_system_malloc()
            .allow_syscalls(&[
                libc::SYS_clock_gettime as u64,
                libc::SYS_gettid as u64,
                libc::SYS_close as u64,
            ]);
        this.add_policy_on_syscall_with(libc::SYS_kill as u64, |l| {
            let mut p = vec![bpf::arg32(0)];
            p.extend(bpf::jne32(0, l.jump("pid_not_null")));
            p.push(bpf::arg32(1));
            p.extend(bpf::jeq32(libc::SIGABRT as u32, bpf::allow()));
            p.push(l.label("pid_not_null"));
            p
        })
    }

    // ---- namespace & mount configuration ----

    /// Namespaces are on by default; this re-enables them after
    /// [`PolicyBuilder::disable_namespaces`].
    #[must_use]
    pub const fn enable_namespaces(mut self) -> Self {
        self.use_namespaces = true;
        self
    }

    /// Runs the sandboxee in the supervisor's namespaces. Disables mount
    /// isolation and stack-trace collection in turn.
    #[must_use]
    pub const fn disable_namespaces(mut self) -> Self {
        self.use_namespaces = false;
        self
    }

    #[must_use]
    pub fn add_file(self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        self.add_file_at(path.clone(), path, false)
    }

    #[must_use]
    pub fn add_file_at(
        mut self,
        outside: impl AsRef<Path>,
        inside: impl AsRef<Path>,
        writable: bool,
    ) -> Self {
        if let Err(e) = self
            .mounts
            .add_file_at(outside.as_ref().to_path_buf(), inside, writable)
        {
            self.set_error(e);
        }
        self
    }

    #[must_use]
    pub fn add_directory(self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        self.add_directory_at(path.clone(), path, false)
    }

    #[must_use]
    pub fn add_directory_at(
        mut self,
        outside: impl AsRef<Path>,
        inside: impl AsRef<Path>,
        writable: bool,
    ) -> Self {
        if let Err(e) =
            self.mounts
                .add_directory_at(outside.as_ref().to_path_buf(), inside, writable)
        {
            self.set_error(e);
        }
        self
    }

    #[must_use]
    pub fn add_tmpfs(mut self, inside: impl AsRef<Path>, size: u64) -> Self {
        if let Err(e) = self.mounts.add_tmpfs(inside, size) {
            self.set_error(e);
        }
        self
    }

    /// Mounts the target binary's directory and the common system library
    /// directories; no dependency discovery is performed.
    #[must_use]
    pub fn add_libraries_for_binary(mut self, binary: impl AsRef<Path>) -> Self {
        if let Some(parent) = binary.as_ref().parent() {
            self = self.add_directory(parent.to_path_buf());
        }
        for dir in ["/usr/lib64", "/usr/lib", "/lib64", "/lib"] {
            if Path::new(dir).exists() {
                self = self.add_directory(dir);
            }
        }
        self
    }

    /// Replaces the whole mount tree; used by the stack tracer to reuse a
    /// target's view.
    #[must_use]
    pub fn set_mounts(mut self, mounts: MountTree) -> Self {
        self.mounts = mounts;
        self
    }

    #[must_use]
    pub fn set_root_writable(mut self) -> Self {
        self.mounts.set_root_writable(true);
        self
    }

    #[must_use]
    pub fn set_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    #[must_use]
    pub const fn allow_unrestricted_networking(mut self) -> Self {
        self.allow_unrestricted_networking = true;
        self
    }

    /// Retains the named capabilities in the sandboxee instead of dropping
    /// everything. Weakens the sandbox; the stack tracer uses it for
    /// `CAP_SYS_PTRACE`.
    #[must_use]
    pub fn unsafe_keep_capabilities(mut self, caps: &[&str]) -> Self {
        self.capabilities
            .extend(caps.iter().map(|c| (*c).to_string()));
        self
    }

    // ---- stack trace toggles ----

    #[must_use]
    pub const fn collect_stacktraces_on_violation(mut self, enable: bool) -> Self {
        self.stack_traces.on_violation = enable;
        self
    }

    #[must_use]
    pub const fn collect_stacktraces_on_signal(mut self, enable: bool) -> Self {
        self.stack_traces.on_signal = enable;
        self
    }

    #[must_use]
    pub const fn collect_stacktraces_on_timeout(mut self, enable: bool) -> Self {
        self.stack_traces.on_timeout = enable;
        self
    }

    #[must_use]
    pub const fn collect_stacktraces_on_kill(mut self, enable: bool) -> Self {
        self.stack_traces.on_kill = enable;
        self
    }

    #[must_use]
    pub const fn collect_stacktraces_on_exit(mut self, enable: bool) -> Self {
        self.stack_traces.on_exit = enable;
        self
    }

    /// On violation, collects stack traces for every thread instead of only
    /// the violating one.
    #[must_use]
    pub const fn collect_all_threads_stacktraces(mut self, enable: bool) -> Self {
        self.collect_all_threads = enable;
        self
    }

    /// Finishes the policy, surfacing the first error recorded along the
    /// chain.
    pub fn try_build(self) -> Result<Policy> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if self.hostname.is_some() && self.allow_unrestricted_networking {
            return Err(WardenError::Policy(
                "cannot set a hostname with unrestricted networking".into(),
            ));
        }
        let namespaces = if self.use_namespaces {
            Some(NamespaceSpec {
                hostname: self.hostname,
                allow_unrestricted_networking: self.allow_unrestricted_networking,
                mounts: self.mounts,
                ..Default::default()
            })
        } else {
            tracing::warn!("namespaces disabled; stack traces on crash are unavailable");
            None
        };
        Ok(Policy {
            user_policy: self.user_policy,
            namespaces,
            capabilities: self.capabilities,
            stack_traces: self.stack_traces,
            track_all_syscalls: self.track_all_syscalls,
            collect_all_threads: self.collect_all_threads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::CpuArch;

    fn eval(policy: &Policy, nr: i64, args: [u64; 6]) -> u32 {
        let data = libc::seccomp_data {
            nr: nr as i32,
            arch: CpuArch::host_audit_arch(),
            instruction_pointer: 0,
            args,
        };
        bpf::evaluate(&policy.program().unwrap(), &data).unwrap()
    }

    #[test]
    fn first_match_wins_on_duplicate_syscalls() {
        // allow then block: the block must be a dedup no-op.
        let policy = PolicyBuilder::new()
            .allow_syscall(libc::SYS_getpid as u64)
            .block_syscall_with_errno(libc::SYS_getpid as u64, libc::EPERM)
            .try_build()
            .unwrap();
        assert_eq!(
            eval(&policy, libc::SYS_getpid, [0; 6]),
            libc::SECCOMP_RET_ALLOW
        );
    }

    #[test]
    fn blocked_syscalls_return_the_errno() {
        let policy = PolicyBuilder::new()
            .block_syscall_with_errno(libc::SYS_kill as u64, libc::EPERM)
            .try_build()
            .unwrap();
        assert_eq!(
            eval(&policy, libc::SYS_kill, [0; 6]),
            libc::SECCOMP_RET_ERRNO | libc::EPERM as u32
        );
    }

    #[test]
    fn syscall_policies_fall_through_to_later_clauses() {
        let policy = PolicyBuilder::new()
            .add_policy_on_syscall(libc::SYS_dup as u64, {
                let mut p = vec![bpf::arg32(0)];
                p.extend(bpf::jeq32(7, bpf::allow()));
                p
            })
            .allow_syscall(libc::SYS_dup as u64)
            .try_build()
            .unwrap();
        // Matching argument: allowed by the snippet.
        let mut args = [0u64; 6];
        args[0] = 7;
        assert_eq!(eval(&policy, libc::SYS_dup, args), libc::SECCOMP_RET_ALLOW);
        // Non-matching argument: falls through to the unconditional allow.
        args[0] = 8;
        assert_eq!(eval(&policy, libc::SYS_dup, args), libc::SECCOMP_RET_ALLOW);
        // Other syscalls never touch the snippet.
        assert_eq!(
            eval(&policy, libc::SYS_getpid, [0; 6]),
            libc::SECCOMP_RET_KILL_THREAD
        );
    }

    #[test]
    fn futex_ops_are_masked() {
        let policy = PolicyBuilder::new()
            .allow_futex_op(libc::FUTEX_WAKE)
            .try_build()
            .unwrap();
        let mut args = [0u64; 6];
        args[1] = (libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG) as u64;
        assert_eq!(
            eval(&policy, libc::SYS_futex, args),
            libc::SECCOMP_RET_ALLOW
        );
        args[1] = (libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG) as u64;
        assert_eq!(
            eval(&policy, libc::SYS_futex, args),
            libc::SECCOMP_RET_KILL_THREAD
        );
    }

    #[test]
    fn default_allow_all_keeps_earlier_clauses() {
        let policy = PolicyBuilder::new()
            .block_syscall_with_errno(libc::SYS_kill as u64, libc::EACCES)
            .danger_default_allow_all()
            .try_build()
            .unwrap();
        assert_eq!(
            eval(&policy, libc::SYS_kill, [0; 6]),
            libc::SECCOMP_RET_ERRNO | libc::EACCES as u32
        );
        assert_eq!(
            eval(&policy, libc::SYS_getpid, [0; 6]),
            libc::SECCOMP_RET_ALLOW
        );
    }

    #[test]
    fn static_startup_policy_builds_and_allows_basics() {
        let policy = PolicyBuilder::new()
            .allow_static_startup()
            .allow_exit()
            .try_build()
            .unwrap();
        assert_eq!(
            eval(&policy, libc::SYS_exit_group, [0; 6]),
            libc::SECCOMP_RET_ALLOW
        );
        assert_eq!(
            eval(&policy, libc::SYS_brk, [0; 6]),
            libc::SECCOMP_RET_ALLOW
        );
    }

    #[test]
    fn dynamic_startup_policy_builds() {
        let policy = PolicyBuilder::new()
            .allow_dynamic_startup()
            .allow_exit()
            .try_build()
            .unwrap();
        // PROT_READ|PROT_EXEC file mapping, as the loader issues.
        let mut args = [0u64; 6];
        args[2] = (libc::PROT_READ | libc::PROT_EXEC) as u64;
        args[3] = (libc::MAP_FILE | libc::MAP_PRIVATE | libc::MAP_DENYWRITE) as u64;
        assert_eq!(eval(&policy, libc::SYS_mmap, args), libc::SECCOMP_RET_ALLOW);
    }

    #[test]
    fn mount_errors_surface_at_build_time() {
        let err = PolicyBuilder::new()
            .add_file_at("/x", "relative/path", false)
            .try_build();
        assert!(err.is_err());
    }

    #[test]
    fn hostname_conflicts_with_unrestricted_networking() {
        let err = PolicyBuilder::new()
            .set_hostname("box")
            .allow_unrestricted_networking()
            .try_build();
        assert!(err.is_err());
    }

    #[test]
    fn tracking_policy_traces_everything() {
        let policy = PolicyBuilder::new()
            .danger_track_all_syscalls()
            .try_build()
            .unwrap();
        let ret = eval(&policy, libc::SYS_getpid, [0; 6]);
        assert_eq!(
            ret,
            libc::SECCOMP_RET_TRACE | u32::from(CpuArch::host().trace_tag())
        );
    }
}
