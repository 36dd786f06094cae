//! Static syscall name tables per audit architecture.
//!
//! Number→(name, argument count) pairs, sorted by number for binary search.
//! Unlisted numbers render as `unknown-syscall-N`.

use crate::syscall::CpuArch;

type Entry = (&'static str, u8);

#[rustfmt::skip]
static X86_64: &[(u32, Entry)] = &[
    (0, ("read", 3)), (1, ("write", 3)), (2, ("open", 3)), (3, ("close", 1)),
    (4, ("stat", 2)), (5, ("fstat", 2)), (6, ("lstat", 2)), (7, ("poll", 3)),
    (8, ("lseek", 3)), (9, ("mmap", 6)), (10, ("mprotect", 3)), (11, ("munmap", 2)),
    (12, ("brk", 1)), (13, ("rt_sigaction", 4)), (14, ("rt_sigprocmask", 4)),
    (15, ("rt_sigreturn", 0)), (16, ("ioctl", 3)), (17, ("pread64", 4)),
    (18, ("pwrite64", 4)), (19, ("readv", 3)), (20, ("writev", 3)), (21, ("access", 2)),
    (22, ("pipe", 1)), (23, ("select", 5)), (24, ("sched_yield", 0)), (25, ("mremap", 5)),
    (26, ("msync", 3)), (27, ("mincore", 3)), (28, ("madvise", 3)), (29, ("shmget", 3)),
    (30, ("shmat", 3)), (31, ("shmctl", 3)), (32, ("dup", 1)), (33, ("dup2", 2)),
    (34, ("pause", 0)), (35, ("nanosleep", 2)), (36, ("getitimer", 2)), (37, ("alarm", 1)),
    (38, ("setitimer", 3)), (39, ("getpid", 0)), (40, ("sendfile", 4)), (41, ("socket", 3)),
    (42, ("connect", 3)), (43, ("accept", 3)), (44, ("sendto", 6)), (45, ("recvfrom", 6)),
    (46, ("sendmsg", 3)), (47, ("recvmsg", 3)), (48, ("shutdown", 2)), (49, ("bind", 3)),
    (50, ("listen", 2)), (51, ("getsockname", 3)), (52, ("getpeername", 3)),
    (53, ("socketpair", 4)), (54, ("setsockopt", 5)), (55, ("getsockopt", 5)),
    (56, ("clone", 5)), (57, ("fork", 0)), (58, ("vfork", 0)), (59, ("execve", 3)),
    (60, ("exit", 1)), (61, ("wait4", 4)), (62, ("kill", 2)), (63, ("uname", 1)),
    (64, ("semget", 3)), (65, ("semop", 3)), (66, ("semctl", 4)), (67, ("shmdt", 1)),
    (68, ("msgget", 2)), (69, ("msgsnd", 4)), (70, ("msgrcv", 5)), (71, ("msgctl", 3)),
    (72, ("fcntl", 3)), (73, ("flock", 2)), (74, ("fsync", 1)), (75, ("fdatasync", 1)),
    (76, ("truncate", 2)), (77, ("ftruncate", 2)), (78, ("getdents", 3)),
    (79, ("getcwd", 2)), (80, ("chdir", 1)), (81, ("fchdir", 1)), (82, ("rename", 2)),
    (83, ("mkdir", 2)), (84, ("rmdir", 1)), (85, ("creat", 2)), (86, ("link", 2)),
    (87, ("unlink", 1)), (88, ("symlink", 2)), (89, ("readlink", 3)), (90, ("chmod", 2)),
    (91, ("fchmod", 2)), (92, ("chown", 3)), (93, ("fchown", 3)), (94, ("lchown", 3)),
    (95, ("umask", 1)), (96, ("gettimeofday", 2)), (97, ("getrlimit", 2)),
    (98, ("getrusage", 2)), (99, ("sysinfo", 1)), (100, ("times", 1)),
    (101, ("ptrace", 4)), (102, ("getuid", 0)), (103, ("syslog", 3)),
    (104, ("getgid", 0)), (105, ("setuid", 1)), (106, ("setgid", 1)),
    (107, ("geteuid", 0)), (108, ("getegid", 0)), (109, ("setpgid", 2)),
    (110, ("getppid", 0)), (111, ("getpgrp", 0)), (112, ("setsid", 0)),
    (113, ("setreuid", 2)), (114, ("setregid", 2)), (115, ("getgroups", 2)),
    (116, ("setgroups", 2)), (117, ("setresuid", 3)), (118, ("getresuid", 3)),
    (119, ("setresgid", 3)), (120, ("getresgid", 3)), (121, ("getpgid", 1)),
    (122, ("setfsuid", 1)), (123, ("setfsgid", 1)), (124, ("getsid", 1)),
    (125, ("capget", 2)), (126, ("capset", 2)), (127, ("rt_sigpending", 2)),
    (128, ("rt_sigtimedwait", 4)), (129, ("rt_sigqueueinfo", 3)),
    (130, ("rt_sigsuspend", 2)), (131, ("sigaltstack", 2)), (132, ("utime", 2)),
    (133, ("mknod", 3)), (135, ("personality", 1)), (136, ("ustat", 2)),
    (137, ("statfs", 2)), (138, ("fstatfs", 2)), (139, ("sysfs", 3)),
    (140, ("getpriority", 2)), (141, ("setpriority", 3)), (142, ("sched_setparam", 2)),
    (143, ("sched_getparam", 2)), (144, ("sched_setscheduler", 3)),
    (145, ("sched_getscheduler", 1)), (146, ("sched_get_priority_max", 1)),
    (147, ("sched_get_priority_min", 1)), (148, ("sched_rr_get_interval", 2)),
    (149, ("mlock", 2)), (150, ("munlock", 2)), (151, ("mlockall", 1)),
    (152, ("munlockall", 0)), (153, ("vhangup", 0)), (154, ("modify_ldt", 3)),
    (155, ("pivot_root", 2)), (157, ("prctl", 5)), (158, ("arch_prctl", 2)),
    (159, ("adjtimex", 1)), (160, ("setrlimit", 2)), (161, ("chroot", 1)),
    (162, ("sync", 0)), (163, ("acct", 1)), (164, ("settimeofday", 2)),
    (165, ("mount", 5)), (166, ("umount2", 2)), (167, ("swapon", 2)),
    (168, ("swapoff", 1)), (169, ("reboot", 4)), (170, ("sethostname", 2)),
    (171, ("setdomainname", 2)), (172, ("iopl", 1)), (173, ("ioperm", 3)),
    (175, ("init_module", 3)), (176, ("delete_module", 2)), (179, ("quotactl", 4)),
    (186, ("gettid", 0)), (187, ("readahead", 3)), (188, ("setxattr", 5)),
    (189, ("lsetxattr", 5)), (190, ("fsetxattr", 5)), (191, ("getxattr", 4)),
    (192, ("lgetxattr", 4)), (193, ("fgetxattr", 4)), (194, ("listxattr", 3)),
    (195, ("llistxattr", 3)), (196, ("flistxattr", 3)), (197, ("removexattr", 2)),
    (198, ("lremovexattr", 2)), (199, ("fremovexattr", 2)), (200, ("tkill", 2)),
    (201, ("time", 1)), (202, ("futex", 6)), (203, ("sched_setaffinity", 3)),
    (204, ("sched_getaffinity", 3)), (205, ("set_thread_area", 1)),
    (206, ("io_setup", 2)), (207, ("io_destroy", 1)), (208, ("io_getevents", 5)),
    (209, ("io_submit", 3)), (210, ("io_cancel", 3)), (211, ("get_thread_area", 1)),
    (213, ("epoll_create", 1)), (216, ("remap_file_pages", 5)),
    (217, ("getdents64", 3)), (218, ("set_tid_address", 1)), (219, ("restart_syscall", 0)),
    (220, ("semtimedop", 4)), (221, ("fadvise64", 4)), (222, ("timer_create", 3)),
    (223, ("timer_settime", 4)), (224, ("timer_gettime", 2)),
    (225, ("timer_getoverrun", 1)), (226, ("timer_delete", 1)),
    (227, ("clock_settime", 2)), (228, ("clock_gettime", 2)),
    (229, ("clock_getres", 2)), (230, ("clock_nanosleep", 4)), (231, ("exit_group", 1)),
    (232, ("epoll_wait", 4)), (233, ("epoll_ctl", 4)), (234, ("tgkill", 3)),
    (235, ("utimes", 2)), (237, ("mbind", 6)), (238, ("set_mempolicy", 3)),
    (239, ("get_mempolicy", 5)), (240, ("mq_open", 4)), (241, ("mq_unlink", 1)),
    (242, ("mq_timedsend", 5)), (243, ("mq_timedreceive", 5)), (244, ("mq_notify", 2)),
    (245, ("mq_getsetattr", 3)), (246, ("kexec_load", 4)), (247, ("waitid", 5)),
    (248, ("add_key", 5)), (249, ("request_key", 4)), (250, ("keyctl", 5)),
    (251, ("ioprio_set", 3)), (252, ("ioprio_get", 2)), (253, ("inotify_init", 0)),
    (254, ("inotify_add_watch", 3)), (255, ("inotify_rm_watch", 2)),
    (256, ("migrate_pages", 4)), (257, ("openat", 4)), (258, ("mkdirat", 3)),
    (259, ("mknodat", 4)), (260, ("fchownat", 5)), (261, ("futimesat", 3)),
    (262, ("newfstatat", 4)), (263, ("unlinkat", 3)), (264, ("renameat", 4)),
    (265, ("linkat", 5)), (266, ("symlinkat", 3)), (267, ("readlinkat", 4)),
    (268, ("fchmodat", 3)), (269, ("faccessat", 3)), (270, ("pselect6", 6)),
    (271, ("ppoll", 5)), (272, ("unshare", 1)), (273, ("set_robust_list", 2)),
    (274, ("get_robust_list", 3)), (275, ("splice", 6)), (276, ("tee", 4)),
    (277, ("sync_file_range", 4)), (278, ("vmsplice", 4)), (279, ("move_pages", 6)),
    (280, ("utimensat", 4)), (281, ("epoll_pwait", 6)), (282, ("signalfd", 3)),
    (283, ("timerfd_create", 2)), (284, ("eventfd", 1)), (285, ("fallocate", 4)),
    (286, ("timerfd_settime", 4)), (287, ("timerfd_gettime", 2)), (288, ("accept4", 4)),
    (289, ("signalfd4", 4)), (290, ("eventfd2", 2)), (291, ("epoll_create1", 1)),
    (292, ("dup3", 3)), (293, ("pipe2", 2)), (294, ("inotify_init1", 1)),
    (295, ("preadv", 5)), (296, ("pwritev", 5)), (297, ("rt_tgsigqueueinfo", 4)),
    (298, ("perf_event_open", 5)), (299, ("recvmmsg", 5)), (300, ("fanotify_init", 2)),
    (301, ("fanotify_mark", 5)), (302, ("prlimit64", 4)),
    (303, ("name_to_handle_at", 5)), (304, ("open_by_handle_at", 3)),
    (305, ("clock_adjtime", 2)), (306, ("syncfs", 1)), (307, ("sendmmsg", 4)),
    (308, ("setns", 2)), (309, ("getcpu", 3)), (310, ("process_vm_readv", 6)),
    (311, ("process_vm_writev", 6)), (312, ("kcmp", 5)), (313, ("finit_module", 3)),
    (314, ("sched_setattr", 3)), (315, ("sched_getattr", 4)), (316, ("renameat2", 5)),
    (317, ("seccomp", 3)), (318, ("getrandom", 3)), (319, ("memfd_create", 2)),
    (320, ("kexec_file_load", 5)), (321, ("bpf", 3)), (322, ("execveat", 5)),
    (323, ("userfaultfd", 1)), (324, ("membarrier", 3)), (325, ("mlock2", 3)),
    (326, ("copy_file_range", 6)), (327, ("preadv2", 6)), (328, ("pwritev2", 6)),
    (329, ("pkey_mprotect", 4)), (330, ("pkey_alloc", 2)), (331, ("pkey_free", 1)),
    (332, ("statx", 5)), (333, ("io_pgetevents", 6)), (334, ("rseq", 4)),
    (424, ("pidfd_send_signal", 4)), (425, ("io_uring_setup", 2)),
    (426, ("io_uring_enter", 6)), (427, ("io_uring_register", 4)),
    (428, ("open_tree", 3)), (429, ("move_mount", 5)), (430, ("fsopen", 2)),
    (431, ("fsconfig", 5)), (432, ("fsmount", 3)), (433, ("fspick", 3)),
    (434, ("pidfd_open", 2)), (435, ("clone3", 2)), (436, ("close_range", 3)),
    (437, ("openat2", 4)), (438, ("pidfd_getfd", 3)), (439, ("faccessat2", 4)),
    (440, ("process_madvise", 5)), (441, ("epoll_pwait2", 6)),
    (442, ("mount_setattr", 5)), (444, ("landlock_create_ruleset", 3)),
    (445, ("landlock_add_rule", 4)), (446, ("landlock_restrict_self", 2)),
    (448, ("process_mrelease", 2)),
];

#[rustfmt::skip]
static X86_32: &[(u32, Entry)] = &[
    (1, ("exit", 1)), (2, ("fork", 0)), (3, ("read", 3)), (4, ("write", 3)),
    (5, ("open", 3)), (6, ("close", 1)), (7, ("waitpid", 3)), (8, ("creat", 2)),
    (9, ("link", 2)), (10, ("unlink", 1)), (11, ("execve", 3)), (12, ("chdir", 1)),
    (13, ("time", 1)), (14, ("mknod", 3)), (15, ("chmod", 2)), (19, ("lseek", 3)),
    (20, ("getpid", 0)), (21, ("mount", 5)), (23, ("setuid", 1)), (24, ("getuid", 0)),
    (26, ("ptrace", 4)), (27, ("alarm", 1)), (29, ("pause", 0)), (33, ("access", 2)),
    (36, ("sync", 0)), (37, ("kill", 2)), (38, ("rename", 2)), (39, ("mkdir", 2)),
    (40, ("rmdir", 1)), (41, ("dup", 1)), (42, ("pipe", 1)), (43, ("times", 1)),
    (45, ("brk", 1)), (46, ("setgid", 1)), (47, ("getgid", 0)), (49, ("geteuid", 0)),
    (50, ("getegid", 0)), (54, ("ioctl", 3)), (55, ("fcntl", 3)), (57, ("setpgid", 2)),
    (60, ("umask", 1)), (61, ("chroot", 1)), (63, ("dup2", 2)), (64, ("getppid", 0)),
    (65, ("getpgrp", 0)), (66, ("setsid", 0)), (78, ("gettimeofday", 2)),
    (85, ("readlink", 3)), (90, ("mmap", 6)), (91, ("munmap", 2)),
    (102, ("socketcall", 2)), (104, ("setitimer", 3)), (114, ("wait4", 4)),
    (117, ("ipc", 6)), (119, ("sigreturn", 0)), (120, ("clone", 5)),
    (122, ("uname", 1)), (125, ("mprotect", 3)), (140, ("_llseek", 5)),
    (141, ("getdents", 3)), (142, ("select", 5)), (143, ("flock", 2)),
    (144, ("msync", 3)), (145, ("readv", 3)), (146, ("writev", 3)),
    (158, ("sched_yield", 0)), (162, ("nanosleep", 2)), (163, ("mremap", 5)),
    (168, ("poll", 3)), (172, ("prctl", 5)), (173, ("rt_sigreturn", 0)),
    (174, ("rt_sigaction", 4)), (175, ("rt_sigprocmask", 4)),
    (179, ("rt_sigsuspend", 2)), (180, ("pread64", 4)), (181, ("pwrite64", 4)),
    (183, ("getcwd", 2)), (186, ("sigaltstack", 2)), (190, ("vfork", 0)),
    (191, ("ugetrlimit", 2)), (192, ("mmap2", 6)), (195, ("stat64", 2)),
    (196, ("lstat64", 2)), (197, ("fstat64", 2)), (199, ("getuid32", 0)),
    (200, ("getgid32", 0)), (201, ("geteuid32", 0)), (202, ("getegid32", 0)),
    (219, ("madvise", 3)), (220, ("getdents64", 3)), (221, ("fcntl64", 3)),
    (224, ("gettid", 0)), (238, ("tkill", 2)), (240, ("futex", 6)),
    (243, ("set_thread_area", 1)), (252, ("exit_group", 1)),
    (254, ("epoll_create", 1)), (255, ("epoll_ctl", 4)), (256, ("epoll_wait", 4)),
    (258, ("set_tid_address", 1)), (265, ("clock_gettime", 2)),
    (266, ("clock_getres", 2)), (267, ("clock_nanosleep", 4)), (270, ("tgkill", 3)),
    (295, ("openat", 4)), (300, ("fstatat64", 4)), (301, ("unlinkat", 3)),
    (311, ("set_robust_list", 2)), (320, ("utimensat", 4)),
    (322, ("timerfd_create", 2)), (328, ("eventfd2", 2)), (329, ("epoll_create1", 1)),
    (331, ("pipe2", 2)), (340, ("prlimit64", 4)), (354, ("seccomp", 3)),
    (355, ("getrandom", 3)), (356, ("memfd_create", 2)), (358, ("execveat", 5)),
    (359, ("socket", 3)), (362, ("connect", 3)), (384, ("arch_prctl", 2)),
];

#[rustfmt::skip]
static AARCH64: &[(u32, Entry)] = &[
    (17, ("getcwd", 2)), (23, ("dup", 1)), (24, ("dup3", 3)), (25, ("fcntl", 3)),
    (29, ("ioctl", 3)), (34, ("mkdirat", 3)), (35, ("unlinkat", 3)),
    (43, ("statfs", 2)), (45, ("truncate", 2)), (46, ("ftruncate", 2)),
    (48, ("faccessat", 3)), (49, ("chdir", 1)), (56, ("openat", 4)),
    (57, ("close", 1)), (61, ("getdents64", 3)), (62, ("lseek", 3)),
    (63, ("read", 3)), (64, ("write", 3)), (65, ("readv", 3)), (66, ("writev", 3)),
    (67, ("pread64", 4)), (68, ("pwrite64", 4)), (69, ("preadv", 5)),
    (70, ("pwritev", 5)), (72, ("pselect6", 6)), (73, ("ppoll", 5)),
    (78, ("readlinkat", 4)), (79, ("newfstatat", 4)), (80, ("fstat", 2)),
    (93, ("exit", 1)), (94, ("exit_group", 1)), (95, ("waitid", 5)),
    (96, ("set_tid_address", 1)), (98, ("futex", 6)), (99, ("set_robust_list", 2)),
    (101, ("nanosleep", 2)), (113, ("clock_gettime", 2)), (114, ("clock_getres", 2)),
    (115, ("clock_nanosleep", 4)), (117, ("ptrace", 4)), (124, ("sched_yield", 0)),
    (129, ("kill", 2)), (130, ("tkill", 2)), (131, ("tgkill", 3)),
    (132, ("sigaltstack", 2)), (133, ("rt_sigsuspend", 2)), (134, ("rt_sigaction", 4)),
    (135, ("rt_sigprocmask", 4)), (137, ("rt_sigtimedwait", 4)),
    (139, ("rt_sigreturn", 0)), (160, ("uname", 1)), (163, ("getrlimit", 2)),
    (164, ("setrlimit", 2)), (165, ("getrusage", 2)), (169, ("gettimeofday", 2)),
    (172, ("getpid", 0)), (173, ("getppid", 0)), (174, ("getuid", 0)),
    (175, ("geteuid", 0)), (176, ("getgid", 0)), (177, ("getegid", 0)),
    (178, ("gettid", 0)), (214, ("brk", 1)), (215, ("munmap", 2)),
    (216, ("mremap", 5)), (220, ("clone", 5)), (221, ("execve", 3)),
    (222, ("mmap", 6)), (226, ("mprotect", 3)), (233, ("madvise", 3)),
    (260, ("wait4", 4)), (261, ("prlimit64", 4)), (270, ("process_vm_readv", 6)),
    (277, ("seccomp", 3)), (278, ("getrandom", 3)), (279, ("memfd_create", 2)),
    (280, ("bpf", 3)), (281, ("execveat", 5)), (435, ("clone3", 2)),
];

#[rustfmt::skip]
static PPC64LE: &[(u32, Entry)] = &[
    (1, ("exit", 1)), (2, ("fork", 0)), (3, ("read", 3)), (4, ("write", 3)),
    (5, ("open", 3)), (6, ("close", 1)), (7, ("waitpid", 3)), (11, ("execve", 3)),
    (20, ("getpid", 0)), (26, ("ptrace", 4)), (37, ("kill", 2)), (45, ("brk", 1)),
    (54, ("ioctl", 3)), (55, ("fcntl", 3)), (90, ("mmap", 6)), (91, ("munmap", 2)),
    (114, ("wait4", 4)), (120, ("clone", 5)), (125, ("mprotect", 3)),
    (162, ("nanosleep", 2)), (167, ("poll", 3)), (173, ("rt_sigaction", 4)),
    (174, ("rt_sigprocmask", 4)), (207, ("gettid", 0)), (221, ("futex", 6)),
    (234, ("exit_group", 1)), (246, ("clock_gettime", 2)),
    (250, ("tgkill", 3)), (286, ("openat", 4)), (358, ("seccomp", 3)),
    (359, ("getrandom", 3)), (361, ("bpf", 3)), (362, ("execveat", 5)),
];

pub(crate) fn lookup(arch: CpuArch, nr: u64) -> Option<Entry> {
    let table = match arch {
        CpuArch::X8664 => X86_64,
        CpuArch::X86 => X86_32,
        CpuArch::Aarch64 => AARCH64,
        CpuArch::Ppc64Le => PPC64LE,
        CpuArch::Unknown => return None,
    };
    let nr = u32::try_from(nr).ok()?;
    table
        .binary_search_by_key(&nr, |(num, _)| *num)
        .ok()
        .map(|idx| table[idx].1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_are_sorted_for_binary_search() {
        for table in [X86_64, X86_32, AARCH64, PPC64LE] {
            for pair in table.windows(2) {
                assert!(pair[0].0 < pair[1].0, "table out of order at {}", pair[1].0);
            }
        }
    }

    #[test]
    fn known_numbers_resolve() {
        assert_eq!(lookup(CpuArch::X8664, 101).unwrap().0, "ptrace");
        assert_eq!(lookup(CpuArch::X8664, 321).unwrap().0, "bpf");
        assert_eq!(lookup(CpuArch::X86, 1).unwrap().0, "exit");
        assert_eq!(lookup(CpuArch::Aarch64, 221).unwrap().0, "execve");
        assert_eq!(lookup(CpuArch::Ppc64Le, 1).unwrap().0, "exit");
    }

    #[test]
    fn unknown_arch_resolves_nothing() {
        assert!(lookup(CpuArch::Unknown, 1).is_none());
    }
}
