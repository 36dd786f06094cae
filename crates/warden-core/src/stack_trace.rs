//! Stack-trace collection through a nested, recursively sandboxed unwinder.
//!
//! On a violation (or timeout/signal/kill, per policy), the monitor launches
//! a second sandbox whose only purpose is to read the target's memory: it
//! joins the target's user namespace so `process_vm_readv` is permitted,
//! sees a read-only copy of the target's maps file and binary, and runs
//! under a policy that admits nothing beyond what unwinding needs.

use crate::executor::Executor;
use crate::mounts::MountTree;
use crate::policy::Policy;
use crate::regs::Regs;
use crate::sandbox::Sandbox;
use crate::unwind::{DEFAULT_MAX_FRAMES, UnwindResult, UnwindSetup};
use crate::{PolicyBuilder, Result, WardenError, bpf, util};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const UNWIND_WALL_TIME: Duration = Duration::from_secs(5);

/// Whether to contain the unwinder in its own sandbox (the default) or run
/// it directly in the monitor process.
static SANDBOXED_UNWINDER: Lazy<AtomicBool> = Lazy::new(|| AtomicBool::new(true));

/// Disables the nested unwind sandbox, falling back to in-process
/// unwinding. Intended for builds where nesting is unavailable (e.g. under
/// sanitizers).
pub fn set_sandboxed_unwinder(enabled: bool) {
    SANDBOXED_UNWINDER.store(enabled, Ordering::Release);
}

/// Temporary tree under /tmp holding the maps copy (and the binary when the
/// original was deleted).
struct UnwindTempDir {
    path: PathBuf,
}

impl UnwindTempDir {
    fn create() -> Result<Self> {
        let path = nix::unistd::mkdtemp("/tmp/.warden_unwind_XXXXXX")?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UnwindTempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Collapses runs of identical consecutive frames. Idempotent: the inserted
/// marker lines never collapse further.
#[must_use]
pub fn compact_stack_trace(frames: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(frames.len());
    let mut repeats = 0usize;
    for frame in frames {
        if out.last() == Some(frame) {
            repeats += 1;
            continue;
        }
        if repeats > 0 {
            out.push(format!("(previous frame repeated {repeats} times)"));
            repeats = 0;
        }
        out.push(frame.clone());
    }
    if repeats > 0 {
        out.push(format!("(previous frame repeated {repeats} times)"));
    }
    out
}

fn unwind_policy(
    target: Pid,
    maps_file: &Path,
    app_path: &Path,
    exe_path: &Path,
) -> Result<Policy> {
    let mut builder = PolicyBuilder::new()
        .allow_open()
        .allow_read()
        .allow_write()
        .allow_stat()
        .allow_mmap()
        .allow_exit()
        .allow_handle_signals()
        .allow_syscalls(&[
            libc::SYS_close as u64,
            libc::SYS_lseek as u64,
            libc::SYS_mincore as u64,
            libc::SYS_mprotect as u64,
            libc::SYS_munmap as u64,
            libc::SYS_pipe2 as u64,
            libc::SYS_brk as u64,
            libc::SYS_clock_gettime as u64,
            libc::SYS_dup as u64,
            libc::SYS_fcntl as u64,
            libc::SYS_getpid as u64,
            libc::SYS_gettid as u64,
            libc::SYS_madvise as u64,
        ])
        // Reading the target's memory, and nothing else's. PID 1 covers the
        // target being init of its own namespace.
        .add_policy_on_syscall(libc::SYS_process_vm_readv as u64, {
            let mut p = vec![bpf::arg32(0)];
            p.extend(bpf::jeq32(target.as_raw() as u32, bpf::allow()));
            p.extend(bpf::jeq32(1, bpf::allow()));
            p
        })
        .add_file_at(maps_file, format!("/proc/{target}/maps"), false)
        .add_file_at(
            maps_file,
            format!("/proc/{target}/task/{target}/maps"),
            false,
        )
        .collect_stacktraces_on_violation(false)
        .unsafe_keep_capabilities(&["CAP_SYS_PTRACE"]);
    if exe_path != app_path {
        builder = builder.add_file_at(exe_path, app_path, false);
    } else {
        builder = builder.add_file(app_path);
    }
    for dir in ["/usr/lib64", "/usr/lib", "/lib64", "/lib"] {
        if Path::new(dir).exists() {
            builder = builder.add_directory(dir);
        }
    }
    builder.try_build()
}

fn launch_unwind_sandbox(regs: &Regs, mounts: &MountTree) -> Result<Vec<String>> {
    let target = regs.pid();
    let temp = UnwindTempDir::create()?;

    let maps_contents = util::read_proc_maps(target);
    if maps_contents.is_empty() {
        return Err(WardenError::StackTrace("target maps unavailable".into()));
    }
    let maps_file = temp.path().join("maps");
    std::fs::write(&maps_file, &maps_contents)?;

    // The path as the target sees it; possibly ' (deleted)' suffixed.
    let app_path = std::fs::read_link(format!("/proc/{target}/exe"))
        .map_err(|e| WardenError::StackTrace(format!("resolving target binary: {e}")))?;
    let (app_path, exe_path) = match mounts.resolve_path(&app_path) {
        Some(outside) => (app_path, outside),
        None => {
            // Backing file removed; mount a copy of /proc/<pid>/exe.
            let app_path = PathBuf::from(
                app_path
                    .to_string_lossy()
                    .trim_end_matches(" (deleted)")
                    .to_string(),
            );
            let exe_copy = temp.path().join("exe");
            std::fs::copy(format!("/proc/{target}/exe"), &exe_copy)
                .map_err(|e| WardenError::StackTrace(format!("copying target binary: {e}")))?;
            (app_path, exe_copy)
        }
    };
    tracing::debug!(app = %app_path.display(), exe = %exe_path.display(), "resolved target binary");

    let policy = unwind_policy(target, &maps_file, &app_path, &exe_path)?;
    let mut executor = Executor::for_unwind_of(target)?;
    executor.set_limits(
        crate::limits::Limits::new()
            .rlimit_cpu(10)
            .wall_time_limit(UNWIND_WALL_TIME),
    );

    let mut sandbox = Sandbox::new(executor, policy);
    if !sandbox.run_async() {
        return Err(WardenError::StackTrace(
            "unwind sandbox failed to start".into(),
        ));
    }
    let comms = sandbox.comms();
    let outcome = (|| {
        comms.send_msg(&UnwindSetup {
            pid: target.as_raw() as u32,
            regs: regs.raw_bytes(),
            default_max_frames: DEFAULT_MAX_FRAMES,
        })?;
        if !comms.recv_bool()? {
            let message = comms
                .recv_string()
                .unwrap_or_else(|_| "unknown unwinder error".into());
            return Err(WardenError::StackTrace(message));
        }
        let result: UnwindResult = comms.recv_msg()?;
        Ok(result.stacktrace)
    })();
    sandbox.kill();
    let _ = sandbox.await_result();
    outcome
}

/// Produces a compacted stack trace of the (stopped) target.
pub(crate) fn get_stack_trace(regs: &Regs, mounts: &MountTree) -> Result<Vec<String>> {
    let frames = if SANDBOXED_UNWINDER.load(Ordering::Acquire) {
        launch_unwind_sandbox(regs, mounts)?
    } else {
        tracing::warn!("using the in-process unwinder");
        let maps = util::read_proc_maps(regs.pid());
        crate::unwind::unwind_remote(regs.pid(), regs, &maps, DEFAULT_MAX_FRAMES)?
    };
    Ok(compact_stack_trace(&frames))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn compaction_collapses_runs() {
        let trace = strings(&["a", "a", "a", "b", "c", "c"]);
        assert_eq!(
            compact_stack_trace(&trace),
            strings(&[
                "a",
                "(previous frame repeated 2 times)",
                "b",
                "c",
                "(previous frame repeated 1 times)",
            ])
        );
    }

    #[test]
    fn compaction_is_idempotent() {
        let trace = strings(&["x", "x", "y", "y", "y", "z"]);
        let once = compact_stack_trace(&trace);
        let twice = compact_stack_trace(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn compaction_of_unique_frames_is_identity() {
        let trace = strings(&["a", "b", "c"]);
        assert_eq!(compact_stack_trace(&trace), trace);
    }

    #[test]
    fn unwind_policy_builds() {
        let policy = unwind_policy(
            Pid::from_raw(12345),
            Path::new("/tmp/maps"),
            Path::new("/usr/bin/target"),
            Path::new("/usr/bin/target"),
        )
        .unwrap();
        // The program must assemble and stay within kernel limits.
        let program = policy.program().unwrap();
        assert!(program.len() < crate::bpf::BPF_MAXINSNS);
    }

    #[test]
    fn temp_dirs_are_cleaned_up() {
        let path = {
            let temp = UnwindTempDir::create().unwrap();
            assert!(temp.path().is_dir());
            temp.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
