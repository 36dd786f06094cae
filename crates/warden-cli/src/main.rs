//! warden CLI - run one binary under a sandbox policy built from flags

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use warden_core::{Executor, PolicyBuilder, Sandbox};

#[derive(Parser)]
#[command(name = "warden")]
#[command(author, version, about = "Process-level sandbox supervisor for Linux")]
struct Cli {
    /// Binary to sandbox
    binary: PathBuf,

    /// Arguments passed to the binary
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,

    /// Extra syscall numbers to allow
    #[arg(short = 's', long = "allow-syscall")]
    allow_syscalls: Vec<u64>,

    /// Allow the startup sequence of dynamically linked binaries
    #[arg(long, default_value_t = true)]
    dynamic_startup: bool,

    /// Read-only paths mapped into the sandbox
    #[arg(short = 'r', long = "ro")]
    ro_paths: Vec<PathBuf>,

    /// Writable paths mapped into the sandbox
    #[arg(short = 'w', long = "rw")]
    rw_paths: Vec<PathBuf>,

    /// tmpfs at /tmp of this many MiB
    #[arg(long, default_value = "16")]
    tmpfs_mb: u64,

    /// Wall-time limit in seconds (0 disables)
    #[arg(short, long, default_value = "30")]
    timeout: u64,

    /// Keep network access (skips the network namespace)
    #[arg(long)]
    network: bool,

    /// Use the seccomp user-notification monitor instead of ptrace
    #[arg(long)]
    unotify: bool,

    /// Let every syscall through and log it (debugging only)
    #[arg(long)]
    permissive: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // The fork server is created by forking; start it before anything else
    // spawns threads.
    warden_core::fork_server::ensure_started();

    let mut builder = PolicyBuilder::new()
        .allow_static_startup()
        .allow_exit()
        .add_libraries_for_binary(&cli.binary)
        .add_tmpfs("/tmp", cli.tmpfs_mb << 20);
    if cli.dynamic_startup {
        builder = builder.allow_dynamic_startup();
    }
    for path in &cli.ro_paths {
        builder = builder.add_directory(path);
    }
    for path in &cli.rw_paths {
        builder = builder.add_directory_at(path, path, true);
    }
    for nr in &cli.allow_syscalls {
        builder = builder.allow_syscall(*nr);
    }
    if cli.network {
        builder = builder.allow_unrestricted_networking();
    }
    if cli.permissive {
        builder = builder.danger_track_all_syscalls();
    }
    let policy = builder.try_build()?;

    let binary_name = cli.binary.display().to_string();
    let mut args: Vec<&str> = vec![&binary_name];
    args.extend(cli.args.iter().map(String::as_str));
    let mut executor = Executor::new(&cli.binary, &args)?;
    executor.set_limits(
        warden_core::limits::Limits::new().wall_time_limit(Duration::from_secs(cli.timeout)),
    );

    let mut sandbox = Sandbox::new(executor, policy);
    if cli.unotify {
        sandbox.enable_unotify_monitor()?;
    }
    let result = sandbox.run();
    println!("{result}");
    if let Some(usage) = result.rusage_sandboxee() {
        tracing::info!(
            user_ms = usage.user_time.as_millis(),
            system_ms = usage.system_time.as_millis(),
            max_rss_kib = usage.max_rss_kib,
            "sandboxee resource usage"
        );
    }
    result.ok()?;
    Ok(())
}
