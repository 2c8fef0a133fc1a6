//! `nameserver`: the PostTroll Name Service daemon binary (spec.md §6).
//!
//! ```text
//! nameserver [-h] [-d {start,stop,status,restart}] [-l LOG] [-v]
//!            [--no-multicast] [--restrict-to-localhost]
//! ```
//!
//! Exit codes: 0 normal, 1 usage, 2 daemon action failed.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use posttroll_nameserver::pidfile::PidFile;
use posttroll_nameserver::{NameService, NameServiceOptions};
use posttroll_types::Config;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DaemonAction {
    Start,
    Stop,
    Status,
    Restart,
}

#[derive(Parser, Debug)]
#[command(name = "nameserver", about = "PostTroll name service daemon")]
struct Args {
    /// Run an OS-level daemon lifecycle action instead of running in the
    /// foreground.
    #[arg(short = 'd', long = "daemon", value_enum)]
    daemon: Option<DaemonAction>,

    /// Write logs to this file instead of stderr.
    #[arg(short = 'l', long = "log")]
    log: Option<PathBuf>,

    /// Increase log verbosity (info → debug → trace).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable the multicast listener; rely solely on direct
    /// `have_address`/`stop_address` pushes.
    #[arg(long = "no-multicast")]
    no_multicast: bool,

    /// Bind the reply socket to loopback only.
    #[arg(long = "restrict-to-localhost")]
    restrict_to_localhost: bool,
}

fn init_tracing(verbose: u8, log_file: Option<&PathBuf>) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| format!("posttroll={level}").parse())
        .unwrap_or_else(|_: tracing_subscriber::filter::ParseError| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(path) => {
            if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
                builder.with_writer(std::sync::Mutex::new(file)).init();
            } else {
                builder.init();
            }
        }
        None => builder.init(),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose, args.log.as_ref());

    if let Some(action) = args.daemon {
        return run_daemon_action(action);
    }

    match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime.block_on(run_foreground(&args)),
        Err(e) => {
            tracing::error!(error = %e, "failed to start tokio runtime");
            ExitCode::from(2)
        }
    }
}

/// Handle `-d start|stop|status|restart`: manage the pidfile and signal
/// the already-running process. `start` re-execs the current binary
/// without `-d` in the background so the daemon action itself returns
/// promptly (spec.md §7 "Daemon start-failure is fatal; exit non-zero
/// with a clear message").
fn run_daemon_action(action: DaemonAction) -> ExitCode {
    let pidfile = PidFile::new(PidFile::default_path());
    match action {
        DaemonAction::Status => match pidfile.running_pid() {
            Ok(Some(pid)) => {
                println!("nameserver is running (pid {pid})");
                ExitCode::SUCCESS
            }
            Ok(None) => {
                println!("nameserver is not running");
                ExitCode::from(2)
            }
            Err(e) => {
                eprintln!("failed to read pidfile: {e}");
                ExitCode::from(2)
            }
        },
        DaemonAction::Stop => match pidfile.signal_stop() {
            Ok(pid) => {
                println!("sent stop signal to nameserver (pid {pid})");
                pidfile.release();
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("failed to stop nameserver: {e}");
                ExitCode::from(2)
            }
        },
        DaemonAction::Start => match spawn_background(&pidfile) {
            Ok(pid) => {
                println!("nameserver started (pid {pid})");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("failed to start nameserver: {e}");
                ExitCode::from(2)
            }
        },
        DaemonAction::Restart => {
            if let Ok(pid) = pidfile.signal_stop() {
                tracing::info!(pid, "stopped previous nameserver instance");
            }
            pidfile.release();
            match spawn_background(&pidfile) {
                Ok(pid) => {
                    println!("nameserver restarted (pid {pid})");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("failed to restart nameserver: {e}");
                    ExitCode::from(2)
                }
            }
        }
    }
}

/// Re-exec this binary without `-d`, detached from the parent's stdio,
/// and claim `pidfile` for the new child.
fn spawn_background(pidfile: &PidFile) -> posttroll_nameserver::pidfile::Result<u32> {
    pidfile.acquire()?;
    let exe = std::env::current_exe().map_err(|source| posttroll_nameserver::pidfile::PidFileError::Io {
        path: pidfile.path().to_path_buf(),
        source,
    })?;
    let mut forwarded: Vec<String> = std::env::args().skip(1).filter(|a| a != "-d" && !a.starts_with("--daemon")).collect();
    forwarded.retain(|a| !matches!(a.as_str(), "start" | "stop" | "status" | "restart"));

    let child = std::process::Command::new(exe)
        .args(&forwarded)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|source| posttroll_nameserver::pidfile::PidFileError::Io {
            path: pidfile.path().to_path_buf(),
            source,
        })?;
    let pid = child.id();
    // The parent only held the pidfile to detect a concurrent `start`;
    // the child never touches it, so record its real pid here so
    // `status`/`stop` address the process that actually owns the
    // listening socket.
    pidfile.release();
    let real_pidfile = PidFile::new(pidfile.path());
    overwrite_pid(&real_pidfile, pid)?;
    std::mem::forget(child);
    Ok(pid)
}

fn overwrite_pid(pidfile: &PidFile, pid: u32) -> posttroll_nameserver::pidfile::Result<()> {
    std::fs::write(pidfile.path(), pid.to_string()).map_err(|source| {
        posttroll_nameserver::pidfile::PidFileError::Io { path: pidfile.path().to_path_buf(), source }
    })
}

async fn run_foreground(args: &Args) -> ExitCode {
    let config = Config::current();
    let options = NameServiceOptions {
        no_multicast: args.no_multicast,
        restrict_to_localhost: args.restrict_to_localhost,
        ..Default::default()
    };

    let mut service = match NameService::start(&config, options).await {
        Ok(service) => service,
        Err(e) => {
            tracing::error!(error = %e, "failed to start name service");
            return ExitCode::from(2);
        }
    };
    tracing::info!(address = %service.local_addr(), "nameserver listening");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    tracing::info!("shutdown signal received");
    service.stop().await;
    ExitCode::SUCCESS
}
