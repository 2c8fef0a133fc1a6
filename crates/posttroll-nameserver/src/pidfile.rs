//! PID-file bookkeeping for `nameserver -d {start,stop,status,restart}`
//! (spec.md §6). Daemonization itself (forking, detaching from the
//! controlling terminal) is out of scope; these subcommands manage a
//! lockfile and signal an already-running process, mirroring
//! `ochra-daemon`'s single-process-per-socket-file discipline applied to
//! a PID instead of a Unix socket path.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("I/O error on pidfile {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("pidfile {path} contains a malformed pid: {contents:?}")]
    MalformedPid { path: PathBuf, contents: String },
    #[error("another nameserver is already running with pid {pid}")]
    AlreadyRunning { pid: i32 },
    #[error("no running nameserver found (pidfile {path} absent or stale)")]
    NotRunning { path: PathBuf },
    #[error("failed to signal pid {pid}: {source}")]
    Signal { pid: i32, source: nix::Error },
}

pub type Result<T> = std::result::Result<T, PidFileError>;

/// A pidfile at a fixed path, written by the owning process on `start`
/// and removed on clean exit.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default location, matching the convention of one pidfile per
    /// well-known service under `/var/run` (or `$TMPDIR` when
    /// unprivileged).
    pub fn default_path() -> PathBuf {
        std::env::var_os("POSTTROLL_NAMESERVER_PIDFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("posttroll-nameserver.pid"))
    }

    /// Read the pid recorded in the file, if any.
    pub fn read(&self) -> Result<Option<i32>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let trimmed = contents.trim();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                trimmed
                    .parse()
                    .map(Some)
                    .map_err(|_| PidFileError::MalformedPid {
                        path: self.path.clone(),
                        contents: contents.clone(),
                    })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PidFileError::Io { path: self.path.clone(), source }),
        }
    }

    /// Whether the pid in the file (if any) still refers to a live
    /// process. Stale pidfiles (process gone) are treated as absent.
    pub fn running_pid(&self) -> Result<Option<i32>> {
        match self.read()? {
            Some(pid) if process_alive(pid) => Ok(Some(pid)),
            _ => Ok(None),
        }
    }

    /// Claim the pidfile for the current process. Fails with
    /// `AlreadyRunning` if a live process already holds it.
    pub fn acquire(&self) -> Result<()> {
        if let Some(pid) = self.running_pid()? {
            return Err(PidFileError::AlreadyRunning { pid });
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| PidFileError::Io {
                    path: self.path.clone(),
                    source,
                })?;
            }
        }
        let mut file = fs::File::create(&self.path).map_err(|source| PidFileError::Io {
            path: self.path.clone(),
            source,
        })?;
        write!(file, "{}", std::process::id()).map_err(|source| PidFileError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Remove the pidfile. Idempotent.
    pub fn release(&self) {
        let _ = fs::remove_file(&self.path);
    }

    /// Send `SIGTERM` to the running process, if any.
    pub fn signal_stop(&self) -> Result<i32> {
        let pid = self.running_pid()?.ok_or_else(|| PidFileError::NotRunning {
            path: self.path.clone(),
        })?;
        signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
            .map_err(|source| PidFileError::Signal { pid, source })?;
        Ok(pid)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `kill(pid, 0)`: whether the process exists and is signalable by us,
/// without actually sending a signal to it.
fn process_alive(pid: i32) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}
