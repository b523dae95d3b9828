//! Exclusive ownership of the server's runtime directory.
//!
//! The lock file is created with `create_new` so two servers cannot share a
//! socket. A lock left behind by a crashed server is reclaimed once the PID
//! it recorded no longer answers a null signal.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use kiln_config::RuntimePaths;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{info, warn};

use super::PROCESS_TARGET;
use super::errors::LaunchError;
use super::files::write_private;

/// Lifecycle phase published in the health snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Runtime files are in place; the socket is not bound yet.
    Starting,
    /// The dispatcher is accepting connections.
    Ready,
    /// The dispatcher has stopped and the process is exiting.
    Stopping,
}

#[derive(Debug, Serialize)]
struct HealthSnapshot<'a> {
    status: HealthState,
    pid: u32,
    socket: &'a str,
    timestamp: u64,
}

/// Holds the runtime lock and removes every runtime artefact on drop.
#[derive(Debug)]
pub(crate) struct ProcessGuard {
    paths: RuntimePaths,
    socket: String,
    pid: Option<u32>,
    _lock: File,
}

impl ProcessGuard {
    /// Takes the runtime lock, reclaiming it from a dead server if needed.
    pub(crate) fn acquire(paths: RuntimePaths, socket: String) -> Result<Self, LaunchError> {
        let lock = acquire_lock(&paths)?;
        Ok(Self {
            paths,
            socket,
            pid: None,
            _lock: lock,
        })
    }

    pub(crate) fn write_pid(&mut self, pid: u32) -> Result<(), LaunchError> {
        let path = self.paths.pid_path();
        write_private(path, format!("{pid}\n").as_bytes()).map_err(|source| {
            LaunchError::PidWrite {
                path: path.to_path_buf(),
                source,
            }
        })?;
        self.pid = Some(pid);
        info!(
            target: PROCESS_TARGET,
            pid,
            file = %path.display(),
            "pid file written"
        );
        Ok(())
    }

    pub(crate) fn write_health(&self, status: HealthState) -> Result<(), LaunchError> {
        let pid = self.pid.ok_or(LaunchError::MissingPid)?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|source| LaunchError::Clock { source })?
            .as_secs();
        let snapshot = HealthSnapshot {
            status,
            pid,
            socket: &self.socket,
            timestamp,
        };
        let mut payload = serde_json::to_vec(&snapshot)?;
        payload.push(b'\n');

        let path = self.paths.health_path();
        write_private(path, &payload).map_err(|source| LaunchError::HealthWrite {
            path: path.to_path_buf(),
            source,
        })?;
        info!(
            target: PROCESS_TARGET,
            status = ?status,
            file = %path.display(),
            "health snapshot updated"
        );
        Ok(())
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        for path in [
            self.paths.health_path(),
            self.paths.pid_path(),
            self.paths.lock_path(),
        ] {
            if let Err(error) = fs::remove_file(path)
                && error.kind() != io::ErrorKind::NotFound
            {
                warn!(
                    target: PROCESS_TARGET,
                    file = %path.display(),
                    error = %error,
                    "failed to remove runtime file"
                );
            }
        }
    }
}

fn acquire_lock(paths: &RuntimePaths) -> Result<File, LaunchError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    match options.open(paths.lock_path()) {
        Ok(file) => {
            info!(
                target: PROCESS_TARGET,
                file = %paths.lock_path().display(),
                "acquired runtime lock"
            );
            Ok(file)
        }
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists => reclaim_lock(paths),
        Err(source) => Err(LaunchError::LockCreate {
            path: paths.lock_path().to_path_buf(),
            source,
        }),
    }
}

fn reclaim_lock(paths: &RuntimePaths) -> Result<File, LaunchError> {
    if let Some(pid) = read_pid(paths.pid_path()) {
        if process_alive(pid)? {
            info!(
                target: PROCESS_TARGET,
                pid,
                "refusing to start: another server is running"
            );
            return Err(LaunchError::AlreadyRunning { pid });
        }
        warn!(
            target: PROCESS_TARGET,
            pid,
            "previous server is gone; removing stale runtime files"
        );
    }
    remove_stale(paths.lock_path())?;
    remove_stale(paths.pid_path())?;
    acquire_lock(paths)
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid != 0)
}

fn remove_stale(path: &Path) -> Result<(), LaunchError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LaunchError::Cleanup {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn process_alive(pid: u32) -> Result<bool, LaunchError> {
    let Ok(raw) = i32::try_from(pid) else {
        return Ok(false);
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(source) => Err(LaunchError::CheckProcess { pid, source }),
    }
}

#[cfg(test)]
mod tests {
    use kiln_config::{Config, SocketEndpoint};
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;

    struct Runtime {
        _dir: TempDir,
        paths: RuntimePaths,
    }

    #[fixture]
    fn runtime() -> Runtime {
        let dir = TempDir::new().expect("temp dir");
        let socket = dir.path().join("kilnd.sock");
        let config = Config {
            daemon_socket: SocketEndpoint::unix(socket.to_str().expect("utf8 path")),
            ..Config::default()
        };
        let paths = RuntimePaths::from_config(&config).expect("runtime paths");
        Runtime { _dir: dir, paths }
    }

    fn acquire(paths: &RuntimePaths) -> Result<ProcessGuard, LaunchError> {
        ProcessGuard::acquire(paths.clone(), "unix:///tmp/kilnd.sock".to_owned())
    }

    #[rstest]
    fn second_guard_is_refused_while_first_is_alive(runtime: Runtime) {
        let mut first = acquire(&runtime.paths).expect("first guard");
        first.write_pid(std::process::id()).expect("write pid");

        let error = acquire(&runtime.paths).expect_err("lock is held");
        assert!(matches!(error, LaunchError::AlreadyRunning { pid } if pid == std::process::id()));
    }

    #[rstest]
    fn stale_lock_from_dead_process_is_reclaimed(runtime: Runtime) {
        fs::write(runtime.paths.lock_path(), b"").expect("seed lock");
        // PIDs near the i32 ceiling are never allocated on Linux or macOS.
        fs::write(runtime.paths.pid_path(), b"2147483000\n").expect("seed pid");

        let guard = acquire(&runtime.paths).expect("stale lock reclaimed");
        assert!(runtime.paths.lock_path().exists());
        assert!(!runtime.paths.pid_path().exists());
        drop(guard);
    }

    #[rstest]
    fn health_requires_a_pid(runtime: Runtime) {
        let guard = acquire(&runtime.paths).expect("guard");
        let error = guard
            .write_health(HealthState::Starting)
            .expect_err("pid missing");
        assert!(matches!(error, LaunchError::MissingPid));
    }

    #[rstest]
    fn health_snapshot_is_json(runtime: Runtime) {
        let mut guard = acquire(&runtime.paths).expect("guard");
        guard.write_pid(4242).expect("write pid");
        guard.write_health(HealthState::Ready).expect("write health");

        let raw = fs::read_to_string(runtime.paths.health_path()).expect("read health");
        let snapshot: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(snapshot["status"], "ready");
        assert_eq!(snapshot["pid"], 4242);
        assert_eq!(snapshot["socket"], "unix:///tmp/kilnd.sock");
    }

    #[rstest]
    fn dropping_the_guard_removes_runtime_files(runtime: Runtime) {
        let mut guard = acquire(&runtime.paths).expect("guard");
        guard.write_pid(4242).expect("write pid");
        guard.write_health(HealthState::Stopping).expect("write health");
        drop(guard);

        assert!(!runtime.paths.lock_path().exists());
        assert!(!runtime.paths.pid_path().exists());
        assert!(!runtime.paths.health_path().exists());
    }
}
