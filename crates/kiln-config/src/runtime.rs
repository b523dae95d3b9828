//! Runtime artefact paths shared by the server and its lifecycle commands.
//!
//! The runtime directory holds the server lock, PID file, and health
//! snapshot. It is the socket's parent directory for Unix endpoints and a
//! per-user directory otherwise.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::defaults::RUNTIME_NAMESPACE;
use crate::{Config, SocketEndpoint};

#[cfg(unix)]
use dirs::runtime_dir;

/// Canonical paths for runtime artefacts written by the server.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    runtime_dir: PathBuf,
    lock_path: PathBuf,
    pid_path: PathBuf,
    health_path: PathBuf,
}

impl RuntimePaths {
    /// Derives runtime paths from configuration, creating the directory.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimePathsError`] when the directory cannot be derived or
    /// created.
    pub fn from_config(config: &Config) -> Result<Self, RuntimePathsError> {
        let runtime_dir = runtime_directory(config)?;
        fs::create_dir_all(&runtime_dir).map_err(|source| RuntimePathsError::RuntimeDirectory {
            path: runtime_dir.clone(),
            source,
        })?;
        Ok(Self {
            lock_path: runtime_dir.join("kilnd.lock"),
            pid_path: runtime_dir.join("kilnd.pid"),
            health_path: runtime_dir.join("kilnd.health"),
            runtime_dir,
        })
    }

    /// Directory holding runtime artefacts.
    #[must_use]
    pub fn runtime_dir(&self) -> &Path {
        self.runtime_dir.as_path()
    }

    /// Lock file guarding single-instance startup.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        self.lock_path.as_path()
    }

    /// PID file.
    #[must_use]
    pub fn pid_path(&self) -> &Path {
        self.pid_path.as_path()
    }

    /// Health snapshot.
    #[must_use]
    pub fn health_path(&self) -> &Path {
        self.health_path.as_path()
    }
}

fn runtime_directory(config: &Config) -> Result<PathBuf, RuntimePathsError> {
    match config.daemon_socket() {
        SocketEndpoint::Unix { path } => path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .map(|parent| parent.as_std_path().to_path_buf())
            .ok_or_else(|| RuntimePathsError::MissingSocketParent {
                path: path.to_string(),
            }),
        SocketEndpoint::Tcp { .. } => Ok(default_runtime_directory()),
    }
}

fn default_runtime_directory() -> PathBuf {
    #[cfg(unix)]
    {
        if let Some(mut dir) = runtime_dir() {
            dir.push(RUNTIME_NAMESPACE);
            return dir;
        }
        let mut dir = env::temp_dir();
        dir.push(RUNTIME_NAMESPACE);
        dir.push(crate::defaults::user_namespace());
        dir
    }

    #[cfg(not(unix))]
    {
        let mut dir = env::temp_dir();
        dir.push(RUNTIME_NAMESPACE);
        dir
    }
}

/// Errors raised while deriving runtime paths.
#[derive(Debug, Error)]
pub enum RuntimePathsError {
    /// The socket path lacked a parent directory.
    #[error("socket path '{path}' has no parent directory")]
    MissingSocketParent {
        /// Offending socket path.
        path: String,
    },
    /// Creating the runtime directory failed.
    #[error("failed to prepare runtime directory '{path}': {source}")]
    RuntimeDirectory {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn derives_paths_beside_unix_socket() {
        let dir = TempDir::new().expect("temp dir");
        let socket = dir.path().join("kilnd.sock");
        let config = Config {
            daemon_socket: SocketEndpoint::unix(socket.to_str().expect("utf-8 path")),
            ..Config::default()
        };
        let paths = RuntimePaths::from_config(&config).expect("paths derive");
        assert_eq!(paths.runtime_dir(), dir.path());
        assert!(paths.lock_path().ends_with("kilnd.lock"));
        assert!(paths.pid_path().ends_with("kilnd.pid"));
        assert!(paths.health_path().ends_with("kilnd.health"));
    }

    #[test]
    fn derives_paths_for_tcp_socket() {
        let config = Config {
            daemon_socket: SocketEndpoint::tcp("127.0.0.1", 9000),
            ..Config::default()
        };
        let paths = RuntimePaths::from_config(&config).expect("paths derive for tcp");
        let tail = paths
            .runtime_dir()
            .file_name()
            .and_then(|name| name.to_str())
            .expect("runtime dir should have a trailing component");
        assert!(
            tail == RUNTIME_NAMESPACE || tail.starts_with("uid-"),
            "unexpected runtime tail: {tail}"
        );
    }

    #[test]
    fn rejects_unix_socket_without_parent() {
        let config = Config {
            daemon_socket: SocketEndpoint::unix("kilnd.sock"),
            ..Config::default()
        };
        let error = RuntimePaths::from_config(&config).expect_err("no parent directory");
        assert!(matches!(error, RuntimePathsError::MissingSocketParent { .. }));
    }
}
