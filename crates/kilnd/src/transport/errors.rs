//! Error types for binding the compilation server's socket.

use std::io;
use std::net::SocketAddr;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors surfaced while binding the socket listener.
///
/// Accept failures after a successful bind are not listener errors; they
/// surface through [`crate::ConnectionError::Accept`] so the dispatcher can
/// retry.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to resolve TCP address {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("no TCP addresses resolved for {host}:{port}")]
    ResolveEmpty { host: String, port: u16 },
    #[error("failed to bind TCP listener at {addr}: {source}")]
    BindTcp {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to hand the listener to the async runtime: {source}")]
    Register {
        #[source]
        source: io::Error,
    },
    #[cfg(not(unix))]
    #[error("unix sockets are unsupported for endpoint {endpoint}")]
    UnsupportedUnix { endpoint: String },
    #[cfg(unix)]
    #[error("failed to bind unix listener at {path}: {source}")]
    BindUnix {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
    #[cfg(unix)]
    #[error("another server is already listening on {path}")]
    UnixInUse { path: Utf8PathBuf },
    #[cfg(unix)]
    #[error("{path} exists and is not a socket")]
    UnixNotSocket { path: Utf8PathBuf },
    #[cfg(unix)]
    #[error("failed to inspect existing socket {path}: {source}")]
    UnixProbe {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
    #[cfg(unix)]
    #[error("failed to remove stale socket {path}: {source}")]
    UnixCleanup {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ListenerError {
    /// Wraps a failure to register a bound socket with Tokio.
    pub(crate) const fn register(source: io::Error) -> Self {
        Self::Register { source }
    }
}
