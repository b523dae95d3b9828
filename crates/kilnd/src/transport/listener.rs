//! Listener that yields socket connections to the dispatcher.

use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use kiln_config::SocketEndpoint;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::stream::{SocketConnection, SocketStream};
use super::{LISTENER_TARGET, ListenerError};
use crate::connection::{ConnectionError, ConnectionSource};

#[cfg(unix)]
use camino::Utf8Path;
#[cfg(unix)]
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;
#[cfg(unix)]
use tokio::net::UnixListener;
#[cfg(unix)]
use tracing::warn;

/// Socket listener bound to the configured endpoint.
///
/// Cloning shares the bound socket. A Unix socket file is removed once the
/// last clone, including any in-flight accept, is dropped.
#[derive(Debug, Clone)]
pub struct SocketListener {
    inner: Arc<ListenerInner>,
}

#[derive(Debug)]
struct ListenerInner {
    endpoint: SocketEndpoint,
    kind: ListenerKind,
    accepted: AtomicU64,
}

#[derive(Debug)]
enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl SocketListener {
    /// Binds the endpoint and registers it with the current Tokio runtime.
    ///
    /// A leftover Unix socket file is removed when nothing answers on it; a
    /// live one is reported as [`ListenerError::UnixInUse`]. Must be called
    /// from within a runtime.
    pub fn bind(endpoint: &SocketEndpoint) -> Result<Self, ListenerError> {
        let kind = match endpoint {
            SocketEndpoint::Tcp { host, port } => bind_tcp(host, *port)?,
            SocketEndpoint::Unix { path } => {
                #[cfg(unix)]
                {
                    bind_unix(path)?
                }

                #[cfg(not(unix))]
                {
                    let _ = path;
                    return Err(ListenerError::UnsupportedUnix {
                        endpoint: endpoint.to_string(),
                    });
                }
            }
        };
        info!(
            target: LISTENER_TARGET,
            endpoint = %endpoint,
            "socket listener bound"
        );
        Ok(Self {
            inner: Arc::new(ListenerInner {
                endpoint: endpoint.clone(),
                kind,
                accepted: AtomicU64::new(0),
            }),
        })
    }

    /// Endpoint this listener was bound to.
    #[must_use]
    pub fn endpoint(&self) -> &SocketEndpoint {
        &self.inner.endpoint
    }

    /// Address actually bound for TCP listeners, useful when binding port 0.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.inner.kind {
            ListenerKind::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            ListenerKind::Unix(_) => None,
        }
    }
}

impl ListenerInner {
    async fn accept(&self) -> io::Result<SocketConnection> {
        let sequence = self.accepted.fetch_add(1, Ordering::Relaxed) + 1;
        let connection = match &self.kind {
            ListenerKind::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                SocketConnection::new(
                    format!("tcp#{sequence}@{peer}"),
                    SocketStream::Tcp(Arc::new(stream)),
                )
            }
            #[cfg(unix)]
            ListenerKind::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                SocketConnection::new(
                    format!("unix#{sequence}"),
                    SocketStream::Unix(Arc::new(stream)),
                )
            }
        };
        debug!(
            target: LISTENER_TARGET,
            sequence,
            "client accepted"
        );
        Ok(connection)
    }
}

impl ConnectionSource for SocketListener {
    type Connection = SocketConnection;

    fn wait_for_connection(
        &self,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Self::Connection, ConnectionError>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(ConnectionError::Cancelled),
                accepted = inner.accept() => {
                    accepted.map_err(|source| ConnectionError::Accept { source })
                }
            }
        }
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let SocketEndpoint::Unix { path } = &self.endpoint {
            cleanup_unix_socket(path);
        }
    }
}

fn bind_tcp(host: &str, port: u16) -> Result<ListenerKind, ListenerError> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| ListenerError::Resolve {
            host: host.to_owned(),
            port,
            source,
        })?;
    let addr = addrs.next().ok_or_else(|| ListenerError::ResolveEmpty {
        host: host.to_owned(),
        port,
    })?;
    let listener = std::net::TcpListener::bind(addr)
        .map_err(|source| ListenerError::BindTcp { addr, source })?;
    listener
        .set_nonblocking(true)
        .map_err(ListenerError::register)?;
    TcpListener::from_std(listener)
        .map(ListenerKind::Tcp)
        .map_err(ListenerError::register)
}

#[cfg(unix)]
fn bind_unix(path: &Utf8Path) -> Result<ListenerKind, ListenerError> {
    if path.exists() {
        remove_stale_socket(path)?;
    }
    let listener =
        std::os::unix::net::UnixListener::bind(path).map_err(|source| ListenerError::BindUnix {
            path: path.to_owned(),
            source,
        })?;
    let registered = listener
        .set_nonblocking(true)
        .and_then(|()| UnixListener::from_std(listener));
    match registered {
        Ok(listener) => Ok(ListenerKind::Unix(listener)),
        Err(error) => {
            cleanup_unix_socket(path);
            Err(ListenerError::register(error))
        }
    }
}

/// Removes a socket file left behind by a server that is no longer running.
#[cfg(unix)]
fn remove_stale_socket(path: &Utf8Path) -> Result<(), ListenerError> {
    let metadata = fs::symlink_metadata(path).map_err(|source| ListenerError::UnixProbe {
        path: path.to_owned(),
        source,
    })?;
    if !metadata.file_type().is_socket() {
        return Err(ListenerError::UnixNotSocket {
            path: path.to_owned(),
        });
    }
    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_live) => Err(ListenerError::UnixInUse {
            path: path.to_owned(),
        }),
        Err(error)
            if matches!(
                error.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
            ) =>
        {
            info!(
                target: LISTENER_TARGET,
                path = %path,
                "removing stale socket"
            );
            fs::remove_file(path).map_err(|source| ListenerError::UnixCleanup {
                path: path.to_owned(),
                source,
            })
        }
        Err(source) => Err(ListenerError::UnixProbe {
            path: path.to_owned(),
            source,
        }),
    }
}

#[cfg(unix)]
fn cleanup_unix_socket(path: &Utf8Path) {
    if let Err(error) = fs::remove_file(path)
        && error.kind() != io::ErrorKind::NotFound
    {
        warn!(
            target: LISTENER_TARGET,
            error = %error,
            path = %path,
            "failed to remove unix socket file"
        );
    }
}
