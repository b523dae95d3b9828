//! Abstractions over accepted client channels.
//!
//! The dispatcher never talks to a transport directly. A [`ConnectionSource`]
//! yields one [`Connection`] per accepted client, and each connection exposes
//! its duplex stream plus a cancellable watch that resolves when the peer
//! goes away. Both futures are `'static` so the dispatcher can spawn them or
//! drop them at any point without leaking borrowed state.

use std::future::Future;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// One accepted client, owned by a single exchange.
pub trait Connection: Send + 'static {
    /// Duplex byte stream carrying the request and response frames.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Opaque identifier used in diagnostics.
    fn identifier(&self) -> &str;

    /// Borrows the duplex stream.
    fn stream(&mut self) -> &mut Self::Stream;

    /// Resolves with `Ok(())` once the peer has disconnected.
    ///
    /// Returns [`ConnectionError::Cancelled`] when `cancel` fires first. Any
    /// other error is unexpected and treated as a server integrity failure.
    fn wait_for_disconnect(
        &self,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send + 'static;
}

/// Produces connections for the dispatcher, one per call.
///
/// Accepting is independent of serving: a new call may be issued while
/// earlier connections are still being handled.
pub trait ConnectionSource: Send + Sync + 'static {
    /// Connection type yielded by this source.
    type Connection: Connection;

    /// Waits for the next client.
    fn wait_for_connection(
        &self,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Self::Connection, ConnectionError>> + Send + 'static;
}

/// Failures surfaced by connection sources and disconnect watches.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The transport failed to accept a client.
    #[error("failed to accept connection: {source}")]
    Accept {
        /// Underlying transport error.
        #[source]
        source: io::Error,
    },
    /// The operation was abandoned because its token was cancelled.
    #[error("connection operation cancelled")]
    Cancelled,
    /// The stream failed while being observed.
    #[error("connection stream failed: {source}")]
    Io {
        /// Underlying stream error.
        #[source]
        source: io::Error,
    },
    /// The disconnect watch failed for a reason other than the stream.
    #[error("disconnect watch failed: {message}")]
    Watch {
        /// Description of the failure.
        message: String,
    },
}

impl ConnectionError {
    /// Returns `true` for cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
