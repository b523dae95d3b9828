//! Accepted socket streams and their disconnect watch.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionError};

const PROBE_BYTES: usize = 64;

/// Duplex stream over an accepted socket.
///
/// The socket is shared with the connection's disconnect watch, so reads and
/// writes go through readiness polling on a shared handle rather than an
/// owned half. Dropping the last clone closes the socket.
#[derive(Debug, Clone)]
pub enum SocketStream {
    /// Accepted TCP client.
    Tcp(Arc<TcpStream>),
    /// Accepted Unix domain socket client.
    #[cfg(unix)]
    Unix(Arc<UnixStream>),
}

impl SocketStream {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self {
            Self::Tcp(stream) => stream.poll_read_ready(cx),
            #[cfg(unix)]
            Self::Unix(stream) => stream.poll_read_ready(cx),
        }
    }

    fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self {
            Self::Tcp(stream) => stream.poll_write_ready(cx),
            #[cfg(unix)]
            Self::Unix(stream) => stream.poll_write_ready(cx),
        }
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.try_read(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.try_read(buf),
        }
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.try_write(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.try_write(buf),
        }
    }

    async fn readable(&self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.readable().await,
            #[cfg(unix)]
            Self::Unix(stream) => stream.readable().await,
        }
    }
}

impl AsyncRead for SocketStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            ready!(self.poll_read_ready(cx))?;
            match self.try_read(buf.initialize_unfilled()) {
                Ok(read) => {
                    buf.advance(read);
                    return Poll::Ready(Ok(()));
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
                Err(error) => return Poll::Ready(Err(error)),
            }
        }
    }
}

impl AsyncWrite for SocketStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            ready!(self.poll_write_ready(cx))?;
            match self.try_write(buf) {
                Ok(written) => return Poll::Ready(Ok(written)),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
                Err(error) => return Poll::Ready(Err(error)),
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A client accepted by [`super::SocketListener`].
#[derive(Debug)]
pub struct SocketConnection {
    identifier: String,
    stream: SocketStream,
}

impl SocketConnection {
    pub(crate) const fn new(identifier: String, stream: SocketStream) -> Self {
        Self { identifier, stream }
    }
}

impl Connection for SocketConnection {
    type Stream = SocketStream;

    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn stream(&mut self) -> &mut Self::Stream {
        &mut self.stream
    }

    fn wait_for_disconnect(
        &self,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send + 'static {
        watch_disconnect(self.stream.clone(), cancel)
    }
}

/// Resolves once the peer closes its end of the socket.
///
/// Clients send exactly one request and then wait, so any bytes that arrive
/// during the build are discarded. End of stream and reset-style errors both
/// count as a disconnect.
async fn watch_disconnect(
    stream: SocketStream,
    cancel: CancellationToken,
) -> Result<(), ConnectionError> {
    let mut probe = [0_u8; PROBE_BYTES];
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ConnectionError::Cancelled),
            ready = stream.readable() => ready.map_err(|source| ConnectionError::Io { source })?,
        }
        match stream.try_read(&mut probe) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
            Err(error) if is_disconnect(&error) => return Ok(()),
            Err(source) => return Err(ConnectionError::Io { source }),
        }
    }
}

fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
