//! Minimal client for talking to a running compilation server.
//!
//! Each call opens a fresh connection, writes one framed request and reads
//! one framed response, mirroring the server's one-exchange-per-connection
//! contract.

use std::future::Future;
use std::io;
use std::time::Duration;

use kiln_config::SocketEndpoint;
use kiln_protocol::{BuildRequest, BuildResponse, ProtocolError, ResponseKind};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Upper bound on establishing a connection.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while talking to the server.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out connecting to {endpoint}")]
    Timeout { endpoint: String },
    #[cfg(not(unix))]
    #[error("unix sockets are unsupported for endpoint {endpoint}")]
    UnsupportedUnix { endpoint: String },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("server answered with an unexpected {kind:?} response")]
    UnexpectedResponse { kind: ResponseKind },
}

/// Sends `request` to the server at `endpoint` and waits for its response.
///
/// # Errors
///
/// Returns [`ClientError`] when the connection fails or the exchange cannot
/// be completed.
pub async fn send_request(
    endpoint: &SocketEndpoint,
    request: &BuildRequest,
) -> Result<BuildResponse, ClientError> {
    match endpoint {
        SocketEndpoint::Tcp { host, port } => {
            let connect = TcpStream::connect((host.as_str(), *port));
            let mut stream = with_timeout(endpoint, connect).await?;
            exchange(&mut stream, request).await
        }
        SocketEndpoint::Unix { path } => {
            #[cfg(unix)]
            {
                let connect = tokio::net::UnixStream::connect(path.as_std_path());
                let mut stream = with_timeout(endpoint, connect).await?;
                exchange(&mut stream, request).await
            }

            #[cfg(not(unix))]
            {
                let _ = path;
                Err(ClientError::UnsupportedUnix {
                    endpoint: endpoint.to_string(),
                })
            }
        }
    }
}

/// Asks the server to shut down and returns its process identifier.
///
/// # Errors
///
/// Returns [`ClientError::UnexpectedResponse`] when the server answers with
/// anything other than a shutdown acknowledgement.
pub async fn request_shutdown(endpoint: &SocketEndpoint) -> Result<u32, ClientError> {
    match send_request(endpoint, &BuildRequest::shutdown()).await? {
        BuildResponse::Shutdown { server_process_id } => Ok(server_process_id),
        other => Err(ClientError::UnexpectedResponse { kind: other.kind() }),
    }
}

async fn with_timeout<S>(
    endpoint: &SocketEndpoint,
    connect: impl Future<Output = io::Result<S>>,
) -> Result<S, ClientError> {
    match tokio::time::timeout(CONNECTION_TIMEOUT, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ClientError::Connect {
            endpoint: endpoint.to_string(),
            source,
        }),
        Err(_elapsed) => Err(ClientError::Timeout {
            endpoint: endpoint.to_string(),
        }),
    }
}

async fn exchange<S>(stream: &mut S, request: &BuildRequest) -> Result<BuildResponse, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    request.write_to(stream).await?;
    Ok(BuildResponse::read_from(stream).await?)
}
