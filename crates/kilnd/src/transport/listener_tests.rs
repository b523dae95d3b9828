//! Tests for the socket listener and its connections.

use std::time::Duration;

use kiln_config::SocketEndpoint;
use rstest::{fixture, rstest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::{ListenerError, SocketListener};
use crate::connection::{Connection, ConnectionError, ConnectionSource};

const WATCH_DEADLINE: Duration = Duration::from_secs(5);

#[fixture]
fn tcp_endpoint() -> SocketEndpoint {
    SocketEndpoint::tcp("127.0.0.1", 0)
}

async fn accept_tcp(
    listener: &SocketListener,
) -> (super::SocketConnection, TcpStream) {
    let addr = listener
        .local_addr()
        .expect("listener should report local address");
    let accept = listener.wait_for_connection(CancellationToken::new());
    let (accepted, client) = tokio::join!(accept, TcpStream::connect(addr));
    (
        accepted.expect("accept connection"),
        client.expect("connect client"),
    )
}

#[rstest]
#[tokio::test]
async fn tcp_connection_carries_bytes_both_ways(tcp_endpoint: SocketEndpoint) {
    let listener = SocketListener::bind(&tcp_endpoint).expect("bind tcp listener");
    let (mut connection, mut client) = accept_tcp(&listener).await;
    assert!(connection.identifier().starts_with("tcp#1@"));

    client.write_all(b"ping").await.expect("client write");
    let mut received = [0_u8; 4];
    connection
        .stream()
        .read_exact(&mut received)
        .await
        .expect("server read");
    assert_eq!(&received, b"ping");

    connection
        .stream()
        .write_all(b"pong")
        .await
        .expect("server write");
    let mut reply = [0_u8; 4];
    client.read_exact(&mut reply).await.expect("client read");
    assert_eq!(&reply, b"pong");
}

#[rstest]
#[tokio::test]
async fn disconnect_watch_resolves_when_client_leaves(tcp_endpoint: SocketEndpoint) {
    let listener = SocketListener::bind(&tcp_endpoint).expect("bind tcp listener");
    let (connection, client) = accept_tcp(&listener).await;
    let watch = connection.wait_for_disconnect(CancellationToken::new());

    drop(client);
    let watched = tokio::time::timeout(WATCH_DEADLINE, watch)
        .await
        .expect("watch should observe the disconnect");
    assert!(watched.is_ok(), "unexpected watch result: {watched:?}");
}

#[rstest]
#[tokio::test]
async fn disconnect_watch_stops_when_cancelled(tcp_endpoint: SocketEndpoint) {
    let listener = SocketListener::bind(&tcp_endpoint).expect("bind tcp listener");
    let (connection, _client) = accept_tcp(&listener).await;
    let cancel = CancellationToken::new();
    let watch = connection.wait_for_disconnect(cancel.clone());

    cancel.cancel();
    let watched = tokio::time::timeout(WATCH_DEADLINE, watch)
        .await
        .expect("watch should stop");
    assert!(matches!(watched, Err(ConnectionError::Cancelled)));
}

#[rstest]
#[tokio::test]
async fn pending_accept_honours_cancellation(tcp_endpoint: SocketEndpoint) {
    let listener = SocketListener::bind(&tcp_endpoint).expect("bind tcp listener");
    let cancel = CancellationToken::new();
    let accept = listener.wait_for_connection(cancel.clone());
    cancel.cancel();
    let accepted = accept.await;
    assert!(matches!(accepted, Err(ConnectionError::Cancelled)));
}

#[cfg(unix)]
#[fixture]
fn unix_tempdir() -> tempfile::TempDir {
    tempfile::tempdir().expect("temp dir")
}

#[cfg(unix)]
fn unix_endpoint(dir: &tempfile::TempDir) -> (std::path::PathBuf, SocketEndpoint) {
    let path = dir.path().join("kilnd.sock");
    let endpoint = SocketEndpoint::unix(path.to_str().expect("utf8 path"));
    (path, endpoint)
}

#[cfg(unix)]
#[rstest]
#[tokio::test]
async fn unix_listener_replaces_stale_socket_and_removes_it_on_drop(
    unix_tempdir: tempfile::TempDir,
) {
    let (path, endpoint) = unix_endpoint(&unix_tempdir);
    {
        let _stale = std::os::unix::net::UnixListener::bind(&path).expect("bind stale listener");
    }
    assert!(path.exists(), "stale socket should remain");

    let listener = SocketListener::bind(&endpoint).expect("bind over stale socket");
    let accept = listener.wait_for_connection(CancellationToken::new());
    let (accepted, client) = tokio::join!(accept, tokio::net::UnixStream::connect(&path));
    let connection = accepted.expect("accept unix client");
    client.expect("connect unix client");
    assert_eq!(connection.identifier(), "unix#1");

    drop(connection);
    drop(listener);
    assert!(!path.exists(), "listener should remove its socket file");
}

#[cfg(unix)]
#[rstest]
#[tokio::test]
async fn unix_listener_rejects_in_use_socket(unix_tempdir: tempfile::TempDir) {
    let (path, endpoint) = unix_endpoint(&unix_tempdir);
    let _existing = std::os::unix::net::UnixListener::bind(&path).expect("bind existing listener");

    let error = SocketListener::bind(&endpoint).expect_err("should fail bind");
    assert!(matches!(error, ListenerError::UnixInUse { .. }));
    assert!(path.exists(), "live socket must be left alone");
}

#[cfg(unix)]
#[rstest]
#[tokio::test]
async fn unix_listener_refuses_to_replace_regular_file(unix_tempdir: tempfile::TempDir) {
    let (path, endpoint) = unix_endpoint(&unix_tempdir);
    std::fs::write(&path, b"not a socket").expect("write regular file");

    let error = SocketListener::bind(&endpoint).expect_err("should fail bind");
    assert!(matches!(error, ListenerError::UnixNotSocket { .. }));
}
