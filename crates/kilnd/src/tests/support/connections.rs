//! Duplex-backed connections and a queue-fed connection source.

use std::future::Future;
use std::sync::Arc;

use kiln_protocol::{BuildRequest, BuildResponse, ProtocolError};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionError, ConnectionSource};

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone)]
enum Watch {
    /// Resolves when the trigger token is cancelled.
    Trigger(CancellationToken),
    /// Fails as soon as it is polled.
    Fail,
}

/// Server side of an in-memory connection.
#[derive(Debug)]
pub(crate) struct FakeConnection {
    identifier: String,
    stream: DuplexStream,
    watch: Watch,
}

impl Connection for FakeConnection {
    type Stream = DuplexStream;

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
        let watch = self.watch.clone();
        async move {
            match watch {
                Watch::Trigger(trigger) => tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(ConnectionError::Cancelled),
                    () = trigger.cancelled() => Ok(()),
                },
                Watch::Fail => Err(ConnectionError::Watch {
                    message: "watch exploded".to_owned(),
                }),
            }
        }
    }
}

/// Client side of an in-memory connection.
#[derive(Debug)]
pub(crate) struct ClientEnd {
    stream: DuplexStream,
    disconnect: CancellationToken,
}

impl ClientEnd {
    pub(crate) async fn send(&mut self, request: &BuildRequest) {
        request
            .write_to(&mut self.stream)
            .await
            .expect("client write request");
    }

    /// Writes a well-framed payload that is not a valid request.
    pub(crate) async fn send_garbage(&mut self) {
        let payload = [1_u8, 0, 0, 0, 3, 0, 0, 0];
        let length = u32::try_from(payload.len()).expect("small payload");
        self.stream
            .write_all(&length.to_le_bytes())
            .await
            .expect("write length");
        self.stream
            .write_all(&payload)
            .await
            .expect("write payload");
    }

    /// Reads the server's response; `Err` when the server wrote nothing.
    pub(crate) async fn response(&mut self) -> Result<BuildResponse, ProtocolError> {
        BuildResponse::read_from(&mut self.stream).await
    }

    /// Makes the server's disconnect watch fire, then drops the stream.
    pub(crate) fn disconnect(self) {
        self.disconnect.cancel();
    }

    /// Makes the server's disconnect watch fire but keeps the stream, so the
    /// test can check what the server wrote afterwards.
    pub(crate) fn hang_up(&self) {
        self.disconnect.cancel();
    }
}

/// Builds a connected pair whose watch fires on [`ClientEnd::disconnect`].
pub(crate) fn connection_pair(identifier: &str) -> (FakeConnection, ClientEnd) {
    let trigger = CancellationToken::new();
    pair(identifier, Watch::Trigger(trigger.clone()), trigger)
}

/// Builds a connected pair whose disconnect watch fails unexpectedly.
pub(crate) fn failing_watch_pair(identifier: &str) -> (FakeConnection, ClientEnd) {
    pair(identifier, Watch::Fail, CancellationToken::new())
}

fn pair(
    identifier: &str,
    watch: Watch,
    disconnect: CancellationToken,
) -> (FakeConnection, ClientEnd) {
    let (server, client) = tokio::io::duplex(PIPE_CAPACITY);
    (
        FakeConnection {
            identifier: identifier.to_owned(),
            stream: server,
            watch,
        },
        ClientEnd {
            stream: client,
            disconnect,
        },
    )
}

type Queued = Result<FakeConnection, ConnectionError>;

/// Connection source fed by a [`ConnectionQueue`].
///
/// Once the queue is empty an accept waits until cancelled.
#[derive(Debug)]
pub(crate) struct FakeSource {
    queue: Arc<Mutex<mpsc::UnboundedReceiver<Queued>>>,
}

/// Producer half of [`FakeSource`].
#[derive(Debug, Clone)]
pub(crate) struct ConnectionQueue {
    sender: mpsc::UnboundedSender<Queued>,
}

impl FakeSource {
    pub(crate) fn new() -> (Self, ConnectionQueue) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                queue: Arc::new(Mutex::new(receiver)),
            },
            ConnectionQueue { sender },
        )
    }
}

impl ConnectionQueue {
    /// Queues a new client and returns its end of the connection.
    pub(crate) fn connect(&self, identifier: &str) -> ClientEnd {
        let (connection, client) = connection_pair(identifier);
        self.push(Ok(connection));
        client
    }

    /// Queues a client whose disconnect watch will fail.
    pub(crate) fn connect_with_failing_watch(&self, identifier: &str) -> ClientEnd {
        let (connection, client) = failing_watch_pair(identifier);
        self.push(Ok(connection));
        client
    }

    /// Queues an accept failure.
    pub(crate) fn fail_accept(&self) {
        self.push(Err(ConnectionError::Accept {
            source: std::io::Error::other("accept refused"),
        }));
    }

    fn push(&self, next: Queued) {
        self.sender.send(next).expect("source is alive");
    }
}

impl ConnectionSource for FakeSource {
    type Connection = FakeConnection;

    fn wait_for_connection(
        &self,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<FakeConnection, ConnectionError>> + Send + 'static {
        let queue = Arc::clone(&self.queue);
        async move {
            let mut receiver = queue.lock().await;
            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(ConnectionError::Cancelled),
                Some(next) = receiver.recv() => next,
            }
        }
    }
}
