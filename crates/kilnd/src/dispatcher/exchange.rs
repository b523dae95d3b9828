//! One accept → request → build → response lifecycle.

use std::future::Future;
use std::sync::Arc;

use kiln_protocol::{BuildRequest, BuildResponse, KeepAlive, PROTOCOL_VERSION};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::compiler::{CompilerError, CompilerHost};
use crate::connection::{Connection, ConnectionError};
use crate::events::EventBus;

use super::DISPATCH_TARGET;
use super::outcome::{CloseReason, ConnectionResult};

pub(crate) const MALFORMED_REQUEST: &str = "malformed request";
pub(crate) const NOT_ACCEPTING: &str = "server is not accepting requests";

/// Serves individual connections on behalf of the dispatcher.
///
/// Cheap to clone; each spawned exchange holds its own copy.
pub struct Exchange<H, E> {
    host: Arc<H>,
    events: Arc<E>,
    server_process_id: u32,
}

impl<H, E> Clone for Exchange<H, E> {
    fn clone(&self) -> Self {
        Self {
            host: Arc::clone(&self.host),
            events: Arc::clone(&self.events),
            server_process_id: self.server_process_id,
        }
    }
}

impl<H, E> Exchange<H, E>
where
    H: CompilerHost,
    E: EventBus,
{
    /// Creates an exchange handler that reports `server_process_id` in
    /// shutdown acknowledgements.
    pub const fn new(host: Arc<H>, events: Arc<E>, server_process_id: u32) -> Self {
        Self {
            host,
            events,
            server_process_id,
        }
    }

    /// Runs one exchange to completion and classifies its outcome.
    ///
    /// `connection` resolves to the accepted client. When `accept` is `false`
    /// the request is read and answered with a rejection without consulting
    /// the compiler host. Cancelling `cancel` abandons the exchange; nothing
    /// is written after cancellation is observed.
    pub async fn handle_connection<F, C>(
        &self,
        connection: F,
        accept: bool,
        cancel: CancellationToken,
    ) -> ConnectionResult
    where
        F: Future<Output = Result<C, ConnectionError>> + Send,
        C: Connection,
    {
        let accepted = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ConnectionError::Cancelled),
            accepted = connection => accepted,
        };
        let mut connection = match accepted {
            Ok(connection) => connection,
            Err(error) => {
                debug!(
                    target: DISPATCH_TARGET,
                    error = %error,
                    "connection unavailable"
                );
                return ConnectionResult::new(CloseReason::CompilationNotStarted);
            }
        };
        self.events.connection_received();

        let read = tokio::select! {
            biased;
            () = cancel.cancelled() => return ConnectionResult::new(CloseReason::Cancelled),
            read = BuildRequest::read_from(connection.stream()) => read,
        };
        let request = match read {
            Ok(request) => request,
            Err(error) if error.is_io() => {
                debug!(
                    target: DISPATCH_TARGET,
                    connection = connection.identifier(),
                    error = %error,
                    "failed to read request"
                );
                return ConnectionResult::new(CloseReason::CompilationNotStarted);
            }
            Err(error) => {
                warn!(
                    target: DISPATCH_TARGET,
                    connection = connection.identifier(),
                    error = %error,
                    "rejecting malformed request"
                );
                let response = BuildResponse::rejected(MALFORMED_REQUEST);
                return self
                    .answer(&mut connection, &response, &cancel, CloseReason::CompilationNotStarted)
                    .await;
            }
        };

        if !accept {
            let response = BuildResponse::rejected(NOT_ACCEPTING);
            return self
                .answer(&mut connection, &response, &cancel, CloseReason::CompilationNotStarted)
                .await;
        }

        if request.is_shutdown() {
            let response = BuildResponse::shutdown(self.server_process_id);
            return self
                .answer(&mut connection, &response, &cancel, CloseReason::ClientShutdownRequest)
                .await;
        }

        if request.protocol_version() != PROTOCOL_VERSION {
            debug!(
                target: DISPATCH_TARGET,
                connection = connection.identifier(),
                client_version = request.protocol_version(),
                server_version = PROTOCOL_VERSION,
                "protocol version mismatch"
            );
            return self
                .answer(
                    &mut connection,
                    &BuildResponse::MismatchedVersion,
                    &cancel,
                    CloseReason::CompilationNotStarted,
                )
                .await;
        }

        let keep_alive = match request.keep_alive() {
            Ok(keep_alive) => keep_alive,
            Err(error) => {
                let response = BuildResponse::rejected(error.to_string());
                return self
                    .answer(&mut connection, &response, &cancel, CloseReason::CompilationNotStarted)
                    .await;
            }
        };

        self.race(connection, request, keep_alive, &cancel).await
    }

    /// Races the build against the disconnect watch and outer cancellation.
    async fn race<C>(
        &self,
        mut connection: C,
        request: BuildRequest,
        keep_alive: Option<KeepAlive>,
        cancel: &CancellationToken,
    ) -> ConnectionResult
    where
        C: Connection,
    {
        let exchange_token = cancel.child_token();
        // Whatever branch wins, the loser observes cancellation once this
        // guard drops.
        let _exchange_guard = exchange_token.clone().drop_guard();

        let disconnect = connection.wait_for_disconnect(exchange_token.clone());
        tokio::pin!(disconnect);

        let host = Arc::clone(&self.host);
        let build_token = exchange_token.clone();
        let build = tokio::task::spawn_blocking(move || host.execute(&request, &build_token));

        let built = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return ConnectionResult::new(CloseReason::Cancelled);
            }
            watched = &mut disconnect => {
                exchange_token.cancel();
                return classify_watch(connection.identifier(), watched, cancel);
            }
            built = build => built,
        };

        let response = match classify_build(connection.identifier(), built, &exchange_token) {
            Ok(response) => response,
            Err(result) => return result,
        };

        let written = tokio::select! {
            biased;
            () = cancel.cancelled() => return ConnectionResult::new(CloseReason::Cancelled),
            written = response.write_to(connection.stream()) => written,
        };
        match written {
            Ok(()) => ConnectionResult::completed(keep_alive),
            Err(error) if error.is_io() => {
                debug!(
                    target: DISPATCH_TARGET,
                    connection = connection.identifier(),
                    error = %error,
                    "client vanished before the response was written"
                );
                ConnectionResult::new(CloseReason::ClientDisconnect)
            }
            Err(error) => {
                warn!(
                    target: DISPATCH_TARGET,
                    connection = connection.identifier(),
                    error = %error,
                    "build response could not be encoded"
                );
                // The client only ever sees the rejection, so the exchange
                // closes the way any other rejected request does.
                let rejection = BuildResponse::rejected(error.to_string());
                self.answer(&mut connection, &rejection, cancel, CloseReason::CompilationNotStarted)
                    .await
            }
        }
    }

    /// Writes a response that needs no build and resolves with `reason`.
    ///
    /// A failed write means the client is gone; for requests that never
    /// started a build that does not change the outcome.
    async fn answer<C>(
        &self,
        connection: &mut C,
        response: &BuildResponse,
        cancel: &CancellationToken,
        reason: CloseReason,
    ) -> ConnectionResult
    where
        C: Connection,
    {
        let written = tokio::select! {
            biased;
            () = cancel.cancelled() => return ConnectionResult::new(CloseReason::Cancelled),
            written = response.write_to(connection.stream()) => written,
        };
        if let Err(error) = written {
            debug!(
                target: DISPATCH_TARGET,
                connection = connection.identifier(),
                response = ?response.kind(),
                error = %error,
                "failed to write response"
            );
        }
        ConnectionResult::new(reason)
    }
}

fn classify_watch(
    identifier: &str,
    watched: Result<(), ConnectionError>,
    cancel: &CancellationToken,
) -> ConnectionResult {
    match watched {
        Ok(()) => {
            debug!(
                target: DISPATCH_TARGET,
                connection = identifier,
                "client disconnected during build"
            );
            ConnectionResult::new(CloseReason::ClientDisconnect)
        }
        Err(error) if error.is_cancelled() && cancel.is_cancelled() => {
            ConnectionResult::new(CloseReason::Cancelled)
        }
        Err(error) => {
            warn!(
                target: DISPATCH_TARGET,
                connection = identifier,
                error = %error,
                "disconnect watch failed"
            );
            ConnectionResult::new(CloseReason::ClientException)
        }
    }
}

fn classify_build(
    identifier: &str,
    built: Result<Result<BuildResponse, CompilerError>, JoinError>,
    exchange_token: &CancellationToken,
) -> Result<BuildResponse, ConnectionResult> {
    match built {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(error)) if exchange_token.is_cancelled() => {
            debug!(
                target: DISPATCH_TARGET,
                connection = identifier,
                error = %error,
                "build abandoned after cancellation"
            );
            Err(ConnectionResult::new(CloseReason::Cancelled))
        }
        Ok(Err(error)) => {
            warn!(
                target: DISPATCH_TARGET,
                connection = identifier,
                error = %error,
                "compiler host failed"
            );
            Err(ConnectionResult::new(CloseReason::ClientException))
        }
        Err(error) => {
            warn!(
                target: DISPATCH_TARGET,
                connection = identifier,
                error = %error,
                "compiler host panicked"
            );
            Err(ConnectionResult::new(CloseReason::ClientException))
        }
    }
}
