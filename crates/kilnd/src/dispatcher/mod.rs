//! Request dispatcher: accept loop, per-connection exchanges, keep-alive.
//!
//! A single coordinating task owns all bookkeeping. Accepts run as spawned
//! tasks so a slow exchange never stalls the next client, exchanges run on a
//! [`JoinSet`], and builds run on the blocking pool. Cancellation flows down
//! a token hierarchy: the caller's token parents one token for the listener
//! and one shared by every exchange.

mod exchange;
mod outcome;

use std::future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_protocol::KeepAlive;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{self, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compiler::CompilerHost;
use crate::connection::{Connection, ConnectionError, ConnectionSource};
use crate::events::EventBus;

pub use self::exchange::Exchange;
pub use self::outcome::{CloseReason, ConnectionResult, ShutdownReason};

#[cfg(test)]
pub(crate) use self::exchange::{MALFORMED_REQUEST, NOT_ACCEPTING};

pub(crate) const DISPATCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dispatcher");

/// Delay before re-issuing an accept that failed.
pub(crate) const ACCEPT_RETRY_BACKOFF: Duration = Duration::from_millis(150);

type PendingAccept<C> = JoinHandle<Result<C, ConnectionError>>;

/// Serves build requests from a connection source until told to stop.
pub struct RequestDispatcher<S, H, E> {
    source: Arc<S>,
    host: Arc<H>,
    events: Arc<E>,
    keep_alive: KeepAlive,
    server_process_id: u32,
}

impl<S, H, E> RequestDispatcher<S, H, E>
where
    S: ConnectionSource,
    H: CompilerHost,
    E: EventBus,
{
    /// Creates a dispatcher with the initial idle keep-alive.
    pub fn new(source: S, host: Arc<H>, events: Arc<E>, keep_alive: KeepAlive) -> Self {
        Self {
            source: Arc::new(source),
            host,
            events,
            keep_alive,
            server_process_id: std::process::id(),
        }
    }

    /// Overrides the process identifier reported to shutdown requests.
    #[must_use]
    pub const fn with_server_process_id(mut self, server_process_id: u32) -> Self {
        self.server_process_id = server_process_id;
        self
    }

    /// Runs the accept loop until shutdown and returns why it stopped.
    ///
    /// The loop only returns once every in-flight exchange has finished.
    /// Cancelling `cancel` abandons in-flight exchanges and resolves with
    /// [`ShutdownReason::Cancelled`].
    pub async fn run(self, cancel: CancellationToken) -> ShutdownReason {
        let exchange = Exchange::new(
            Arc::clone(&self.host),
            Arc::clone(&self.events),
            self.server_process_id,
        );
        let mut state = DispatchLoop {
            source: self.source,
            exchange,
            events: self.events,
            keep_alive: self.keep_alive,
            exchanges: cancel.child_token(),
            listen: cancel.child_token(),
            in_flight: JoinSet::new(),
            pending: None,
            timer: None,
            completed: 0,
            shutdown: None,
            accept_failed: false,
        };
        info!(
            target: DISPATCH_TARGET,
            keep_alive = %state.keep_alive,
            "dispatcher running"
        );
        let reason = state.drive(&cancel).await;
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
        info!(
            target: DISPATCH_TARGET,
            reason = %reason,
            completed = state.completed,
            "dispatcher stopped"
        );
        reason
    }
}

struct DispatchLoop<S, H, E>
where
    S: ConnectionSource,
{
    source: Arc<S>,
    exchange: Exchange<H, E>,
    events: Arc<E>,
    keep_alive: KeepAlive,
    exchanges: CancellationToken,
    listen: CancellationToken,
    in_flight: JoinSet<ConnectionResult>,
    pending: Option<PendingAccept<S::Connection>>,
    timer: Option<Pin<Box<Sleep>>>,
    completed: usize,
    shutdown: Option<ShutdownReason>,
    accept_failed: bool,
}

impl<S, H, E> DispatchLoop<S, H, E>
where
    S: ConnectionSource,
    H: CompilerHost,
    E: EventBus,
{
    async fn drive(&mut self, cancel: &CancellationToken) -> ShutdownReason {
        loop {
            if let Some(reason) = self.shutdown
                && self.in_flight.is_empty()
            {
                return reason;
            }
            self.issue_accept();
            self.arm_timer();

            tokio::select! {
                biased;
                () = cancel.cancelled(), if self.shutdown.is_none() => {
                    self.begin_shutdown(ShutdownReason::Cancelled);
                    self.exchanges.cancel();
                }
                Some(joined) = self.in_flight.join_next() => self.on_exchange(joined),
                accepted = wait_accept(&mut self.pending) => {
                    self.pending = None;
                    self.on_accept(accepted);
                }
                () = wait_timer(&mut self.timer) => {
                    self.timer = None;
                    self.events.keep_alive_reached();
                    self.begin_shutdown(ShutdownReason::KeepAliveTimeout);
                }
            }
        }
    }

    /// Starts the next accept unless one is pending or shutdown has begun.
    fn issue_accept(&mut self) {
        if self.shutdown.is_some() || self.pending.is_some() {
            return;
        }
        let accept = self.source.wait_for_connection(self.listen.clone());
        let backoff = self.accept_failed.then_some(ACCEPT_RETRY_BACKOFF);
        self.pending = Some(tokio::spawn(async move {
            if let Some(delay) = backoff {
                time::sleep(delay).await;
            }
            accept.await
        }));
        self.events.connection_listening();
    }

    /// Arms the idle timer while running with nothing in flight.
    fn arm_timer(&mut self) {
        if self.shutdown.is_some() || !self.in_flight.is_empty() || self.timer.is_some() {
            return;
        }
        if let Some(duration) = self.keep_alive.duration() {
            debug!(
                target: DISPATCH_TARGET,
                keep_alive = %self.keep_alive,
                "idle; keep-alive timer armed"
            );
            self.timer = Some(Box::pin(time::sleep(duration)));
        }
    }

    fn on_accept(&mut self, accepted: Result<S::Connection, ConnectionError>) {
        match accepted {
            Ok(connection) => {
                self.accept_failed = false;
                self.timer = None;
                let accept = self.shutdown.is_none();
                debug!(
                    target: DISPATCH_TARGET,
                    connection = connection.identifier(),
                    accept,
                    "connection accepted"
                );
                let exchange = self.exchange.clone();
                let cancel = self.exchanges.clone();
                self.in_flight.spawn(async move {
                    exchange
                        .handle_connection(future::ready(Ok(connection)), accept, cancel)
                        .await
                });
            }
            Err(error) if self.shutdown.is_some() => {
                debug!(
                    target: DISPATCH_TARGET,
                    error = %error,
                    "accept ended during shutdown"
                );
            }
            Err(error) => {
                warn!(
                    target: DISPATCH_TARGET,
                    error = %error,
                    backoff_ms = ACCEPT_RETRY_BACKOFF.as_millis(),
                    "accept failed; retrying"
                );
                self.accept_failed = true;
            }
        }
    }

    fn on_exchange(&mut self, joined: Result<ConnectionResult, JoinError>) {
        let result = joined.unwrap_or_else(|error| {
            warn!(
                target: DISPATCH_TARGET,
                error = %error,
                "exchange task failed"
            );
            ConnectionResult::new(CloseReason::ClientException)
        });
        self.completed += 1;
        debug!(
            target: DISPATCH_TARGET,
            close_reason = %result.close_reason,
            completed = self.completed,
            in_flight = self.in_flight.len(),
            "exchange finished"
        );
        self.events.connection_completed(self.completed, Instant::now());

        match result.close_reason {
            CloseReason::CompilationCompleted => self.events.compilation_completed(),
            CloseReason::ClientDisconnect => self.events.connection_rudely_ended(),
            CloseReason::ClientShutdownRequest => {
                self.begin_shutdown(ShutdownReason::ClientRequest);
            }
            CloseReason::ClientException => {
                self.events.bad_connection();
                self.begin_shutdown(ShutdownReason::BadConnection);
                self.exchanges.cancel();
            }
            CloseReason::CompilationNotStarted | CloseReason::Cancelled => {}
        }

        if let Some(keep_alive) = result.keep_alive {
            self.keep_alive = keep_alive;
            self.events.keep_alive_updated(keep_alive);
        }
    }

    /// Records the shutdown reason and stops listening.
    ///
    /// The first reason sticks, except that a bad connection always wins so
    /// the process exit status reflects it.
    fn begin_shutdown(&mut self, reason: ShutdownReason) {
        if self.shutdown.is_none() || reason == ShutdownReason::BadConnection {
            info!(
                target: DISPATCH_TARGET,
                reason = %reason,
                in_flight = self.in_flight.len(),
                "shutdown requested"
            );
            self.shutdown = Some(reason);
        }
        self.timer = None;
        self.listen.cancel();
    }
}

async fn wait_accept<C>(pending: &mut Option<PendingAccept<C>>) -> Result<C, ConnectionError> {
    let Some(handle) = pending.as_mut() else {
        return future::pending().await;
    };
    match handle.await {
        Ok(accepted) => accepted,
        Err(error) => Err(ConnectionError::Accept {
            source: error.into(),
        }),
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => future::pending().await,
    }
}
