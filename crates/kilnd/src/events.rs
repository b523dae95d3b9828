//! Dispatcher lifecycle notifications.

use std::sync::Arc;
use std::time::Instant;

use kiln_protocol::KeepAlive;

const EVENTS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::events");

/// Observer notified as the dispatcher serves connections.
///
/// Calls are notifications only; the dispatcher never reads anything back.
/// Implementations must tolerate calls from several tasks at once.
pub trait EventBus: Send + Sync + 'static {
    /// A new accept was issued.
    fn connection_listening(&self);

    /// A client connected and its exchange began.
    fn connection_received(&self);

    /// An exchange finished; `count` is the running total.
    fn connection_completed(&self, count: usize, at: Instant);

    /// A build ran and its response reached the client.
    fn compilation_completed(&self);

    /// A client went away before receiving its response.
    fn connection_rudely_ended(&self);

    /// A completed build changed the idle keep-alive.
    fn keep_alive_updated(&self, keep_alive: KeepAlive);

    /// The server sat idle for the whole keep-alive.
    fn keep_alive_reached(&self);

    /// An exchange failed unexpectedly; the server is shutting down.
    fn bad_connection(&self);
}

impl<T> EventBus for Arc<T>
where
    T: EventBus,
{
    fn connection_listening(&self) {
        (**self).connection_listening();
    }

    fn connection_received(&self) {
        (**self).connection_received();
    }

    fn connection_completed(&self, count: usize, at: Instant) {
        (**self).connection_completed(count, at);
    }

    fn compilation_completed(&self) {
        (**self).compilation_completed();
    }

    fn connection_rudely_ended(&self) {
        (**self).connection_rudely_ended();
    }

    fn keep_alive_updated(&self, keep_alive: KeepAlive) {
        (**self).keep_alive_updated(keep_alive);
    }

    fn keep_alive_reached(&self) {
        (**self).keep_alive_reached();
    }

    fn bad_connection(&self) {
        (**self).bad_connection();
    }
}

/// Event bus that records every notification through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredEventBus;

impl StructuredEventBus {
    /// Builds a new event bus.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl EventBus for StructuredEventBus {
    fn connection_listening(&self) {
        tracing::debug!(
            target: EVENTS_TARGET,
            event = "connection_listening",
            "waiting for client connection"
        );
    }

    fn connection_received(&self) {
        tracing::debug!(
            target: EVENTS_TARGET,
            event = "connection_received",
            "client connected"
        );
    }

    fn connection_completed(&self, count: usize, _at: Instant) {
        tracing::info!(
            target: EVENTS_TARGET,
            event = "connection_completed",
            count,
            "connection completed"
        );
    }

    fn compilation_completed(&self) {
        tracing::info!(
            target: EVENTS_TARGET,
            event = "compilation_completed",
            "compilation completed"
        );
    }

    fn connection_rudely_ended(&self) {
        tracing::info!(
            target: EVENTS_TARGET,
            event = "connection_rudely_ended",
            "client disconnected before the response was sent"
        );
    }

    fn keep_alive_updated(&self, keep_alive: KeepAlive) {
        tracing::info!(
            target: EVENTS_TARGET,
            event = "keep_alive_updated",
            %keep_alive,
            "keep-alive updated"
        );
    }

    fn keep_alive_reached(&self) {
        tracing::info!(
            target: EVENTS_TARGET,
            event = "keep_alive_reached",
            "idle keep-alive elapsed"
        );
    }

    fn bad_connection(&self) {
        tracing::error!(
            target: EVENTS_TARGET,
            event = "bad_connection",
            "connection failed unexpectedly; shutting down"
        );
    }
}
