//! Classification of exchange and server outcomes.

use std::fmt;

use kiln_protocol::KeepAlive;

/// Why an exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// No build ran: the connection never arrived, the request could not be
    /// read, or the server declined it.
    CompilationNotStarted,
    /// The build ran and its response was written.
    CompilationCompleted,
    /// The client went away before the response was written.
    ClientDisconnect,
    /// The exchange failed unexpectedly.
    ClientException,
    /// The client asked the server to shut down.
    ClientShutdownRequest,
    /// The dispatcher abandoned the exchange while stopping.
    Cancelled,
}

impl CloseReason {
    /// Stable name used in telemetry.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CompilationNotStarted => "compilation_not_started",
            Self::CompilationCompleted => "compilation_completed",
            Self::ClientDisconnect => "client_disconnect",
            Self::ClientException => "client_exception",
            Self::ClientShutdownRequest => "client_shutdown_request",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionResult {
    /// Why the exchange ended.
    pub close_reason: CloseReason,
    /// Keep-alive requested by a completed build, if any.
    pub keep_alive: Option<KeepAlive>,
}

impl ConnectionResult {
    /// Creates a result without a keep-alive override.
    #[must_use]
    pub const fn new(close_reason: CloseReason) -> Self {
        Self {
            close_reason,
            keep_alive: None,
        }
    }

    /// Creates a completed result carrying an optional keep-alive override.
    #[must_use]
    pub const fn completed(keep_alive: Option<KeepAlive>) -> Self {
        Self {
            close_reason: CloseReason::CompilationCompleted,
            keep_alive,
        }
    }
}

/// Why the dispatcher stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownReason {
    /// A client sent a shutdown request.
    ClientRequest,
    /// The server stayed idle for the whole keep-alive.
    KeepAliveTimeout,
    /// An exchange failed unexpectedly.
    BadConnection,
    /// The dispatcher's token was cancelled, usually by a signal.
    Cancelled,
}

impl ShutdownReason {
    /// `false` only when the server stopped because of a bad connection.
    #[must_use]
    pub const fn is_clean(self) -> bool {
        !matches!(self, Self::BadConnection)
    }

    /// Stable name used in telemetry.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientRequest => "client_request",
            Self::KeepAliveTimeout => "keep_alive_timeout",
            Self::BadConnection => "bad_connection",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
