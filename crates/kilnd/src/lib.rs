//! Kiln compilation server.
//!
//! `kilnd` is a long-lived process that accepts connections from short-lived
//! compiler clients. Each connection carries one framed build request; the
//! server runs the build through a [`CompilerHost`], races it against the
//! client disconnecting, and writes back one framed response.
//!
//! The core is the [`RequestDispatcher`]. It keeps accepting while earlier
//! builds are still running, cancels builds whose clients went away, and
//! stops on a shutdown request, an idle keep-alive timeout, an unexpected
//! exchange failure, or cancellation of its token. Every exchange ends with
//! exactly one [`ConnectionResult`].
//!
//! Around the dispatcher sit the socket transport, the process compiler
//! host, a tracing-backed [`EventBus`], and process supervision (runtime lock,
//! PID and health files, termination signals).

mod bootstrap;
pub mod client;
mod command;
mod compiler;
mod connection;
mod dispatcher;
mod events;
mod process;
mod telemetry;
mod transport;

pub use bootstrap::{
    BootstrapError, Bootstrapped, ConfigLoader, StaticConfigLoader, SystemConfigLoader,
    bootstrap_with,
};
pub use command::{Command, Invocation};
pub use compiler::{CompilerError, CompilerHost, ProcessCompilerHost};
pub use connection::{Connection, ConnectionError, ConnectionSource};
pub use dispatcher::{
    CloseReason, ConnectionResult, Exchange, RequestDispatcher, ShutdownReason,
};
pub use events::{EventBus, StructuredEventBus};
pub use process::{
    HealthState, LaunchError, ShutdownError, ShutdownSignal, SystemShutdownSignal, run_server,
    run_server_with,
};
pub use telemetry::{TelemetryError, TelemetryHandle};
pub use transport::{ListenerError, SocketConnection, SocketListener, SocketStream};

#[cfg(test)]
mod tests;
