//! Socket transport for the compilation server.
//!
//! The listener binds the configured endpoint and hands each accepted client
//! to the dispatcher as a [`crate::Connection`].

mod errors;
mod listener;
#[cfg(test)]
mod listener_tests;
mod stream;

pub use self::errors::ListenerError;
pub use self::listener::SocketListener;
pub use self::stream::{SocketConnection, SocketStream};

const LISTENER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");
