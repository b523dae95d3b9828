//! Termination signal handling.

use std::io;
use std::thread::{self, JoinHandle};

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::PROCESS_TARGET;

/// Source of external shutdown requests.
pub trait ShutdownSignal: Send + Sync {
    /// Keeps the watch alive until dropped.
    type Watch: Send;

    /// Cancels `cancel` when shutdown is requested.
    fn watch(&self, cancel: CancellationToken) -> Result<Self::Watch, ShutdownError>;
}

/// Errors reported by shutdown signal listeners.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Installing signal handlers failed.
    #[error("failed to install signal handlers: {source}")]
    Install {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The watcher thread could not be started.
    #[error("failed to spawn signal watcher: {source}")]
    Spawn {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Watches `SIGTERM`, `SIGINT`, `SIGQUIT` and `SIGHUP`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemShutdownSignal;

impl SystemShutdownSignal {
    /// Builds the production signal watcher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Running signal watcher; dropping it unregisters the handlers.
#[derive(Debug)]
pub struct SignalWatch {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl ShutdownSignal for SystemShutdownSignal {
    type Watch = SignalWatch;

    fn watch(&self, cancel: CancellationToken) -> Result<SignalWatch, ShutdownError> {
        let mut signals = Signals::new([SIGTERM, SIGINT, SIGQUIT, SIGHUP])
            .map_err(|source| ShutdownError::Install { source })?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name("kilnd-signals".to_owned())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    info!(
                        target: PROCESS_TARGET,
                        signal,
                        "shutdown signal received"
                    );
                    cancel.cancel();
                }
            })
            .map_err(|source| ShutdownError::Spawn { source })?;
        Ok(SignalWatch {
            handle,
            thread: Some(thread),
        })
    }
}

impl Drop for SignalWatch {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            drop(thread.join());
        }
    }
}
