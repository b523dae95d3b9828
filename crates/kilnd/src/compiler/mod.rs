//! Compiler host seam.
//!
//! The dispatcher hands each accepted build request to a [`CompilerHost`] on
//! the blocking pool. Hosts must honour the cancellation token promptly: the
//! dispatcher cancels it when the client disconnects or the server stops.

mod process;

use std::io;

use kiln_protocol::{BuildRequest, BuildResponse};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use self::process::ProcessCompilerHost;

/// Executes build requests.
pub trait CompilerHost: Send + Sync + 'static {
    /// Runs the request to completion or until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`CompilerError`] when the build cannot run or was cancelled.
    fn execute(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildResponse, CompilerError>;
}

/// Failures raised by a compiler host.
#[derive(Debug, Error)]
pub enum CompilerError {
    /// The compiler process could not be started.
    #[error("failed to launch compiler '{program}': {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// Waiting on the compiler process failed.
    #[error("failed to wait for compiler: {source}")]
    Wait {
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The build was abandoned after cancellation.
    #[error("compilation cancelled")]
    Cancelled,
    /// The host failed for another reason.
    #[error("compiler host failed: {message}")]
    Failed {
        /// Description of the failure.
        message: String,
    },
}

impl CompilerError {
    /// Builds a [`CompilerError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}
