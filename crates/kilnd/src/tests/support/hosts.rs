//! Compiler hosts for exercising the dispatcher without real builds.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use kiln_protocol::{BuildRequest, BuildResponse};
use mockall::mock;
use tokio_util::sync::CancellationToken;

use crate::compiler::{CompilerError, CompilerHost};

const GATE_POLL: Duration = Duration::from_millis(2);

mock! {
    pub Compiler {}

    impl CompilerHost for Compiler {
        fn execute(
            &self,
            request: &BuildRequest,
            cancel: &CancellationToken,
        ) -> Result<BuildResponse, CompilerError>;
    }
}

/// Response every successful build in these tests produces.
pub(crate) fn completed_output(request: &BuildRequest) -> BuildResponse {
    BuildResponse::completed(0, true, request.command_line().join(" "))
}

/// Host whose builds block until the gate opens or they are cancelled.
///
/// An open gate lets builds finish immediately.
#[derive(Debug, Default)]
pub(crate) struct GatedHost {
    open: AtomicBool,
    started: AtomicUsize,
    finished: AtomicUsize,
    cancelled: AtomicUsize,
}

impl GatedHost {
    pub(crate) fn open() -> Self {
        let host = Self::default();
        host.release();
        host
    }

    pub(crate) fn closed() -> Self {
        Self::default()
    }

    pub(crate) fn release(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub(crate) fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// Builds that observed their cancellation token.
    pub(crate) fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl CompilerHost for GatedHost {
    fn execute(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildResponse, CompilerError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        loop {
            if cancel.is_cancelled() {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                return Err(CompilerError::Cancelled);
            }
            if self.open.load(Ordering::SeqCst) {
                self.finished.fetch_add(1, Ordering::SeqCst);
                return Ok(completed_output(request));
            }
            thread::sleep(GATE_POLL);
        }
    }
}
