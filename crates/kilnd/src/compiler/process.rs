//! Compiler host that runs an external compiler executable per request.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use kiln_protocol::{BuildRequest, BuildResponse};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{CompilerError, CompilerHost};

const COMPILER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::compiler");
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILLED_RETURN_CODE: i32 = -1;
const LAUNCH_FAILED_RETURN_CODE: i32 = 1;

/// Runs the configured compiler with the request's command line.
///
/// The child runs in the request's current directory with stdin closed. A
/// launch refused because of what the request named (a missing working
/// directory or compiler) is answered as a failed build rather than a host
/// error, so one bad request cannot stop the server.
/// Standard output and standard error are captured and concatenated in that
/// order. The child is polled rather than waited on so a cancelled token
/// kills it promptly.
#[derive(Debug, Clone)]
pub struct ProcessCompilerHost {
    program: PathBuf,
}

impl ProcessCompilerHost {
    /// Creates a host for the given compiler executable.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Compiler executable launched for each request.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    fn spawn(&self, request: &BuildRequest) -> Result<Child, CompilerError> {
        let mut command = Command::new(&self.program);
        command
            .args(request.command_line())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(directory) = request.current_directory() {
            command.current_dir(directory);
        }
        if let Some(temp) = request.temp_directory() {
            command.env("TMPDIR", temp);
        }

        debug!(
            target: COMPILER_TARGET,
            program = %self.program.display(),
            arguments = request.command_line().len(),
            "spawning compiler"
        );
        command.spawn().map_err(|source| CompilerError::Spawn {
            program: self.program.display().to_string(),
            source,
        })
    }

    fn spawn_failure(&self, request: &BuildRequest, source: &io::Error) -> String {
        match request.current_directory() {
            Some(directory) => format!(
                "kilnd: failed to launch '{}' in '{directory}': {source}\n",
                self.program.display()
            ),
            None => format!(
                "kilnd: failed to launch '{}': {source}\n",
                self.program.display()
            ),
        }
    }
}

/// Spawn failures that stem from the request or the compiler path rather
/// than from the host running out of resources.
fn launch_refused(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied | io::ErrorKind::NotADirectory
    )
}

impl CompilerHost for ProcessCompilerHost {
    fn execute(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildResponse, CompilerError> {
        if cancel.is_cancelled() {
            return Err(CompilerError::Cancelled);
        }

        let mut child = match self.spawn(request) {
            Ok(child) => child,
            Err(CompilerError::Spawn { ref source, .. }) if launch_refused(source) => {
                let message = self.spawn_failure(request, source);
                warn!(
                    target: COMPILER_TARGET,
                    error = %message,
                    "compiler could not be launched for request"
                );
                return Ok(BuildResponse::completed(
                    LAUNCH_FAILED_RETURN_CODE,
                    true,
                    message,
                ));
            }
            Err(error) => return Err(error),
        };
        let stdout = child.stdout.take().map(spawn_drain);
        let stderr = child.stderr.take().map(spawn_drain);

        let status = wait_for_exit(&mut child, cancel)?;
        let mut output = collect(stdout);
        output.extend(collect(stderr));

        let return_code = status.code().unwrap_or(KILLED_RETURN_CODE);
        debug!(
            target: COMPILER_TARGET,
            return_code,
            output_bytes = output.len(),
            "compiler exited"
        );
        let (output, utf8_output) = match String::from_utf8(output) {
            Ok(text) => (text, true),
            Err(error) => (String::from_utf8_lossy(error.as_bytes()).into_owned(), false),
        };
        Ok(BuildResponse::completed(return_code, utf8_output, output))
    }
}

/// Reads a pipe to completion on its own thread so a chatty child never
/// blocks on a full pipe buffer.
fn spawn_drain<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Err(error) = reader.read_to_end(&mut buffer) {
            warn!(
                target: COMPILER_TARGET,
                error = %error,
                "failed to read compiler output"
            );
        }
        buffer
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn wait_for_exit(child: &mut Child, cancel: &CancellationToken) -> Result<ExitStatus, CompilerError> {
    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|source| CompilerError::Wait { source })?
        {
            return Ok(status);
        }
        if cancel.is_cancelled() {
            warn!(
                target: COMPILER_TARGET,
                pid = child.id(),
                "build cancelled, killing compiler"
            );
            drop(child.kill());
            drop(child.wait());
            return Err(CompilerError::Cancelled);
        }
        thread::sleep(POLL_INTERVAL);
    }
}
