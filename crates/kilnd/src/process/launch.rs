//! Launch sequencing for the server process.

use std::sync::Arc;

use kiln_config::RuntimePaths;
use kiln_protocol::KeepAlive;
use tokio::runtime::{Builder, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bootstrap::{ConfigLoader, bootstrap_with};
use crate::compiler::ProcessCompilerHost;
use crate::dispatcher::{RequestDispatcher, ShutdownReason};
use crate::events::StructuredEventBus;
use crate::transport::SocketListener;

use super::errors::LaunchError;
use super::guard::{HealthState, ProcessGuard};
use super::shutdown::{ShutdownSignal, SystemShutdownSignal};
use super::{PROCESS_TARGET, SHUTDOWN_TIMEOUT};

/// Runs the server with the production collaborators.
///
/// `loader` supplies the configuration; termination signals stop the server
/// cleanly.
pub fn run_server(loader: &dyn ConfigLoader) -> Result<ShutdownReason, LaunchError> {
    run_server_with(loader, &SystemShutdownSignal::new())
}

/// Runs the server until the dispatcher stops.
///
/// Returns the dispatcher's shutdown reason; only failures to get the server
/// running are reported as errors.
pub fn run_server_with<S>(
    loader: &dyn ConfigLoader,
    signals: &S,
) -> Result<ShutdownReason, LaunchError>
where
    S: ShutdownSignal,
{
    let config = bootstrap_with(loader)?.into_config();
    let compiler = config
        .compiler()
        .ok_or(LaunchError::MissingCompiler)?
        .to_owned();
    let keep_alive = config
        .keep_alive()
        .map_or(KeepAlive::Disabled, KeepAlive::After);

    let paths = RuntimePaths::from_config(&config)?;
    let mut guard = ProcessGuard::acquire(paths, config.daemon_socket().to_string())?;
    let pid = std::process::id();
    guard.write_pid(pid)?;
    guard.write_health(HealthState::Starting)?;

    let runtime = build_runtime()?;
    let cancel = CancellationToken::new();
    let watch = signals.watch(cancel.clone())?;

    info!(
        target: PROCESS_TARGET,
        pid,
        compiler = %compiler,
        keep_alive = %keep_alive,
        "starting compilation server"
    );
    let served = runtime.block_on(async {
        let listener = SocketListener::bind(config.daemon_socket())?;
        guard.write_health(HealthState::Ready)?;
        let dispatcher = RequestDispatcher::new(
            listener,
            Arc::new(ProcessCompilerHost::new(compiler.into_std_path_buf())),
            Arc::new(StructuredEventBus::new()),
            keep_alive,
        )
        .with_server_process_id(pid);
        Ok::<_, LaunchError>(dispatcher.run(cancel).await)
    });
    drop(watch);
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);

    let reason = served?;
    guard.write_health(HealthState::Stopping)?;
    info!(
        target: PROCESS_TARGET,
        reason = %reason,
        "shutdown sequence completed"
    );
    Ok(reason)
}

fn build_runtime() -> Result<Runtime, LaunchError> {
    Builder::new_multi_thread()
        .enable_all()
        .thread_name("kilnd-worker")
        .build()
        .map_err(|source| LaunchError::Runtime { source })
}
