//! Process supervision: runtime artefacts, signals and the launch sequence.

use std::time::Duration;

mod errors;
mod files;
mod guard;
mod launch;
mod shutdown;

pub use self::errors::LaunchError;
pub use self::guard::HealthState;
pub use self::launch::{run_server, run_server_with};
pub use self::shutdown::{ShutdownError, ShutdownSignal, SystemShutdownSignal};

pub(crate) const PROCESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::process");

/// Grace period for blocking work to wind down once the dispatcher stops.
pub(crate) const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
