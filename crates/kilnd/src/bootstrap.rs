//! Configuration loading and telemetry start-up.

use std::ffi::OsString;
use std::sync::Arc;

use kiln_config::{Config, SocketPreparationError};
use ortho_config::{OrthoConfig, OrthoError};
use thiserror::Error;
use tracing::info;

use crate::telemetry::{self, TelemetryError, TelemetryHandle};

const BOOTSTRAP_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::bootstrap");

/// Source of the server configuration.
pub trait ConfigLoader: Send + Sync {
    /// Loads the layered configuration.
    fn load(&self) -> Result<Config, Arc<OrthoError>>;
}

/// Loads configuration from files, `KILN_*` variables and the given
/// command-line arguments.
#[derive(Debug, Clone, Default)]
pub struct SystemConfigLoader {
    args: Vec<OsString>,
}

impl SystemConfigLoader {
    /// Uses `args` (program name first) as the command-line layer.
    #[must_use]
    pub const fn from_args(args: Vec<OsString>) -> Self {
        Self { args }
    }
}

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        if self.args.is_empty() {
            Config::load()
        } else {
            Config::load_from_iter(self.args.iter().cloned())
        }
    }
}

/// Loader that returns a pre-built configuration.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    /// Wraps an already resolved configuration.
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(self.config.clone())
    }
}

/// Errors surfaced during bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
    /// The socket directory could not be prepared.
    #[error("failed to prepare server socket: {source}")]
    Socket {
        /// Filesystem error reported while preparing the socket directory.
        #[source]
        source: SocketPreparationError,
    },
}

/// Configuration plus the telemetry it installed.
#[derive(Debug)]
pub struct Bootstrapped {
    config: Config,
    telemetry: TelemetryHandle,
}

impl Bootstrapped {
    /// Resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Handle proving telemetry is installed.
    #[must_use]
    pub const fn telemetry(&self) -> TelemetryHandle {
        self.telemetry
    }

    /// Consumes the bootstrap result, keeping the configuration.
    #[must_use]
    pub fn into_config(self) -> Config {
        self.config
    }
}

/// Loads configuration, installs telemetry and prepares the socket directory.
pub fn bootstrap_with(loader: &dyn ConfigLoader) -> Result<Bootstrapped, BootstrapError> {
    let config = loader
        .load()
        .map_err(|source| BootstrapError::Configuration { source })?;
    let telemetry =
        telemetry::initialise(&config).map_err(|source| BootstrapError::Telemetry { source })?;
    config
        .daemon_socket()
        .prepare_filesystem()
        .map_err(|source| BootstrapError::Socket { source })?;

    info!(
        target: BOOTSTRAP_TARGET,
        socket = %config.daemon_socket(),
        log_filter = %config.log_filter(),
        log_format = %config.log_format(),
        keep_alive_secs = config.keep_alive().map(|keep_alive| keep_alive.as_secs()),
        compiler = config.compiler().map(|path| path.as_str()),
        "configuration loaded"
    );
    Ok(Bootstrapped { config, telemetry })
}
