//! Layered configuration shared by the Kiln server and its clients.
//!
//! Values resolve in precedence order: built-in defaults, then a
//! configuration file (`--config-path` or `KILN_CONFIG_PATH`), then
//! `KILN_*` environment variables, then command-line flags.

mod defaults;
mod logging;
mod runtime;
mod socket;

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_LOG_FILTER, DEFAULT_TCP_PORT, default_log_filter, default_log_filter_string,
    default_log_format, default_socket_endpoint,
};
pub use logging::{LogFormat, LogFormatParseError};
pub use runtime::{RuntimePaths, RuntimePathsError};
pub use socket::{SocketEndpoint, SocketParseError, SocketPreparationError};

/// Resolved server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "KILN")]
pub struct Config {
    /// Endpoint the server listens on and clients connect to.
    #[serde(default = "default_socket_endpoint")]
    #[ortho_config(default = default_socket_endpoint())]
    pub daemon_socket: SocketEndpoint,

    /// `tracing` filter directive applied to server telemetry.
    #[serde(default = "default_log_filter_string")]
    #[ortho_config(default = default_log_filter_string())]
    pub log_filter: String,

    /// Output format for server telemetry.
    #[serde(default = "default_log_format")]
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,

    /// Idle seconds before the server exits; absent keeps it running.
    #[serde(default)]
    pub keep_alive_secs: Option<u64>,

    /// Compiler executable launched for each build request.
    #[serde(default)]
    pub compiler: Option<Utf8PathBuf>,
}

impl Config {
    /// Endpoint the server binds.
    #[must_use]
    pub const fn daemon_socket(&self) -> &SocketEndpoint {
        &self.daemon_socket
    }

    /// Telemetry filter directive.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Telemetry output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Configured idle keep-alive, `None` when disabled.
    #[must_use]
    pub const fn keep_alive(&self) -> Option<Duration> {
        match self.keep_alive_secs {
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        }
    }

    /// Configured compiler executable.
    #[must_use]
    pub fn compiler(&self) -> Option<&camino::Utf8Path> {
        self.compiler.as_deref()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon_socket: default_socket_endpoint(),
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            keep_alive_secs: None,
            compiler: None,
        }
    }
}
