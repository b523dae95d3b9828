//! Top-level command selection for the `kilnd` binary.
//!
//! Configuration flags are owned by `ortho_config`, so the optional
//! subcommand is peeled off before the remaining arguments reach it.

use std::ffi::OsString;

const SHUTDOWN_COMMAND: &str = "shutdown";

/// What the binary was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the compilation server in the foreground.
    Serve,
    /// Ask the configured server to shut down.
    Shutdown,
}

/// Parsed command plus the arguments destined for configuration loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    command: Command,
    config_args: Vec<OsString>,
}

impl Invocation {
    /// Splits `args` (program name first) into a command and config flags.
    ///
    /// Only the first argument after the program name is treated as a
    /// subcommand; everything else passes through untouched.
    pub fn from_args<I>(args: I) -> Self
    where
        I: IntoIterator<Item = OsString>,
    {
        let mut config_args: Vec<OsString> = args.into_iter().collect();
        let command = if config_args
            .get(1)
            .is_some_and(|arg| arg == SHUTDOWN_COMMAND)
        {
            config_args.remove(1);
            Command::Shutdown
        } else {
            Command::Serve
        };
        Self {
            command,
            config_args,
        }
    }

    /// Selected command.
    #[must_use]
    pub const fn command(&self) -> Command {
        self.command
    }

    /// Consumes the invocation, yielding the configuration arguments.
    #[must_use]
    pub fn into_config_args(self) -> Vec<OsString> {
        self.config_args
    }
}
