//! Idle keep-alive durations carried by build requests.

use std::fmt;
use std::time::Duration;

use crate::error::ProtocolError;

const DISABLED_VALUE: &str = "-1";

/// How long the server lingers once it has no work in flight.
///
/// On the wire the value is a decimal string of whole seconds, with `-1`
/// meaning the server should never exit on idleness. Sub-second precision is
/// dropped when a duration is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeepAlive {
    /// Never shut down because of idleness.
    #[default]
    Disabled,
    /// Shut down after the server has been idle for the duration.
    After(Duration),
}

impl KeepAlive {
    /// Builds a keep-alive from an optional number of seconds.
    #[must_use]
    pub const fn from_secs(secs: Option<u64>) -> Self {
        match secs {
            Some(value) => Self::After(Duration::from_secs(value)),
            None => Self::Disabled,
        }
    }

    /// Returns the idle duration, or `None` when disabled.
    #[must_use]
    pub const fn duration(self) -> Option<Duration> {
        match self {
            Self::Disabled => None,
            Self::After(duration) => Some(duration),
        }
    }

    /// Parses the textual argument form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidKeepAlive`] for anything other than
    /// `-1` or a non-negative whole number of seconds.
    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        let trimmed = value.trim();
        if trimmed == DISABLED_VALUE {
            return Ok(Self::Disabled);
        }
        trimmed
            .parse::<u64>()
            .map(|secs| Self::After(Duration::from_secs(secs)))
            .map_err(|_| ProtocolError::InvalidKeepAlive {
                value: value.to_owned(),
            })
    }

    /// Renders the textual argument form.
    #[must_use]
    pub fn to_argument_value(self) -> String {
        match self {
            Self::Disabled => DISABLED_VALUE.to_owned(),
            Self::After(duration) => duration.as_secs().to_string(),
        }
    }
}

impl fmt::Display for KeepAlive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::After(duration) => write!(f, "{}s", duration.as_secs()),
        }
    }
}
