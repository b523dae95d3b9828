use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Telemetry output formats.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    Json,
    /// Single-line human-readable output.
    Compact,
}

/// Error raised when text does not name a [`LogFormat`].
pub type LogFormatParseError = strum::ParseError;
