//! Errors raised while framing, encoding, or decoding protocol messages.

use std::io;
use std::string::FromUtf8Error;

use thiserror::Error;

/// Failures surfaced by the protocol codec.
///
/// [`ProtocolError::Io`] covers every failure of the underlying stream,
/// including a peer that closes the connection part way through a frame.
/// All other variants describe a payload that arrived intact but does not
/// form a valid message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Reading from or writing to the stream failed.
    #[error("stream error: {0}")]
    Io(#[from] io::Error),

    /// The frame length exceeds [`MAX_FRAME_BYTES`](crate::MAX_FRAME_BYTES).
    #[error("frame of {size} bytes exceeds the {max_size} byte limit")]
    FrameTooLarge {
        /// Declared or computed frame size.
        size: usize,
        /// Largest accepted frame size.
        max_size: usize,
    },

    /// The payload ended before a field could be read in full.
    #[error("payload truncated while reading {field}: needed {needed} bytes, {available} available")]
    Truncated {
        /// Field being decoded.
        field: &'static str,
        /// Bytes required by the field.
        needed: usize,
        /// Bytes remaining in the payload.
        available: usize,
    },

    /// Bytes remained after the final field was decoded.
    #[error("{count} unexpected trailing bytes after payload")]
    TrailingBytes {
        /// Number of unread bytes.
        count: usize,
    },

    /// A string field did not hold valid UTF-8.
    #[error("{field} is not valid UTF-8: {source}")]
    InvalidUtf8 {
        /// Field being decoded.
        field: &'static str,
        /// Underlying conversion error.
        #[source]
        source: FromUtf8Error,
    },

    /// A request argument carried an unrecognised identifier.
    #[error("unknown argument identifier {0:#010x}")]
    UnknownArgument(u32),

    /// A response carried an unrecognised kind tag.
    #[error("unknown response kind {0}")]
    UnknownResponseKind(u32),

    /// A request mixed the shutdown marker with build arguments.
    #[error("shutdown requests cannot carry build arguments")]
    MixedShutdown,

    /// The keep-alive argument was not a whole number of seconds or `-1`.
    #[error("invalid keep-alive value '{value}'")]
    InvalidKeepAlive {
        /// Raw argument value.
        value: String,
    },
}

impl ProtocolError {
    /// Returns `true` when the error came from the stream rather than the
    /// payload contents.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    pub(crate) const fn frame_too_large(size: usize) -> Self {
        Self::FrameTooLarge {
            size,
            max_size: crate::MAX_FRAME_BYTES,
        }
    }
}
