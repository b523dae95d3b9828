//! Responses returned by the server for each connection.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::{PayloadReader, PayloadWriter, read_frame, write_frame};
use crate::error::ProtocolError;

/// Discriminates the variants of [`BuildResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    /// The compiler ran to completion.
    Completed,
    /// The client speaks a different protocol version.
    MismatchedVersion,
    /// The server declined the request.
    Rejected,
    /// The server acknowledged a shutdown request.
    Shutdown,
}

impl ResponseKind {
    const COMPLETED: u32 = 1;
    const MISMATCHED_VERSION: u32 = 2;
    const REJECTED: u32 = 3;
    const SHUTDOWN: u32 = 4;

    /// Returns the wire tag.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Completed => Self::COMPLETED,
            Self::MismatchedVersion => Self::MISMATCHED_VERSION,
            Self::Rejected => Self::REJECTED,
            Self::Shutdown => Self::SHUTDOWN,
        }
    }
}

impl TryFrom<u32> for ResponseKind {
    type Error = ProtocolError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            Self::COMPLETED => Ok(Self::Completed),
            Self::MISMATCHED_VERSION => Ok(Self::MismatchedVersion),
            Self::REJECTED => Ok(Self::Rejected),
            Self::SHUTDOWN => Ok(Self::Shutdown),
            other => Err(ProtocolError::UnknownResponseKind(other)),
        }
    }
}

/// Outcome reported to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildResponse {
    /// The compiler finished.
    Completed {
        /// Compiler exit status.
        return_code: i32,
        /// Whether the compiler produced UTF-8 output without replacement.
        utf8_output: bool,
        /// Combined compiler output.
        output: String,
    },
    /// The request used an unsupported protocol version.
    MismatchedVersion,
    /// The server declined to run the request.
    Rejected {
        /// Human-readable explanation.
        reason: String,
    },
    /// The server is shutting down at the client's request.
    Shutdown {
        /// Process identifier of the server.
        server_process_id: u32,
    },
}

impl BuildResponse {
    /// Creates a completed response.
    #[must_use]
    pub fn completed(return_code: i32, utf8_output: bool, output: impl Into<String>) -> Self {
        Self::Completed {
            return_code,
            utf8_output,
            output: output.into(),
        }
    }

    /// Creates a rejection.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Creates a shutdown acknowledgement.
    #[must_use]
    pub const fn shutdown(server_process_id: u32) -> Self {
        Self::Shutdown { server_process_id }
    }

    /// Returns the variant tag.
    #[must_use]
    pub const fn kind(&self) -> ResponseKind {
        match self {
            Self::Completed { .. } => ResponseKind::Completed,
            Self::MismatchedVersion => ResponseKind::MismatchedVersion,
            Self::Rejected { .. } => ResponseKind::Rejected,
            Self::Shutdown { .. } => ResponseKind::Shutdown,
        }
    }

    /// Encodes the response payload without framing.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] if the compiler output does
    /// not fit in a frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut writer = PayloadWriter::new();
        writer.put_u32(self.kind().code());
        match self {
            Self::Completed {
                return_code,
                utf8_output,
                output,
            } => {
                writer.put_i32(*return_code).put_bool(*utf8_output);
                writer.put_string(output)?;
            }
            Self::MismatchedVersion => {}
            Self::Rejected { reason } => {
                writer.put_string(reason)?;
            }
            Self::Shutdown { server_process_id } => {
                writer.put_u32(*server_process_id);
            }
        }
        writer.finish()
    }

    /// Decodes a response payload.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] describing the first malformed field.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = PayloadReader::new(payload);
        let kind = ResponseKind::try_from(reader.u32("response kind")?)?;
        let response = match kind {
            ResponseKind::Completed => Self::Completed {
                return_code: reader.i32("return code")?,
                utf8_output: reader.bool("utf8 flag")?,
                output: reader.string("output")?,
            },
            ResponseKind::MismatchedVersion => Self::MismatchedVersion,
            ResponseKind::Rejected => Self::Rejected {
                reason: reader.string("rejection reason")?,
            },
            ResponseKind::Shutdown => Self::Shutdown {
                server_process_id: reader.u32("server process id")?,
            },
        };
        reader.finish()?;
        Ok(response)
    }

    /// Reads one framed response.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Io`] when the stream fails or ends early and
    /// another variant when the payload is malformed.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let payload = read_frame(reader).await?;
        Self::decode(&payload)
    }

    /// Writes the response as one frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Io`] when the stream fails.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let payload = self.encode()?;
        write_frame(writer, &payload).await
    }
}
