//! Build requests sent from a client to the server.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::{PayloadReader, PayloadWriter, read_frame, write_frame};
use crate::error::ProtocolError;
use crate::keep_alive::KeepAlive;

/// Protocol version spoken by this build of the server.
pub const PROTOCOL_VERSION: u32 = 1;

/// Identifies the meaning of a request argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgumentId {
    /// Working directory the compiler should run in.
    CurrentDirectory,
    /// Scratch directory the client would like the compiler to use.
    TempDirectory,
    /// Directory holding the client executable.
    ClientDirectory,
    /// One compiler command-line argument, ordered by index.
    CommandLineArgument,
    /// Idle keep-alive override in whole seconds, `-1` to disable.
    KeepAlive,
    /// Marks the request as a server shutdown request.
    Shutdown,
}

impl ArgumentId {
    const CURRENT_DIRECTORY: u32 = 0x4b49_0001;
    const TEMP_DIRECTORY: u32 = 0x4b49_0002;
    const CLIENT_DIRECTORY: u32 = 0x4b49_0003;
    const COMMAND_LINE_ARGUMENT: u32 = 0x4b49_0004;
    const KEEP_ALIVE: u32 = 0x4b49_0005;
    const SHUTDOWN: u32 = 0x4b49_0006;

    /// Returns the wire identifier.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::CurrentDirectory => Self::CURRENT_DIRECTORY,
            Self::TempDirectory => Self::TEMP_DIRECTORY,
            Self::ClientDirectory => Self::CLIENT_DIRECTORY,
            Self::CommandLineArgument => Self::COMMAND_LINE_ARGUMENT,
            Self::KeepAlive => Self::KEEP_ALIVE,
            Self::Shutdown => Self::SHUTDOWN,
        }
    }
}

impl TryFrom<u32> for ArgumentId {
    type Error = ProtocolError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            Self::CURRENT_DIRECTORY => Ok(Self::CurrentDirectory),
            Self::TEMP_DIRECTORY => Ok(Self::TempDirectory),
            Self::CLIENT_DIRECTORY => Ok(Self::ClientDirectory),
            Self::COMMAND_LINE_ARGUMENT => Ok(Self::CommandLineArgument),
            Self::KEEP_ALIVE => Ok(Self::KeepAlive),
            Self::SHUTDOWN => Ok(Self::Shutdown),
            other => Err(ProtocolError::UnknownArgument(other)),
        }
    }
}

/// One typed argument of a build request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestArgument {
    /// Meaning of the argument.
    pub id: ArgumentId,
    /// Position among arguments sharing the same identifier.
    pub index: u32,
    /// Argument text.
    pub value: String,
}

impl RequestArgument {
    /// Creates an argument.
    #[must_use]
    pub fn new(id: ArgumentId, index: u32, value: impl Into<String>) -> Self {
        Self {
            id,
            index,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RequestBody {
    Build(Vec<RequestArgument>),
    Shutdown,
}

/// A request to compile, or to shut the server down.
///
/// A request is never both: the shutdown marker cannot be combined with build
/// arguments, and constructors enforce this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    protocol_version: u32,
    body: RequestBody,
}

impl BuildRequest {
    /// Creates a build request from typed arguments.
    ///
    /// A list holding only a [`ArgumentId::Shutdown`] argument produces a
    /// shutdown request.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MixedShutdown`] when the shutdown marker is
    /// combined with other arguments.
    pub fn new(arguments: Vec<RequestArgument>) -> Result<Self, ProtocolError> {
        Self::from_parts(PROTOCOL_VERSION, arguments)
    }

    /// Creates a build request for a compiler command line.
    #[must_use]
    pub fn from_command_line<I, S>(current_directory: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut arguments = vec![RequestArgument::new(
            ArgumentId::CurrentDirectory,
            0,
            current_directory,
        )];
        arguments.extend(
            args.into_iter()
                .zip(0_u32..)
                .map(|(value, index)| {
                    RequestArgument::new(ArgumentId::CommandLineArgument, index, value)
                }),
        );
        Self {
            protocol_version: PROTOCOL_VERSION,
            body: RequestBody::Build(arguments),
        }
    }

    /// Creates a request asking the server to shut down.
    #[must_use]
    pub const fn shutdown() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            body: RequestBody::Shutdown,
        }
    }

    /// Replaces any keep-alive argument with the supplied value.
    ///
    /// Has no effect on shutdown requests.
    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: KeepAlive) -> Self {
        if let RequestBody::Build(arguments) = &mut self.body {
            arguments.retain(|argument| argument.id != ArgumentId::KeepAlive);
            arguments.push(RequestArgument::new(
                ArgumentId::KeepAlive,
                0,
                keep_alive.to_argument_value(),
            ));
        }
        self
    }

    /// Overrides the protocol version; used to talk to older servers.
    #[must_use]
    pub const fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    /// Protocol version the request was encoded with.
    #[must_use]
    pub const fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Returns `true` for shutdown requests.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self.body, RequestBody::Shutdown)
    }

    /// Build arguments in wire order; empty for shutdown requests.
    #[must_use]
    pub fn arguments(&self) -> &[RequestArgument] {
        match &self.body {
            RequestBody::Build(arguments) => arguments,
            RequestBody::Shutdown => &[],
        }
    }

    /// Compiler command-line arguments ordered by index.
    #[must_use]
    pub fn command_line(&self) -> Vec<&str> {
        let mut args: Vec<&RequestArgument> = self
            .arguments_with(ArgumentId::CommandLineArgument)
            .collect();
        args.sort_by_key(|argument| argument.index);
        args.into_iter().map(|argument| argument.value.as_str()).collect()
    }

    /// Working directory requested by the client.
    #[must_use]
    pub fn current_directory(&self) -> Option<&str> {
        self.first_value(ArgumentId::CurrentDirectory)
    }

    /// Scratch directory requested by the client.
    #[must_use]
    pub fn temp_directory(&self) -> Option<&str> {
        self.first_value(ArgumentId::TempDirectory)
    }

    /// Keep-alive override carried by the request, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidKeepAlive`] when the argument is not a
    /// whole number of seconds or `-1`.
    pub fn keep_alive(&self) -> Result<Option<KeepAlive>, ProtocolError> {
        self.first_value(ArgumentId::KeepAlive)
            .map(KeepAlive::parse)
            .transpose()
    }

    /// Encodes the request payload without framing.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] if the payload would exceed
    /// [`MAX_FRAME_BYTES`](crate::MAX_FRAME_BYTES).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let shutdown_marker;
        let arguments: &[RequestArgument] = match &self.body {
            RequestBody::Build(arguments) => arguments,
            RequestBody::Shutdown => {
                shutdown_marker = [RequestArgument::new(ArgumentId::Shutdown, 0, "")];
                &shutdown_marker
            }
        };
        let count = u32::try_from(arguments.len())
            .map_err(|_| ProtocolError::frame_too_large(arguments.len()))?;

        let mut writer = PayloadWriter::new();
        writer.put_u32(self.protocol_version).put_u32(count);
        for argument in arguments {
            writer.put_u32(argument.id.code()).put_u32(argument.index);
            writer.put_string(&argument.value)?;
        }
        writer.finish()
    }

    /// Decodes a request payload.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] describing the first malformed field.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = PayloadReader::new(payload);
        let protocol_version = reader.u32("protocol version")?;
        let count = reader.u32("argument count")?;
        let mut arguments = Vec::new();
        for _ in 0..count {
            let id = ArgumentId::try_from(reader.u32("argument id")?)?;
            let index = reader.u32("argument index")?;
            let value = reader.string("argument value")?;
            arguments.push(RequestArgument { id, index, value });
        }
        reader.finish()?;
        Self::from_parts(protocol_version, arguments)
    }

    /// Reads one framed request.
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

    /// Writes the request as one frame.
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

    fn from_parts(
        protocol_version: u32,
        arguments: Vec<RequestArgument>,
    ) -> Result<Self, ProtocolError> {
        let shutdown_markers = arguments
            .iter()
            .filter(|argument| argument.id == ArgumentId::Shutdown)
            .count();
        let body = match (shutdown_markers, arguments.len()) {
            (0, _) => RequestBody::Build(arguments),
            (1, 1) => RequestBody::Shutdown,
            _ => return Err(ProtocolError::MixedShutdown),
        };
        Ok(Self {
            protocol_version,
            body,
        })
    }

    fn arguments_with(&self, id: ArgumentId) -> impl Iterator<Item = &RequestArgument> {
        self.arguments()
            .iter()
            .filter(move |argument| argument.id == id)
    }

    fn first_value(&self, id: ArgumentId) -> Option<&str> {
        self.arguments_with(id)
            .min_by_key(|argument| argument.index)
            .map(|argument| argument.value.as_str())
    }
}
