//! Length-prefixed framing and primitive field codecs.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Largest payload accepted in a single frame.
///
/// Compiler output is returned inline, so the limit is generous; it exists to
/// stop a corrupt length header from triggering an unbounded allocation.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const HEADER_BYTES: usize = 4;

/// Reads one frame and returns its payload.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0_u8; HEADER_BYTES];
    reader.read_exact(&mut header).await?;
    let declared = u32::from_le_bytes(header);
    let length =
        usize::try_from(declared).map_err(|_| ProtocolError::frame_too_large(usize::MAX))?;
    if length > MAX_FRAME_BYTES {
        return Err(ProtocolError::frame_too_large(length));
    }

    let mut payload = vec![0_u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Writes the payload as a single frame and flushes the writer.
pub(crate) async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::frame_too_large(payload.len()));
    }
    let length =
        u32::try_from(payload.len()).map_err(|_| ProtocolError::frame_too_large(payload.len()))?;

    // Header and payload go out in one write so a peer never observes a
    // header without its body from a partially failed write.
    let mut frame = Vec::with_capacity(HEADER_BYTES + payload.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Accumulates encoded fields for a payload.
#[derive(Debug, Default)]
pub(crate) struct PayloadWriter {
    buffer: Vec<u8>,
}

impl PayloadWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn put_bool(&mut self, value: bool) -> &mut Self {
        self.buffer.push(u8::from(value));
        self
    }

    pub(crate) fn put_string(&mut self, value: &str) -> Result<&mut Self, ProtocolError> {
        let length =
            u32::try_from(value.len()).map_err(|_| ProtocolError::frame_too_large(value.len()))?;
        self.put_u32(length);
        self.buffer.extend_from_slice(value.as_bytes());
        Ok(self)
    }

    pub(crate) fn finish(self) -> Result<Vec<u8>, ProtocolError> {
        if self.buffer.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::frame_too_large(self.buffer.len()));
        }
        Ok(self.buffer)
    }
}

/// Cursor over a received payload.
///
/// Fields are consumed front to back; nothing is produced for the caller
/// until every field has been validated.
#[derive(Debug)]
pub(crate) struct PayloadReader<'a> {
    remaining: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub(crate) const fn new(payload: &'a [u8]) -> Self {
        Self { remaining: payload }
    }

    fn take(&mut self, needed: usize, field: &'static str) -> Result<&'a [u8], ProtocolError> {
        let Some((head, tail)) = self.remaining.split_at_checked(needed) else {
            return Err(ProtocolError::Truncated {
                field,
                needed,
                available: self.remaining.len(),
            });
        };
        self.remaining = tail;
        Ok(head)
    }

    fn take_array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], ProtocolError> {
        let bytes = self.take(N, field)?;
        <[u8; N]>::try_from(bytes).map_err(|_| ProtocolError::Truncated {
            field,
            needed: N,
            available: bytes.len(),
        })
    }

    pub(crate) fn u32(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        self.take_array::<4>(field).map(u32::from_le_bytes)
    }

    pub(crate) fn i32(&mut self, field: &'static str) -> Result<i32, ProtocolError> {
        self.take_array::<4>(field).map(i32::from_le_bytes)
    }

    pub(crate) fn bool(&mut self, field: &'static str) -> Result<bool, ProtocolError> {
        self.take_array::<1>(field).map(|[byte]| byte != 0)
    }

    pub(crate) fn string(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let declared = self.u32(field)?;
        let length = usize::try_from(declared).map_err(|_| ProtocolError::Truncated {
            field,
            needed: usize::MAX,
            available: self.remaining.len(),
        })?;
        let bytes = self.take(length, field)?;
        String::from_utf8(bytes.to_vec()).map_err(|source| ProtocolError::InvalidUtf8 { field, source })
    }

    pub(crate) const fn remaining(&self) -> usize {
        self.remaining.len()
    }

    /// Confirms the whole payload was consumed.
    pub(crate) const fn finish(self) -> Result<(), ProtocolError> {
        if self.remaining.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::TrailingBytes {
                count: self.remaining.len(),
            })
        }
    }
}
