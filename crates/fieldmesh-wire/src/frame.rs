//! Multipart frames.
//!
//! Each frame on a TCP stream is prefixed with a 4-byte big-endian length,
//! followed by a 4-byte part count and then each part as a 4-byte length and
//! its bytes. The last part is always the serialized message; any parts
//! before it are the remaining hops of an explicit path, consumed one per
//! forwarding router.

use crate::error::{WireError, WireResult};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum single frame size (64 MB).
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// One unit on the wire: routing hops plus opaque message bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Remaining explicit hops, first hop first.
    pub hops: Vec<String>,
    /// Serialized message.
    pub body: Bytes,
}

impl Frame {
    pub fn new(body: Bytes) -> Self {
        Self {
            hops: Vec::new(),
            body,
        }
    }

    pub fn with_hops(hops: Vec<String>, body: Bytes) -> Self {
        Self { hops, body }
    }

    /// The identity frame a dialer sends first on a new connection.
    pub fn identity(id: &str) -> Self {
        Self::new(Bytes::copy_from_slice(id.as_bytes()))
    }

    /// Read an identity frame back.
    pub fn as_identity(&self) -> WireResult<String> {
        if !self.hops.is_empty() {
            return Err(WireError::Malformed("identity frame carries hops".into()));
        }
        let id = std::str::from_utf8(&self.body)
            .map_err(|_| WireError::Malformed("identity is not UTF-8".into()))?;
        if id.is_empty() {
            return Err(WireError::Malformed("empty identity".into()));
        }
        Ok(id.to_string())
    }

    /// Drop leading hops that name `own_id` (or its `_<id>` alias).
    pub fn consume_own_hops(&mut self, own_id: &str) {
        let skip = self
            .hops
            .iter()
            .take_while(|hop| is_own_id(hop, own_id))
            .count();
        self.hops.drain(..skip);
    }

    /// Encode the frame body (without the outer length prefix).
    pub fn encode(&self) -> Vec<u8> {
        let parts = self.hops.len() + 1;
        let size = 4
            + self.hops.iter().map(|h| 4 + h.len()).sum::<usize>()
            + 4
            + self.body.len();
        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&(parts as u32).to_be_bytes());
        for hop in &self.hops {
            out.extend_from_slice(&(hop.len() as u32).to_be_bytes());
            out.extend_from_slice(hop.as_bytes());
        }
        out.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// Decode a frame body produced by [`Frame::encode`].
    pub fn decode(raw: Bytes) -> WireResult<Self> {
        let mut cursor = 0usize;
        let parts = read_u32(&raw, &mut cursor)? as usize;
        if parts == 0 {
            return Err(WireError::Malformed("frame has no parts".into()));
        }
        // Every part carries at least its 4-byte length.
        if parts > (raw.len() - cursor) / 4 {
            return Err(WireError::Malformed(format!(
                "{parts} parts do not fit in {} bytes",
                raw.len()
            )));
        }

        let mut hops = Vec::with_capacity(parts - 1);
        for _ in 0..parts - 1 {
            let part = read_part(&raw, &mut cursor)?;
            let hop = String::from_utf8(part.to_vec())
                .map_err(|_| WireError::Malformed("hop is not UTF-8".into()))?;
            hops.push(hop);
        }
        let body = read_part(&raw, &mut cursor)?;
        if cursor != raw.len() {
            return Err(WireError::Malformed(format!(
                "{} trailing bytes",
                raw.len() - cursor
            )));
        }
        Ok(Self { hops, body })
    }
}

/// Whether `candidate` addresses the endpoint `own_id`.
pub fn is_own_id(candidate: &str, own_id: &str) -> bool {
    candidate == own_id || candidate.strip_prefix('_') == Some(own_id)
}

fn read_u32(raw: &[u8], cursor: &mut usize) -> WireResult<u32> {
    let end = *cursor + 4;
    let bytes = raw
        .get(*cursor..end)
        .ok_or_else(|| WireError::Malformed("truncated length".into()))?;
    *cursor = end;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_part(raw: &Bytes, cursor: &mut usize) -> WireResult<Bytes> {
    let len = read_u32(raw, cursor)? as usize;
    let end = *cursor + len;
    if end > raw.len() {
        return Err(WireError::Malformed("truncated part".into()));
    }
    let part = raw.slice(*cursor..end);
    *cursor = end;
    Ok(part)
}

/// Write a length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    let body = frame.encode();
    let len = body.len() as u32;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R) -> WireResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Frame::decode(Bytes::from(body))
}
