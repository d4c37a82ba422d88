//! Envelope codec and stream framing.
//!
//! The logical payload is one JSON object per envelope. On stream
//! transports each payload is prefixed with a 4-byte big-endian length
//! header; HTTP carries the payload as the request/response body.

use actmesh_types::{DecodeError, Envelope};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Errors reading a frame off a stream.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    Closed,
    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: u32, max: u32 },
}

/// Serialize an envelope to its JSON payload.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(envelope)
}

/// Parse a JSON payload into an envelope.
pub fn decode(body: &[u8]) -> Result<Envelope, DecodeError> {
    serde_json::from_slice(body).map_err(|e| DecodeError::new(e.to_string()))
}

/// Encode an envelope with its length header (4-byte big-endian length + JSON).
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    let json = encode(envelope)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Best-effort recovery of the correlation id from a payload that failed to
/// decode, so the waiting side still gets an error response.
pub fn salvage_correlation_id(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("correlationId")?.as_str().map(String::from)
}

/// Read one frame body from a stream.
///
/// A clean EOF before the header is [`FrameError::Closed`]; EOF inside a
/// frame is an IO error.
pub async fn read_frame<R>(reader: &mut R, max: u32) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::Closed);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let len = decode_length(&header);
    if len > max {
        return Err(FrameError::TooLarge { size: len, max });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Write an already framed envelope to a stream.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}
