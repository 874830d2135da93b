//! Length-prefixed multi-frame encoding.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_MESSAGE_SIZE;
use crate::protocol::envelope::Multipart;
use crate::protocol::error::{Result, TriplexError};

/// Serialize a multi-frame message into one length-prefixed buffer.
pub fn encode_frames(frames: &[Vec<u8>]) -> Result<Vec<u8>> {
    let body_len: usize = frames.iter().map(|f| 4 + f.len()).sum();
    if body_len > MAX_MESSAGE_SIZE {
        return Err(TriplexError::Oversized(body_len, MAX_MESSAGE_SIZE));
    }
    let mut buf = Vec::with_capacity(4 + body_len);
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    for frame in frames {
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
    }
    Ok(buf)
}

/// Parse a message body back into its frames.
pub fn decode_frames(body: &[u8]) -> Result<Multipart> {
    let mut frames = Vec::new();
    let mut offset = 0usize;
    while offset < body.len() {
        if body.len() - offset < 4 {
            return Err(TriplexError::Malformed(
                "truncated frame length prefix".into(),
            ));
        }
        let len = u32::from_be_bytes(body[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4;
        if body.len() - offset < len {
            return Err(TriplexError::Malformed(format!(
                "frame of {len} bytes overruns message body"
            )));
        }
        frames.push(body[offset..offset + len].to_vec());
        offset += len;
    }
    Ok(frames)
}

/// Write one multi-frame message.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, frames: &[Vec<u8>]) -> Result<()> {
    let buf = encode_frames(frames)?;
    writer
        .write_all(&buf)
        .await
        .map_err(|e| TriplexError::Connection(format!("writing message: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| TriplexError::Connection(format!("flushing stream: {e}")))?;
    Ok(())
}

/// Read one multi-frame message.
///
/// Returns `Ok(None)` on a clean end-of-stream at a message boundary.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Multipart>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TriplexError::Connection(format!("reading length: {e}"))),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(TriplexError::Oversized(len, MAX_MESSAGE_SIZE));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| TriplexError::Connection(format!("reading body: {e}")))?;

    Ok(Some(decode_frames(&body)?))
}
