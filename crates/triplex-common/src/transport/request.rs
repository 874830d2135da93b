use std::time::Duration;

use tokio::net::TcpStream;

use crate::protocol::error::{Result, TriplexError};
use crate::transport::framing::{read_message, write_message};

/// Client-side lockstep request channel.
///
/// Sends `[empty | data]` and waits for the reply within a bounded wait.
/// The peer router prepends the caller's identity on receipt and strips it
/// on reply, so the caller only ever sees its own payload frames.
pub struct RequestChannel {
    stream: TcpStream,
}

impl RequestChannel {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TriplexError::Connection(format!("failed to connect to {addr}: {e}")))?;
        Ok(RequestChannel { stream })
    }

    /// One request-reply exchange; the reply's payload frame is returned.
    pub async fn request(&mut self, data: Vec<u8>, wait: Duration) -> Result<Vec<u8>> {
        let exchange = async {
            write_message(&mut self.stream, &[Vec::new(), data]).await?;
            match read_message(&mut self.stream).await? {
                Some(frames) => frames
                    .into_iter()
                    .last()
                    .ok_or_else(|| TriplexError::Malformed("reply with no frames".into())),
                None => Err(TriplexError::Connection(
                    "peer closed before replying".into(),
                )),
            }
        };
        tokio::time::timeout(wait, exchange)
            .await
            .map_err(|_| TriplexError::Timeout(wait.as_millis() as u64))?
    }
}
