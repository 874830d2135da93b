use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::protocol::envelope::{join, split, Multipart};
use crate::protocol::error::{Result, TriplexError};
use crate::transport::framing::{read_message, write_message};
use crate::transport::CHANNEL_DEPTH;

/// A worker's end of a cohort dispatch channel.
///
/// Every inbound message is split into its routing frames and payload; a
/// reply carries the routing frames back so the broker can deliver it to
/// the originator (a client for service results, the broker itself for
/// heartbeat pongs). Malformed envelopes are logged and dropped at the
/// read side.
///
/// All sends go through `&mut self`, which serializes concurrent writers
/// at message granularity; the worker funnels detached task output through
/// a mailbox so the session loop stays the only writer.
pub struct ReplyChannel {
    inbound: mpsc::Receiver<(Multipart, Vec<u8>)>,
    writer: OwnedWriteHalf,
    reader_handle: JoinHandle<()>,
}

impl ReplyChannel {
    /// Connect to a cohort dispatch endpoint.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TriplexError::Connection(format!("failed to connect to {addr}: {e}")))?;
        let (read_half, write_half) = stream.into_split();

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_DEPTH);
        let reader_handle = tokio::spawn(read_dispatch(read_half, inbound_tx));

        Ok(ReplyChannel {
            inbound: inbound_rx,
            writer: write_half,
            reader_handle,
        })
    }

    /// Next inbound `(routing frames, payload)`.
    ///
    /// `None` means the broker side closed the connection.
    pub async fn recv(&mut self) -> Option<(Multipart, Vec<u8>)> {
        self.inbound.recv().await
    }

    /// Send `data` back along the preserved routing frames.
    pub async fn send(&mut self, routing: Multipart, data: Vec<u8>) -> Result<()> {
        write_message(&mut self.writer, &join(routing, data)).await
    }
}

impl Drop for ReplyChannel {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

async fn read_dispatch(mut read_half: OwnedReadHalf, inbound: mpsc::Sender<(Multipart, Vec<u8>)>) {
    loop {
        match read_message(&mut read_half).await {
            Ok(Some(frames)) => match split(frames) {
                Ok(message) => {
                    if inbound.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("dropping malformed dispatch envelope: {e}"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!("dispatch read error: {e}");
                break;
            }
        }
    }
}
