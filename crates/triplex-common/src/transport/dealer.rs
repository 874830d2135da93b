use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::envelope::Multipart;
use crate::protocol::error::{Result, TriplexError};
use crate::transport::framing::{read_message, write_message};
use crate::transport::CHANNEL_DEPTH;

#[derive(Default)]
struct Peers {
    senders: Vec<(u64, mpsc::Sender<Multipart>)>,
    cursor: usize,
}

/// Server-side fan-out/fan-in channel for one cohort.
///
/// Sends are distributed round-robin across connected peers, so N
/// consecutive sends of one request place one copy on each of N replicas.
/// Receives are fair-queued from all peers. Frames pass through unchanged
/// in both directions.
pub struct DealerChannel {
    local_addr: SocketAddr,
    inbound: mpsc::Receiver<Multipart>,
    peers: Arc<Mutex<Peers>>,
    accept_handle: JoinHandle<()>,
}

impl DealerChannel {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TriplexError::Connection(format!("failed to bind to {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TriplexError::Connection(format!("failed to get local addr: {e}")))?;

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_DEPTH);
        let peers = Arc::new(Mutex::new(Peers::default()));

        let accept_handle = tokio::spawn(accept_loop(listener, inbound_tx, peers.clone()));

        Ok(DealerChannel {
            local_addr,
            inbound: inbound_rx,
            peers,
            accept_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next inbound message from any peer.
    pub async fn recv(&mut self) -> Option<Multipart> {
        self.inbound.recv().await
    }

    /// Send to the next peer in round-robin order.
    ///
    /// With no connected peer, or a full peer queue, the message is
    /// dropped with a warning; the send never blocks.
    pub async fn send(&self, frames: Multipart) -> Result<()> {
        let mut guard = self.peers.lock().await;
        let peers = &mut *guard;
        loop {
            if peers.senders.is_empty() {
                warn!("no peer connected, dropping dispatch message");
                return Ok(());
            }
            let idx = peers.cursor % peers.senders.len();
            peers.cursor = (idx + 1) % peers.senders.len();
            match peers.senders[idx].1.try_send(frames.clone()) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("peer queue full, dropping dispatch message");
                    return Ok(());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Peer went away between accept and send; retry the next one.
                    peers.senders.remove(idx);
                    peers.cursor = if peers.senders.is_empty() { 0 } else { idx % peers.senders.len() };
                }
            }
        }
    }

    /// Number of currently connected peers.
    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.senders.len()
    }
}

impl Drop for DealerChannel {
    fn drop(&mut self) {
        self.accept_handle.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbound: mpsc::Sender<Multipart>,
    peers: Arc<Mutex<Peers>>,
) {
    let mut next_peer: u64 = 0;
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        let peer_id = next_peer;
        next_peer += 1;
        debug!("dispatch peer {peer_id} connected from {peer_addr}");

        let (read_half, write_half) = stream.into_split();
        let (peer_tx, peer_rx) = mpsc::channel(CHANNEL_DEPTH);
        peers.lock().await.senders.push((peer_id, peer_tx));

        tokio::spawn(write_peer(write_half, peer_rx));
        tokio::spawn(read_peer(read_half, peer_id, inbound.clone(), peers.clone()));
    }
}

async fn read_peer(
    mut read_half: OwnedReadHalf,
    peer_id: u64,
    inbound: mpsc::Sender<Multipart>,
    peers: Arc<Mutex<Peers>>,
) {
    loop {
        match read_message(&mut read_half).await {
            Ok(Some(frames)) => {
                if inbound.send(frames).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("dispatch peer {peer_id} read error: {e}");
                break;
            }
        }
    }
    peers.lock().await.senders.retain(|(id, _)| *id != peer_id);
    debug!("dispatch peer {peer_id} disconnected");
}

async fn write_peer(mut write_half: OwnedWriteHalf, mut outbound: mpsc::Receiver<Multipart>) {
    while let Some(frames) = outbound.recv().await {
        if let Err(e) = write_message(&mut write_half, &frames).await {
            warn!("dispatch peer write error: {e}");
            break;
        }
    }
}
