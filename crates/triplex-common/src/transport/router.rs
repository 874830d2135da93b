use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::envelope::{identity_frame, Multipart};
use crate::protocol::error::{Result, TriplexError};
use crate::transport::framing::{read_message, write_message};
use crate::transport::CHANNEL_DEPTH;

type PeerMap = Arc<Mutex<HashMap<Vec<u8>, mpsc::Sender<Multipart>>>>;

/// Server-side channel that addresses peers by identity frame.
///
/// Each accepted connection is assigned a 5-byte identity
/// (`[0x00 | u32 peer id]`). Inbound messages arrive with the identity
/// prepended as frame 0; outbound messages must carry the target identity
/// as frame 0, which is stripped before delivery.
pub struct RouterChannel {
    local_addr: SocketAddr,
    inbound: mpsc::Receiver<Multipart>,
    peers: PeerMap,
    accept_handle: JoinHandle<()>,
}

impl RouterChannel {
    /// Bind and start accepting peers.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TriplexError::Connection(format!("failed to bind to {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TriplexError::Connection(format!("failed to get local addr: {e}")))?;

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_DEPTH);
        let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));

        let accept_handle = tokio::spawn(accept_loop(listener, inbound_tx, peers.clone()));

        Ok(RouterChannel {
            local_addr,
            inbound: inbound_rx,
            peers,
            accept_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next inbound message, `[identity | peer frames...]`.
    pub async fn recv(&mut self) -> Option<Multipart> {
        self.inbound.recv().await
    }

    /// Route a message to the peer named by its leading identity frame.
    ///
    /// Unknown peers and full peer queues drop the message with a warning;
    /// the send itself never blocks.
    pub async fn send(&self, frames: Multipart) -> Result<()> {
        let identity = frames
            .first()
            .ok_or_else(|| TriplexError::Malformed("send without identity frame".into()))?
            .clone();

        let peer = { self.peers.lock().await.get(&identity).cloned() };
        let Some(peer) = peer else {
            warn!("dropping message for unknown peer identity {identity:02x?}");
            return Ok(());
        };

        let payload: Multipart = frames.into_iter().skip(1).collect();
        match peer.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("peer queue full, dropping outbound message");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.peers.lock().await.remove(&identity);
                warn!("peer gone, dropping outbound message");
                Ok(())
            }
        }
    }
}

impl Drop for RouterChannel {
    fn drop(&mut self) {
        self.accept_handle.abort();
    }
}

async fn accept_loop(listener: TcpListener, inbound: mpsc::Sender<Multipart>, peers: PeerMap) {
    let mut next_peer: u32 = 1;
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        let identity = identity_frame(next_peer);
        next_peer = next_peer.wrapping_add(1);
        debug!("peer {peer_addr} connected, identity {identity:02x?}");

        let (read_half, write_half) = stream.into_split();
        let (peer_tx, peer_rx) = mpsc::channel(CHANNEL_DEPTH);
        peers.lock().await.insert(identity.clone(), peer_tx);

        tokio::spawn(write_peer(write_half, peer_rx));
        tokio::spawn(read_peer(
            read_half,
            identity,
            inbound.clone(),
            peers.clone(),
        ));
    }
}

async fn read_peer(
    mut read_half: OwnedReadHalf,
    identity: Vec<u8>,
    inbound: mpsc::Sender<Multipart>,
    peers: PeerMap,
) {
    loop {
        match read_message(&mut read_half).await {
            Ok(Some(mut frames)) => {
                frames.insert(0, identity.clone());
                if inbound.send(frames).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("peer read error: {e}");
                break;
            }
        }
    }
    peers.lock().await.remove(&identity);
    debug!("peer {identity:02x?} disconnected");
}

async fn write_peer(mut write_half: OwnedWriteHalf, mut outbound: mpsc::Receiver<Multipart>) {
    while let Some(frames) = outbound.recv().await {
        if let Err(e) = write_message(&mut write_half, &frames).await {
            warn!("peer write error: {e}");
            break;
        }
    }
}
