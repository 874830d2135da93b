use std::collections::HashMap;
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

type PeerMap = Arc<Mutex<HashMap<u64, mpsc::Sender<Multipart>>>>;

/// Opaque handle naming the peer a reply must go to.
#[derive(Debug, Clone, Copy)]
pub struct ReplyToken(u64);

/// Bare bound request-reply channel, used for the health interfaces.
///
/// Each inbound message yields a [`ReplyToken`]; the application answers
/// with [`RepChannel::reply`]. Never multiplexed with application data.
pub struct RepChannel {
    local_addr: SocketAddr,
    inbound: mpsc::Receiver<(u64, Multipart)>,
    peers: PeerMap,
    accept_handle: JoinHandle<()>,
}

impl RepChannel {
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

        Ok(RepChannel {
            local_addr,
            inbound: inbound_rx,
            peers,
            accept_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next inbound request; its payload is discarded by the
    /// health protocol so only the reply token is surfaced.
    pub async fn recv(&mut self) -> Option<ReplyToken> {
        self.inbound.recv().await.map(|(peer, _)| ReplyToken(peer))
    }

    /// Answer the peer behind `token` with `data`.
    pub async fn reply(&self, token: ReplyToken, data: Vec<u8>) -> Result<()> {
        let peer = { self.peers.lock().await.get(&token.0).cloned() };
        let Some(peer) = peer else {
            warn!("reply peer {} gone, dropping pong", token.0);
            return Ok(());
        };
        if peer.try_send(vec![Vec::new(), data]).is_err() {
            warn!("reply peer {} unreachable, dropping pong", token.0);
        }
        Ok(())
    }
}

impl Drop for RepChannel {
    fn drop(&mut self) {
        self.accept_handle.abort();
    }
}

async fn accept_loop(listener: TcpListener, inbound: mpsc::Sender<(u64, Multipart)>, peers: PeerMap) {
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
        debug!("health peer {peer_id} connected from {peer_addr}");

        let (read_half, write_half) = stream.into_split();
        let (peer_tx, peer_rx) = mpsc::channel(CHANNEL_DEPTH);
        peers.lock().await.insert(peer_id, peer_tx);

        tokio::spawn(write_peer(write_half, peer_rx));
        tokio::spawn(read_peer(read_half, peer_id, inbound.clone(), peers.clone()));
    }
}

async fn read_peer(
    mut read_half: OwnedReadHalf,
    peer_id: u64,
    inbound: mpsc::Sender<(u64, Multipart)>,
    peers: PeerMap,
) {
    loop {
        match read_message(&mut read_half).await {
            Ok(Some(frames)) => {
                if inbound.send((peer_id, frames)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("health peer {peer_id} read error: {e}");
                break;
            }
        }
    }
    peers.lock().await.remove(&peer_id);
}

async fn write_peer(mut write_half: OwnedWriteHalf, mut outbound: mpsc::Receiver<Multipart>) {
    while let Some(frames) = outbound.recv().await {
        if let Err(e) = write_message(&mut write_half, &frames).await {
            warn!("health peer write error: {e}");
            break;
        }
    }
}
