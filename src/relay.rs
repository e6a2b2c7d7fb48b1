//! Fan-out relay server.
//!
//! The relay is deliberately dumb: it accepts websocket connections and
//! forwards every text frame to every connected client, the sender
//! included. It holds no pin state, performs no validation, and knows
//! nothing about channels; all consistency logic lives in the clients.
//! Echoing to the sender keeps the forwarding path uniform and the clients
//! already treat their own snapshot as a merge no-op.

use crate::error::Result;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

type PeerMap = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>>;

/// Websocket fan-out server.
pub struct MapRelay {
    listener: TcpListener,
    peers: PeerMap,
}

impl MapRelay {
    /// Bind the relay to an address. Use port 0 to let the OS pick.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            peers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and serve clients until the task is dropped.
    pub async fn run(self) {
        let mut next_peer_id: u64 = 0;
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let peer_id = next_peer_id;
                    next_peer_id += 1;
                    let peers = self.peers.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_peer(peer_id, stream, peers).await {
                            tracing::debug!(peer_id, %addr, error = %err, "peer closed");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                }
            }
        }
    }
}

async fn serve_peer(peer_id: u64, stream: TcpStream, peers: PeerMap) -> Result<()> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    peers.lock().insert(peer_id, tx);
    tracing::debug!(peer_id, clients = peers.lock().len(), "peer joined");

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if sink.send(WsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            incoming = source.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        broadcast(&peers, text.as_str());
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = sink.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    peers.lock().remove(&peer_id);
    tracing::debug!(peer_id, clients = peers.lock().len(), "peer left");
    Ok(())
}

/// Forward one frame to every connected peer, sender included.
fn broadcast(peers: &PeerMap, frame: &str) {
    let map = peers.lock();
    for tx in map.values() {
        let _ = tx.send(frame.to_string());
    }
}
