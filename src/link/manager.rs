// The link-manager worker (§5: "one link-manager" among the process's
// long-lived workers). Owns the set of live links, dials and accepts
// sockets, reconnects with exponential backoff+jitter on loss, and runs
// each link's keep-alive loop. Talks to callers only through its command
// mailbox and a broadcast of `LinkEvent`s — no shared mutable link table is
// exposed directly, per §5's ownership discipline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::error::{MeshError, Result};
use crate::identity::{IdentityService, NodeId};
use crate::link::connection::{self, InboundFrame, Link, LinkState};

/// Inbound frame tagged with the peer it arrived from, plus link up/down
/// transitions. Consumers (L3 gossip, L4 Raft transport, L6 sender/receiver
/// loops) subscribe to this instead of touching sockets.
#[derive(Clone)]
pub enum LinkEvent {
    Up(Link),
    Down(NodeId),
    Frame(NodeId, Arc<InboundFrame>),
}

enum Command {
    Dial { peer: NodeId, addr: SocketAddr, peer_public_key: [u8; 32] },
    RegisterIncoming { stream: TcpStream, addr: SocketAddr, peer_public_key: [u8; 32] },
    Forget(NodeId),
    Shutdown { grace: Duration },
}

#[derive(Clone)]
pub struct LinkManagerHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<LinkEvent>,
    links: Arc<RwLock<HashMap<NodeId, Link>>>,
}

impl LinkManagerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub async fn dial(&self, peer: NodeId, addr: SocketAddr, peer_public_key: [u8; 32]) -> Result<()> {
        self.tx
            .send(Command::Dial { peer, addr, peer_public_key })
            .await
            .map_err(|_| MeshError::Internal("link manager mailbox closed".into()))
    }

    pub async fn register_incoming(&self, stream: TcpStream, addr: SocketAddr, peer_public_key: [u8; 32]) -> Result<()> {
        self.tx
            .send(Command::RegisterIncoming { stream, addr, peer_public_key })
            .await
            .map_err(|_| MeshError::Internal("link manager mailbox closed".into()))
    }

    pub async fn forget(&self, peer: NodeId) -> Result<()> {
        self.tx
            .send(Command::Forget(peer))
            .await
            .map_err(|_| MeshError::Internal("link manager mailbox closed".into()))
    }

    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.tx.send(Command::Shutdown { grace }).await;
    }

    pub async fn link_to(&self, peer: &NodeId) -> Option<Link> {
        self.links.read().await.get(peer).cloned()
    }

    pub async fn active_peers(&self) -> Vec<NodeId> {
        self.links.read().await.keys().cloned().collect()
    }
}

/// Runs the listener accept loop, binding `bind_addr` and handing each
/// accepted socket to the link manager as an incoming registration. The
/// caller is expected to learn the peer's expected public key out of band
/// (from the current membership view) before calling `register_incoming`;
/// this helper exists mainly for tests and single-listener deployments where
/// the key is resolved from a shared directory.
pub async fn accept_loop(listener: TcpListener, manager: LinkManagerHandle, resolve_key: impl Fn(SocketAddr) -> Option<[u8; 32]>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if let Some(key) = resolve_key(addr) {
                    if let Err(e) = manager.register_incoming(stream, addr, key).await {
                        tracing::warn!(error = %e, "failed to register incoming link");
                    }
                } else {
                    tracing::warn!(%addr, "rejecting incoming connection with no known public key");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "listener accept failed");
            }
        }
    }
}

pub struct LinkManager;

impl LinkManager {
    /// Spawns the link-manager worker and returns a cheap, cloneable handle.
    pub fn spawn(identity: Arc<IdentityService>, credit_window_bytes: usize, incarnation: u64) -> LinkManagerHandle {
        let (tx, rx) = mpsc::channel(256);
        let (events_tx, _) = broadcast::channel(4096);
        let links = Arc::new(RwLock::new(HashMap::new()));

        let handle = LinkManagerHandle { tx, events: events_tx.clone(), links: links.clone() };

        tokio::spawn(run(identity, credit_window_bytes, incarnation, rx, events_tx, links));

        handle
    }
}

async fn run(
    identity: Arc<IdentityService>,
    credit_window_bytes: usize,
    incarnation: u64,
    mut rx: mpsc::Receiver<Command>,
    events: broadcast::Sender<LinkEvent>,
    links: Arc<RwLock<HashMap<NodeId, Link>>>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Dial { peer, addr, peer_public_key } => {
                spawn_dial_with_reconnect(identity.clone(), credit_window_bytes, incarnation, peer, addr, peer_public_key, events.clone(), links.clone());
            }
            Command::RegisterIncoming { stream, addr, peer_public_key } => {
                let identity = identity.clone();
                let events = events.clone();
                let links = links.clone();
                tokio::spawn(async move {
                    match connection::establish(stream, addr, identity, peer_public_key, incarnation, credit_window_bytes, false).await {
                        Ok((link, inbound_rx)) => {
                            install_link(link, inbound_rx, events, links).await;
                        }
                        Err(e) => {
                            tracing::warn!(%addr, error = %e, "incoming handshake failed");
                        }
                    }
                });
            }
            Command::Forget(peer) => {
                if let Some(link) = links.write().await.remove(&peer) {
                    link.close().await;
                }
                let _ = events.send(LinkEvent::Down(peer));
            }
            Command::Shutdown { grace } => {
                let all: Vec<Link> = links.write().await.drain().map(|(_, l)| l).collect();
                let closing = all.into_iter().map(|l| async move { l.close().await });
                let _ = tokio::time::timeout(grace, futures::future::join_all(closing)).await;
                break;
            }
        }
    }
}

async fn install_link(link: Link, mut inbound_rx: mpsc::Receiver<InboundFrame>, events: broadcast::Sender<LinkEvent>, links: Arc<RwLock<HashMap<NodeId, Link>>>) {
    let peer = link.peer_id.clone();
    links.write().await.insert(peer.clone(), link.clone());
    let _ = events.send(LinkEvent::Up(link.clone()));

    tokio::spawn(connection::run_keepalive(link.clone(), Duration::from_secs(10), 3));

    let pump_peer = peer.clone();
    let pump_events = events.clone();
    let pump_links = links.clone();
    tokio::spawn(async move {
        while let Some(frame) = inbound_rx.recv().await {
            if pump_events.send(LinkEvent::Frame(pump_peer.clone(), Arc::new(frame))).is_err() {
                break;
            }
        }
        pump_links.write().await.remove(&pump_peer);
        let _ = pump_events.send(LinkEvent::Down(pump_peer));
    });
}

fn spawn_dial_with_reconnect(
    identity: Arc<IdentityService>,
    credit_window_bytes: usize,
    incarnation: u64,
    peer: NodeId,
    addr: SocketAddr,
    peer_public_key: [u8; 32],
    events: broadcast::Sender<LinkEvent>,
    links: Arc<RwLock<HashMap<NodeId, Link>>>,
) {
    tokio::spawn(async move {
        let mut attempt: u32 = 0;
        loop {
            if links.read().await.contains_key(&peer) {
                return;
            }
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    match connection::establish(stream, addr, identity.clone(), peer_public_key, incarnation, credit_window_bytes, true).await {
                        Ok((link, inbound_rx)) => {
                            install_link(link, inbound_rx, events.clone(), links.clone()).await;
                            return;
                        }
                        Err(e) => {
                            tracing::warn!(%peer, %addr, error = %e, "handshake failed, will retry");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(%peer, %addr, error = %e, "dial failed, will retry");
                }
            }

            let delay = reconnect_backoff(attempt);
            attempt += 1;
            tokio::time::sleep(delay).await;
        }
    });
}

/// `min(cap, base * 2^attempt) * uniform(0.5, 1.5)`, matching the delivery
/// backoff formula in §4.6, applied here to link reconnection per §4.2.
fn reconnect_backoff(attempt: u32) -> Duration {
    let base_ms: u64 = 500;
    let cap_ms: u64 = 60_000;
    let raw = base_ms.saturating_mul(1u64 << attempt.min(20));
    let capped = raw.min(cap_ms);
    let jitter = 0.5 + fastrand::f64();
    Duration::from_millis(((capped as f64) * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_backoff_is_capped() {
        for attempt in 0..40 {
            let d = reconnect_backoff(attempt);
            assert!(d.as_millis() <= (60_000f64 * 1.5) as u128);
        }
    }

    #[test]
    fn reconnect_backoff_grows_with_attempts() {
        let first = reconnect_backoff(0);
        let later = reconnect_backoff(5);
        assert!(later >= first);
    }
}
