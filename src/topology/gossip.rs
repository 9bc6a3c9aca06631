// LSA gossip worker (§4.3): periodically floods this node's adjacent routes
// to every live link, and relays inbound LSAs that change the local view on
// to every other live link (split-horizon: never back to the sender). Follows
// the link-manager's broadcast-subscriber pattern rather than a dedicated
// mailbox, since gossip has no caller-facing command surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;

use crate::identity::NodeId;
use crate::link::manager::{LinkEvent, LinkManagerHandle};
use crate::link::FrameType;
use crate::topology::{Lsa, TopologyService};

#[derive(Debug, Clone, Copy)]
pub struct GossipConfig {
    pub flood_interval_ms: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self { flood_interval_ms: 5_000 }
    }
}

pub struct GossipWorker;

impl GossipWorker {
    /// Spawns the periodic flood loop and the inbound-relay loop. Both run
    /// for the lifetime of the process; there is no handle to stop them
    /// individually, matching every other always-on worker in §5.
    pub fn spawn(local_node: NodeId, topology: Arc<TopologyService>, links: LinkManagerHandle, config: GossipConfig) {
        let version = Arc::new(AtomicU64::new(1));
        tokio::spawn(run_flood_loop(local_node.clone(), topology.clone(), links.clone(), version, Duration::from_millis(config.flood_interval_ms)));
        tokio::spawn(run_relay_loop(local_node, topology, links));
    }
}

async fn run_flood_loop(local_node: NodeId, topology: Arc<TopologyService>, links: LinkManagerHandle, version: Arc<AtomicU64>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let snapshot = topology.snapshot().await;
        let routes = snapshot.graph.neighbors(&local_node);
        let lsa = Lsa::new(local_node.clone(), version.fetch_add(1, Ordering::Relaxed), routes);
        flood(&lsa, &links, None).await;
    }
}

async fn run_relay_loop(local_node: NodeId, topology: Arc<TopologyService>, links: LinkManagerHandle) {
    let mut events = links.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };

        let LinkEvent::Frame(from, frame) = event else { continue };
        if frame.header.frame_type != FrameType::Lsa {
            continue;
        }

        let lsa: Lsa = match bincode::serde::decode_from_slice(&frame.payload, bincode::config::standard()) {
            Ok((lsa, _)) => lsa,
            Err(e) => {
                tracing::warn!(peer = %from, error = %e, "failed to decode inbound LSA");
                continue;
            }
        };

        if lsa.originator == local_node {
            continue;
        }

        let changed = topology.apply_lsa(lsa.clone()).await;
        if changed {
            flood(&lsa, &links, Some(&from)).await;
        }
    }
}

async fn flood(lsa: &Lsa, links: &LinkManagerHandle, exclude: Option<&NodeId>) {
    let payload = match bincode::serde::encode_to_vec(lsa, bincode::config::standard()) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode LSA for flooding");
            return;
        }
    };

    for peer in links.active_peers().await {
        if Some(&peer) == exclude {
            continue;
        }
        if let Some(link) = links.link_to(&peer).await {
            if let Err(e) = link.send_frame(FrameType::Lsa, 0, BytesMut::from(&payload[..])).await {
                tracing::warn!(%peer, error = %e, "failed to flood LSA");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::route::RouteMetrics;

    fn node(s: &str) -> NodeId {
        NodeId::from_string(format!("node_{s}")).unwrap()
    }

    #[test]
    fn lsa_wire_roundtrip_preserves_routes() {
        let lsa = Lsa::new(node("a1234567890123456789ab"), 3, vec![(node("b1234567890123456789ab"), RouteMetrics::new(12.0, 100.0, 0.0, 0.1))]);
        let encoded = bincode::serde::encode_to_vec(&lsa, bincode::config::standard()).unwrap();
        let (decoded, _): (Lsa, usize) = bincode::serde::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(decoded.originator, lsa.originator);
        assert_eq!(decoded.version, lsa.version);
        assert_eq!(decoded.routes.len(), 1);
    }
}
