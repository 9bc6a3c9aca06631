// Background link probe (§4.3: "A background probe measures latency and
// loss on each active link; metrics are smoothed (EWMA...)"). This is the
// only caller of `TopologyService::record_probe` in production — it
// registers the local-adjacency edge to a peer as soon as its link comes
// up (so a fresh link doesn't wait a full tick for its first sample before
// `next_hop` can route through it) and resamples every tick off the link's
// measured PING/PONG round-trip.

use std::sync::Arc;
use std::time::Duration;

use crate::link::manager::{LinkEvent, LinkManagerHandle};
use crate::topology::route::RouteMetrics;
use crate::topology::TopologyService;

#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    pub probe_interval_ms: u64,
}

/// Placeholder link capacity used until a real bandwidth estimator exists;
/// loss/utilization have no measurement source yet either; this crate
/// samples what the link layer actually reports and leaves the rest at
/// their conservative defaults rather than inventing numbers.
const ASSUMED_BANDWIDTH_MBPS: f64 = 1_000.0;

pub struct ProbeWorker;

impl ProbeWorker {
    /// Spawns the periodic per-link sampler and the link up/down listener.
    /// Both run for the process lifetime, matching every other always-on
    /// worker in §5.
    pub fn spawn(topology: Arc<TopologyService>, links: LinkManagerHandle, config: ProbeConfig) {
        tokio::spawn(run_tick_loop(topology.clone(), links.clone(), Duration::from_millis(config.probe_interval_ms)));
        tokio::spawn(run_link_event_loop(topology, links));
    }
}

async fn run_tick_loop(topology: Arc<TopologyService>, links: LinkManagerHandle, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        for peer in links.active_peers().await {
            let Some(link) = links.link_to(&peer).await else { continue };
            let sample = RouteMetrics::new(link.last_rtt_ms(), ASSUMED_BANDWIDTH_MBPS, 0.0, 0.0);
            topology.record_probe(peer, sample).await;
        }
    }
}

async fn run_link_event_loop(topology: Arc<TopologyService>, links: LinkManagerHandle) {
    let mut events = links.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };

        match event {
            LinkEvent::Up(link) => {
                // First sample, taken immediately so routing doesn't stall
                // until the next tick; the RTT is usually still 0 here
                // (no PONG yet) and gets refined by `run_tick_loop`.
                let sample = RouteMetrics::new(link.last_rtt_ms(), ASSUMED_BANDWIDTH_MBPS, 0.0, 0.0);
                topology.record_probe(link.peer_id.clone(), sample).await;
            }
            LinkEvent::Down(peer) => {
                topology.mark_unreachable(&peer).await;
            }
            LinkEvent::Frame(..) => {}
        }
    }
}
