// Route and graph types (§3 Route / TopologySnapshot, §4.3 path cost).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::identity::{NodeId, RoutingId};
use crate::stream::QosClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteStatus {
    Up,
    Degraded,
    Unreachable,
}

/// Measured metrics for one undirected route. Both endpoints converge on the
/// same values via LSA gossip (§3: "Routes are undirected; both endpoints
/// keep identical state").
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteMetrics {
    pub latency_ms: f64,
    pub bandwidth_mbps: f64,
    pub loss: f64,
    pub utilization: f64,
    pub status: RouteStatus,
}

impl RouteMetrics {
    pub fn new(latency_ms: f64, bandwidth_mbps: f64, loss: f64, utilization: f64) -> Self {
        Self {
            latency_ms,
            bandwidth_mbps,
            loss: loss.clamp(0.0, 1.0),
            utilization: utilization.clamp(0.0, 1.0),
            status: RouteStatus::Up,
        }
    }

    /// EWMA-smooths this sample against a prior measurement, α configurable
    /// (§4.3). `alpha` weights the new sample.
    pub fn smoothed(prior: &RouteMetrics, sample: &RouteMetrics, alpha: f64) -> RouteMetrics {
        RouteMetrics {
            latency_ms: alpha * sample.latency_ms + (1.0 - alpha) * prior.latency_ms,
            bandwidth_mbps: alpha * sample.bandwidth_mbps + (1.0 - alpha) * prior.bandwidth_mbps,
            loss: (alpha * sample.loss + (1.0 - alpha) * prior.loss).clamp(0.0, 1.0),
            utilization: (alpha * sample.utilization + (1.0 - alpha) * prior.utilization).clamp(0.0, 1.0),
            status: sample.status,
        }
    }

    /// Whether this sample differs from `prior` by more than `delta` in any
    /// dimension worth re-flooding an LSA for (§4.3).
    pub fn changed_materially(&self, prior: &RouteMetrics, delta: f64) -> bool {
        (self.latency_ms - prior.latency_ms).abs() / prior.latency_ms.max(1.0) > delta
            || (self.loss - prior.loss).abs() > delta
            || (self.utilization - prior.utilization).abs() > delta
            || self.status != prior.status
    }
}

/// An unordered pair of node ids, canonicalized so (a, b) and (b, a) hash
/// identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteKey(NodeId, NodeId);

impl RouteKey {
    pub fn new(a: NodeId, b: NodeId) -> Self {
        if a <= b {
            RouteKey(a, b)
        } else {
            RouteKey(b, a)
        }
    }

    pub fn endpoints(&self) -> (&NodeId, &NodeId) {
        (&self.0, &self.1)
    }

    pub fn other(&self, one: &NodeId) -> Option<&NodeId> {
        if &self.0 == one {
            Some(&self.1)
        } else if &self.1 == one {
            Some(&self.0)
        } else {
            None
        }
    }
}

/// Per-QoS-class cost weights applied to `RouteMetrics` (§4.3):
/// `cost = w_lat*lat + w_loss*-log(1-loss) + w_util*util`.
pub fn path_cost(metrics: &RouteMetrics, w_lat: f64, w_loss: f64, w_util: f64) -> f64 {
    let loss_term = -(1.0 - metrics.loss).max(1e-6).ln();
    w_lat * metrics.latency_ms + w_loss * loss_term + w_util * metrics.utilization
}

/// The adjacency graph built from the local node's view of all routes
/// (reassembled from its own routes plus flooded LSAs).
#[derive(Debug, Clone, Default)]
pub struct TopologyGraph {
    pub nodes: HashSet<NodeId>,
    pub routes: HashMap<RouteKey, RouteMetrics>,
    pub routing_ids: HashMap<NodeId, RoutingId>,
}

impl TopologyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_route(&mut self, a: NodeId, b: NodeId, metrics: RouteMetrics) {
        self.nodes.insert(a.clone());
        self.nodes.insert(b.clone());
        self.routes.insert(RouteKey::new(a, b), metrics);
    }

    pub fn set_routing_id(&mut self, node: NodeId, routing_id: RoutingId) {
        self.nodes.insert(node.clone());
        self.routing_ids.insert(node, routing_id);
    }

    pub fn remove_node(&mut self, node: &NodeId) {
        self.nodes.remove(node);
        self.routes.retain(|k, _| k.other(node).is_none());
        self.routing_ids.remove(node);
    }

    pub fn neighbors(&self, node: &NodeId) -> Vec<(NodeId, RouteMetrics)> {
        self.routes
            .iter()
            .filter_map(|(k, m)| k.other(node).map(|n| (n.clone(), *m)))
            .collect()
    }
}

/// Monotonic snapshot of the graph (§3 TopologySnapshot). Versions only ever
/// increase for the lifetime of a mesh (invariant checked in §8 property 5).
#[derive(Debug, Clone)]
pub struct TopologySnapshot {
    pub version: u64,
    pub graph: TopologyGraph,
}

pub fn default_weights_for(class: QosClass) -> (f64, f64, f64) {
    match class {
        QosClass::Critical => (1.0, 4.0, 0.5),
        QosClass::High => (1.2, 2.0, 0.8),
        QosClass::Normal => (1.0, 1.0, 1.0),
        QosClass::Low => (0.6, 0.5, 2.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_key_is_order_independent() {
        let a = NodeId::from_string("node_aaaaaaaaaaaaaaaaaaaaaa".into()).unwrap();
        let b = NodeId::from_string("node_bbbbbbbbbbbbbbbbbbbbbb".into()).unwrap();
        assert_eq!(RouteKey::new(a.clone(), b.clone()), RouteKey::new(b, a));
    }

    #[test]
    fn smoothing_moves_toward_sample() {
        let prior = RouteMetrics::new(100.0, 10.0, 0.0, 0.0);
        let sample = RouteMetrics::new(200.0, 10.0, 0.0, 0.0);
        let out = RouteMetrics::smoothed(&prior, &sample, 0.5);
        assert_eq!(out.latency_ms, 150.0);
    }

    #[test]
    fn higher_loss_increases_cost() {
        let low = RouteMetrics::new(50.0, 100.0, 0.01, 0.1);
        let high = RouteMetrics::new(50.0, 100.0, 0.5, 0.1);
        let (wl, wlo, wu) = default_weights_for(QosClass::Critical);
        assert!(path_cost(&high, wl, wlo, wu) > path_cost(&low, wl, wlo, wu));
    }
}
