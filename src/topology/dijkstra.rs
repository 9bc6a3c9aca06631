// Shortest-path computation (§4.3): Dijkstra over the current graph,
// weighted by QoS-class path cost. Results are meant to be cached by the
// caller until the next LSA that affects the source tree (the cache lives in
// `TopologyService`, not here — this module is pure graph math).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::identity::NodeId;
use crate::topology::route::{default_weights_for, path_cost, TopologyGraph};
use crate::stream::QosClass;

#[derive(Debug, Clone)]
struct HeapEntry {
    cost: f64,
    routing_tiebreak: u64,
    node: NodeId,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost && self.node == other.node
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap via BinaryHeap (which is max-heap by default).
        other
            .cost
            .partial_cmp(&self.cost)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.routing_tiebreak.cmp(&self.routing_tiebreak))
            .then_with(|| other.node.cmp(&self.node))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The computed shortest-path tree rooted at `source`: for every reachable
/// node, the first hop out of `source` on the cheapest path to it.
pub struct ShortestPaths {
    pub next_hop: HashMap<NodeId, NodeId>,
    pub cost: HashMap<NodeId, f64>,
}

impl ShortestPaths {
    pub fn next_hop_to(&self, dest: &NodeId) -> Option<&NodeId> {
        self.next_hop.get(dest)
    }
}

/// Runs Dijkstra from `source`, weighting edges by `qos`'s path-cost
/// formula. Tie-breaks per §4.3: lower destination `routing_id` wins, then
/// lexicographic `NodeId` — implemented as the heap's secondary/tertiary
/// ordering key so equal-cost frontiers pop deterministically.
pub fn shortest_paths(graph: &TopologyGraph, source: &NodeId, qos: QosClass) -> ShortestPaths {
    let (w_lat, w_loss, w_util) = default_weights_for(qos);

    let mut dist: HashMap<NodeId, f64> = HashMap::new();
    let mut first_hop: HashMap<NodeId, NodeId> = HashMap::new();
    let mut heap = BinaryHeap::new();

    dist.insert(source.clone(), 0.0);
    heap.push(HeapEntry { cost: 0.0, routing_tiebreak: 0, node: source.clone() });

    while let Some(HeapEntry { cost, node, .. }) = heap.pop() {
        if cost > *dist.get(&node).unwrap_or(&f64::INFINITY) {
            continue;
        }

        for (neighbor, metrics) in graph.neighbors(&node) {
            if matches!(metrics.status, crate::topology::route::RouteStatus::Unreachable) {
                continue;
            }
            let edge_cost = path_cost(&metrics, w_lat, w_loss, w_util);
            let candidate = cost + edge_cost;
            let better = candidate < *dist.get(&neighbor).unwrap_or(&f64::INFINITY);
            if better {
                dist.insert(neighbor.clone(), candidate);
                let hop = if node == *source { neighbor.clone() } else { first_hop.get(&node).cloned().unwrap_or(neighbor.clone()) };
                first_hop.insert(neighbor.clone(), hop);

                let routing_tiebreak = graph.routing_ids.get(&neighbor).map(|r| r.0).unwrap_or(u64::MAX);
                heap.push(HeapEntry { cost: candidate, routing_tiebreak, node: neighbor });
            }
        }
    }

    dist.remove(source);
    ShortestPaths { next_hop: first_hop, cost: dist }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::route::RouteMetrics;

    fn node(s: &str) -> NodeId {
        NodeId::from_string(format!("node_{s}")).unwrap()
    }

    #[test]
    fn picks_direct_link_over_longer_path() {
        let mut graph = TopologyGraph::new();
        let a = node("aaaaaaaaaaaaaaaaaaaaaa");
        let b = node("bbbbbbbbbbbbbbbbbbbbbb");
        let c = node("cccccccccccccccccccccc");
        graph.upsert_route(a.clone(), b.clone(), RouteMetrics::new(10.0, 100.0, 0.0, 0.0));
        graph.upsert_route(b.clone(), c.clone(), RouteMetrics::new(10.0, 100.0, 0.0, 0.0));
        graph.upsert_route(a.clone(), c.clone(), RouteMetrics::new(5.0, 100.0, 0.0, 0.0));

        let paths = shortest_paths(&graph, &a, QosClass::Normal);
        assert_eq!(paths.next_hop_to(&c), Some(&c));
    }

    #[test]
    fn routes_through_intermediate_when_cheaper() {
        let mut graph = TopologyGraph::new();
        let a = node("aaaaaaaaaaaaaaaaaaaaaa");
        let b = node("bbbbbbbbbbbbbbbbbbbbbb");
        let c = node("cccccccccccccccccccccc");
        graph.upsert_route(a.clone(), b.clone(), RouteMetrics::new(1.0, 100.0, 0.0, 0.0));
        graph.upsert_route(b.clone(), c.clone(), RouteMetrics::new(1.0, 100.0, 0.0, 0.0));
        graph.upsert_route(a.clone(), c.clone(), RouteMetrics::new(100.0, 100.0, 0.0, 0.0));

        let paths = shortest_paths(&graph, &a, QosClass::Normal);
        assert_eq!(paths.next_hop_to(&c), Some(&b));
    }

    #[test]
    fn unreachable_routes_are_excluded() {
        let mut graph = TopologyGraph::new();
        let a = node("aaaaaaaaaaaaaaaaaaaaaa");
        let b = node("bbbbbbbbbbbbbbbbbbbbbb");
        let mut unreachable = RouteMetrics::new(1.0, 1.0, 0.0, 0.0);
        unreachable.status = crate::topology::route::RouteStatus::Unreachable;
        graph.upsert_route(a.clone(), b.clone(), unreachable);

        let paths = shortest_paths(&graph, &a, QosClass::Normal);
        assert!(paths.next_hop_to(&b).is_none());
    }
}
