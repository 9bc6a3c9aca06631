// Topology & Routing (L3): the graph L5/L6 use to pick next-hops, built
// from flooded LSAs and local probe measurements (§4.3). Grounded in the
// teacher's `networking/routing/table.rs` (concurrent routing-table idiom)
// and `networking/membership/swim.rs` (gossip fanout shape).

pub mod dijkstra;
pub mod gossip;
pub mod lsa;
pub mod probe;
pub mod route;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::config::SplitStrategy;
use crate::error::{MeshError, Result};
use crate::identity::{NodeId, RoutingId};
use crate::stream::QosClass;

pub use dijkstra::{shortest_paths, ShortestPaths};
pub use gossip::{GossipConfig, GossipWorker};
pub use lsa::Lsa;
pub use probe::{ProbeConfig, ProbeWorker};
pub use route::{RouteKey, RouteMetrics, RouteStatus, TopologyGraph, TopologySnapshot};

/// Owns the local view of the mesh graph, the monotonic snapshot version,
/// and a per-(destination, qos) shortest-path cache invalidated on every
/// topology-affecting LSA (§4.3: "cached until the next LSA that affects the
/// source tree").
pub struct TopologyService {
    local_node: NodeId,
    ewma_alpha: f64,
    lsa_delta_threshold: f64,
    graph: Arc<RwLock<TopologyGraph>>,
    version: AtomicU64,
    last_lsa_version: DashMap<NodeId, u64>,
    path_cache: DashMap<(NodeId, u8), Option<NodeId>>,
    cache_epoch: AtomicU64,
    split_brain: std::sync::atomic::AtomicBool,
    split_strategy: SplitStrategy,
    seed_node: Option<NodeId>,
}

impl TopologyService {
    pub fn new(local_node: NodeId, ewma_alpha: f64, lsa_delta_threshold: f64) -> Self {
        let mut graph = TopologyGraph::new();
        graph.nodes.insert(local_node.clone());
        Self {
            local_node,
            ewma_alpha,
            lsa_delta_threshold,
            graph: Arc::new(RwLock::new(graph)),
            version: AtomicU64::new(0),
            last_lsa_version: DashMap::new(),
            path_cache: DashMap::new(),
            cache_epoch: AtomicU64::new(0),
            split_brain: std::sync::atomic::AtomicBool::new(false),
            split_strategy: SplitStrategy::MajorityWins,
            seed_node: None,
        }
    }

    /// Selects §4.3's even-split tie-break policy. Called once, right after
    /// construction, from `Runtime::bootstrap`.
    pub fn with_split_policy(mut self, split_strategy: SplitStrategy, seed_node: Option<NodeId>) -> Self {
        self.split_strategy = split_strategy;
        self.seed_node = seed_node;
        self
    }

    pub fn seed_node(&self) -> Option<&NodeId> {
        self.seed_node.as_ref()
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    pub async fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot { version: self.version.load(Ordering::SeqCst), graph: self.graph.read().await.clone() }
    }

    pub fn register_routing_id(&self, node: NodeId, routing_id: RoutingId) {
        let graph = self.graph.clone();
        tokio::spawn(async move {
            graph.write().await.set_routing_id(node, routing_id);
        });
    }

    /// Applies a probe measurement for the local node's adjacency to `peer`,
    /// EWMA-smoothing against any prior sample. Returns `true` when the
    /// change exceeds `lsa_delta_threshold` and the caller should flood a
    /// fresh LSA (§4.3).
    pub async fn record_probe(&self, peer: NodeId, sample: RouteMetrics) -> bool {
        let mut graph = self.graph.write().await;
        let key = RouteKey::new(self.local_node.clone(), peer.clone());
        let changed = match graph.routes.get(&key) {
            Some(prior) => {
                let smoothed = RouteMetrics::smoothed(prior, &sample, self.ewma_alpha);
                let material = smoothed.changed_materially(prior, self.lsa_delta_threshold);
                graph.upsert_route(self.local_node.clone(), peer, smoothed);
                material
            }
            None => {
                graph.upsert_route(self.local_node.clone(), peer, sample);
                true
            }
        };
        if changed {
            self.bump_version();
        }
        changed
    }

    /// Applies an LSA received from the mesh (§4.3 precedence rules). No-op
    /// (and `false`) if the LSA is stale or its originator is the local node.
    pub async fn apply_lsa(&self, lsa: Lsa) -> bool {
        if lsa.originator == self.local_node {
            return false;
        }

        let mut entry = self.last_lsa_version.entry(lsa.originator.clone()).or_insert(0);
        if lsa.version <= *entry && lsa.version != 0 {
            // Same-or-older version: only accept if hash tie-break favors it
            // at the identical version (handled implicitly by caller re-gossip);
            // a strictly older version is always rejected.
            if lsa.version < *entry {
                return false;
            }
        }
        *entry = lsa.version;
        drop(entry);

        let mut graph = self.graph.write().await;
        for (peer, metrics) in &lsa.routes {
            graph.upsert_route(lsa.originator.clone(), peer.clone(), *metrics);
        }
        drop(graph);
        self.bump_version();
        true
    }

    pub async fn remove_node(&self, node: &NodeId) {
        self.graph.write().await.remove_node(node);
        self.last_lsa_version.remove(node);
        self.bump_version();
    }

    /// Marks the local-adjacency route to `peer` `Unreachable` without
    /// dropping it from the graph (dijkstra already excludes `Unreachable`
    /// edges, §4.3), so a link drop takes the peer out of next-hop
    /// selection immediately instead of waiting on gossip to notice.
    /// Returns `true` (and floods) only on the Up -> Unreachable transition.
    pub async fn mark_unreachable(&self, peer: &NodeId) -> bool {
        let mut graph = self.graph.write().await;
        let key = RouteKey::new(self.local_node.clone(), peer.clone());
        let Some(prior) = graph.routes.get(&key).copied() else { return false };
        if prior.status == RouteStatus::Unreachable {
            return false;
        }
        let mut marked = prior;
        marked.status = RouteStatus::Unreachable;
        graph.upsert_route(self.local_node.clone(), peer.clone(), marked);
        drop(graph);
        self.bump_version();
        true
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
        self.cache_epoch.fetch_add(1, Ordering::SeqCst);
        self.path_cache.clear();
    }

    /// Next hop toward `dest` for QoS class `qos`, using the cached
    /// shortest-path tree when still valid. Returns `NoRoute` when
    /// unreachable, or when split-brain has marked all remote destinations
    /// unreachable (§4.3).
    pub async fn next_hop(&self, dest: &NodeId, qos: QosClass) -> Result<NodeId> {
        if self.split_brain.load(Ordering::SeqCst) && dest != &self.local_node {
            return Err(MeshError::NoRoute(format!("split-brain: {dest} marked unreachable")));
        }

        let cache_key = (dest.clone(), qos as u8);
        if let Some(cached) = self.path_cache.get(&cache_key) {
            return cached.clone().ok_or_else(|| MeshError::NoRoute(dest.to_string()));
        }

        let graph = self.graph.read().await;
        let paths = shortest_paths(&graph, &self.local_node, qos);
        let hop = paths.next_hop_to(dest).cloned();
        self.path_cache.insert(cache_key, hop.clone());
        hop.ok_or_else(|| MeshError::NoRoute(dest.to_string()))
    }

    /// Split-brain detection (§4.3): when the membership view reports fewer
    /// online nodes than a majority of the configured group size, mark all
    /// non-local destinations unreachable and refuse new sends. On an exact
    /// even split under `SplitStrategy::SeedNodePrevails`, the partition that
    /// can still see the configured seed node keeps accepting writes instead
    /// of both halves declaring split-brain (§8 Scenario D).
    pub fn evaluate_membership(&self, online_nodes: usize, total_nodes: usize, seed_reachable: bool) {
        let has_majority = online_nodes * 2 > total_nodes;
        let even_split = total_nodes > 0 && online_nodes * 2 == total_nodes;
        let seed_side_wins = even_split && self.split_strategy == SplitStrategy::SeedNodePrevails && seed_reachable;
        self.split_brain.store(!(has_majority || seed_side_wins), Ordering::SeqCst);
    }

    pub fn is_split_brain(&self) -> bool {
        self.split_brain.load(Ordering::SeqCst)
    }
}

pub type RoutingIds = HashMap<NodeId, RoutingId>;
