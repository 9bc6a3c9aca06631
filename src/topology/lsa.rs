// Link-State Advertisements (§4.3): each node floods an LSA describing its
// adjacent routes. Newer versions supersede older; equal versions are
// resolved by hash order, matching the teacher's gossip-update precedence
// idiom in `networking/membership/swim.rs` generalized from membership
// updates to route updates.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::identity::NodeId;
use crate::topology::route::RouteMetrics;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lsa {
    pub originator: NodeId,
    pub version: u64,
    pub routes: Vec<(NodeId, RouteMetrics)>,
}

impl Lsa {
    pub fn new(originator: NodeId, version: u64, routes: Vec<(NodeId, RouteMetrics)>) -> Self {
        Self { originator, version, routes }
    }

    /// Deterministic tie-break hash over the originator and route contents,
    /// used when two LSAs for the same originator carry the same version.
    pub fn hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.originator.as_str().hash(&mut hasher);
        self.version.hash(&mut hasher);
        for (peer, metrics) in &self.routes {
            peer.as_str().hash(&mut hasher);
            metrics.latency_ms.to_bits().hash(&mut hasher);
            metrics.loss.to_bits().hash(&mut hasher);
            metrics.utilization.to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Whether `self` supersedes `current` per §4.3's precedence rule.
    pub fn supersedes(&self, current: &Lsa) -> bool {
        if self.version != current.version {
            self.version > current.version
        } else {
            self.hash() > current.hash()
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
    fn higher_version_always_supersedes() {
        let a = Lsa::new(node("a1234567890123456789ab"), 1, vec![]);
        let b = Lsa::new(node("a1234567890123456789ab"), 2, vec![]);
        assert!(b.supersedes(&a));
        assert!(!a.supersedes(&b));
    }

    #[test]
    fn equal_versions_break_tie_by_hash() {
        let a = Lsa::new(node("a1234567890123456789ab"), 1, vec![(node("x1234567890123456789ab"), RouteMetrics::new(1.0, 1.0, 0.0, 0.0))]);
        let b = Lsa::new(node("a1234567890123456789ab"), 1, vec![(node("y1234567890123456789ab"), RouteMetrics::new(1.0, 1.0, 0.0, 0.0))]);
        // Exactly one direction should report supersession (or both equal hash, extremely unlikely).
        assert_ne!(a.supersedes(&b), b.supersedes(&a));
    }
}
