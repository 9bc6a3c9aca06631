// Membership (§3 "Membership record"; §4.4: the MCG replicates "membership
// set" as part of its single source of truth). A `MembershipRecord` is a
// Mesh x Node row with `status`/`incarnation`/`last_seen`; every ACTIVE node
// converges to the same table by applying the same committed sequence of
// `MembershipOp`s, exactly the way `stream::StreamOp` converges `Stream`
// definitions (§4.5) — this module is that same pattern applied to §3's
// membership entity instead.
//
// The local failure-suspicion half (`SwimDetector`) is the supplemental
// feature named in SPEC_FULL.md §2: grounded in
// `networking/membership/swim.rs`'s protocol-period probe / suspicion-timeout
// shape, but fed by a real signal — this crate already has per-peer liveness
// from L2's `LinkEvent::Up`/`Down` (the teacher's `swim.rs` stubs out the
// actual UDP ping/ack exchange with a `tracing::trace!` and a comment; there
// is nothing to reuse from that half of the file).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::consensus::{ConsensusService, GroupId, ProposeOutcome};
use crate::identity::NodeId;
use crate::link::manager::{LinkEvent, LinkManagerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipStatus {
    Joining,
    Active,
    Leaving,
    Orphaned,
}

/// One row of §3's Membership record. `suspected_since_unix_ms` is this
/// crate's local precursor signal, not one of the four replicated statuses —
/// it tracks how long the local `SwimDetector` has believed the node
/// unreachable before escalating to a `MarkOrphaned` proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub node_id: NodeId,
    pub status: MembershipStatus,
    pub incarnation: u64,
    pub last_seen_unix_ms: u64,
    pub suspected_since_unix_ms: Option<u64>,
}

/// Operations proposed through MCG that mutate the replicated membership set
/// (§3: "The Raft log replicates changes to this set"). Serialized the same
/// way `stream::StreamOp` is (externally-tagged JSON by variant name) so both
/// op families can share one apply loop draining the MCG commit channel —
/// see `runtime::spawn_mcg_apply_loop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MembershipOp {
    Join { node_id: NodeId, incarnation: u64 },
    ConfirmActive { node_id: NodeId, incarnation: u64 },
    /// Local suspicion surfaced into the replicated log so every node agrees
    /// on who is currently under suspicion, without yet declaring them
    /// orphaned (§4.1's incarnation-counter rotation rule: a higher
    /// incarnation always refutes a lower one).
    MarkSuspect { node_id: NodeId, incarnation: u64 },
    MarkLeaving { node_id: NodeId },
    MarkOrphaned { node_id: NodeId },
}

fn now_ms() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// The locally-applied view of the MCG's replicated membership set (§3, §4.4).
pub struct MembershipTable {
    records: DashMap<NodeId, MembershipRecord>,
}

impl Default for MembershipTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipTable {
    pub fn new() -> Self {
        Self { records: DashMap::new() }
    }

    /// Applies a committed `MembershipOp`. Stale incarnations never move the
    /// record backwards, matching §4.1: "old key remains valid until all
    /// ACTIVE nodes have received the new membership entry" generalized to
    /// every incarnation-guarded field on this row.
    pub fn apply(&self, op: MembershipOp) {
        match op {
            MembershipOp::Join { node_id, incarnation } => {
                self.upsert_if_newer(node_id, MembershipStatus::Joining, incarnation, None);
            }
            MembershipOp::ConfirmActive { node_id, incarnation } => {
                self.upsert_if_newer(node_id, MembershipStatus::Active, incarnation, None);
            }
            MembershipOp::MarkSuspect { node_id, incarnation } => {
                if let Some(mut rec) = self.records.get_mut(&node_id) {
                    if incarnation >= rec.incarnation && rec.status == MembershipStatus::Active && rec.suspected_since_unix_ms.is_none() {
                        rec.suspected_since_unix_ms = Some(now_ms());
                    }
                }
            }
            MembershipOp::MarkLeaving { node_id } => {
                if let Some(mut rec) = self.records.get_mut(&node_id) {
                    rec.status = MembershipStatus::Leaving;
                    rec.suspected_since_unix_ms = None;
                    rec.last_seen_unix_ms = now_ms();
                }
            }
            MembershipOp::MarkOrphaned { node_id } => {
                if let Some(mut rec) = self.records.get_mut(&node_id) {
                    rec.status = MembershipStatus::Orphaned;
                    rec.suspected_since_unix_ms = None;
                    rec.last_seen_unix_ms = now_ms();
                }
            }
        }
    }

    fn upsert_if_newer(&self, node_id: NodeId, status: MembershipStatus, incarnation: u64, suspected_since_unix_ms: Option<u64>) {
        match self.records.get_mut(&node_id) {
            Some(mut rec) => {
                if incarnation >= rec.incarnation {
                    rec.status = status;
                    rec.incarnation = incarnation;
                    rec.last_seen_unix_ms = now_ms();
                    rec.suspected_since_unix_ms = suspected_since_unix_ms;
                }
            }
            None => {
                self.records.insert(node_id.clone(), MembershipRecord { node_id, status, incarnation, last_seen_unix_ms: now_ms(), suspected_since_unix_ms });
            }
        }
    }

    pub fn get(&self, node_id: &NodeId) -> Option<MembershipRecord> {
        self.records.get(node_id).map(|r| r.clone())
    }

    pub fn records(&self) -> Vec<MembershipRecord> {
        self.records.iter().map(|e| e.value().clone()).collect()
    }

    /// Count of members currently `Active` — the numerator in §4.3's
    /// split-brain majority check.
    pub fn online_count(&self) -> usize {
        self.records.iter().filter(|e| e.status == MembershipStatus::Active).count()
    }

    /// Total known members — the denominator in §4.3's split-brain majority
    /// check. Orphaned members still count (they remain part of the
    /// configured set until the catalog layer removes them; §3 does not
    /// describe automatic membership-set shrinkage).
    pub fn total_count(&self) -> usize {
        self.records.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SwimConfig {
    /// How often the detector re-evaluates suspicion escalation (teacher:
    /// `protocol_period`).
    pub protocol_period: Duration,
    /// How long a node stays `suspected` before this detector proposes
    /// `MarkOrphaned` (teacher: `suspicion_multiplier * protocol_period`).
    pub orphan_after: Duration,
}

impl SwimConfig {
    pub fn new(protocol_period: Duration, suspicion_multiplier: u32) -> Self {
        Self { protocol_period, orphan_after: protocol_period * suspicion_multiplier }
    }
}

/// Drives local suspicion off L2's real link-liveness signal and proposes
/// the resulting `MembershipOp`s through MCG so every node's table converges
/// (§4.3's split-brain detection also consumes `MembershipTable::online_count`
/// via `TopologyService::evaluate_membership`, called once per tick here).
pub struct SwimDetector;

impl SwimDetector {
    pub fn spawn(
        local_node: NodeId,
        consensus: Arc<ConsensusService>,
        table: Arc<MembershipTable>,
        links: LinkManagerHandle,
        topology: Arc<crate::topology::TopologyService>,
        config: SwimConfig,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(run(local_node, consensus, table, links, topology, config))
    }
}

async fn propose(consensus: &Arc<ConsensusService>, table: &Arc<MembershipTable>, op: MembershipOp) {
    let tag = match &op {
        MembershipOp::Join { .. } => "join",
        MembershipOp::ConfirmActive { .. } => "confirm",
        MembershipOp::MarkSuspect { .. } => "suspect",
        MembershipOp::MarkLeaving { .. } => "leaving",
        MembershipOp::MarkOrphaned { .. } => "orphaned",
    };
    let op_id = format!("membership-{tag}-{}", Uuid::new_v4());
    let payload = match serde_json::to_vec(&op) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode membership op");
            return;
        }
    };
    match consensus.propose(&GroupId::mcg(), op_id, payload).await {
        Ok(ProposeOutcome::Committed { .. }) => table.apply(op),
        Ok(ProposeOutcome::LeaderRedirect(leader)) => {
            tracing::debug!(%leader, "membership proposal hit a follower, dropping (next tick retries)");
        }
        Ok(ProposeOutcome::TimedOut) => {
            tracing::debug!("membership proposal timed out, next tick retries");
        }
        Err(e) => {
            tracing::warn!(error = %e, "membership proposal failed");
        }
    }
}

/// Proposes `Join` then `ConfirmActive` for the local node at startup, so a
/// freshly-booted founding voter's own membership row exists in the
/// replicated table without waiting to observe itself over a link (a node
/// never dials itself, so it would otherwise never see its own
/// `LinkEvent::Up`). Called once from `Runtime::bootstrap` per §4.1's "one
/// per process" identity lifecycle.
pub async fn bootstrap_self(consensus: &Arc<ConsensusService>, table: &Arc<MembershipTable>, node_id: NodeId, incarnation: u64) {
    propose(consensus, table, MembershipOp::Join { node_id: node_id.clone(), incarnation }).await;
    propose(consensus, table, MembershipOp::ConfirmActive { node_id, incarnation }).await;
}

async fn run(
    local_node: NodeId,
    consensus: Arc<ConsensusService>,
    table: Arc<MembershipTable>,
    links: LinkManagerHandle,
    topology: Arc<crate::topology::TopologyService>,
    config: SwimConfig,
) {
    let mut events = links.subscribe();
    let mut ticker = tokio::time::interval(config.protocol_period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                escalate_suspicions(&local_node, &consensus, &table, &config).await;
                let seed_reachable = seed_is_reachable(&local_node, &table, &topology);
                topology.evaluate_membership(table.online_count(), table.total_count().max(1), seed_reachable);
            }
            event = events.recv() => {
                match event {
                    Ok(LinkEvent::Up(link)) => {
                        let incarnation = table.get(&link.peer_id).map(|r| r.incarnation).unwrap_or_else(now_ms);
                        propose(&consensus, &table, MembershipOp::ConfirmActive { node_id: link.peer_id, incarnation }).await;
                    }
                    Ok(LinkEvent::Down(peer)) => {
                        if let Some(rec) = table.get(&peer) {
                            if rec.status == MembershipStatus::Active && rec.suspected_since_unix_ms.is_none() {
                                propose(&consensus, &table, MembershipOp::MarkSuspect { node_id: peer, incarnation: rec.incarnation }).await;
                            }
                        }
                    }
                    Ok(LinkEvent::Frame(..)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Whether this node's own partition can still see the configured seed node
/// (itself, or `Active` in the local membership view) — the input
/// `TopologyService::evaluate_membership`'s `SplitStrategy::SeedNodePrevails`
/// tie-break needs on an exact even split (§8 Scenario D).
fn seed_is_reachable(local_node: &NodeId, table: &Arc<MembershipTable>, topology: &Arc<crate::topology::TopologyService>) -> bool {
    match topology.seed_node() {
        None => false,
        Some(seed) if seed == local_node => true,
        Some(seed) => table.get(seed).map(|r| r.status == MembershipStatus::Active).unwrap_or(false),
    }
}

async fn escalate_suspicions(local_node: &NodeId, consensus: &Arc<ConsensusService>, table: &Arc<MembershipTable>, config: &SwimConfig) {
    let now = now_ms();
    let to_orphan: Vec<NodeId> = table
        .records()
        .into_iter()
        .filter(|r| &r.node_id != local_node)
        .filter_map(|r| {
            let since = r.suspected_since_unix_ms?;
            if now.saturating_sub(since) >= config.orphan_after.as_millis() as u64 {
                Some(r.node_id)
            } else {
                None
            }
        })
        .collect();

    for node_id in to_orphan {
        propose(consensus, table, MembershipOp::MarkOrphaned { node_id }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> NodeId {
        NodeId::from_string(format!("node_{s}")).unwrap()
    }

    #[test]
    fn join_then_confirm_promotes_to_active() {
        let table = MembershipTable::new();
        let n = node("aaaaaaaaaaaaaaaaaaaaaa");
        table.apply(MembershipOp::Join { node_id: n.clone(), incarnation: 1 });
        assert_eq!(table.get(&n).unwrap().status, MembershipStatus::Joining);
        table.apply(MembershipOp::ConfirmActive { node_id: n.clone(), incarnation: 2 });
        assert_eq!(table.get(&n).unwrap().status, MembershipStatus::Active);
        assert_eq!(table.online_count(), 1);
    }

    #[test]
    fn stale_incarnation_does_not_downgrade() {
        let table = MembershipTable::new();
        let n = node("bbbbbbbbbbbbbbbbbbbbbb");
        table.apply(MembershipOp::ConfirmActive { node_id: n.clone(), incarnation: 5 });
        table.apply(MembershipOp::Join { node_id: n.clone(), incarnation: 1 });
        assert_eq!(table.get(&n).unwrap().status, MembershipStatus::Active);
        assert_eq!(table.get(&n).unwrap().incarnation, 5);
    }

    #[test]
    fn suspect_then_orphan_updates_status() {
        let table = MembershipTable::new();
        let n = node("cccccccccccccccccccccc");
        table.apply(MembershipOp::ConfirmActive { node_id: n.clone(), incarnation: 1 });
        table.apply(MembershipOp::MarkSuspect { node_id: n.clone(), incarnation: 1 });
        assert!(table.get(&n).unwrap().suspected_since_unix_ms.is_some());
        assert_eq!(table.get(&n).unwrap().status, MembershipStatus::Active);
        table.apply(MembershipOp::MarkOrphaned { node_id: n.clone() });
        assert_eq!(table.get(&n).unwrap().status, MembershipStatus::Orphaned);
        assert_eq!(table.online_count(), 0);
        assert_eq!(table.total_count(), 1);
    }

    #[test]
    fn leaving_is_not_counted_online() {
        let table = MembershipTable::new();
        let n = node("dddddddddddddddddddddd");
        table.apply(MembershipOp::ConfirmActive { node_id: n.clone(), incarnation: 1 });
        table.apply(MembershipOp::MarkLeaving { node_id: n });
        assert_eq!(table.online_count(), 0);
    }
}
