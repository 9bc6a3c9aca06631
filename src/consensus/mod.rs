// Consensus (L4 MCG / L7 DSG, §4.4 / §4.7): one mandatory Mesh Control Group
// replicating membership, stream defs, config KV, topology pointer, and
// license state, plus zero-or-more optional per-tenant Data State Groups.
// Grounded almost directly in the teacher's `clustering/raft.rs`.

pub mod node;
pub mod transport;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::error::{MeshError, Result};
use crate::identity::NodeId;

pub use node::{GroupCommand, ProposeOutcome, RaftGroup, RaftTransport};
pub use transport::{run_receiver as run_raft_receiver, LinkRaftTransport};
pub use types::{AppendEntriesRequest, AppendEntriesResponse, GroupId, GroupKind, LogEntry, RaftRole, VoteRequest, VoteResponse};

struct GroupHandle {
    group: Arc<RaftGroup>,
    mailbox: mpsc::UnboundedSender<GroupCommand>,
}

/// Owns the MCG (created at mesh bootstrap) and any DSGs created later by
/// MCG proposal. `DSG proposals block when the containing tenant has been
/// removed` (§4.7) is enforced by the caller checking `dsg(tenant)` returns
/// `None` after a tenant-removal op applies.
pub struct ConsensusService {
    local: NodeId,
    transport: Arc<dyn RaftTransport>,
    election_timeout_min: Duration,
    election_timeout_max: Duration,
    heartbeat_interval: Duration,
    learner_catchup: Duration,
    snapshot_threshold: usize,
    groups: RwLock<HashMap<String, GroupHandle>>,
}

impl ConsensusService {
    pub fn new(
        local: NodeId,
        transport: Arc<dyn RaftTransport>,
        election_timeout_min: Duration,
        election_timeout_max: Duration,
        heartbeat_interval: Duration,
        learner_catchup: Duration,
        snapshot_threshold: usize,
    ) -> Self {
        Self {
            local,
            transport,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            learner_catchup,
            snapshot_threshold,
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Bootstraps the single mesh-wide MCG. Called once per process, with
    /// the initial voter set (typically just the local node for a new mesh,
    /// or the full founding set for a multi-node bootstrap).
    pub async fn bootstrap_mcg(&self, voters: Vec<NodeId>) -> mpsc::UnboundedReceiver<crate::consensus::types::LogEntry> {
        self.create_group(GroupId::mcg(), GroupKind::Mcg, voters).await
    }

    /// Creates a DSG. Per §4.7 this is only ever invoked as the effect of an
    /// MCG-committed `CreateDsg` operation, never called directly by an
    /// external caller.
    pub async fn create_dsg(&self, tenant: &str, voters: Vec<NodeId>) -> mpsc::UnboundedReceiver<crate::consensus::types::LogEntry> {
        self.create_group(GroupId::dsg(tenant), GroupKind::Dsg, voters).await
    }

    async fn create_group(&self, group_id: GroupId, kind: GroupKind, voters: Vec<NodeId>) -> mpsc::UnboundedReceiver<crate::consensus::types::LogEntry> {
        let (group, apply_rx) = RaftGroup::new(
            group_id.clone(),
            kind,
            self.local.clone(),
            voters,
            self.election_timeout_min,
            self.election_timeout_max,
            self.heartbeat_interval,
            self.learner_catchup,
            self.snapshot_threshold,
            self.transport.clone(),
        );
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        group.spawn_ticker(cmd_tx.clone());
        tokio::spawn(group.clone().run(cmd_rx));
        self.groups.write().await.insert(group_id.0.clone(), GroupHandle { group, mailbox: cmd_tx });
        apply_rx
    }

    pub async fn remove_dsg(&self, tenant: &str) {
        self.groups.write().await.remove(&GroupId::dsg(tenant).0);
    }

    pub async fn mcg(&self) -> Arc<RaftGroup> {
        self.groups.read().await.get(&GroupId::mcg().0).expect("MCG must be bootstrapped before use").group.clone()
    }

    pub async fn dsg(&self, tenant: &str) -> Option<Arc<RaftGroup>> {
        self.groups.read().await.get(&GroupId::dsg(tenant).0).map(|h| h.group.clone())
    }

    /// `Propose(op) -> (index, term) | LeaderRedirect(node) | TimedOut`
    /// against a named group's mailbox (§4.4).
    pub async fn propose(&self, group_id: &GroupId, op_id: String, payload: Vec<u8>) -> Result<ProposeOutcome> {
        let mailbox = {
            let groups = self.groups.read().await;
            groups.get(&group_id.0).map(|h| h.mailbox.clone()).ok_or_else(|| MeshError::NotFound(format!("raft group {group_id} not running")))?
        };
        let (tx, rx) = oneshot::channel();
        mailbox
            .send(GroupCommand::Propose { op_id, payload, respond: tx })
            .map_err(|_| MeshError::Internal(format!("raft group {group_id} mailbox closed")))?;
        rx.await.map_err(|_| MeshError::Internal(format!("raft group {group_id} dropped propose response")))?
    }

    pub async fn mailbox_for(&self, group_id: &GroupId) -> Option<mpsc::UnboundedSender<GroupCommand>> {
        self.groups.read().await.get(&group_id.0).map(|h| h.mailbox.clone())
    }

    /// Forces `group_id` to compact its committed log into a snapshot marker
    /// now, ahead of `snapshot_threshold` (the `force-snapshot` control
    /// command, §4.4/§6). Returns the committed index the snapshot covers.
    pub async fn force_snapshot(&self, group_id: &GroupId) -> Result<crate::consensus::types::LogIndex> {
        let mailbox = {
            let groups = self.groups.read().await;
            groups.get(&group_id.0).map(|h| h.mailbox.clone()).ok_or_else(|| MeshError::NotFound(format!("raft group {group_id} not running")))?
        };
        let (tx, rx) = oneshot::channel();
        mailbox
            .send(GroupCommand::ForceSnapshot { respond: tx })
            .map_err(|_| MeshError::Internal(format!("raft group {group_id} mailbox closed")))?;
        rx.await.map_err(|_| MeshError::Internal(format!("raft group {group_id} dropped force-snapshot response")))
    }
}
