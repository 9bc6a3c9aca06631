// Multi-node Raft integration coverage: a 3-node MCG elects a leader, commits
// a proposal to every node's apply channel, survives its leader being killed,
// and re-elects without losing anything already committed. No real sockets —
// each node's `RaftTransport` dispatches directly into its peers'
// `ConsensusService::mailbox_for`, the same "decode then hand to the
// addressed group's mailbox" shape `consensus::transport::run_receiver` uses
// over real links.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use redb_mesh::consensus::{
    AppendEntriesRequest, AppendEntriesResponse, ConsensusService, GroupCommand, GroupId, RaftTransport, VoteRequest, VoteResponse,
};
use redb_mesh::error::{MeshError, Result};
use redb_mesh::identity::NodeId;
use tokio::sync::oneshot;

/// Routes an RPC to the addressed peer's `ConsensusService` mailbox, unless
/// the calling node has been marked `killed` — a crashed process sends
/// nothing, which is what actually needs to happen for the rest of the
/// cluster to notice it is gone and re-elect.
struct LoopbackTransport {
    local: NodeId,
    registry: Arc<DashMap<NodeId, Arc<ConsensusService>>>,
    killed: Arc<DashSet<NodeId>>,
}

impl LoopbackTransport {
    async fn dispatch_vote(&self, peer: &NodeId, req: VoteRequest) -> Result<VoteResponse> {
        if self.killed.contains(&self.local) {
            return Err(MeshError::NoRoute(format!("{} is down", self.local)));
        }
        let consensus = self.registry.get(peer).map(|c| c.clone()).ok_or_else(|| MeshError::NoRoute(peer.to_string()))?;
        let mailbox = consensus.mailbox_for(&GroupId(req.group.clone())).await.ok_or_else(|| MeshError::NoRoute(peer.to_string()))?;
        let (tx, rx) = oneshot::channel();
        mailbox
            .send(GroupCommand::HandleVoteRequest { req, respond: tx })
            .map_err(|_| MeshError::Internal("mailbox closed".into()))?;
        rx.await.map_err(|_| MeshError::Internal("dropped vote response".into()))
    }

    async fn dispatch_append(&self, peer: &NodeId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        if self.killed.contains(&self.local) {
            return Err(MeshError::NoRoute(format!("{} is down", self.local)));
        }
        let consensus = self.registry.get(peer).map(|c| c.clone()).ok_or_else(|| MeshError::NoRoute(peer.to_string()))?;
        let mailbox = consensus.mailbox_for(&GroupId(req.group.clone())).await.ok_or_else(|| MeshError::NoRoute(peer.to_string()))?;
        let (tx, rx) = oneshot::channel();
        mailbox
            .send(GroupCommand::HandleAppendEntries { req, respond: tx })
            .map_err(|_| MeshError::Internal("mailbox closed".into()))?;
        rx.await.map_err(|_| MeshError::Internal("dropped append response".into()))
    }
}

#[async_trait]
impl RaftTransport for LoopbackTransport {
    async fn send_vote_request(&self, peer: &NodeId, req: VoteRequest) -> Result<VoteResponse> {
        self.dispatch_vote(peer, req).await
    }

    async fn send_append_entries(&self, peer: &NodeId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.dispatch_append(peer, req).await
    }
}

fn node(s: &str) -> NodeId {
    NodeId::from_string(format!("node_{s}")).unwrap()
}

async fn wait_for_leader(nodes: &[(NodeId, Arc<ConsensusService>)], timeout: Duration) -> NodeId {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        for (id, consensus) in nodes {
            if consensus.mcg().await.is_leader().await {
                return id.clone();
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("no leader elected within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn cluster_survives_leader_crash_and_re_elects() {
    let n1 = node("n1aaaaaaaaaaaaaaaaaaaa");
    let n2 = node("n2aaaaaaaaaaaaaaaaaaaa");
    let n3 = node("n3aaaaaaaaaaaaaaaaaaaa");
    let voters = vec![n1.clone(), n2.clone(), n3.clone()];

    let registry: Arc<DashMap<NodeId, Arc<ConsensusService>>> = Arc::new(DashMap::new());
    let killed: Arc<DashSet<NodeId>> = Arc::new(DashSet::new());

    let mut nodes = Vec::new();
    let mut apply_rxs = Vec::new();
    for id in [&n1, &n2, &n3] {
        let transport = Arc::new(LoopbackTransport { local: id.clone(), registry: registry.clone(), killed: killed.clone() });
        let consensus = Arc::new(ConsensusService::new(
            id.clone(),
            transport,
            Duration::from_millis(80),
            Duration::from_millis(160),
            Duration::from_millis(20),
            Duration::from_secs(1),
            10_000,
        ));
        registry.insert(id.clone(), consensus.clone());
        let apply_rx = consensus.bootstrap_mcg(voters.clone()).await;
        nodes.push((id.clone(), consensus));
        apply_rxs.push(apply_rx);
    }

    let leader = wait_for_leader(&nodes, Duration::from_secs(2)).await;
    let leader_consensus = nodes.iter().find(|(id, _)| *id == leader).unwrap().1.clone();

    match leader_consensus.propose(&GroupId::mcg(), "create-stream-s1".into(), b"stream s1".to_vec()).await.unwrap() {
        redb_mesh::consensus::ProposeOutcome::Committed { .. } => {}
        other => panic!("expected commit from leader, got {other:?}"),
    }

    for rx in apply_rxs.iter_mut() {
        let entry = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(entry.op_id, "create-stream-s1");
    }

    // Crash the leader: from now on its own RPCs never leave the process.
    killed.insert(leader.clone());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let new_leader = loop {
        let mut found = None;
        for (id, consensus) in &nodes {
            if id != &leader && consensus.mcg().await.is_leader().await {
                found = Some(id.clone());
                break;
            }
        }
        if let Some(id) = found {
            break id;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("surviving nodes never elected a new leader after the old leader crashed");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_ne!(new_leader, leader);

    let new_leader_consensus = nodes.iter().find(|(id, _)| *id == new_leader).unwrap().1.clone();
    match new_leader_consensus.propose(&GroupId::mcg(), "create-stream-s2".into(), b"stream s2".to_vec()).await.unwrap() {
        redb_mesh::consensus::ProposeOutcome::Committed { .. } => {}
        other => panic!("expected the new leader to commit after re-election, got {other:?}"),
    }

    for (id, mut rx) in nodes.iter().map(|(id, _)| id.clone()).zip(apply_rxs) {
        if id == leader {
            continue;
        }
        let entry = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(entry.op_id, "create-stream-s2");
    }
}
