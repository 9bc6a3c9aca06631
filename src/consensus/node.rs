// Raft core: leader election (with pre-vote), log replication, commit-index
// advancement, and idempotent client proposals. Generalized from the
// teacher's `clustering/raft.rs` `RaftNode` to be parametrized by
// `group_id`/`GroupKind` (one mandatory MCG, zero-or-more DSGs, §4.4/§4.7).
//
// Per §5's locking discipline ("Raft state is accessed only through its own
// FIFO command channel"), all mutation goes through `RaftGroup::run`'s
// command loop — callers never lock the core directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{MeshError, Result};
use crate::identity::NodeId;

use super::types::{
    AppendEntriesRequest, AppendEntriesResponse, GroupConfiguration, GroupId, GroupKind, LeaderVolatileState,
    LogEntry, LogIndex, PersistentState, RaftRole, Term, VoteRequest, VoteResponse,
};

/// What a `Propose` call yields, mirroring §4.4's client API contract.
#[derive(Debug, Clone)]
pub enum ProposeOutcome {
    Committed { index: LogIndex, term: Term },
    LeaderRedirect(NodeId),
    TimedOut,
}

/// Abstracts sending Raft RPCs to peers over the mesh (normally backed by
/// L2 RAFT_VOTE/RAFT_APPEND frames; an in-memory fake backs tests).
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn send_vote_request(&self, peer: &NodeId, req: VoteRequest) -> Result<VoteResponse>;
    async fn send_append_entries(&self, peer: &NodeId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse>;
}

struct Core {
    role: RaftRole,
    persistent: PersistentState,
    commit_index: LogIndex,
    last_applied: LogIndex,
    leader: Option<NodeId>,
    configuration: GroupConfiguration,
    votes_received: HashMap<String, bool>,
    leader_state: Option<LeaderVolatileState>,
}

impl Core {
    fn new(configuration: GroupConfiguration) -> Self {
        Self {
            role: RaftRole::Follower,
            persistent: PersistentState::new(),
            commit_index: 0,
            last_applied: 0,
            leader: None,
            configuration,
            votes_received: HashMap::new(),
            leader_state: None,
        }
    }
}

/// One Raft group (an MCG or a DSG), run as a single owning task with a
/// command mailbox.
pub struct RaftGroup {
    pub group_id: GroupId,
    pub kind: GroupKind,
    local: NodeId,
    core: Mutex<Core>,
    election_timeout_min: Duration,
    election_timeout_max: Duration,
    heartbeat_interval: Duration,
    learner_catchup: Duration,
    snapshot_threshold: usize,
    applied_ops: DashMap<String, (Term, LogIndex)>,
    transport: Arc<dyn RaftTransport>,
    apply_tx: mpsc::UnboundedSender<LogEntry>,
}

pub enum GroupCommand {
    Propose { op_id: String, payload: Vec<u8>, respond: oneshot::Sender<Result<ProposeOutcome>> },
    HandleVoteRequest { req: VoteRequest, respond: oneshot::Sender<VoteResponse> },
    HandleAppendEntries { req: AppendEntriesRequest, respond: oneshot::Sender<AppendEntriesResponse> },
    /// Compacts the committed log into the snapshot marker now, ahead of
    /// `snapshot_threshold` (the `force-snapshot` control command, §4.4/§6).
    ForceSnapshot { respond: oneshot::Sender<LogIndex> },
    Tick,
}

impl RaftGroup {
    pub fn new(
        group_id: GroupId,
        kind: GroupKind,
        local: NodeId,
        voters: Vec<NodeId>,
        election_timeout_min: Duration,
        election_timeout_max: Duration,
        heartbeat_interval: Duration,
        learner_catchup: Duration,
        snapshot_threshold: usize,
        transport: Arc<dyn RaftTransport>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LogEntry>) {
        let is_sole_voter = voters.len() == 1 && voters[0] == local;
        let configuration = GroupConfiguration::new(voters.into_iter().map(|n| n.to_string()).collect());
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let mut core = Core::new(configuration);
        if is_sole_voter {
            // A single-voter group has no one to lose an election to;
            // skip straight to leadership rather than waiting out an
            // election timeout against an empty peer set.
            core.role = RaftRole::Leader;
            core.leader = Some(local.clone());
            core.leader_state = Some(LeaderVolatileState::new(&[], 0));
        }
        let group = Arc::new(Self {
            group_id,
            kind,
            local,
            core: Mutex::new(core),
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            learner_catchup,
            snapshot_threshold,
            applied_ops: DashMap::new(),
            transport,
            apply_tx,
        });
        (group, apply_rx)
    }

    pub async fn role(&self) -> RaftRole {
        self.core.lock().await.role
    }

    pub async fn current_term(&self) -> Term {
        self.core.lock().await.persistent.current_term
    }

    pub async fn current_leader(&self) -> Option<NodeId> {
        self.core.lock().await.leader.clone()
    }

    pub async fn is_leader(&self) -> bool {
        self.role().await == RaftRole::Leader
    }

    /// Spawns the election-timeout / heartbeat ticker. The tick drives
    /// `GroupCommand::Tick` into `run`'s mailbox rather than mutating state
    /// directly, keeping the command channel the sole entry point.
    pub fn spawn_ticker(self: &Arc<Self>, tx: mpsc::UnboundedSender<GroupCommand>) {
        let min = self.election_timeout_min;
        let max = self.election_timeout_max;
        tokio::spawn(async move {
            loop {
                let timeout = {
                    let spread = max.saturating_sub(min).as_millis().max(1) as u64;
                    min + Duration::from_millis(rand::rng().random_range(0..=spread))
                };
                tokio::time::sleep(timeout).await;
                if tx.send(GroupCommand::Tick).is_err() {
                    return;
                }
            }
        });
    }

    /// Runs the command loop. This is the only task permitted to mutate
    /// `core`.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<GroupCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                GroupCommand::Propose { op_id, payload, respond } => {
                    let outcome = self.handle_propose(op_id, payload).await;
                    let _ = respond.send(outcome);
                }
                GroupCommand::HandleVoteRequest { req, respond } => {
                    let resp = self.handle_vote_request(req).await;
                    let _ = respond.send(resp);
                }
                GroupCommand::HandleAppendEntries { req, respond } => {
                    let resp = self.handle_append_entries(req).await;
                    let _ = respond.send(resp);
                }
                GroupCommand::ForceSnapshot { respond } => {
                    let snapshot_index = self.handle_force_snapshot().await;
                    let _ = respond.send(snapshot_index);
                }
                GroupCommand::Tick => {
                    self.on_tick().await;
                }
            }
        }
    }

    async fn handle_force_snapshot(&self) -> LogIndex {
        let mut core = self.core.lock().await;
        let index = core.commit_index;
        core.persistent.compact_through(index);
        index
    }

    async fn on_tick(self: &Arc<Self>) {
        let role = self.role().await;
        if role == RaftRole::Leader {
            self.send_heartbeats().await;
        } else if role != RaftRole::Learner {
            self.start_election(true).await;
        }
    }

    /// Pre-vote phase first (§4.4): probe peers without incrementing term.
    /// Only on a successful pre-vote quorum does the node become a real
    /// candidate and increment its term.
    async fn start_election(self: &Arc<Self>, use_pre_vote: bool) {
        let (term, last_index, last_term, peers) = {
            let core = self.core.lock().await;
            (core.persistent.current_term, core.persistent.last_log_index(), core.persistent.last_log_term(), core.configuration.voters.clone())
        };

        if use_pre_vote {
            let req = VoteRequest {
                group: self.group_id.0.clone(),
                term: term + 1,
                candidate: self.local.to_string(),
                last_log_index: last_index,
                last_log_term: last_term,
                pre_vote: true,
            };
            let granted = self.canvass(&peers, req).await;
            if !granted {
                return;
            }
        }

        let mut core = self.core.lock().await;
        core.persistent.current_term += 1;
        core.persistent.voted_for = Some(self.local.to_string());
        core.role = RaftRole::Candidate;
        core.votes_received.clear();
        core.votes_received.insert(self.local.to_string(), true);
        let term = core.persistent.current_term;
        let last_index = core.persistent.last_log_index();
        let last_term = core.persistent.last_log_term();
        let config = core.configuration.clone_for_quorum();
        drop(core);

        let req = VoteRequest {
            group: self.group_id.0.clone(),
            term,
            candidate: self.local.to_string(),
            last_log_index: last_index,
            last_log_term: last_term,
            pre_vote: false,
        };

        let peers_excl_self: Vec<NodeId> = config.voters.iter().filter(|v| *v != self.local.as_str()).filter_map(|v| NodeId::from_string(v.clone()).ok()).collect();

        for peer in peers_excl_self {
            let transport = self.transport.clone();
            let req = req.clone();
            let this = self.clone();
            tokio::spawn(async move {
                if let Ok(resp) = transport.send_vote_request(&peer, req).await {
                    this.handle_vote_response(peer.to_string(), resp).await;
                }
            });
        }
    }

    /// Sends pre-vote requests and reports whether a quorum would grant the
    /// vote, without mutating persistent state.
    async fn canvass(&self, peers: &[String], req: VoteRequest) -> bool {
        let mut votes = HashMap::new();
        votes.insert(self.local.to_string(), true);
        let mut handles = Vec::new();
        for peer in peers {
            if peer == self.local.as_str() {
                continue;
            }
            if let Ok(node) = NodeId::from_string(peer.clone()) {
                let transport = self.transport.clone();
                let req = req.clone();
                handles.push(tokio::spawn(async move { transport.send_vote_request(&node, req).await }));
            }
        }
        for (peer, handle) in peers.iter().filter(|p| *p != self.local.as_str()).zip(handles) {
            if let Ok(Ok(resp)) = handle.await {
                votes.insert(peer.clone(), resp.vote_granted);
            }
        }
        let config = GroupConfiguration::new(peers.to_vec());
        config.has_quorum(&votes)
    }

    async fn handle_vote_request(&self, req: VoteRequest) -> VoteResponse {
        let mut core = self.core.lock().await;

        if req.pre_vote {
            // Pre-vote never changes persistent state; grant iff the
            // candidate's log is at least as fresh as ours and we haven't
            // heard from a leader recently (approximated here by current role).
            let log_ok = req.last_log_term > core.persistent.last_log_term()
                || (req.last_log_term == core.persistent.last_log_term() && req.last_log_index >= core.persistent.last_log_index());
            return VoteResponse { term: core.persistent.current_term, vote_granted: log_ok };
        }

        if req.term > core.persistent.current_term {
            core.persistent.current_term = req.term;
            core.persistent.voted_for = None;
            core.role = RaftRole::Follower;
        }

        let mut vote_granted = false;
        if req.term >= core.persistent.current_term {
            let can_vote = core.persistent.voted_for.is_none() || core.persistent.voted_for.as_deref() == Some(req.candidate.as_str());
            let log_ok = req.last_log_term > core.persistent.last_log_term()
                || (req.last_log_term == core.persistent.last_log_term() && req.last_log_index >= core.persistent.last_log_index());
            if can_vote && log_ok {
                core.persistent.voted_for = Some(req.candidate.clone());
                vote_granted = true;
            }
        }

        VoteResponse { term: core.persistent.current_term, vote_granted }
    }

    async fn handle_vote_response(self: &Arc<Self>, from: String, resp: VoteResponse) {
        let mut core = self.core.lock().await;
        if resp.term > core.persistent.current_term {
            core.persistent.current_term = resp.term;
            core.persistent.voted_for = None;
            core.role = RaftRole::Follower;
            return;
        }
        if core.role != RaftRole::Candidate || resp.term != core.persistent.current_term {
            return;
        }
        core.votes_received.insert(from, resp.vote_granted);
        let won = core.configuration.has_quorum(&core.votes_received);
        if won {
            core.role = RaftRole::Leader;
            core.leader = Some(self.local.clone());
            let last_index = core.persistent.last_log_index();
            let peers: Vec<NodeId> = core.configuration.voters.iter().filter_map(|v| NodeId::from_string(v.clone()).ok()).filter(|n| n != &self.local).collect();
            core.leader_state = Some(LeaderVolatileState::new(&peers, last_index));
            tracing::info!(group = %self.group_id, term = core.persistent.current_term, "became leader");
        }
    }

    async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut core = self.core.lock().await;

        if req.term > core.persistent.current_term {
            core.persistent.current_term = req.term;
            core.persistent.voted_for = None;
        }

        if req.term < core.persistent.current_term {
            return AppendEntriesResponse { term: core.persistent.current_term, success: false, match_index: None, conflict_index: None };
        }

        if core.role != RaftRole::Learner {
            core.role = RaftRole::Follower;
        }
        core.leader = NodeId::from_string(req.leader.clone()).ok();

        if req.prev_log_index > 0 {
            match core.persistent.get_term(req.prev_log_index) {
                Some(term) if term == req.prev_log_term => {}
                _ => {
                    return AppendEntriesResponse {
                        term: core.persistent.current_term,
                        success: false,
                        match_index: None,
                        conflict_index: Some(core.persistent.last_log_index()),
                    };
                }
            }
        }

        if !req.entries.is_empty() {
            core.persistent.truncate_from(req.prev_log_index + 1);
            for entry in req.entries {
                core.persistent.log.push(entry);
            }
        }

        if req.leader_commit > core.commit_index {
            core.commit_index = req.leader_commit.min(core.persistent.last_log_index());
        }
        self.drain_applies(&mut core);

        AppendEntriesResponse { term: core.persistent.current_term, success: true, match_index: Some(core.persistent.last_log_index()), conflict_index: None }
    }

    fn drain_applies(&self, core: &mut Core) {
        while core.last_applied < core.commit_index {
            core.last_applied += 1;
            if let Some(entry) = core.persistent.get_entry(core.last_applied).cloned() {
                self.applied_ops.insert(entry.op_id.clone(), (entry.term, entry.index));
                let _ = self.apply_tx.send(entry);
            }
        }
    }

    async fn send_heartbeats(self: &Arc<Self>) {
        let (peers, term, commit_index) = {
            let core = self.core.lock().await;
            let peers: Vec<NodeId> = core.configuration.voters.iter().chain(core.configuration.learners.iter()).filter_map(|v| NodeId::from_string(v.clone()).ok()).filter(|n| n != &self.local).collect();
            (peers, core.persistent.current_term, core.commit_index)
        };

        for peer in peers {
            let this = self.clone();
            let _ = term;
            tokio::spawn(async move { this.replicate_to(peer).await });
        }
        let _ = commit_index;
    }

    async fn replicate_to(self: &Arc<Self>, peer: NodeId) {
        let req = {
            let core = self.core.lock().await;
            if core.role != RaftRole::Leader {
                return;
            }
            let leader_state = match &core.leader_state {
                Some(ls) => ls,
                None => return,
            };
            let next_index = leader_state.next_index.get(&peer).copied().unwrap_or(1);
            let prev_log_index = next_index.saturating_sub(1);
            let prev_log_term = if prev_log_index > 0 { core.persistent.get_term(prev_log_index).unwrap_or(0) } else { 0 };
            let entries: Vec<LogEntry> = core.persistent.log.iter().filter(|e| e.index >= next_index).take(256).cloned().collect();
            AppendEntriesRequest {
                group: self.group_id.0.clone(),
                term: core.persistent.current_term,
                leader: self.local.to_string(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: core.commit_index,
            }
        };

        if let Ok(resp) = self.transport.send_append_entries(&peer, req.clone()).await {
            let mut core = self.core.lock().await;
            if resp.term > core.persistent.current_term {
                core.persistent.current_term = resp.term;
                core.role = RaftRole::Follower;
                core.leader_state = None;
                return;
            }
            if core.role != RaftRole::Leader {
                return;
            }
            let Some(leader_state) = core.leader_state.as_mut() else { return };
            if resp.success {
                if let Some(match_index) = resp.match_index {
                    leader_state.match_index.insert(peer.clone(), match_index);
                    leader_state.next_index.insert(peer.clone(), match_index + 1);
                }
                let new_commit = leader_state.majority_match_index(core.commit_index);
                // Raft Figure 8: a leader may only advance commit_index over an
                // entry from an *earlier* term once an entry from its own
                // current term has also reached a majority. Advancing on the
                // prior-term entry alone can make it appear committed and then
                // have a future leader overwrite it. Committing the
                // current-term entry implicitly carries every lower-indexed
                // entry with it (§4.4's log-matching property), so it's
                // sufficient to gate on the term of `new_commit` itself.
                if new_commit > core.commit_index && core.persistent.get_term(new_commit) == Some(core.persistent.current_term) {
                    core.commit_index = new_commit;
                }
                self.drain_applies(&mut core);
            } else {
                let next = leader_state.next_index.get(&peer).copied().unwrap_or(1);
                leader_state.next_index.insert(peer, next.saturating_sub(1).max(1));
            }
        }
    }

    /// `Propose(op) -> (index, term) | LeaderRedirect(node) | TimedOut`
    /// (§4.4). Idempotent by `op_id`: a previously-applied op_id returns its
    /// original (index, term) without appending a duplicate entry.
    async fn handle_propose(self: &Arc<Self>, op_id: String, payload: Vec<u8>) -> Result<ProposeOutcome> {
        if let Some(prior) = self.applied_ops.get(&op_id) {
            return Ok(ProposeOutcome::Committed { term: prior.0, index: prior.1 });
        }

        let (index, term) = {
            let mut core = self.core.lock().await;
            if core.role != RaftRole::Leader {
                return Ok(match &core.leader {
                    Some(leader) => ProposeOutcome::LeaderRedirect(leader.clone()),
                    None => ProposeOutcome::TimedOut,
                });
            }
            let index = core.persistent.last_log_index() + 1;
            let term = core.persistent.current_term;
            core.persistent.log.push(LogEntry { term, index, op_id: op_id.clone(), payload });
            if let Some(ls) = core.leader_state.as_mut() {
                ls.match_index.insert(self.local.clone(), index);
            }
            if core.configuration.voters.len() == 1 {
                core.commit_index = index;
                self.drain_applies(&mut core);
            }
            (index, term)
        };

        self.send_heartbeats().await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if self.applied_ops.contains_key(&op_id) {
                return Ok(ProposeOutcome::Committed { index, term });
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(ProposeOutcome::TimedOut);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn should_snapshot(&self, log_len: usize) -> bool {
        log_len >= self.snapshot_threshold
    }

    pub fn learner_catchup_window(&self) -> Duration {
        self.learner_catchup
    }
}

impl GroupConfiguration {
    fn clone_for_quorum(&self) -> GroupConfiguration {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct LoopbackTransport {
        groups: StdMutex<HashMap<String, Arc<RaftGroup>>>,
    }

    #[async_trait]
    impl RaftTransport for LoopbackTransport {
        async fn send_vote_request(&self, peer: &NodeId, req: VoteRequest) -> Result<VoteResponse> {
            let group = self.groups.lock().unwrap().get(peer.as_str()).cloned();
            match group {
                Some(g) => Ok(g.handle_vote_request(req).await),
                None => Err(MeshError::NoRoute(peer.to_string())),
            }
        }
        async fn send_append_entries(&self, peer: &NodeId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
            let group = self.groups.lock().unwrap().get(peer.as_str()).cloned();
            match group {
                Some(g) => Ok(g.handle_append_entries(req).await),
                None => Err(MeshError::NoRoute(peer.to_string())),
            }
        }
    }

    fn node(s: &str) -> NodeId {
        NodeId::from_string(format!("node_{s}")).unwrap()
    }

    #[tokio::test]
    async fn single_node_group_commits_immediately() {
        let n1 = node("n1aaaaaaaaaaaaaaaaaaaa");
        let transport = Arc::new(LoopbackTransport { groups: StdMutex::new(HashMap::new()) });
        let (group, mut apply_rx) = RaftGroup::new(
            GroupId::mcg(),
            GroupKind::Mcg,
            n1.clone(),
            vec![n1.clone()],
            Duration::from_millis(150),
            Duration::from_millis(300),
            Duration::from_millis(50),
            Duration::from_secs(1),
            10_000,
            transport.clone(),
        );
        transport.groups.lock().unwrap().insert(n1.to_string(), group.clone());

        {
            let mut core = group.core.lock().await;
            core.role = RaftRole::Leader;
            core.leader = Some(n1.clone());
            core.leader_state = Some(LeaderVolatileState::new(&[], 0));
        }

        let outcome = group.handle_propose("op-1".into(), b"hello".to_vec()).await.unwrap();
        assert!(matches!(outcome, ProposeOutcome::Committed { index: 1, .. }));
        let applied = apply_rx.recv().await.unwrap();
        assert_eq!(applied.op_id, "op-1");
    }

    #[tokio::test]
    async fn propose_is_idempotent_by_op_id() {
        let n1 = node("n1aaaaaaaaaaaaaaaaaaaa");
        let transport = Arc::new(LoopbackTransport { groups: StdMutex::new(HashMap::new()) });
        let (group, _apply_rx) = RaftGroup::new(
            GroupId::mcg(),
            GroupKind::Mcg,
            n1.clone(),
            vec![n1.clone()],
            Duration::from_millis(150),
            Duration::from_millis(300),
            Duration::from_millis(50),
            Duration::from_secs(1),
            10_000,
            transport.clone(),
        );
        transport.groups.lock().unwrap().insert(n1.to_string(), group.clone());
        {
            let mut core = group.core.lock().await;
            core.role = RaftRole::Leader;
            core.leader = Some(n1.clone());
            core.leader_state = Some(LeaderVolatileState::new(&[], 0));
        }

        let first = group.handle_propose("dup".into(), b"a".to_vec()).await.unwrap();
        let second = group.handle_propose("dup".into(), b"b".to_vec()).await.unwrap();
        match (first, second) {
            (ProposeOutcome::Committed { index: i1, .. }, ProposeOutcome::Committed { index: i2, .. }) => assert_eq!(i1, i2),
            other => panic!("expected both committed with same index, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn follower_redirects_propose_to_leader() {
        let n1 = node("n1aaaaaaaaaaaaaaaaaaaa");
        let n2 = node("n2aaaaaaaaaaaaaaaaaaaa");
        let transport = Arc::new(LoopbackTransport { groups: StdMutex::new(HashMap::new()) });
        let (group, _rx) = RaftGroup::new(
            GroupId::mcg(),
            GroupKind::Mcg,
            n2.clone(),
            vec![n1.clone(), n2.clone()],
            Duration::from_millis(150),
            Duration::from_millis(300),
            Duration::from_millis(50),
            Duration::from_secs(1),
            10_000,
            transport,
        );
        {
            let mut core = group.core.lock().await;
            core.leader = Some(n1.clone());
        }
        let outcome = group.handle_propose("op-x".into(), b"y".to_vec()).await.unwrap();
        assert!(matches!(outcome, ProposeOutcome::LeaderRedirect(ref l) if l == &n1));
    }

    /// Raft Figure 8: a majority-replicated entry from an earlier term must
    /// not be committed on its own; it only becomes safe once an entry from
    /// the leader's current term also reaches a majority.
    #[tokio::test]
    async fn leader_does_not_commit_a_prior_term_entry_without_a_current_term_majority() {
        let n1 = node("n1aaaaaaaaaaaaaaaaaaaa");
        let n2 = node("n2aaaaaaaaaaaaaaaaaaaa");
        let transport = Arc::new(LoopbackTransport { groups: StdMutex::new(HashMap::new()) });

        let (leader, _rx1) = RaftGroup::new(
            GroupId::mcg(),
            GroupKind::Mcg,
            n1.clone(),
            vec![n1.clone(), n2.clone()],
            Duration::from_millis(150),
            Duration::from_millis(300),
            Duration::from_millis(50),
            Duration::from_secs(1),
            10_000,
            transport.clone(),
        );
        let (follower, _rx2) = RaftGroup::new(
            GroupId::mcg(),
            GroupKind::Mcg,
            n2.clone(),
            vec![n1.clone(), n2.clone()],
            Duration::from_millis(150),
            Duration::from_millis(300),
            Duration::from_millis(50),
            Duration::from_secs(1),
            10_000,
            transport.clone(),
        );
        transport.groups.lock().unwrap().insert(n1.to_string(), leader.clone());
        transport.groups.lock().unwrap().insert(n2.to_string(), follower.clone());

        // Both nodes already hold index 1 from a past term's leader.
        let stale_entry = LogEntry { term: 1, index: 1, op_id: "old-op".into(), payload: vec![] };
        {
            let mut core = follower.core.lock().await;
            core.persistent.current_term = 1;
            core.persistent.log.push(stale_entry.clone());
        }
        {
            let mut core = leader.core.lock().await;
            core.persistent.current_term = 2;
            core.persistent.log.push(stale_entry);
            core.role = RaftRole::Leader;
            core.leader = Some(n1.clone());
            core.leader_state = Some(LeaderVolatileState::new(&[n2.clone()], 1));
        }

        // Replicate with no new entries: the follower matches index 1, which
        // is a majority, but it is still a term-1 entry under a term-2 leader.
        leader.clone().replicate_to(n2.clone()).await;
        assert_eq!(leader.core.lock().await.commit_index, 0, "prior-term entry must not commit alone");

        // Leader appends its own (current-term) entry and replicates again.
        {
            let mut core = leader.core.lock().await;
            let index = core.persistent.last_log_index() + 1;
            let term = core.persistent.current_term;
            core.persistent.log.push(LogEntry { term, index, op_id: "new-op".into(), payload: vec![] });
            if let Some(ls) = core.leader_state.as_mut() {
                ls.match_index.insert(n1.clone(), index);
            }
        }
        leader.clone().replicate_to(n2.clone()).await;
        assert_eq!(leader.core.lock().await.commit_index, 2, "current-term entry carries the prior entry with it once majority-replicated");
    }
}
