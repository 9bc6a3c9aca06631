// Shared Raft types, generalized from the teacher's `clustering/raft.rs`
// (`RaftState`/`PersistentState`/`LeaderState`/`ClusterConfiguration`) to be
// parametrized by `group_id`/`GroupKind` instead of one implicit cluster, per
// §3's "exactly one MCG exists" / "zero-or-more DSG" data model.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::identity::NodeId;

pub type Term = u64;
pub type LogIndex = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupKind {
    /// The single, mesh-wide Mesh Control Group (§4.4).
    Mcg,
    /// An optional per-tenant Data State Group (§4.7).
    Dsg,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl GroupId {
    pub fn mcg() -> Self {
        GroupId("mcg".to_string())
    }

    pub fn dsg(tenant: &str) -> Self {
        GroupId(format!("dsg-{tenant}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    Follower,
    PreCandidate,
    Candidate,
    Leader,
    /// Receives the log but does not vote until caught up (§4.4). Learners
    /// are never candidates.
    Learner,
}

/// One committed operation's payload. The group's state machine (membership
/// set, stream definitions, config KV, topology pointer, license state for
/// MCG; tenant-scoped ordered state for DSG) interprets the bytes; this
/// crate's Raft core only replicates them.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub op_id: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct VoteRequest {
    pub group: String,
    pub term: Term,
    pub candidate: String,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    /// Pre-vote requests do not increment the candidate's term if rejected
    /// (§4.4: "Pre-vote before incrementing term, to avoid disruption").
    pub pre_vote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct AppendEntriesRequest {
    pub group: String,
    pub term: Term,
    pub leader: String,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: Option<LogIndex>,
    pub conflict_index: Option<LogIndex>,
}

/// The group's membership, with joint-consensus support for configuration
/// changes in flight (teacher: `ClusterConfiguration`).
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct GroupConfiguration {
    pub voters: Vec<String>,
    pub learners: Vec<String>,
    pub new_voters: Option<Vec<String>>,
}

impl GroupConfiguration {
    pub fn new(voters: Vec<String>) -> Self {
        Self { voters, learners: Vec::new(), new_voters: None }
    }

    pub fn is_joint(&self) -> bool {
        self.new_voters.is_some()
    }

    pub fn has_quorum(&self, votes: &HashMap<String, bool>) -> bool {
        Self::quorum_over(&self.voters, votes) && self.new_voters.as_ref().map(|n| Self::quorum_over(n, votes)).unwrap_or(true)
    }

    fn quorum_over(members: &[String], votes: &HashMap<String, bool>) -> bool {
        if members.is_empty() {
            return true;
        }
        let yes = members.iter().filter(|m| votes.get(*m).copied().unwrap_or(false)).count();
        yes > members.len() / 2
    }
}

#[derive(Debug, Clone)]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<String>,
    pub log: Vec<LogEntry>,
    pub snapshot_last_index: LogIndex,
    pub snapshot_last_term: Term,
}

impl PersistentState {
    pub fn new() -> Self {
        Self { current_term: 0, voted_for: None, log: Vec::new(), snapshot_last_index: 0, snapshot_last_term: 0 }
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.log.last().map(|e| e.index).unwrap_or(self.snapshot_last_index)
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last().map(|e| e.term).unwrap_or(self.snapshot_last_term)
    }

    pub fn get_term(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return None;
        }
        if index <= self.snapshot_last_index {
            return if index == self.snapshot_last_index { Some(self.snapshot_last_term) } else { None };
        }
        let offset = (index - self.snapshot_last_index - 1) as usize;
        self.log.get(offset).map(|e| e.term)
    }

    pub fn get_entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index <= self.snapshot_last_index {
            return None;
        }
        let offset = (index - self.snapshot_last_index - 1) as usize;
        self.log.get(offset)
    }

    pub fn truncate_from(&mut self, index: LogIndex) {
        if index <= self.snapshot_last_index {
            self.log.clear();
            return;
        }
        let offset = (index - self.snapshot_last_index - 1) as usize;
        self.log.truncate(offset);
    }

    /// Compacts every entry up to and including `index` into the snapshot
    /// marker, dropping them from the in-memory log. `index` must already be
    /// committed; the caller is responsible for that check (§4.4 force-
    /// snapshot control command).
    pub fn compact_through(&mut self, index: LogIndex) {
        if index <= self.snapshot_last_index {
            return;
        }
        let Some(term) = self.get_term(index) else { return };
        let drop_count = (index - self.snapshot_last_index) as usize;
        if drop_count >= self.log.len() {
            self.log.clear();
        } else {
            self.log.drain(0..drop_count);
        }
        self.snapshot_last_index = index;
        self.snapshot_last_term = term;
    }
}

impl Default for PersistentState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct LeaderVolatileState {
    pub next_index: HashMap<NodeId, LogIndex>,
    pub match_index: HashMap<NodeId, LogIndex>,
    /// Timestamp (ms since leader became leader) each learner last caught up
    /// to within `learner_catchup_ms`, so the leader can decide when to
    /// promote a learner to voter (§4.4).
    pub learner_caught_up_at: HashMap<NodeId, u64>,
    pub pending_applies: VecDeque<LogIndex>,
}

impl LeaderVolatileState {
    pub fn new(peers: &[NodeId], last_log_index: LogIndex) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for peer in peers {
            next_index.insert(peer.clone(), last_log_index + 1);
            match_index.insert(peer.clone(), 0);
        }
        Self { next_index, match_index, learner_caught_up_at: HashMap::new(), pending_applies: VecDeque::new() }
    }

    /// Commit index is the highest index replicated to a majority (teacher:
    /// `LeaderState::calculate_commit_index`, median of match indices).
    pub fn majority_match_index(&self, current_commit: LogIndex) -> LogIndex {
        if self.match_index.is_empty() {
            return current_commit;
        }
        let mut indices: Vec<LogIndex> = self.match_index.values().copied().collect();
        indices.sort_unstable();
        let median = indices.len() / 2;
        indices.get(median).copied().unwrap_or(current_commit).max(current_commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_through_drops_entries_and_keeps_tail() {
        let mut state = PersistentState::new();
        for i in 1..=5 {
            state.log.push(LogEntry { term: 1, index: i, op_id: format!("op-{i}"), payload: vec![] });
        }
        state.compact_through(3);
        assert_eq!(state.snapshot_last_index, 3);
        assert_eq!(state.snapshot_last_term, 1);
        assert_eq!(state.log.len(), 2);
        assert_eq!(state.get_entry(4).map(|e| e.index), Some(4));
        assert_eq!(state.get_entry(3), None);
    }
}
