// Stream entity, QoS classes, and per-destination offsets (§3 Stream /
// StreamOffset, §4.5).

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QosClass {
    /// Ordered highest-to-lowest so derived `Ord` gives CRITICAL the highest
    /// rank, matching "CRITICAL preempts HIGH on sender side" (§4.5).
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamId(pub String);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::hash::Hash for StreamId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub stream_id: StreamId,
    pub tenant: String,
    pub source: NodeId,
    pub destinations: Vec<NodeId>,
    pub qos: QosClass,
    pub priority: i32,
    pub metadata: std::collections::HashMap<String, String>,
}

/// (stream_id, node_id) -> largest contiguously-committed sequence for that
/// destination (§3 StreamOffset).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommittedSeq(pub u64);

#[derive(Debug, Clone)]
pub struct Envelope {
    pub stream_id: StreamId,
    pub message_id: String,
    pub seq: u64,
    pub payload: Vec<u8>,
    pub headers: std::collections::HashMap<String, String>,
}
