// Change event model, relationship lifecycle, and cursor shape (§4.8).
// Grounded in `streams/cdc.rs`'s `ChangeType`/`ChangeEvent` (table/op/
// before-after image/lsn model carries over near-exactly) generalized from a
// WAL-tailing engine to a source-agnostic, externally-driven event shape.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::identity::NodeId;
use crate::stream::StreamId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// How the upstream catalog obtains change events. Chosen by the catalog
/// layer outside this crate (SPEC_FULL.md §3 Open Question 3); this crate
/// only needs to know it to label the relationship, not to implement it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CdcMechanism {
    LogicalReplication,
    TriggerBased,
    Polling,
    External,
}

/// A row-change event read from a `ReplicationSource`. `lsn` is an opaque,
/// source-defined, monotonically-increasing cursor token (log sequence
/// number, binlog position, whatever the source speaks).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub lsn: String,
    pub table: String,
    pub op: ChangeType,
    pub primary_key: Vec<(String, Value)>,
    pub before: Option<HashMap<String, Value>>,
    pub after: Option<HashMap<String, Value>>,
    pub commit_ts: i64,
}

impl ChangeEvent {
    /// Deterministic message id so the same source event always maps to the
    /// same mesh message id, making the stream-layer dedupe (by `seq`) line
    /// up with re-reads of the same source position after a restart (§4.8,
    /// §3 Open Question 3's sibling: deterministic CDC message ids).
    pub fn message_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.lsn.as_bytes());
        hasher.update(self.table.as_bytes());
        for (col, val) in &self.primary_key {
            hasher.update(col.as_bytes());
            hasher.update(val.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Opaque cursor persisted via the catalog adapter's `cdc_position`/
/// `cdc_state` columns (§6). This crate treats both as blobs it carries,
/// never interprets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CdcCursor {
    pub cdc_position: String,
    pub cdc_state: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipState {
    Initializing,
    Streaming,
    Degraded { reason: String },
    Paused,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct RelationshipId(pub String);

impl std::fmt::Display for RelationshipId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One configured source-to-target change feed (§4.8's `Relationship`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelationshipId,
    pub tenant: String,
    pub mechanism: CdcMechanism,
    pub source_table: String,
    pub target_table: String,
    pub owner: NodeId,
    pub state: RelationshipState,
    /// The one mesh stream this relationship emits transformed events onto
    /// (§4.8 "one stream per relationship"). Created ahead of `start` via
    /// `StreamManager::create_stream`.
    pub stream_id: StreamId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// The mapping couldn't resolve this event yet (e.g. a lookup dependency
    /// hasn't arrived); dead-letter and keep the cursor moving (§4.8).
    Unresolved(String),
    /// The mapping itself is broken and will never resolve; moves the
    /// relationship to `Degraded` (§4.8).
    Fatal(String),
}
