// Catalog DB Adapter (§6): the trait-only interface this crate *consumes*
// for durable state — the mesh's control-plane tables live in the catalog
// database, not in this crate. No real implementation ships here; the
// catalog layer outside this crate provides one, and `InMemoryCatalog`
// below exists only to back tests.
//
// Grounded in `catalog/mod.rs`'s schema/table trait shape, generalized from
// a DB schema catalog into a transactional row-store trait over the six
// named tables.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RaftLogRow {
    pub group_id: String,
    pub index: u64,
    pub term: u64,
    pub op_id: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub stream_id: String,
    pub message_id: String,
    pub dest_node: String,
    pub seq: u64,
    pub payload: Vec<u8>,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct InboxRow {
    pub stream_id: String,
    pub message_id: String,
    pub seq: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DeliveryLogRow {
    pub stream_id: String,
    pub message_id: String,
    pub dest_node: String,
    pub state: String,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StreamOffsetRow {
    pub stream_id: String,
    pub node_id: String,
    pub committed_seq: u64,
}

#[derive(Debug, Clone)]
pub struct TopologySnapshotRow {
    pub version: u64,
    pub payload: Vec<u8>,
}

/// Transactional access to the six mesh control-plane tables the catalog
/// database owns (§6). Every write is keyed so a retried write with the
/// same key is an overwrite, not a duplicate — the idempotence guarantees
/// in §4.4/§4.6 assume this.
#[async_trait]
pub trait CatalogAdapter: Send + Sync {
    async fn append_raft_log(&self, row: RaftLogRow) -> Result<()>;
    async fn load_raft_log(&self, group_id: &str) -> Result<Vec<RaftLogRow>>;
    async fn truncate_raft_log_from(&self, group_id: &str, index: u64) -> Result<()>;

    async fn upsert_outbox(&self, row: OutboxRow) -> Result<()>;
    async fn delete_outbox(&self, stream_id: &str, message_id: &str) -> Result<()>;
    async fn load_outbox(&self, dest_node: &str) -> Result<Vec<OutboxRow>>;

    async fn upsert_inbox(&self, row: InboxRow) -> Result<()>;
    async fn load_inbox_after(&self, stream_id: &str, after_seq: u64, limit: usize) -> Result<Vec<InboxRow>>;
    async fn gc_inbox(&self, stream_id: &str, floor_seq: u64) -> Result<()>;

    async fn append_delivery_log(&self, row: DeliveryLogRow) -> Result<()>;
    async fn load_delivery_log(&self, stream_id: &str, message_id: &str) -> Result<Vec<DeliveryLogRow>>;

    async fn upsert_stream_offset(&self, row: StreamOffsetRow) -> Result<()>;
    async fn load_stream_offset(&self, stream_id: &str, node_id: &str) -> Result<Option<StreamOffsetRow>>;

    async fn save_topology_snapshot(&self, row: TopologySnapshotRow) -> Result<()>;
    async fn load_latest_topology_snapshot(&self) -> Result<Option<TopologySnapshotRow>>;
}

#[derive(Default)]
struct InMemoryState {
    raft_log: HashMap<String, Vec<RaftLogRow>>,
    outbox: HashMap<(String, String), OutboxRow>,
    inbox: HashMap<String, std::collections::BTreeMap<u64, InboxRow>>,
    delivery_log: Vec<DeliveryLogRow>,
    stream_offsets: HashMap<(String, String), StreamOffsetRow>,
    topology_snapshots: Vec<TopologySnapshotRow>,
}

/// In-memory `CatalogAdapter` used by tests and single-process demos. Never
/// intended as a production implementation — no durability, no transactions
/// across tables.
#[derive(Default)]
pub struct InMemoryCatalog {
    state: RwLock<InMemoryState>,
}

impl InMemoryCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl CatalogAdapter for InMemoryCatalog {
    async fn append_raft_log(&self, row: RaftLogRow) -> Result<()> {
        self.state.write().await.raft_log.entry(row.group_id.clone()).or_default().push(row);
        Ok(())
    }

    async fn load_raft_log(&self, group_id: &str) -> Result<Vec<RaftLogRow>> {
        Ok(self.state.read().await.raft_log.get(group_id).cloned().unwrap_or_default())
    }

    async fn truncate_raft_log_from(&self, group_id: &str, index: u64) -> Result<()> {
        if let Some(log) = self.state.write().await.raft_log.get_mut(group_id) {
            log.retain(|row| row.index < index);
        }
        Ok(())
    }

    async fn upsert_outbox(&self, row: OutboxRow) -> Result<()> {
        let key = (row.stream_id.clone(), row.message_id.clone());
        self.state.write().await.outbox.insert(key, row);
        Ok(())
    }

    async fn delete_outbox(&self, stream_id: &str, message_id: &str) -> Result<()> {
        self.state.write().await.outbox.remove(&(stream_id.to_string(), message_id.to_string()));
        Ok(())
    }

    async fn load_outbox(&self, dest_node: &str) -> Result<Vec<OutboxRow>> {
        Ok(self.state.read().await.outbox.values().filter(|r| r.dest_node == dest_node).cloned().collect())
    }

    async fn upsert_inbox(&self, row: InboxRow) -> Result<()> {
        let mut state = self.state.write().await;
        state.inbox.entry(row.stream_id.clone()).or_default().insert(row.seq, row);
        Ok(())
    }

    async fn load_inbox_after(&self, stream_id: &str, after_seq: u64, limit: usize) -> Result<Vec<InboxRow>> {
        let state = self.state.read().await;
        Ok(state
            .inbox
            .get(stream_id)
            .map(|rows| rows.range((after_seq + 1)..).take(limit).map(|(_, r)| r.clone()).collect())
            .unwrap_or_default())
    }

    async fn gc_inbox(&self, stream_id: &str, floor_seq: u64) -> Result<()> {
        if let Some(rows) = self.state.write().await.inbox.get_mut(stream_id) {
            *rows = rows.split_off(&floor_seq);
        }
        Ok(())
    }

    async fn append_delivery_log(&self, row: DeliveryLogRow) -> Result<()> {
        self.state.write().await.delivery_log.push(row);
        Ok(())
    }

    async fn load_delivery_log(&self, stream_id: &str, message_id: &str) -> Result<Vec<DeliveryLogRow>> {
        Ok(self
            .state
            .read()
            .await
            .delivery_log
            .iter()
            .filter(|r| r.stream_id == stream_id && r.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn upsert_stream_offset(&self, row: StreamOffsetRow) -> Result<()> {
        let key = (row.stream_id.clone(), row.node_id.clone());
        self.state.write().await.stream_offsets.insert(key, row);
        Ok(())
    }

    async fn load_stream_offset(&self, stream_id: &str, node_id: &str) -> Result<Option<StreamOffsetRow>> {
        Ok(self.state.read().await.stream_offsets.get(&(stream_id.to_string(), node_id.to_string())).cloned())
    }

    async fn save_topology_snapshot(&self, row: TopologySnapshotRow) -> Result<()> {
        self.state.write().await.topology_snapshots.push(row);
        Ok(())
    }

    async fn load_latest_topology_snapshot(&self) -> Result<Option<TopologySnapshotRow>> {
        Ok(self.state.read().await.topology_snapshots.last().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outbox_round_trips() {
        let catalog = InMemoryCatalog::new();
        catalog.upsert_outbox(OutboxRow { stream_id: "s1".into(), message_id: "m1".into(), dest_node: "n1".into(), seq: 1, payload: vec![1, 2, 3], status: "pending".into() }).await.unwrap();
        let rows = catalog.load_outbox("n1").await.unwrap();
        assert_eq!(rows.len(), 1);
        catalog.delete_outbox("s1", "m1").await.unwrap();
        assert!(catalog.load_outbox("n1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn raft_log_truncation_drops_entries_at_and_after_index() {
        let catalog = InMemoryCatalog::new();
        for i in 0..5 {
            catalog.append_raft_log(RaftLogRow { group_id: "mcg".into(), index: i, term: 1, op_id: format!("op-{i}"), payload: vec![] }).await.unwrap();
        }
        catalog.truncate_raft_log_from("mcg", 3).await.unwrap();
        let log = catalog.load_raft_log("mcg").await.unwrap();
        assert_eq!(log.len(), 3);
    }
}
