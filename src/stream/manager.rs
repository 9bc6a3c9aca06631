// Stream Manager (L5, §4.5): `Stream` CRUD proposed through MCG, per-stream
// monotonic sequence leasing, and the `Send`/`Subscribe`/`Ack` surface. The
// actual outbox/inbox storage lives in L6 (`delivery`); this module depends
// only on the `OutboxSink`/`InboxSource` traits so L5 and L6 don't form a
// module cycle — `Runtime` wires a concrete `delivery::DeliveryEngine` into
// both sides.
//
// Grounded in `streams/publisher.rs` / `streams/subscriber.rs` (publish/
// subscribe shape) and `networking/routing/queue.rs` (priority scheduling
// idiom, applied here to QoS class ordering rather than queue dequeue order).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::consensus::{ConsensusService, GroupId, ProposeOutcome};
use crate::error::{MeshError, Result};
use crate::identity::NodeId;

use super::types::{CommittedSeq, Envelope, QosClass, Stream, StreamId};

#[async_trait]
pub trait OutboxSink: Send + Sync {
    async fn enqueue(&self, stream: &Stream, message_id: String, seq: u64, payload: Vec<u8>, headers: HashMap<String, String>) -> Result<()>;
}

#[async_trait]
pub trait InboxSource: Send + Sync {
    /// Returns inbox rows for `stream_id` with `seq > after`, in ascending
    /// sequence order, up to `limit` rows.
    async fn read_after(&self, stream_id: &StreamId, after: u64, limit: usize) -> Result<Vec<Envelope>>;

    /// Garbage-collects inbox rows for `stream_id` at or below
    /// `committed_seq - retention_window` (§4.6 step 4).
    async fn gc(&self, stream_id: &StreamId, committed_seq: u64, retention_window: u64);
}

struct SequenceLease {
    next: AtomicU64,
    ceiling: AtomicU64,
}

pub struct StreamManager {
    local_node: NodeId,
    consensus: Arc<ConsensusService>,
    lease_batch: u64,
    streams: DashMap<StreamId, Stream>,
    leases: DashMap<StreamId, SequenceLease>,
    offsets: DashMap<(StreamId, NodeId), CommittedSeq>,
    outbox: Arc<dyn OutboxSink>,
    inbox: Arc<dyn InboxSource>,
    inbox_retention_window: u64,
}

impl StreamManager {
    pub fn new(
        local_node: NodeId,
        consensus: Arc<ConsensusService>,
        lease_batch: u64,
        outbox: Arc<dyn OutboxSink>,
        inbox: Arc<dyn InboxSource>,
        inbox_retention_window: u64,
    ) -> Self {
        Self {
            local_node,
            consensus,
            lease_batch,
            streams: DashMap::new(),
            leases: DashMap::new(),
            offsets: DashMap::new(),
            outbox,
            inbox,
            inbox_retention_window,
        }
    }

    /// `CreateStream(src, dst_set, qos, priority, meta) -> stream_id`,
    /// proposed through MCG; becomes visible everywhere on commit (§4.5).
    pub async fn create_stream(
        &self,
        tenant: String,
        source: NodeId,
        destinations: Vec<NodeId>,
        qos: QosClass,
        priority: i32,
        metadata: HashMap<String, String>,
    ) -> Result<StreamId> {
        let stream_id = StreamId(format!("strm_{}", Uuid::new_v4().simple()));
        let stream = Stream { stream_id: stream_id.clone(), tenant, source, destinations, qos, priority, metadata };

        let payload = serde_json::to_vec(&StreamOp::Create(stream.clone())).map_err(MeshError::from)?;
        let op_id = format!("create-{stream_id}");
        match self.consensus.propose(&GroupId::mcg(), op_id, payload).await? {
            ProposeOutcome::Committed { .. } => {
                self.apply_create(stream);
                Ok(stream_id)
            }
            ProposeOutcome::LeaderRedirect(leader) => Err(MeshError::LeaderRedirect(leader.to_string())),
            ProposeOutcome::TimedOut => Err(MeshError::TimedOut("CreateStream proposal".into())),
        }
    }

    /// Applies a committed `StreamOp` to local state. Called by the code
    /// that drains the MCG's apply channel (every ACTIVE node, including the
    /// proposer, learns about the stream this way).
    pub fn apply_create(&self, stream: Stream) {
        let last_log_index = 0u64;
        self.leases.insert(stream.stream_id.clone(), SequenceLease { next: AtomicU64::new(1), ceiling: AtomicU64::new(last_log_index) });
        self.streams.insert(stream.stream_id.clone(), stream);
    }

    pub fn get(&self, stream_id: &StreamId) -> Option<Stream> {
        self.streams.get(stream_id).map(|s| s.clone())
    }

    /// Assigns a per-stream monotonic sequence from a lease obtained in
    /// batches of `lease_batch` from MCG (§4.5), writes an outbox row, and
    /// returns. Does not wait for delivery.
    pub async fn send(&self, stream_id: &StreamId, payload: Vec<u8>, headers: HashMap<String, String>) -> Result<String> {
        self.send_with_id(stream_id, Uuid::new_v4().to_string(), payload, headers).await
    }

    /// Same as `send`, but the caller supplies `message_id` instead of a
    /// random one. Used by producers that need dedupable ids across
    /// restarts/re-sends of the same logical event — e.g. L8's CDC emitter,
    /// whose `message_id = hash(lsn, table, pk)` makes a re-read snapshot
    /// collapse to the same outbox row instead of a fresh one (§4.8
    /// "Emission").
    pub async fn send_with_id(&self, stream_id: &StreamId, message_id: String, payload: Vec<u8>, headers: HashMap<String, String>) -> Result<String> {
        let stream = self.streams.get(stream_id).map(|s| s.clone()).ok_or_else(|| MeshError::StreamUnknown(stream_id.to_string()))?;
        let seq = self.next_sequence(stream_id).await?;
        self.outbox.enqueue(&stream, message_id.clone(), seq, payload, headers).await?;
        Ok(message_id)
    }

    async fn next_sequence(&self, stream_id: &StreamId) -> Result<u64> {
        loop {
            {
                let lease = self.leases.get(stream_id).ok_or_else(|| MeshError::StreamUnknown(stream_id.to_string()))?;
                let next = lease.next.load(Ordering::SeqCst);
                if next <= lease.ceiling.load(Ordering::SeqCst) {
                    lease.next.fetch_add(1, Ordering::SeqCst);
                    return Ok(next);
                }
            }
            self.refill_lease(stream_id).await?;
        }
    }

    async fn refill_lease(&self, stream_id: &StreamId) -> Result<()> {
        let op_id = format!("lease-{stream_id}-{}", Uuid::new_v4());
        let payload = serde_json::to_vec(&StreamOp::LeaseSequence { stream_id: stream_id.clone(), batch: self.lease_batch }).map_err(MeshError::from)?;
        match self.consensus.propose(&GroupId::mcg(), op_id, payload).await? {
            ProposeOutcome::Committed { index, .. } => {
                let lease = self.leases.get(stream_id).ok_or_else(|| MeshError::StreamUnknown(stream_id.to_string()))?;
                let new_ceiling = index * self.lease_batch;
                if new_ceiling > lease.ceiling.load(Ordering::SeqCst) {
                    lease.ceiling.store(new_ceiling, Ordering::SeqCst);
                }
                Ok(())
            }
            ProposeOutcome::LeaderRedirect(leader) => Err(MeshError::LeaderRedirect(leader.to_string())),
            ProposeOutcome::TimedOut => Err(MeshError::TimedOut("sequence lease proposal".into())),
        }
    }

    /// Restartable read of committed messages after this node's current
    /// offset. The caller (L8 applier, or a direct subscriber) is expected
    /// to call `Ack` after successfully processing each batch.
    pub async fn subscribe(&self, stream_id: &StreamId, limit: usize) -> Result<Vec<Envelope>> {
        let after = self.offsets.get(&(stream_id.clone(), self.local_node.clone())).map(|s| s.0).unwrap_or(0);
        self.inbox.read_after(stream_id, after, limit).await
    }

    /// Advances `committed_seq` for this node and garbage-collects inbox
    /// rows below the retention window (§4.6 step 4).
    pub async fn ack(&self, stream_id: &StreamId, up_to_seq: u64) {
        self.offsets.insert((stream_id.clone(), self.local_node.clone()), CommittedSeq(up_to_seq));
        self.inbox.gc(stream_id, up_to_seq, self.inbox_retention_window).await;
    }

    pub fn committed_seq(&self, stream_id: &StreamId, node: &NodeId) -> u64 {
        self.offsets.get(&(stream_id.clone(), node.clone())).map(|s| s.0).unwrap_or(0)
    }

    pub fn set_committed_seq(&self, stream_id: &StreamId, node: NodeId, seq: u64) {
        self.offsets.insert((stream_id.clone(), node), CommittedSeq(seq));
    }
}

/// Operations proposed through MCG that mutate stream metadata (§4.5's
/// "proposed through MCG; becomes visible everywhere on commit").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum StreamOp {
    Create(Stream),
    LeaseSequence { stream_id: StreamId, batch: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::node::RaftTransport;
    use crate::consensus::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct NoopTransport;
    #[async_trait]
    impl RaftTransport for NoopTransport {
        async fn send_vote_request(&self, _peer: &NodeId, _req: VoteRequest) -> Result<VoteResponse> {
            Err(MeshError::NoRoute("noop".into()))
        }
        async fn send_append_entries(&self, _peer: &NodeId, _req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
            Err(MeshError::NoRoute("noop".into()))
        }
    }

    struct MemOutbox(Mutex<Vec<(String, u64, Vec<u8>)>>);
    #[async_trait]
    impl OutboxSink for MemOutbox {
        async fn enqueue(&self, _stream: &Stream, message_id: String, seq: u64, payload: Vec<u8>, _headers: HashMap<String, String>) -> Result<()> {
            self.0.lock().await.push((message_id, seq, payload));
            Ok(())
        }
    }

    struct MemInbox;
    #[async_trait]
    impl InboxSource for MemInbox {
        async fn read_after(&self, _stream_id: &StreamId, _after: u64, _limit: usize) -> Result<Vec<Envelope>> {
            Ok(vec![])
        }
        async fn gc(&self, _stream_id: &StreamId, _committed_seq: u64, _retention_window: u64) {}
    }

    async fn single_node_manager() -> (Arc<StreamManager>, NodeId) {
        let n1 = NodeId::from_string("node_n1aaaaaaaaaaaaaaaaaaaa".into()).unwrap();
        let transport = Arc::new(NoopTransport);
        let consensus = Arc::new(ConsensusService::new(n1.clone(), transport, Duration::from_millis(150), Duration::from_millis(300), Duration::from_millis(50), Duration::from_secs(1), 10_000));
        let mut apply_rx = consensus.bootstrap_mcg(vec![n1.clone()]).await;
        // A single-voter group self-commits without an election (see
        // `handle_propose`'s `voters.len() == 1` fast path), so tests don't
        // need to wait for a leader.
        let outbox = Arc::new(MemOutbox(Mutex::new(Vec::new())));
        let inbox = Arc::new(MemInbox);
        let manager = Arc::new(StreamManager::new(n1.clone(), consensus, 10, outbox, inbox, 1000));

        let manager_apply = manager.clone();
        tokio::spawn(async move {
            while let Some(entry) = apply_rx.recv().await {
                if let Ok(op) = serde_json::from_slice::<StreamOp>(&entry.payload) {
                    match op {
                        StreamOp::Create(stream) => manager_apply.apply_create(stream),
                        StreamOp::LeaseSequence { .. } => {}
                    }
                }
            }
        });

        (manager, n1)
    }

    #[tokio::test]
    async fn create_stream_then_send_assigns_sequence() {
        let (manager, n1) = single_node_manager().await;
        let stream_id = manager.create_stream("tenant-a".into(), n1.clone(), vec![n1.clone()], QosClass::Normal, 0, HashMap::new()).await.unwrap();
        let id1 = manager.send(&stream_id, b"hello".to_vec(), HashMap::new()).await.unwrap();
        let id2 = manager.send(&stream_id, b"world".to_vec(), HashMap::new()).await.unwrap();
        assert_ne!(id1, id2);
    }

    #[tokio::test]
    async fn ack_advances_committed_seq() {
        let (manager, n1) = single_node_manager().await;
        let stream_id = manager.create_stream("tenant-a".into(), n1.clone(), vec![n1.clone()], QosClass::Normal, 0, HashMap::new()).await.unwrap();
        assert_eq!(manager.committed_seq(&stream_id, &n1), 0);
        manager.ack(&stream_id, 5).await;
        assert_eq!(manager.committed_seq(&stream_id, &n1), 5);
    }
}
