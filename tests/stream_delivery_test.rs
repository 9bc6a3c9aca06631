// Stream + delivery integration, single sole-voter MCG so proposals commit
// without an election (see `consensus::node::RaftGroup`'s single-voter fast
// path) — the interesting behavior under test is L5/L6, not L4.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redb_mesh::consensus::{AppendEntriesRequest, AppendEntriesResponse, ConsensusService, RaftTransport, VoteRequest, VoteResponse};
use redb_mesh::delivery::{DeliveryConfig, DeliveryEngine};
use redb_mesh::error::{MeshError, Result};
use redb_mesh::identity::{IdentityService, NodeId};
use redb_mesh::link::LinkManager;
use redb_mesh::stream::{OutboxSink, QosClass, Stream, StreamId, StreamManager, StreamOp};
use redb_mesh::topology::TopologyService;

struct DeadEndTransport;
#[async_trait]
impl RaftTransport for DeadEndTransport {
    async fn send_vote_request(&self, _peer: &NodeId, _req: VoteRequest) -> Result<VoteResponse> {
        Err(MeshError::NoRoute("no peers in this test mesh".into()))
    }
    async fn send_append_entries(&self, _peer: &NodeId, _req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        Err(MeshError::NoRoute("no peers in this test mesh".into()))
    }
}

fn node(s: &str) -> NodeId {
    NodeId::from_string(format!("node_{s}")).unwrap()
}

async fn single_node_stack(tmp: &tempfile::TempDir) -> (NodeId, Arc<StreamManager>, Arc<DeliveryEngine>) {
    let local = node("local000000000000000a");
    let identity = Arc::new(IdentityService::open(tmp.path(), b"integration-test-pass").unwrap());
    let links = LinkManager::spawn(identity, 1 << 20, 0);
    let topology = Arc::new(TopologyService::new(local.clone(), 0.5, 0.1));
    let delivery = DeliveryEngine::new(local.clone(), links, topology, DeliveryConfig { outbox_high_watermark: 100, ..DeliveryConfig::default() });

    let transport = Arc::new(DeadEndTransport);
    let consensus = Arc::new(ConsensusService::new(
        local.clone(),
        transport,
        Duration::from_millis(150),
        Duration::from_millis(300),
        Duration::from_millis(50),
        Duration::from_secs(1),
        10_000,
    ));
    let mut apply_rx = consensus.bootstrap_mcg(vec![local.clone()]).await;

    let manager = Arc::new(StreamManager::new(local.clone(), consensus, 10, delivery.clone(), delivery.clone(), 1_000));
    let manager_apply = manager.clone();
    tokio::spawn(async move {
        while let Some(entry) = apply_rx.recv().await {
            if let Ok(StreamOp::Create(stream)) = serde_json::from_slice::<StreamOp>(&entry.payload) {
                manager_apply.apply_create(stream);
            }
        }
    });

    (local, manager, delivery)
}

#[tokio::test]
async fn self_addressed_stream_delivers_in_order_and_acks_clear_the_inbox() {
    let tmp = tempfile::tempdir().unwrap();
    let (local, manager, _delivery) = single_node_stack(&tmp).await;

    let stream_id = manager
        .create_stream("tenant-a".into(), local.clone(), vec![local.clone()], QosClass::Normal, 0, HashMap::new())
        .await
        .unwrap();

    manager.send(&stream_id, b"hello".to_vec(), HashMap::new()).await.unwrap();
    manager.send(&stream_id, b"world".to_vec(), HashMap::new()).await.unwrap();

    let received = manager.subscribe(&stream_id, 10).await.unwrap();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].seq, 1);
    assert_eq!(received[0].payload, b"hello");
    assert_eq!(received[1].seq, 2);
    assert_eq!(received[1].payload, b"world");

    assert_eq!(manager.committed_seq(&stream_id, &local), 0);
    manager.ack(&stream_id, 2).await;
    assert_eq!(manager.committed_seq(&stream_id, &local), 2);

    // Nothing left to read after acking past the last sequence.
    assert!(manager.subscribe(&stream_id, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn outbox_backpressure_trips_at_the_configured_watermark() {
    let tmp = tempfile::tempdir().unwrap();
    let (local, manager, delivery) = single_node_stack(&tmp).await;

    let dest = node("dest00000000000000000a");
    let stream_id = manager
        .create_stream("tenant-a".into(), local.clone(), vec![dest.clone()], QosClass::Normal, 0, HashMap::new())
        .await
        .unwrap();
    let stream = manager.get(&stream_id).unwrap();

    for i in 0..100u64 {
        delivery.enqueue(&stream, format!("m{i}"), i + 1, vec![], HashMap::new()).await.unwrap();
    }

    let err = delivery.enqueue(&stream, "m100".into(), 101, vec![], HashMap::new()).await.unwrap_err();
    assert!(matches!(err, MeshError::Backpressure(_)));
}
