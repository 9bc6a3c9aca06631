// Bridges the CDC relationship runtime onto the mesh stream fabric (§4.8
// "Emission" / "Application at target"). `CdcRuntime` on its own only knows
// how to read a source and hand mapped events to *some* `TargetApplier`; the
// two pieces here are what make that applier mean "the mesh", not "the
// local process" — `StreamEmitter` turns it into a `Send` onto the
// relationship's stream, and `StreamApplierWorker` is the independent
// subscriber loop that turns received envelopes back into calls against the
// catalog-supplied applier that actually writes the target table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{MeshError, Result};
use crate::stream::{StreamId, StreamManager};

use super::applier::{group_by_commit_bracket, TargetApplier};
use super::types::ChangeEvent;

/// `TargetApplier` that never touches a target table: it serializes each
/// mapped event and `Send`s it on the relationship's stream, keyed by
/// `ChangeEvent::message_id()` so a re-read source snapshot collapses onto
/// the same outbox row instead of duplicating it (§4.8 "Emission").
/// `CdcRuntime` is pointed at one of these instead of the real applier; the
/// real applier lives on the other end, driven by `StreamApplierWorker`.
pub struct StreamEmitter {
    stream_manager: Arc<StreamManager>,
    stream_id: StreamId,
}

impl StreamEmitter {
    pub fn new(stream_manager: Arc<StreamManager>, stream_id: StreamId) -> Self {
        Self { stream_manager, stream_id }
    }
}

#[async_trait]
impl TargetApplier for StreamEmitter {
    async fn apply_batch(&self, _target_table: &str, events: &[ChangeEvent]) -> Result<()> {
        for event in events {
            let message_id = event.message_id();
            let payload = serde_json::to_vec(event).map_err(MeshError::from)?;
            self.stream_manager.send_with_id(&self.stream_id, message_id, payload, HashMap::new()).await?;
        }
        Ok(())
    }
}

/// Target-side half of §4.8: subscribes to the relationship's stream,
/// regroups the received envelopes into commit-brackets (the bracketing the
/// source side already did doesn't survive the outbox/inbox hop, since
/// inbox rows are keyed by sequence, not by bracket), and calls the real
/// `TargetApplier` the catalog layer supplied. `Ack`s the highest sequence
/// in a batch only after every bracket in it applies, matching §4.6 step 4's
/// "on successful application, calls `Ack`".
pub struct StreamApplierWorker {
    shutdown: Notify,
}

impl StreamApplierWorker {
    pub fn spawn(
        stream_manager: Arc<StreamManager>,
        stream_id: StreamId,
        target_table: String,
        applier: Arc<dyn TargetApplier>,
        poll_interval: Duration,
        batch_size: usize,
    ) -> Arc<Self> {
        let worker = Arc::new(Self { shutdown: Notify::new() });
        let task_worker = worker.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_worker.shutdown.notified() => return,
                    _ = tokio::time::sleep(poll_interval) => {}
                }

                let envelopes = match stream_manager.subscribe(&stream_id, batch_size).await {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::warn!(stream = %stream_id, error = %e, "CDC applier subscribe failed, retrying next tick");
                        continue;
                    }
                };
                if envelopes.is_empty() {
                    continue;
                }

                let mut events = Vec::with_capacity(envelopes.len());
                let mut last_seq = 0u64;
                for env in &envelopes {
                    match serde_json::from_slice::<ChangeEvent>(&env.payload) {
                        Ok(event) => events.push(event),
                        Err(e) => {
                            tracing::error!(stream = %stream_id, message_id = %env.message_id, error = %e, "CDC envelope failed to deserialize, skipping");
                        }
                    }
                    last_seq = last_seq.max(env.seq);
                }

                let mut apply_failed = false;
                for bracket in group_by_commit_bracket(events) {
                    if let Err(e) = applier.apply_batch(&target_table, &bracket).await {
                        tracing::warn!(stream = %stream_id, error = %e, "CDC target apply failed, will retry on next poll");
                        apply_failed = true;
                        break;
                    }
                }
                if apply_failed {
                    continue;
                }
                stream_manager.ack(&stream_id, last_seq).await;
            }
        });
        worker
    }

    pub fn stop(&self) {
        self.shutdown.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::types::ChangeType;
    use crate::consensus::node::RaftTransport;
    use crate::consensus::{AppendEntriesRequest, AppendEntriesResponse, ConsensusService, VoteRequest, VoteResponse};
    use crate::delivery::{DeliveryConfig, DeliveryEngine};
    use crate::identity::NodeId;
    use crate::link::LinkManager;
    use crate::stream::QosClass;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

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

    struct CountingApplier(Arc<AtomicUsize>);
    #[async_trait]
    impl TargetApplier for CountingApplier {
        async fn apply_batch(&self, _target_table: &str, events: &[ChangeEvent]) -> Result<()> {
            self.0.fetch_add(events.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    fn event(lsn: &str, commit_ts: i64) -> ChangeEvent {
        ChangeEvent { lsn: lsn.into(), table: "accounts".into(), op: ChangeType::Insert, primary_key: vec![], before: None, after: None, commit_ts }
    }

    #[tokio::test]
    async fn emitter_and_applier_worker_round_trip_through_the_stream() {
        let n1 = NodeId::from_string("node_n1aaaaaaaaaaaaaaaaaaaa".into()).unwrap();
        let identity = Arc::new(crate::identity::IdentityService::open(tempfile::tempdir().unwrap().path(), b"pw").unwrap());
        let links = LinkManager::spawn(identity.clone(), 1 << 20, 1);
        let topology = Arc::new(crate::topology::TopologyService::new(n1.clone(), 0.3, 0.1));

        let transport = Arc::new(NoopTransport);
        let consensus = Arc::new(ConsensusService::new(n1.clone(), transport, Duration::from_millis(150), Duration::from_millis(300), Duration::from_millis(50), Duration::from_secs(1), 10_000));
        let mut apply_rx = consensus.bootstrap_mcg(vec![n1.clone()]).await;

        let delivery = DeliveryEngine::new(n1.clone(), links, topology, DeliveryConfig {
            ack_timeout_ms: 1_000,
            backoff_base_ms: 50,
            backoff_cap_ms: 500,
            max_permanent_attempts: 5,
            outbox_high_watermark: 1_000,
            sender_tick_ms: 10,
        });
        delivery.spawn(std::iter::empty());

        let manager = Arc::new(StreamManager::new(n1.clone(), consensus, 10, delivery.clone(), delivery.clone(), 1_000));
        let manager_apply = manager.clone();
        tokio::spawn(async move {
            while let Some(entry) = apply_rx.recv().await {
                if let Ok(crate::stream::StreamOp::Create(stream)) = serde_json::from_slice(&entry.payload) {
                    manager_apply.apply_create(stream);
                }
            }
        });

        let stream_id = manager.create_stream("tenant-a".into(), n1.clone(), vec![n1.clone()], QosClass::Normal, 0, HashMap::new()).await.unwrap();

        let emitter = StreamEmitter::new(manager.clone(), stream_id.clone());
        emitter.apply_batch("accounts_replica", &[event("1", 10), event("2", 10), event("3", 11)]).await.unwrap();

        let applied = Arc::new(AtomicUsize::new(0));
        let worker = StreamApplierWorker::spawn(
            manager.clone(),
            stream_id.clone(),
            "accounts_replica".into(),
            Arc::new(CountingApplier(applied.clone())),
            Duration::from_millis(5),
            64,
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(applied.load(Ordering::SeqCst), 3);
        assert_eq!(manager.committed_seq(&stream_id, &n1), 3);
        worker.stop();
    }
}
