// Delivery Engine (L6, §4.6): the hardest subsystem per the grounding
// ledger. Owns the outbox/inbox/delivery-log state machine, runs one sender
// loop per known destination and a single receiver loop draining inbound
// DATA/ACK frames from the link layer, and implements the `OutboxSink` /
// `InboxSource` traits `StreamManager` depends on.
//
// Grounded in `networking/routing/delivery.rs` (per-destination delivery
// state machine) and `networking/routing/dispatcher.rs` (dispatch loop
// shape); backoff/jitter grounded in `replication/slots/manager.rs`'s retry
// handling.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashSet;
use tokio::sync::broadcast;

use crate::error::{MeshError, Result};
use crate::identity::NodeId;
use crate::link::manager::LinkManagerHandle;
use crate::link::{FrameType, LinkEvent};
use crate::stream::{Envelope, InboxSource, OutboxSink, QosClass, Stream, StreamId};
use crate::topology::TopologyService;

use super::inbox::Inbox;
use super::outbox::Outbox;
use super::types::{now_millis, backoff_delay_ms, AckResult, AckWireMsg, DataWireMsg, DeliveryLogEntry, DeliveryState, InboxEntry, OutboxEntry};

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub ack_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub max_permanent_attempts: u32,
    pub outbox_high_watermark: usize,
    pub sender_tick_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self { ack_timeout_ms: 5_000, backoff_base_ms: 200, backoff_cap_ms: 30_000, max_permanent_attempts: 5, outbox_high_watermark: 10_000, sender_tick_ms: 50 }
    }
}

pub fn logical_stream_id(stream_id: &StreamId) -> u64 {
    let mut hasher = DefaultHasher::new();
    stream_id.0.hash(&mut hasher);
    hasher.finish()
}

pub struct DeliveryEngine {
    local_node: NodeId,
    links: LinkManagerHandle,
    topology: Arc<TopologyService>,
    config: DeliveryConfig,
    outbox: Outbox,
    inbox: Inbox,
    delivery_log: dashmap::DashMap<(StreamId, String, NodeId), DeliveryLogEntry>,
    senders_started: DashSet<NodeId>,
    shutdown: AtomicBool,
}

impl DeliveryEngine {
    pub fn new(local_node: NodeId, links: LinkManagerHandle, topology: Arc<TopologyService>, config: DeliveryConfig) -> Arc<Self> {
        Arc::new(Self {
            local_node,
            links,
            topology,
            config,
            outbox: Outbox::new(),
            inbox: Inbox::new(),
            delivery_log: dashmap::DashMap::new(),
            senders_started: DashSet::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Starts the single receiver loop (one process-wide task draining
    /// inbound DATA/ACK frames) and, per §5, the per-destination sender
    /// loops for `known_destinations`.
    pub fn spawn(self: &Arc<Self>, known_destinations: impl IntoIterator<Item = NodeId>) {
        let engine = self.clone();
        let rx = self.links.subscribe();
        tokio::spawn(run_receiver(engine, rx));

        for dest in known_destinations {
            self.ensure_sender(dest);
        }
    }

    /// Lazily starts a sender loop for a destination discovered after
    /// `spawn` (e.g. a stream created with a previously-unseen destination).
    pub fn ensure_sender(self: &Arc<Self>, dest: NodeId) {
        if dest == self.local_node {
            return;
        }
        if self.senders_started.insert(dest.clone()) {
            let engine = self.clone();
            tokio::spawn(run_sender(engine, dest));
        }
    }

    fn set_log_state(&self, stream_id: &StreamId, message_id: &str, dest: &NodeId, state: DeliveryState, last_error: Option<String>) {
        self.delivery_log.insert(
            (stream_id.clone(), message_id.to_string(), dest.clone()),
            DeliveryLogEntry { stream_id: stream_id.clone(), message_id: message_id.to_string(), dst_node: dest.clone(), state, last_error, updated_ms: now_millis() },
        );
    }

    pub fn delivery_state(&self, stream_id: &StreamId, message_id: &str, dest: &NodeId) -> Option<DeliveryState> {
        self.delivery_log.get(&(stream_id.clone(), message_id.to_string(), dest.clone())).map(|e| e.state)
    }

    /// All delivery-log rows for one message, across every destination —
    /// the introspection surface's per-message drill-down (§6).
    pub fn delivery_log_for(&self, stream_id: &StreamId, message_id: &str) -> Vec<DeliveryLogEntry> {
        self.delivery_log
            .iter()
            .filter(|e| e.stream_id == *stream_id && e.message_id == message_id)
            .map(|e| e.clone())
            .collect()
    }

    async fn handle_inbound_data(&self, origin: NodeId, msg: DataWireMsg) {
        let stream_id = StreamId(msg.stream_id.clone());
        let entry = InboxEntry { stream_id: stream_id.clone(), message_id: msg.message_id.clone(), seq: msg.seq, payload: msg.payload, headers: msg.headers, received_ms: now_millis(), processed_ms: None };
        let is_new = self.inbox.insert_if_absent(entry).await;

        let result = if is_new { AckResult::Ok } else { AckResult::Duplicate };
        let ack = AckWireMsg { stream_id: msg.stream_id, message_id: msg.message_id, seq: msg.seq, result, reason: None };
        self.send_ack(&origin, ack).await;
    }

    async fn send_ack(&self, to: &NodeId, ack: AckWireMsg) {
        let Some(link) = self.links.link_to(to).await else { return };
        let Ok(bytes) = bincode::encode_to_vec(&ack, bincode::config::standard()) else { return };
        let lsid = logical_stream_id(&StreamId(ack.stream_id));
        let _ = link.send_frame(FrameType::Ack, lsid, BytesMut::from(&bytes[..])).await;
    }

    fn handle_inbound_ack(&self, from: NodeId, ack: AckWireMsg) {
        let stream_id = StreamId(ack.stream_id);
        match ack.result {
            AckResult::Ok | AckResult::Duplicate => {
                self.set_log_state(&stream_id, &ack.message_id, &from, DeliveryState::Done, None);
                self.outbox.retire_destination(&stream_id, &ack.message_id, &from);
            }
            AckResult::Permanent => {
                self.set_log_state(&stream_id, &ack.message_id, &from, DeliveryState::Cancelled, ack.reason.clone());
                self.outbox.retire_destination(&stream_id, &ack.message_id, &from);
                tracing::warn!(%stream_id, message_id = %ack.message_id, dest = %from, reason = ?ack.reason, "delivery cancelled: permanent error");
            }
            AckResult::Transient => {
                let attempts = self.outbox.attempts_for(&stream_id, &ack.message_id, &from);
                if attempts >= self.config.max_permanent_attempts {
                    self.set_log_state(&stream_id, &ack.message_id, &from, DeliveryState::Cancelled, ack.reason.clone());
                    self.outbox.retire_destination(&stream_id, &ack.message_id, &from);
                    tracing::warn!(%stream_id, message_id = %ack.message_id, dest = %from, attempts, "delivery cancelled after repeated transient failures");
                } else {
                    let delay = backoff_delay_ms(attempts, self.config.backoff_base_ms, self.config.backoff_cap_ms);
                    self.outbox.mark_attempted(&stream_id, &ack.message_id, &from, now_millis() + delay);
                    self.set_log_state(&stream_id, &ack.message_id, &from, DeliveryState::Failed, ack.reason.clone());
                }
            }
        }
    }

    /// One sweep of the sender loop for `dest`: dequeue due rows, resolve a
    /// next hop via L3, and write a DATA frame via L2 (§4.6 step 2-3).
    async fn drive_destination_once(&self, dest: &NodeId) {
        for row in self.outbox.due_for_destination(dest, 64) {
            let next_hop = match self.topology.next_hop(dest, row.qos).await {
                Ok(hop) => hop,
                Err(_) => {
                    // No route yet; leave PENDING, retried on next LSA change
                    // or the next tick once backoff elapses again.
                    let delay = backoff_delay_ms(self.outbox.attempts_for(&row.stream_id, &row.message_id, dest), self.config.backoff_base_ms, self.config.backoff_cap_ms);
                    self.outbox.mark_attempted(&row.stream_id, &row.message_id, dest, now_millis() + delay);
                    continue;
                }
            };

            let Some(link) = self.links.link_to(&next_hop).await else {
                let delay = backoff_delay_ms(self.outbox.attempts_for(&row.stream_id, &row.message_id, dest), self.config.backoff_base_ms, self.config.backoff_cap_ms);
                self.outbox.mark_attempted(&row.stream_id, &row.message_id, dest, now_millis() + delay);
                continue;
            };

            let wire = DataWireMsg { stream_id: row.stream_id.0.clone(), message_id: row.message_id.clone(), seq: row.seq, payload: row.payload.clone(), headers: row.headers.clone() };
            let lsid = logical_stream_id(&row.stream_id);
            let sent = match bincode::encode_to_vec(&wire, bincode::config::standard()) {
                Ok(bytes) => link.send_frame(FrameType::Data, lsid, BytesMut::from(&bytes[..])).await.is_ok(),
                Err(_) => false,
            };

            // Schedule a resend in case the ACK never arrives (lost frame or
            // dead link); a genuine ACK updates next_attempt again before
            // this fires.
            self.outbox.mark_attempted(&row.stream_id, &row.message_id, dest, now_millis() + self.config.ack_timeout_ms);
            if sent {
                self.set_log_state(&row.stream_id, &row.message_id, dest, DeliveryState::Sent, None);
            }
        }
    }
}

async fn run_sender(engine: Arc<DeliveryEngine>, dest: NodeId) {
    let mut ticker = tokio::time::interval(Duration::from_millis(engine.config.sender_tick_ms));
    loop {
        ticker.tick().await;
        if engine.shutdown.load(Ordering::SeqCst) {
            return;
        }
        engine.drive_destination_once(&dest).await;
    }
}

async fn run_receiver(engine: Arc<DeliveryEngine>, mut events: broadcast::Receiver<LinkEvent>) {
    loop {
        if engine.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let event = match events.recv().await {
            Ok(e) => e,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };

        match event {
            LinkEvent::Frame(origin, frame) => match frame.header.frame_type {
                FrameType::Data => {
                    if let Ok((msg, _)) = bincode::decode_from_slice::<DataWireMsg, _>(&frame.payload, bincode::config::standard()) {
                        engine.handle_inbound_data(origin, msg).await;
                    }
                }
                FrameType::Ack => {
                    if let Ok((ack, _)) = bincode::decode_from_slice::<AckWireMsg, _>(&frame.payload, bincode::config::standard()) {
                        engine.handle_inbound_ack(origin, ack);
                    }
                }
                _ => {}
            },
            LinkEvent::Up(link) => {
                engine.ensure_sender(link.peer_id.clone());
            }
            LinkEvent::Down(_) => {}
        }
    }
}

#[async_trait]
impl OutboxSink for DeliveryEngine {
    async fn enqueue(&self, stream: &Stream, message_id: String, seq: u64, payload: Vec<u8>, headers: HashMap<String, String>) -> Result<()> {
        let (local, remote): (Vec<NodeId>, Vec<NodeId>) = stream.destinations.iter().cloned().partition(|d| *d == self.local_node);

        for dest in &remote {
            if self.outbox.len_for_destination(dest) >= self.config.outbox_high_watermark {
                return Err(MeshError::Backpressure(format!("outbox to {dest} at high watermark")));
            }
        }

        // Destinations equal to this node are delivered straight to the
        // inbox; there's no link to round-trip through (§4.6).
        if !local.is_empty() {
            let entry = InboxEntry { stream_id: stream.stream_id.clone(), message_id: message_id.clone(), seq, payload: payload.clone(), headers: headers.clone(), received_ms: now_millis(), processed_ms: None };
            self.inbox.insert_if_absent(entry).await;
        }

        if !remote.is_empty() {
            let entry = OutboxEntry::new(stream.stream_id.clone(), message_id, seq, stream.qos, stream.priority, remote, payload, headers);
            self.outbox.insert(entry);
        }
        Ok(())
    }
}

#[async_trait]
impl InboxSource for DeliveryEngine {
    async fn read_after(&self, stream_id: &StreamId, after: u64, limit: usize) -> Result<Vec<Envelope>> {
        Ok(self.inbox.read_after(stream_id, after, limit).await)
    }

    async fn gc(&self, stream_id: &StreamId, committed_seq: u64, retention_window: u64) {
        self.inbox.gc(stream_id, committed_seq, retention_window).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> NodeId {
        NodeId::from_string(format!("node_{s}")).unwrap()
    }

    #[test]
    fn logical_stream_id_is_stable_for_same_stream() {
        let a = logical_stream_id(&StreamId("s1".into()));
        let b = logical_stream_id(&StreamId("s1".into()));
        let c = logical_stream_id(&StreamId("s2".into()));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn inbound_ack_ok_retires_destination_from_outbox() {
        let local = node("local0000000000000000");
        let topology = Arc::new(TopologyService::new(local.clone(), 0.5, 0.1));
        let tmp = tempfile::tempdir().unwrap();
        let identity = Arc::new(crate::identity::IdentityService::open(tmp.path(), b"test-pass").unwrap());
        let links = crate::link::LinkManager::spawn(identity, 1 << 20, 0);
        let engine = DeliveryEngine::new(local.clone(), links, topology, DeliveryConfig::default());

        let dest = node("dest0000000000000000a");
        let stream_id = StreamId("s1".into());
        engine.outbox.insert(OutboxEntry::new(stream_id.clone(), "m1".into(), 1, QosClass::Normal, 0, vec![dest.clone()], vec![], HashMap::new()));
        assert_eq!(engine.outbox.len_for_destination(&dest), 1);

        engine.handle_inbound_ack(dest.clone(), AckWireMsg { stream_id: stream_id.0.clone(), message_id: "m1".into(), seq: 1, result: AckResult::Ok, reason: None });
        assert_eq!(engine.outbox.len_for_destination(&dest), 0);
        assert_eq!(engine.delivery_state(&stream_id, "m1", &dest), Some(DeliveryState::Done));
    }

    #[tokio::test]
    async fn repeated_transient_acks_cancel_after_max_attempts() {
        let local = node("local0000000000000000");
        let topology = Arc::new(TopologyService::new(local.clone(), 0.5, 0.1));
        let tmp = tempfile::tempdir().unwrap();
        let identity = Arc::new(crate::identity::IdentityService::open(tmp.path(), b"test-pass").unwrap());
        let links = crate::link::LinkManager::spawn(identity, 1 << 20, 0);
        let engine = DeliveryEngine::new(local.clone(), links, topology, DeliveryConfig { max_permanent_attempts: 3, ..DeliveryConfig::default() });

        let dest = node("dest0000000000000000b");
        let stream_id = StreamId("s1".into());
        engine.outbox.insert(OutboxEntry::new(stream_id.clone(), "flaky".into(), 1, QosClass::Normal, 0, vec![dest.clone()], vec![], HashMap::new()));

        // `attempts_for` is read before the row's own attempt counter is
        // bumped, so the cancelling ack is the one *after* the configured
        // ceiling, not the one that reaches it.
        for _ in 0..=engine.config.max_permanent_attempts {
            engine.handle_inbound_ack(dest.clone(), AckWireMsg { stream_id: stream_id.0.clone(), message_id: "flaky".into(), seq: 1, result: AckResult::Transient, reason: Some("timeout".into()) });
        }

        assert_eq!(engine.delivery_state(&stream_id, "flaky", &dest), Some(DeliveryState::Cancelled));
        assert_eq!(engine.outbox.len_for_destination(&dest), 0);
    }
}
