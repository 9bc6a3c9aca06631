// Outbox/inbox/delivery-log row types and the delivery state machine
// (§3 OutboxEntry/InboxEntry/DeliveryLogEntry, §4.6).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::identity::NodeId;
use crate::stream::{QosClass, StreamId};

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Sent,
}

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub stream_id: StreamId,
    pub message_id: String,
    pub seq: u64,
    pub qos: QosClass,
    pub priority: i32,
    pub destinations: Vec<NodeId>,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub next_attempt_ms: HashMap<NodeId, u64>,
    pub attempts: HashMap<NodeId, u32>,
    pub status: OutboxStatus,
    pub created_ms: u64,
}

impl OutboxEntry {
    pub fn new(stream_id: StreamId, message_id: String, seq: u64, qos: QosClass, priority: i32, destinations: Vec<NodeId>, payload: Vec<u8>, headers: HashMap<String, String>) -> Self {
        let now = now_ms();
        let next_attempt_ms = destinations.iter().map(|d| (d.clone(), now)).collect();
        let attempts = destinations.iter().map(|d| (d.clone(), 0)).collect();
        Self { stream_id, message_id, seq, qos, priority, destinations, payload, headers, next_attempt_ms, attempts, status: OutboxStatus::Pending, created_ms: now }
    }
}

#[derive(Debug, Clone)]
pub struct InboxEntry {
    pub stream_id: StreamId,
    pub message_id: String,
    pub seq: u64,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub received_ms: u64,
    pub processed_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Sent,
    Received,
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct DeliveryLogEntry {
    pub stream_id: StreamId,
    pub message_id: String,
    pub dst_node: NodeId,
    pub state: DeliveryState,
    pub last_error: Option<String>,
    pub updated_ms: u64,
}

/// The four outcomes an ACK can carry back to the sender loop (§4.6 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum AckResult {
    Ok,
    Duplicate,
    Transient,
    Permanent,
}

/// Wire payload for a DATA frame (§4.2/§4.6): one outbox row, addressed to a
/// single destination.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct DataWireMsg {
    pub stream_id: String,
    pub message_id: String,
    pub seq: u64,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

/// Wire payload for an ACK frame, reporting one of the four `AckResult`s back
/// to the origin of a `DataWireMsg`.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct AckWireMsg {
    pub stream_id: String,
    pub message_id: String,
    pub seq: u64,
    pub result: AckResult,
    pub reason: Option<String>,
}

pub fn now_millis() -> u64 {
    now_ms()
}

/// `delay = min(cap, base * 2^attempts) * uniform(0.5, 1.5)` (§4.6).
pub fn backoff_delay_ms(attempts: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let raw = base_ms.saturating_mul(1u64 << attempts.min(20));
    let capped = raw.min(cap_ms);
    let jitter = 0.5 + fastrand::f64();
    ((capped as f64) * jitter) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_respects_cap() {
        for attempts in 0..30 {
            let d = backoff_delay_ms(attempts, 200, 30_000);
            assert!(d <= (30_000f64 * 1.5) as u64);
        }
    }

    #[test]
    fn backoff_grows_then_saturates() {
        let small = backoff_delay_ms(0, 200, 30_000);
        let large = backoff_delay_ms(10, 200, 30_000);
        assert!(large >= small);
    }
}
