// Outbox storage: one row per (stream, message) carrying per-destination
// attempt/backoff state (§3 OutboxEntry, §4.6).

use dashmap::DashMap;

use crate::identity::NodeId;
use crate::stream::StreamId;

use super::types::{now_millis, OutboxEntry, OutboxStatus};

#[derive(Default)]
pub struct Outbox {
    rows: DashMap<(StreamId, String), OutboxEntry>,
}

impl Outbox {
    pub fn new() -> Self {
        Self { rows: DashMap::new() }
    }

    pub fn insert(&self, entry: OutboxEntry) {
        self.rows.insert((entry.stream_id.clone(), entry.message_id.clone()), entry);
    }

    pub fn len_for_destination(&self, dest: &NodeId) -> usize {
        self.rows.iter().filter(|r| r.destinations.contains(dest)).count()
    }

    /// Rows still owing a send/resend to `dest` whose backoff has elapsed,
    /// ordered by (QoS desc, priority desc, seq asc) per §4.6's sender-loop
    /// dequeue order.
    pub fn due_for_destination(&self, dest: &NodeId, limit: usize) -> Vec<OutboxEntry> {
        let now = now_millis();
        let mut due: Vec<OutboxEntry> = self
            .rows
            .iter()
            .filter(|r| {
                r.destinations.contains(dest) && r.next_attempt_ms.get(dest).map(|t| *t <= now).unwrap_or(false)
            })
            .map(|r| r.clone())
            .collect();
        due.sort_by(|a, b| b.qos.cmp(&a.qos).then(b.priority.cmp(&a.priority)).then(a.seq.cmp(&b.seq)));
        due.truncate(limit);
        due
    }

    pub fn mark_attempted(&self, stream_id: &StreamId, message_id: &str, dest: &NodeId, next_attempt_ms: u64) {
        if let Some(mut row) = self.rows.get_mut(&(stream_id.clone(), message_id.to_string())) {
            row.status = OutboxStatus::Sent;
            row.next_attempt_ms.insert(dest.clone(), next_attempt_ms);
            *row.attempts.entry(dest.clone()).or_insert(0) += 1;
        }
    }

    pub fn attempts_for(&self, stream_id: &StreamId, message_id: &str, dest: &NodeId) -> u32 {
        self.rows
            .get(&(stream_id.clone(), message_id.to_string()))
            .and_then(|r| r.attempts.get(dest).copied())
            .unwrap_or(0)
    }

    /// Removes `dest` from a row's pending destination set; drops the whole
    /// row once every destination is accounted for.
    pub fn retire_destination(&self, stream_id: &StreamId, message_id: &str, dest: &NodeId) {
        let key = (stream_id.clone(), message_id.to_string());
        let should_remove = if let Some(mut row) = self.rows.get_mut(&key) {
            row.destinations.retain(|d| d != dest);
            row.destinations.is_empty()
        } else {
            false
        };
        if should_remove {
            self.rows.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::QosClass;
    use std::collections::HashMap;

    fn node(s: &str) -> NodeId {
        NodeId::from_string(format!("node_{s}")).unwrap()
    }

    #[test]
    fn due_rows_are_ordered_by_qos_then_seq() {
        let outbox = Outbox::new();
        let dest = node("dest0000000000000000a");
        let stream_id = StreamId("s1".into());
        let low = OutboxEntry::new(stream_id.clone(), "m-low".into(), 2, QosClass::Low, 0, vec![dest.clone()], vec![], HashMap::new());
        let high = OutboxEntry::new(stream_id.clone(), "m-high".into(), 1, QosClass::Critical, 0, vec![dest.clone()], vec![], HashMap::new());
        outbox.insert(low);
        outbox.insert(high);

        let due = outbox.due_for_destination(&dest, 10);
        assert_eq!(due[0].message_id, "m-high");
        assert_eq!(due[1].message_id, "m-low");
    }

    #[test]
    fn retire_last_destination_drops_row() {
        let outbox = Outbox::new();
        let dest = node("dest0000000000000000a");
        let stream_id = StreamId("s1".into());
        outbox.insert(OutboxEntry::new(stream_id.clone(), "m1".into(), 1, QosClass::Normal, 0, vec![dest.clone()], vec![], HashMap::new()));
        assert_eq!(outbox.len_for_destination(&dest), 1);
        outbox.retire_destination(&stream_id, "m1", &dest);
        assert_eq!(outbox.len_for_destination(&dest), 0);
    }
}
