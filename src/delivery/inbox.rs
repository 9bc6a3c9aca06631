// Inbox storage: per-stream ordered, deduplicated delivery log consumers
// read via `StreamManager::subscribe` (§4.6 receiver loop). The inbox's
// real primary key is `(stream_id, message_id)` (§4.6 step 1, §6's
// `mesh_inbox` schema) — `seq` is only the FIFO-per-destination ordering
// index, and is *not* safe to dedupe on: a re-emitted message (e.g. a CDC
// relationship replaying from an older cursor, §4.8) gets a fresh `seq`
// on its new `Send` even though its `message_id` is the same deterministic
// hash as before, so dedup must key on `message_id` alone.

use std::collections::{BTreeMap, HashSet};

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::stream::{Envelope, StreamId};

use super::types::{now_millis, InboxEntry};

#[derive(Default)]
struct StreamInbox {
    rows: BTreeMap<u64, InboxEntry>,
    seen_message_ids: HashSet<String>,
}

#[derive(Default)]
pub struct Inbox {
    streams: DashMap<StreamId, RwLock<StreamInbox>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self { streams: DashMap::new() }
    }

    /// Inserts a freshly-received row, returning `false` if `message_id` was
    /// already seen for this stream (duplicate delivery, §4.6 step 1). A
    /// duplicate is rejected even if its `seq` differs from the first
    /// delivery's, so a message already applied can't be re-applied just
    /// because it arrived again under a new sequence number.
    pub async fn insert_if_absent(&self, entry: InboxEntry) -> bool {
        let rows = self.streams.entry(entry.stream_id.clone()).or_insert_with(|| RwLock::new(StreamInbox::default()));
        let mut guard = rows.write().await;
        if !guard.seen_message_ids.insert(entry.message_id.clone()) {
            return false;
        }
        guard.rows.insert(entry.seq, entry);
        true
    }

    pub async fn read_after(&self, stream_id: &StreamId, after: u64, limit: usize) -> Vec<Envelope> {
        let Some(rows) = self.streams.get(stream_id) else { return vec![] };
        let guard = rows.read().await;
        guard
            .rows
            .range((after + 1)..)
            .take(limit)
            .map(|(seq, e)| Envelope { stream_id: stream_id.clone(), message_id: e.message_id.clone(), seq: *seq, payload: e.payload.clone(), headers: e.headers.clone() })
            .collect()
    }

    /// Drops rows below the retention floor. `seen_message_ids` is left
    /// untouched — idempotence must survive past whatever window the rows
    /// themselves are retained for, since a gc'd row's `message_id` can
    /// still reappear as a genuine duplicate later (§8 property 1).
    pub async fn gc(&self, stream_id: &StreamId, committed_seq: u64, retention_window: u64) {
        let Some(rows) = self.streams.get(stream_id) else { return };
        let floor = committed_seq.saturating_sub(retention_window);
        let mut guard = rows.write().await;
        let keep: BTreeMap<u64, InboxEntry> = guard.rows.split_off(&floor);
        guard.rows = keep;
    }

    pub async fn mark_processed(&self, stream_id: &StreamId, seq: u64) {
        if let Some(rows) = self.streams.get(stream_id) {
            if let Some(entry) = rows.write().await.rows.get_mut(&seq) {
                entry.processed_ms = Some(now_millis());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn entry(stream_id: &StreamId, seq: u64) -> InboxEntry {
        entry_with_id(stream_id, seq, format!("m{seq}"))
    }

    fn entry_with_id(stream_id: &StreamId, seq: u64, message_id: String) -> InboxEntry {
        InboxEntry { stream_id: stream_id.clone(), message_id, seq, payload: vec![], headers: HashMap::new(), received_ms: now_millis(), processed_ms: None }
    }

    #[tokio::test]
    async fn duplicate_seq_is_rejected() {
        let inbox = Inbox::new();
        let stream_id = StreamId("s1".into());
        assert!(inbox.insert_if_absent(entry(&stream_id, 1)).await);
        assert!(!inbox.insert_if_absent(entry(&stream_id, 1)).await);
    }

    #[tokio::test]
    async fn duplicate_message_id_is_rejected_even_under_a_new_seq() {
        let inbox = Inbox::new();
        let stream_id = StreamId("s1".into());
        assert!(inbox.insert_if_absent(entry_with_id(&stream_id, 1, "evt-1".into())).await);
        // Same deterministic message_id re-emitted on a later, higher seq
        // (§4.8 CDC replay) must still be rejected as a duplicate.
        assert!(!inbox.insert_if_absent(entry_with_id(&stream_id, 7, "evt-1".into())).await);
        let got = inbox.read_after(&stream_id, 0, 10).await;
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn read_after_returns_ascending_order() {
        let inbox = Inbox::new();
        let stream_id = StreamId("s1".into());
        inbox.insert_if_absent(entry(&stream_id, 3)).await;
        inbox.insert_if_absent(entry(&stream_id, 1)).await;
        inbox.insert_if_absent(entry(&stream_id, 2)).await;

        let got = inbox.read_after(&stream_id, 0, 10).await;
        let seqs: Vec<u64> = got.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn gc_drops_rows_below_retention_floor() {
        let inbox = Inbox::new();
        let stream_id = StreamId("s1".into());
        for seq in 1..=10 {
            inbox.insert_if_absent(entry(&stream_id, seq)).await;
        }
        inbox.gc(&stream_id, 10, 3).await;
        let remaining = inbox.read_after(&stream_id, 0, 20).await;
        assert!(remaining.iter().all(|e| e.seq >= 7));
    }
}
