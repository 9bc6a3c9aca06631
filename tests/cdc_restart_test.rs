// CDC relationship restart integration: a reader is torn down partway
// through a 100-row backfill, a second `CdcRuntime` is built against a
// cursor store that outlived the first (the way a restarted process finds
// its `cdc_position` already sitting in the catalog's relationship row,
// §4.8, §6) and resumes without re-applying anything already committed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redb_mesh::cdc::{
    CdcCursor, CdcMechanism, CdcRuntime, CdcSource, ChangeEvent, ChangeType, CursorStore, IdentityMapper, NullDeadLetterSink, Relationship,
    RelationshipId, RelationshipState, TargetApplier,
};
use redb_mesh::error::Result;
use redb_mesh::identity::NodeId;
use redb_mesh::stream::StreamId;
use serde_json::json;

/// Serves whatever slice of the upstream change log is currently "visible"
/// to this process — modeling a source reader that crashed after row 50 by
/// simply constructing it with only rows 1..=50 in the first place.
struct VecSource(Vec<ChangeEvent>);

#[async_trait]
impl CdcSource for VecSource {
    async fn read_since(&self, cursor: &CdcCursor, max: usize) -> Result<Vec<(ChangeEvent, CdcCursor)>> {
        let after: u64 = cursor.cdc_position.parse().unwrap_or(0);
        Ok(self
            .0
            .iter()
            .filter(|e| e.lsn.parse::<u64>().unwrap() > after)
            .take(max)
            .map(|e| (e.clone(), CdcCursor { cdc_position: e.lsn.clone(), cdc_state: vec![] }))
            .collect())
    }
}

/// Backed by a plain `Mutex`, not torn down between the two `CdcRuntime`
/// instances in this test — the thing that actually has to survive a
/// restart for resumption to work.
struct SharedCursorStore(Mutex<CdcCursor>);

#[async_trait]
impl CursorStore for SharedCursorStore {
    async fn load(&self, _relationship: &RelationshipId) -> Result<CdcCursor> {
        Ok(self.0.lock().unwrap().clone())
    }
    async fn save(&self, _relationship: &RelationshipId, cursor: &CdcCursor) -> Result<()> {
        *self.0.lock().unwrap() = cursor.clone();
        Ok(())
    }
}

/// Records every message id actually handed to the target, across both
/// runtime instances, so the test can assert nothing was ever re-applied.
struct RecordingApplier(Arc<Mutex<Vec<String>>>);

#[async_trait]
impl TargetApplier for RecordingApplier {
    async fn apply_batch(&self, _target_table: &str, events: &[ChangeEvent]) -> Result<()> {
        let mut applied = self.0.lock().unwrap();
        for event in events {
            applied.push(event.message_id());
        }
        Ok(())
    }
}

fn row(n: u64) -> ChangeEvent {
    ChangeEvent {
        lsn: n.to_string(),
        table: "accounts".into(),
        op: ChangeType::Insert,
        primary_key: vec![("id".into(), json!(n))],
        before: None,
        after: Some([("id".to_string(), json!(n))].into_iter().collect()),
        commit_ts: n as i64,
    }
}

fn relationship() -> Relationship {
    Relationship {
        id: RelationshipId("rel-restart".into()),
        tenant: "tenant-a".into(),
        mechanism: CdcMechanism::External,
        source_table: "accounts".into(),
        target_table: "accounts_replica".into(),
        owner: NodeId::from_string("node_owner00000000000000".into()).unwrap(),
        state: RelationshipState::Initializing,
        stream_id: StreamId("strm_rel-restart".into()),
    }
}

async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn restart_resumes_from_persisted_cursor_without_reapplying_rows() {
    let applied: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let cursor_store = Arc::new(SharedCursorStore(Mutex::new(CdcCursor::default())));
    let rel_id = RelationshipId("rel-restart".into());

    // First process: only ever saw rows 1..=50 before it went down.
    {
        let runtime = CdcRuntime::new(Duration::from_millis(5), 256, Arc::new(NullDeadLetterSink));
        let source = Arc::new(VecSource((1..=50).map(row).collect()));
        let applier = Arc::new(RecordingApplier(applied.clone()));
        runtime.start(relationship(), source, Arc::new(IdentityMapper), applier, cursor_store.clone());

        wait_until(|| applied.lock().unwrap().len() >= 50, Duration::from_secs(2)).await;
        runtime.stop(&rel_id);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            if runtime.state(&rel_id).await == Some(RelationshipState::Stopped) {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("relationship never reached Stopped after stop()");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    assert_eq!(applied.lock().unwrap().len(), 50);
    assert_eq!(cursor_store.0.lock().unwrap().cdc_position, "50");

    // Second process, fresh `CdcRuntime`, same persisted cursor store: the
    // upstream now has the full log, but resumption must start past row 50.
    {
        let runtime = CdcRuntime::new(Duration::from_millis(5), 256, Arc::new(NullDeadLetterSink));
        let source = Arc::new(VecSource((1..=100).map(row).collect()));
        let applier = Arc::new(RecordingApplier(applied.clone()));
        runtime.start(relationship(), source, Arc::new(IdentityMapper), applier, cursor_store.clone());

        wait_until(|| applied.lock().unwrap().len() >= 100, Duration::from_secs(2)).await;
        runtime.stop(&rel_id);
    }

    let applied = applied.lock().unwrap();
    assert_eq!(applied.len(), 100, "every row from both runs, no duplicates and nothing skipped");
    let distinct: HashSet<&String> = applied.iter().collect();
    assert_eq!(distinct.len(), 100, "no row was ever re-applied across the restart");
}
