// CDC Relationship Runtime (L8, §4.8): one reader+applier task pair per
// active `Relationship`. Reads raw events via `CdcSource`, runs the
// configured `RowMapper`, groups into commit brackets, and calls
// `TargetApplier` — everything the catalog layer doesn't own.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Notify, RwLock};

use super::applier::{group_by_commit_bracket, TargetApplier};
use super::mapping::{DeadLetterSink, RowMapper};
use super::source::{CdcSource, CursorStore};
use super::types::{CdcCursor, Relationship, RelationshipId, RelationshipState, TransformError};

struct RelationshipHandle {
    state: RwLock<RelationshipState>,
    shutdown: Notify,
}

pub struct CdcRuntime {
    relationships: DashMap<RelationshipId, Arc<RelationshipHandle>>,
    poll_interval: Duration,
    read_batch_size: usize,
    dead_letter: Arc<dyn DeadLetterSink>,
}

impl CdcRuntime {
    pub fn new(poll_interval: Duration, read_batch_size: usize, dead_letter: Arc<dyn DeadLetterSink>) -> Arc<Self> {
        Arc::new(Self { relationships: DashMap::new(), poll_interval, read_batch_size, dead_letter })
    }

    /// Starts the reader+applier loop for `relationship`. The relationship
    /// is `Initializing` until the first cursor load succeeds, then
    /// `Streaming` until a fatal mapping error (or explicit `stop`) ends it.
    pub fn start(
        self: &Arc<Self>,
        relationship: Relationship,
        source: Arc<dyn CdcSource>,
        mapper: Arc<dyn RowMapper>,
        applier: Arc<dyn TargetApplier>,
        cursor_store: Arc<dyn CursorStore>,
    ) {
        let handle = Arc::new(RelationshipHandle { state: RwLock::new(RelationshipState::Initializing), shutdown: Notify::new() });
        self.relationships.insert(relationship.id.clone(), handle.clone());

        let runtime = self.clone();
        tokio::spawn(async move {
            runtime.run_relationship(relationship, handle, source, mapper, applier, cursor_store).await;
        });
    }

    pub async fn state(&self, relationship: &RelationshipId) -> Option<RelationshipState> {
        let handle = self.relationships.get(relationship)?.clone();
        Some(handle.state.read().await.clone())
    }

    pub fn stop(&self, relationship: &RelationshipId) {
        if let Some(handle) = self.relationships.get(relationship) {
            handle.shutdown.notify_one();
        }
    }

    async fn run_relationship(
        self: Arc<Self>,
        relationship: Relationship,
        handle: Arc<RelationshipHandle>,
        source: Arc<dyn CdcSource>,
        mapper: Arc<dyn RowMapper>,
        applier: Arc<dyn TargetApplier>,
        cursor_store: Arc<dyn CursorStore>,
    ) {
        let id = relationship.id.clone();
        let mut cursor = match cursor_store.load(&id).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(relationship = %id, error = %e, "failed to load CDC cursor, degrading relationship");
                *handle.state.write().await = RelationshipState::Degraded { reason: e.to_string() };
                return;
            }
        };
        *handle.state.write().await = RelationshipState::Streaming;

        loop {
            tokio::select! {
                _ = handle.shutdown.notified() => {
                    *handle.state.write().await = RelationshipState::Stopped;
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let batch = match source.read_since(&cursor, self.read_batch_size).await {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(relationship = %id, error = %e, "CDC source read failed, retrying next tick");
                    continue;
                }
            };
            if batch.is_empty() {
                continue;
            }

            let mut mapped = Vec::with_capacity(batch.len());
            let mut advanced_cursor = cursor.clone();
            let mut went_fatal = false;
            for (event, next_cursor) in batch {
                match mapper.map(&event) {
                    Ok(Some(out)) => mapped.push(out),
                    Ok(None) => {}
                    Err(TransformError::Unresolved(reason)) => {
                        self.dead_letter.dead_letter(&id.0, event, reason).await;
                    }
                    Err(TransformError::Fatal(reason)) => {
                        tracing::error!(relationship = %id, reason, "CDC mapping fatal error, degrading relationship");
                        *handle.state.write().await = RelationshipState::Degraded { reason };
                        went_fatal = true;
                        break;
                    }
                }
                advanced_cursor = next_cursor;
            }
            if went_fatal {
                return;
            }

            let mut apply_failed = false;
            for bracket in group_by_commit_bracket(mapped) {
                if let Err(e) = applier.apply_batch(&relationship.target_table, &bracket).await {
                    tracing::warn!(relationship = %id, error = %e, "CDC target apply failed, will retry from last saved cursor");
                    apply_failed = true;
                    break;
                }
            }
            if apply_failed {
                continue;
            }

            if let Err(e) = cursor_store.save(&id, &advanced_cursor).await {
                tracing::warn!(relationship = %id, error = %e, "failed to persist CDC cursor");
                continue;
            }
            cursor = advanced_cursor;
        }
    }
}

pub type CdcRuntimeCursor = CdcCursor;
