// Relationship service (L9): the in-process surface over `CdcRuntime`.
// `create_relationship` takes the external seams (source reader, mapper,
// applier, cursor store) as arguments rather than owning them, since the
// catalog layer supplies the concrete implementations (§4.8, §6). The
// relationship's own stream already exists (the caller created it via
// `StreamService`/`StreamManager::create_stream`); this service is what
// splices `CdcRuntime`'s reader onto that stream via `StreamEmitter` and
// starts the target-side `StreamApplierWorker` that drains it back into the
// real `applier` (§4.8 "Emission" / "Application at target").

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::cdc::{CdcRuntime, CdcSource, CursorStore, Relationship, RelationshipId, RelationshipState, RowMapper, StreamApplierWorker, StreamEmitter, TargetApplier};
use crate::error::{MeshError, Result};
use crate::stream::StreamManager;

use super::types::{IdempotencyCache, TenantContext};

#[async_trait]
pub trait RelationshipService: Send + Sync {
    async fn create_relationship(
        &self,
        ctx: &TenantContext,
        relationship: Relationship,
        source: Arc<dyn CdcSource>,
        mapper: Arc<dyn RowMapper>,
        applier: Arc<dyn TargetApplier>,
        cursor_store: Arc<dyn CursorStore>,
    ) -> Result<()>;

    async fn pause(&self, ctx: &TenantContext, id: &RelationshipId) -> Result<()>;

    async fn status(&self, ctx: &TenantContext, id: &RelationshipId) -> Result<RelationshipState>;
}

pub struct RelationshipServiceImpl {
    runtime: Arc<CdcRuntime>,
    stream_manager: Arc<StreamManager>,
    applier_workers: DashMap<RelationshipId, Arc<StreamApplierWorker>>,
    create_cache: Arc<IdempotencyCache<()>>,
}

impl RelationshipServiceImpl {
    pub fn new(runtime: Arc<CdcRuntime>, stream_manager: Arc<StreamManager>) -> Self {
        Self { runtime, stream_manager, applier_workers: DashMap::new(), create_cache: super::types::new_cache() }
    }
}

#[async_trait]
impl RelationshipService for RelationshipServiceImpl {
    async fn create_relationship(
        &self,
        ctx: &TenantContext,
        relationship: Relationship,
        source: Arc<dyn CdcSource>,
        mapper: Arc<dyn RowMapper>,
        applier: Arc<dyn TargetApplier>,
        cursor_store: Arc<dyn CursorStore>,
    ) -> Result<()> {
        if self.create_cache.get(&ctx.request_id).is_some() {
            return Ok(());
        }

        let worker = StreamApplierWorker::spawn(
            self.stream_manager.clone(),
            relationship.stream_id.clone(),
            relationship.target_table.clone(),
            applier,
            Duration::from_millis(50),
            256,
        );
        self.applier_workers.insert(relationship.id.clone(), worker);

        let emitter = Arc::new(StreamEmitter::new(self.stream_manager.clone(), relationship.stream_id.clone()));
        self.runtime.start(relationship, source, mapper, emitter, cursor_store);
        self.create_cache.put(ctx.request_id.clone(), ());
        Ok(())
    }

    async fn pause(&self, _ctx: &TenantContext, id: &RelationshipId) -> Result<()> {
        self.runtime.stop(id);
        if let Some((_, worker)) = self.applier_workers.remove(id) {
            worker.stop();
        }
        Ok(())
    }

    async fn status(&self, _ctx: &TenantContext, id: &RelationshipId) -> Result<RelationshipState> {
        self.runtime.state(id).await.ok_or_else(|| MeshError::NotFound(format!("relationship {id}")))
    }
}
