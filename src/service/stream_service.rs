// Stream service (L9): the narrow in-process surface over `StreamManager`
// that `Runtime` exposes to `ops` and to other in-process callers, with
// request-id idempotency wrapped around the two mutating calls.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::identity::NodeId;
use crate::stream::{Envelope, QosClass, StreamId, StreamManager};

use super::types::{IdempotencyCache, TenantContext};

#[async_trait]
pub trait StreamService: Send + Sync {
    async fn create_stream(
        &self,
        ctx: &TenantContext,
        source: NodeId,
        destinations: Vec<NodeId>,
        qos: QosClass,
        priority: i32,
        metadata: HashMap<String, String>,
    ) -> Result<StreamId>;

    async fn send(&self, ctx: &TenantContext, stream_id: &StreamId, payload: Vec<u8>, headers: HashMap<String, String>) -> Result<String>;

    async fn subscribe(&self, ctx: &TenantContext, stream_id: &StreamId, limit: usize) -> Result<Vec<Envelope>>;

    async fn ack(&self, ctx: &TenantContext, stream_id: &StreamId, up_to_seq: u64) -> Result<()>;
}

pub struct StreamServiceImpl {
    manager: Arc<StreamManager>,
    create_cache: Arc<IdempotencyCache<StreamId>>,
    send_cache: Arc<IdempotencyCache<String>>,
}

impl StreamServiceImpl {
    pub fn new(manager: Arc<StreamManager>) -> Self {
        Self { manager, create_cache: super::types::new_cache(), send_cache: super::types::new_cache() }
    }
}

#[async_trait]
impl StreamService for StreamServiceImpl {
    async fn create_stream(
        &self,
        ctx: &TenantContext,
        source: NodeId,
        destinations: Vec<NodeId>,
        qos: QosClass,
        priority: i32,
        metadata: HashMap<String, String>,
    ) -> Result<StreamId> {
        if let Some(cached) = self.create_cache.get(&ctx.request_id) {
            return Ok(cached);
        }
        let stream_id = self.manager.create_stream(ctx.tenant.clone(), source, destinations, qos, priority, metadata).await?;
        self.create_cache.put(ctx.request_id.clone(), stream_id.clone());
        Ok(stream_id)
    }

    async fn send(&self, ctx: &TenantContext, stream_id: &StreamId, payload: Vec<u8>, headers: HashMap<String, String>) -> Result<String> {
        if let Some(cached) = self.send_cache.get(&ctx.request_id) {
            return Ok(cached);
        }
        let message_id = self.manager.send(stream_id, payload, headers).await?;
        self.send_cache.put(ctx.request_id.clone(), message_id.clone());
        Ok(message_id)
    }

    async fn subscribe(&self, _ctx: &TenantContext, stream_id: &StreamId, limit: usize) -> Result<Vec<Envelope>> {
        self.manager.subscribe(stream_id, limit).await
    }

    async fn ack(&self, _ctx: &TenantContext, stream_id: &StreamId, up_to_seq: u64) -> Result<()> {
        self.manager.ack(stream_id, up_to_seq).await;
        Ok(())
    }
}
