// Tenant context, component health, and the generic idempotency cache every
// L9 service uses to make mutating calls safe to retry (§4.9). Health status
// is grounded in the teacher's `common::HealthStatus`/`Component` family,
// narrowed to the read-only health-check half — lifecycle (init/shutdown)
// belongs to `Runtime`, not to an individual service.

use std::sync::Arc;

use dashmap::DashMap;

/// Per-call context every L9 operation takes. `request_id` is the
/// idempotency key; a retried call with the same id returns the original
/// result instead of re-executing.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant: String,
    pub request_id: String,
}

impl TenantContext {
    pub fn new(tenant: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self { tenant: tenant.into(), request_id: request_id.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Caches the result of a mutating call by request id so a client retry
/// (e.g. after a timeout that actually succeeded) observes the original
/// outcome rather than re-executing the operation.
pub struct IdempotencyCache<V: Clone + Send + Sync> {
    seen: DashMap<String, V>,
}

impl<V: Clone + Send + Sync> Default for IdempotencyCache<V> {
    fn default() -> Self {
        Self { seen: DashMap::new() }
    }
}

impl<V: Clone + Send + Sync> IdempotencyCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, request_id: &str) -> Option<V> {
        self.seen.get(request_id).map(|v| v.clone())
    }

    pub fn put(&self, request_id: String, value: V) {
        self.seen.insert(request_id, value);
    }
}

pub fn new_cache<V: Clone + Send + Sync>() -> Arc<IdempotencyCache<V>> {
    Arc::new(IdempotencyCache::new())
}
