// Service Surface (L9, §4.9): the narrow in-process API `ops` and other
// in-process callers use instead of reaching into L3-L8 directly. Grounded
// in the `Component`/`Monitorable` trait family in `common/mod.rs`.

pub mod relationship_service;
pub mod stream_service;
pub mod types;

pub use relationship_service::{RelationshipService, RelationshipServiceImpl};
pub use stream_service::{StreamService, StreamServiceImpl};
pub use types::{HealthStatus, IdempotencyCache, TenantContext};

use std::sync::Arc;

use crate::consensus::ConsensusService;
use crate::identity::{IdentityService, NodeId};
use crate::membership::{MembershipRecord, MembershipTable};
use crate::topology::TopologyService;

/// Mesh-wide health/identity surface (§4.9's narrow `MeshService`), grounded
/// in the teacher's `Component::health_check` signature but read-only —
/// lifecycle (`initialize`/`shutdown`) is `Runtime`'s responsibility.
pub trait MeshService: Send + Sync {
    fn node_id(&self) -> &NodeId;
    fn health_check(&self) -> HealthStatus;
    /// Current view of the replicated §3 Membership record set.
    fn membership(&self) -> Vec<MembershipRecord>;
}

pub struct MeshServiceImpl {
    identity: Arc<IdentityService>,
    topology: Arc<TopologyService>,
    consensus: Arc<ConsensusService>,
    membership: Arc<MembershipTable>,
}

impl MeshServiceImpl {
    pub fn new(identity: Arc<IdentityService>, topology: Arc<TopologyService>, consensus: Arc<ConsensusService>, membership: Arc<MembershipTable>) -> Self {
        Self { identity, topology, consensus, membership }
    }

    pub fn consensus(&self) -> &Arc<ConsensusService> {
        &self.consensus
    }
}

impl MeshService for MeshServiceImpl {
    fn node_id(&self) -> &NodeId {
        self.identity.node_id()
    }

    fn health_check(&self) -> HealthStatus {
        if self.topology.is_split_brain() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    fn membership(&self) -> Vec<MembershipRecord> {
        self.membership.records()
    }
}
