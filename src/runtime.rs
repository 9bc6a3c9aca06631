// `Runtime` (§5): the single dependency-injected value that owns every
// long-lived worker this process runs — link manager, LSA gossip, the MCG's
// Raft core and its link-backed RPC transport, the outbox/inbox sender and
// receiver loops, and one reader+applier task per active CDC relationship.
// `main.rs` constructs exactly one of these per process; `ops` drives it only
// through the narrow `MeshService`/`ControlPlane` seams, never by reaching
// into a subsystem directly.
//
// Grounded in the teacher's top-level `Database`/`Engine` struct shape
// (single composition root owning every subsystem handle).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::catalog_adapter::CatalogAdapter;
use crate::cdc::{CdcRuntime, NullDeadLetterSink};
use crate::config::MeshConfig;
use crate::consensus::{ConsensusService, GroupId, LinkRaftTransport};
use crate::delivery::{DeliveryConfig, DeliveryEngine};
use crate::error::{MeshError, Result};
use crate::identity::{IdentityService, NodeId};
use crate::link::manager::LinkManagerHandle;
use crate::link::LinkManager;
use crate::membership::{MembershipTable, SwimConfig, SwimDetector};
use crate::ops::{ControlPlane, OpsState};
use crate::service::{MeshService, MeshServiceImpl, RelationshipServiceImpl, StreamServiceImpl};
use crate::stream::StreamManager;
use crate::topology::{GossipConfig, GossipWorker, ProbeConfig, ProbeWorker, TopologyService};

/// Everything a booted mesh node owns. Cloning is cheap (every field is an
/// `Arc` or a cheap handle); `Arc<Runtime>` is what callers actually hold.
pub struct Runtime {
    data_dir: PathBuf,
    passphrase: Vec<u8>,
    config: MeshConfig,
    identity: Arc<IdentityService>,
    links: LinkManagerHandle,
    topology: Arc<TopologyService>,
    consensus: Arc<ConsensusService>,
    membership: Arc<MembershipTable>,
    stream_manager: Arc<StreamManager>,
    delivery: Arc<DeliveryEngine>,
    cdc_runtime: Arc<CdcRuntime>,
    #[allow(dead_code)]
    catalog: Arc<dyn CatalogAdapter>,
    mesh_service: Arc<MeshServiceImpl>,
    stream_service: Arc<StreamServiceImpl>,
    relationship_service: Arc<RelationshipServiceImpl>,
}

impl Runtime {
    /// Boots every always-on worker named in §5 and returns the composition
    /// root. `voters` is the MCG's founding voter set — typically just the
    /// local node for a brand-new mesh, or the full founding set when
    /// bootstrapping a multi-node mesh at once.
    pub async fn bootstrap(data_dir: &Path, passphrase: &[u8], config: MeshConfig, catalog: Arc<dyn CatalogAdapter>, voters: Vec<NodeId>) -> Result<Arc<Self>> {
        let identity = Arc::new(IdentityService::open(data_dir, passphrase)?);
        let local_node = identity.node_id().clone();

        let incarnation = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        let links = LinkManager::spawn(identity.clone(), config.credit_window_bytes, incarnation);

        let seed_node = config.seed_node.as_ref().map(|s| NodeId::from_string(s.clone())).transpose()?;
        let topology = Arc::new(
            TopologyService::new(local_node.clone(), config.ewma_alpha, config.lsa_delta_threshold).with_split_policy(config.split_strategy, seed_node),
        );
        GossipWorker::spawn(local_node.clone(), topology.clone(), links.clone(), GossipConfig { flood_interval_ms: config.probe_interval_ms });
        ProbeWorker::spawn(topology.clone(), links.clone(), ProbeConfig { probe_interval_ms: config.probe_interval_ms });

        let raft_transport = LinkRaftTransport::new(links.clone(), Duration::from_millis(config.election_timeout_max_ms));
        let consensus = Arc::new(ConsensusService::new(
            local_node.clone(),
            raft_transport.clone(),
            config.election_timeout_min(),
            config.election_timeout_max(),
            config.heartbeat_interval(),
            Duration::from_millis(config.learner_catchup_ms),
            config.snapshot_threshold,
        ));
        tokio::spawn(crate::consensus::run_raft_receiver(raft_transport, consensus.clone(), links.clone()));

        let apply_rx = consensus.bootstrap_mcg(voters.clone()).await;

        let membership = Arc::new(MembershipTable::new());
        SwimDetector::spawn(
            local_node.clone(),
            consensus.clone(),
            membership.clone(),
            links.clone(),
            topology.clone(),
            SwimConfig::new(Duration::from_millis(config.probe_interval_ms), 3),
        );

        let delivery = DeliveryEngine::new(local_node.clone(), links.clone(), topology.clone(), DeliveryConfig {
            ack_timeout_ms: config.heartbeat_ms.max(1_000),
            backoff_base_ms: config.backoff_base_ms,
            backoff_cap_ms: config.backoff_cap_ms,
            max_permanent_attempts: config.max_permanent_attempts,
            outbox_high_watermark: config.outbox_high_watermark,
            sender_tick_ms: 50,
        });
        delivery.spawn(std::iter::empty());

        let stream_manager = Arc::new(StreamManager::new(
            local_node.clone(),
            consensus.clone(),
            config.sequence_lease_batch,
            delivery.clone(),
            delivery.clone(),
            config.inbox_retention_window,
        ));
        spawn_mcg_apply_loop(stream_manager.clone(), membership.clone(), apply_rx);

        // Founding voters are already agreed on out of band (they are the
        // Raft group's initial `GroupConfiguration`); each node still
        // proposes its own `Join`/`ConfirmActive` so the replicated
        // `MembershipTable` — consulted independently by §4.3's split-brain
        // check — converges to the same view every other MCG-replicated
        // fact uses, instead of trusting local-only bootstrap state.
        if voters.contains(&local_node) {
            let membership_bootstrap = membership.clone();
            let consensus_bootstrap = consensus.clone();
            let node_bootstrap = local_node.clone();
            tokio::spawn(async move {
                crate::membership::bootstrap_self(&consensus_bootstrap, &membership_bootstrap, node_bootstrap, incarnation).await;
            });
        }

        let cdc_runtime = CdcRuntime::new(Duration::from_millis(config.probe_interval_ms), 256, Arc::new(NullDeadLetterSink));

        let mesh_service = Arc::new(MeshServiceImpl::new(identity.clone(), topology.clone(), consensus.clone(), membership.clone()));
        let stream_service = Arc::new(StreamServiceImpl::new(stream_manager.clone()));
        let relationship_service = Arc::new(RelationshipServiceImpl::new(cdc_runtime.clone(), stream_manager.clone()));

        Ok(Arc::new(Self {
            data_dir: data_dir.to_path_buf(),
            passphrase: passphrase.to_vec(),
            config,
            identity,
            links,
            topology,
            consensus,
            membership,
            stream_manager,
            delivery,
            cdc_runtime,
            catalog,
            mesh_service,
            stream_service,
            relationship_service,
        }))
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn local_node(&self) -> &NodeId {
        self.identity.node_id()
    }

    pub fn topology(&self) -> &Arc<TopologyService> {
        &self.topology
    }

    pub fn membership(&self) -> &Arc<MembershipTable> {
        &self.membership
    }

    pub fn stream_manager(&self) -> &Arc<StreamManager> {
        &self.stream_manager
    }

    pub fn delivery(&self) -> &Arc<DeliveryEngine> {
        &self.delivery
    }

    pub fn mesh_service(self: &Arc<Self>) -> Arc<dyn MeshService> {
        self.mesh_service.clone()
    }

    pub fn stream_service(&self) -> &Arc<StreamServiceImpl> {
        &self.stream_service
    }

    pub fn relationship_service(&self) -> &Arc<RelationshipServiceImpl> {
        &self.relationship_service
    }

    /// Dials a statically-configured peer at startup. Peer discovery beyond a
    /// fixed seed list is out of scope (§1 Non-goals).
    pub async fn dial_peer(&self, peer: NodeId, addr: SocketAddr, peer_public_key: [u8; 32]) -> Result<()> {
        self.links.dial(peer, addr, peer_public_key).await
    }

    /// Builds the `ops` router state over this runtime's subsystems.
    pub fn ops_state(self: &Arc<Self>) -> Arc<OpsState> {
        Arc::new(OpsState {
            mesh: self.mesh_service(),
            topology: self.topology.clone(),
            streams: self.stream_manager.clone(),
            delivery: self.delivery.clone(),
            control: self.clone() as Arc<dyn ControlPlane>,
        })
    }
}

/// Drains the MCG's commit stream and applies committed ops to local state —
/// every node, including the proposer, learns a `Stream` or a membership
/// change this way (§4.5, §3). The two op families (`stream::StreamOp`,
/// `membership::MembershipOp`) are distinguished by trying each in turn —
/// their variant names never collide, so a mismatched deserialize attempt
/// just fails and falls through, the same "silently skip" rule the
/// stream-only version of this loop already used for non-stream payloads.
fn spawn_mcg_apply_loop(stream_manager: Arc<StreamManager>, membership: Arc<MembershipTable>, mut apply_rx: mpsc::UnboundedReceiver<crate::consensus::LogEntry>) {
    tokio::spawn(async move {
        while let Some(entry) = apply_rx.recv().await {
            if let Ok(op) = serde_json::from_slice::<crate::stream::StreamOp>(&entry.payload) {
                match op {
                    crate::stream::StreamOp::Create(stream) => stream_manager.apply_create(stream),
                    crate::stream::StreamOp::LeaseSequence { .. } => {}
                }
                continue;
            }
            if let Ok(op) = serde_json::from_slice::<crate::membership::MembershipOp>(&entry.payload) {
                membership.apply(op);
            }
        }
    });
}

#[async_trait::async_trait]
impl ControlPlane for Runtime {
    /// Stops accepting new sender work and waits up to `grace_ms` for
    /// in-flight link writes to finish before returning (§3 Open Question
    /// 2's `Shutdown { grace }` pattern, exposed as an operator command).
    async fn drain(&self, grace_ms: u64) -> Result<()> {
        self.delivery.shutdown();
        self.links.shutdown(Duration::from_millis(grace_ms)).await;
        Ok(())
    }

    /// Rotates this node's signing key at rest. `MembershipOp` now carries
    /// node/incarnation/status through MCG (§4.1, §3), but it has no field
    /// for a public key yet — rotation's Open Question is resolved here as:
    /// rotate locally, log loudly, and leave the public-key half of
    /// propagation to the catalog layer's membership table until a key field
    /// is added to `MembershipOp`. Incarnation still bumps via the next
    /// `ConfirmActive`, so peers at least see this node's generation change.
    async fn rotate_key(&self) -> Result<()> {
        let new_key = self.identity.rotate(&self.data_dir, &self.passphrase)?;
        tracing::warn!(node = %self.local_node(), new_key = %hex::encode(new_key), "rotated signing key; propagate via membership update out of band");
        Ok(())
    }

    /// Forces `group_id` to compact its committed log into a snapshot marker
    /// now, ahead of `snapshot_threshold` (§4.4).
    async fn force_snapshot(&self, group_id: &str) -> Result<()> {
        let index = self.consensus.force_snapshot(&GroupId(group_id.to_string())).await?;
        if index == 0 {
            return Err(MeshError::InvalidState(format!("group {group_id} has nothing committed to snapshot")));
        }
        Ok(())
    }
}
