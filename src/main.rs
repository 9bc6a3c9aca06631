// reDB mesh daemon entry point. Boots a `Runtime`, dials any statically
// configured peers, and serves the `ops` introspection/control surface.
// Peer discovery beyond a fixed seed list and an end-user-facing gateway are
// both out of scope (§1); this binary's only externally reachable surface
// is the narrow operator RPC `ops::router` exposes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use redb_mesh::catalog_adapter::InMemoryCatalog;
use redb_mesh::identity::NodeId;
use redb_mesh::ops;
use redb_mesh::{MeshConfig, Runtime};
use tracing::{error, info};

#[tokio::main]
async fn main() -> redb_mesh::Result<()> {
    tracing_subscriber::fmt().with_target(true).with_level(true).init();

    let data_dir = env_path("REDB_DATA_DIR", "./data");
    std::fs::create_dir_all(&data_dir).map_err(redb_mesh::MeshError::Io)?;

    let passphrase = std::env::var("REDB_PASSPHRASE").unwrap_or_else(|_| "change-me".to_string());
    let config = load_config();

    // TODO(redb-mesh): load founding voter set and static peer list from the
    // catalog database's membership table once a real CatalogAdapter ships;
    // until then a single-node mesh and REDB_VOTERS/REDB_PEERS env overrides
    // cover local testing.
    let catalog = InMemoryCatalog::new();
    let probe = redb_mesh::identity::IdentityService::open(&data_dir, passphrase.as_bytes())?;
    let local_node = probe.node_id().clone();
    drop(probe);

    let voters = parse_voters(&local_node);
    info!(node = %local_node, bind = %config.bind_addr, "booting reDB mesh runtime");

    let runtime = Runtime::bootstrap(&data_dir, passphrase.as_bytes(), config.clone(), catalog, voters).await?;

    for (peer, addr, pubkey) in parse_peers() {
        if let Err(e) = runtime.dial_peer(peer.clone(), addr, pubkey).await {
            error!(%peer, %addr, error = %e, "failed to dial configured peer");
        }
    }

    let bind_addr: SocketAddr = config.bind_addr.parse().map_err(|e| redb_mesh::MeshError::Configuration(format!("invalid bind_addr: {e}")))?;
    let app = ops::router(runtime.ops_state());
    let listener = tokio::net::TcpListener::bind(bind_addr).await.map_err(redb_mesh::MeshError::Io)?;
    info!(%bind_addr, "ops surface listening");

    let shutdown_runtime = runtime.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal, draining");
            use redb_mesh::ops::ControlPlane;
            let _ = shutdown_runtime.drain(config.grace_period_ms).await;
        })
        .await
        .map_err(redb_mesh::MeshError::Io)?;

    info!("reDB mesh runtime stopped");
    Ok(())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

fn load_config() -> MeshConfig {
    match std::env::var("REDB_CONFIG") {
        Ok(path) => match std::fs::read_to_string(&path) {
            Ok(body) => match MeshConfig::from_json_str(&body) {
                Ok(cfg) => cfg,
                Err(e) => {
                    error!(%path, error = %e, "invalid config file, falling back to defaults");
                    MeshConfig::default()
                }
            },
            Err(e) => {
                error!(%path, error = %e, "could not read config file, falling back to defaults");
                MeshConfig::default()
            }
        },
        Err(_) => MeshConfig::default(),
    }
}

fn parse_voters(local_node: &NodeId) -> Vec<NodeId> {
    match std::env::var("REDB_VOTERS") {
        Ok(raw) => raw.split(',').filter_map(|s| NodeId::from_string(s.trim().to_string()).ok()).collect(),
        Err(_) => vec![local_node.clone()],
    }
}

fn parse_peers() -> Vec<(NodeId, SocketAddr, [u8; 32])> {
    let Ok(raw) = std::env::var("REDB_PEERS") else { return Vec::new() };
    raw.split(';')
        .filter_map(|entry| {
            let mut parts = entry.splitn(3, '=');
            let node = NodeId::from_string(parts.next()?.trim().to_string()).ok()?;
            let addr: SocketAddr = parts.next()?.trim().parse().ok()?;
            let key_bytes = hex::decode(parts.next()?.trim()).ok()?;
            let key: [u8; 32] = key_bytes.try_into().ok()?;
            Some((node, addr, key))
        })
        .collect()
}
