// Operational / introspection surface (§6): the one narrow external RPC
// this crate exposes — list nodes/streams, show a message's delivery log,
// and the three operator commands (`drain`, `rotate-key`, `force-snapshot`).
// Everything else named "out of scope" in spec §1 (catalog CRUD, end-user
// auth, per-database drivers, a dashboard) stays out.
//
// Grounded in the teacher's general `axum` usage pattern; its own REST
// gateway (`api/`) is out of scope, but the stack is kept for this surface.

pub mod control;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::delivery::DeliveryEngine;
use crate::error::MeshError;
use crate::service::MeshService;
use crate::stream::{StreamId, StreamManager};
use crate::topology::TopologyService;

pub use control::ControlPlane;

pub struct OpsState {
    pub mesh: Arc<dyn MeshService>,
    pub topology: Arc<TopologyService>,
    pub streams: Arc<StreamManager>,
    pub delivery: Arc<DeliveryEngine>,
    pub control: Arc<dyn ControlPlane>,
}

pub fn router(state: Arc<OpsState>) -> Router {
    Router::new()
        .route("/v1/nodes", get(list_nodes))
        .route("/v1/streams/{stream_id}", get(show_stream))
        .route("/v1/streams/{stream_id}/messages/{message_id}/delivery-log", get(show_delivery_log))
        .route("/v1/control/drain", post(drain))
        .route("/v1/control/rotate-key", post(rotate_key))
        .route("/v1/control/force-snapshot/{group_id}", post(force_snapshot))
        .with_state(state)
}

#[derive(Serialize)]
struct MemberResponse {
    node_id: String,
    status: String,
    incarnation: u64,
    suspected: bool,
}

#[derive(Serialize)]
struct NodesResponse {
    local_node: String,
    split_brain: bool,
    peers: Vec<String>,
    members: Vec<MemberResponse>,
}

async fn list_nodes(State(state): State<Arc<OpsState>>) -> Json<NodesResponse> {
    let snapshot = state.topology.snapshot().await;
    let peers: Vec<String> = snapshot.graph.nodes.iter().map(|n| n.to_string()).filter(|n| n != state.mesh.node_id().as_str()).collect();
    let members = state
        .mesh
        .membership()
        .into_iter()
        .map(|rec| MemberResponse {
            node_id: rec.node_id.to_string(),
            status: format!("{:?}", rec.status),
            incarnation: rec.incarnation,
            suspected: rec.suspected_since_unix_ms.is_some(),
        })
        .collect();
    Json(NodesResponse { local_node: state.mesh.node_id().to_string(), split_brain: state.topology.is_split_brain(), peers, members })
}

#[derive(Serialize)]
struct StreamResponse {
    stream_id: String,
    tenant: String,
    source: String,
    destinations: Vec<String>,
    committed_seq_by_destination: HashMap<String, u64>,
}

async fn show_stream(State(state): State<Arc<OpsState>>, Path(stream_id): Path<String>) -> Result<Json<StreamResponse>, ApiError> {
    let stream_id = StreamId(stream_id);
    let stream = state.streams.get(&stream_id).ok_or_else(|| ApiError(MeshError::StreamUnknown(stream_id.to_string())))?;
    let committed_seq_by_destination = stream
        .destinations
        .iter()
        .map(|node| (node.to_string(), state.streams.committed_seq(&stream_id, node)))
        .collect();
    Ok(Json(StreamResponse {
        stream_id: stream.stream_id.to_string(),
        tenant: stream.tenant,
        source: stream.source.to_string(),
        destinations: stream.destinations.iter().map(|n| n.to_string()).collect(),
        committed_seq_by_destination,
    }))
}

#[derive(Serialize)]
struct DeliveryLogRowResponse {
    dest_node: String,
    state: String,
    last_error: Option<String>,
}

async fn show_delivery_log(State(state): State<Arc<OpsState>>, Path((stream_id, message_id)): Path<(String, String)>) -> Json<Vec<DeliveryLogRowResponse>> {
    let rows = state
        .delivery
        .delivery_log_for(&StreamId(stream_id), &message_id)
        .into_iter()
        .map(|row| DeliveryLogRowResponse { dest_node: row.dst_node.to_string(), state: format!("{:?}", row.state), last_error: row.last_error })
        .collect();
    Json(rows)
}

#[derive(Deserialize, Default)]
struct DrainRequest {
    #[serde(default = "default_grace_ms")]
    grace_ms: u64,
}

fn default_grace_ms() -> u64 {
    5_000
}

async fn drain(State(state): State<Arc<OpsState>>, body: Option<Json<DrainRequest>>) -> Result<StatusCode, ApiError> {
    let grace_ms = body.map(|b| b.0.grace_ms).unwrap_or_else(default_grace_ms);
    state.control.drain(grace_ms).await.map_err(ApiError)?;
    Ok(StatusCode::ACCEPTED)
}

async fn rotate_key(State(state): State<Arc<OpsState>>) -> Result<StatusCode, ApiError> {
    state.control.rotate_key().await.map_err(ApiError)?;
    Ok(StatusCode::ACCEPTED)
}

async fn force_snapshot(State(state): State<Arc<OpsState>>, Path(group_id): Path<String>) -> Result<StatusCode, ApiError> {
    state.control.force_snapshot(&group_id).await.map_err(ApiError)?;
    Ok(StatusCode::ACCEPTED)
}

struct ApiError(MeshError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MeshError::NotFound(_) | MeshError::StreamUnknown(_) => StatusCode::NOT_FOUND,
            MeshError::InvalidArgument(_) | MeshError::Configuration(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}
