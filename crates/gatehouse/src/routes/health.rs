//! Health check endpoints.

use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use portcullis_common::NodeId;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Basic health check (is the server running?)
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    leader: NodeId,
}

/// Readiness check: local replica running and a leader elected
pub async fn ready_check(
    State(state): State<AppState>,
) -> Result<Json<ReadyResponse>, StatusCode> {
    match state.consensus.current_leader() {
        Some(leader) if state.replica.is_live() => Ok(Json(ReadyResponse {
            status: "ready",
            leader,
        })),
        _ => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

#[derive(Serialize)]
pub struct NodeStatusResponse {
    node_id: NodeId,
    leader: Option<NodeId>,
    term: u64,
    commit_index: u64,
    applied_index: u64,
    members: usize,
    code_versions: usize,
    uptime_secs: u64,
}

/// Replication progress of this member (for monitoring)
pub async fn node_status(
    State(state): State<AppState>,
) -> Json<NodeStatusResponse> {
    let (members, code_versions) = state
        .replica
        .read(|view| (view.member_ids().len(), view.registry().len()));

    Json(NodeStatusResponse {
        node_id: state.node_id,
        leader: state.consensus.current_leader(),
        term: state.consensus.current_term(),
        commit_index: state.consensus.commit_index(),
        applied_index: state.replica.applied_index(),
        members,
        code_versions,
        uptime_secs: state.uptime_secs(),
    })
}
