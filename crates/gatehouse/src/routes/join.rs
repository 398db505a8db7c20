//! Node admission endpoint.

use axum::{
    Json,
    extract::State,
    response::{AppendHeaders, IntoResponse},
};
use portcullis_common::{JoinRequest, JoinResponse};

use super::{ApiError, commit_headers};
use crate::state::AppState;

/// Admit a candidate node. Any member accepts joins; the membership change is
/// forwarded to the leader.
pub async fn join(
    State(state): State<AppState>,
    Json(request): Json<JoinRequest>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::info!(
        address = %request.address,
        code = %request.code_digest,
        via = %state.node_id,
        "Join request received"
    );

    let admission = state.admission.admit(request).await?;
    let commit_index = state.consensus.commit_index();
    let term = state.consensus.current_term();

    Ok((
        AppendHeaders(commit_headers(commit_index, term)),
        Json(JoinResponse {
            node_id: admission.member.node_id,
            leader: state.consensus.current_leader(),
            applied_index: admission.applied_index,
            commit_index,
            term,
        }),
    ))
}
