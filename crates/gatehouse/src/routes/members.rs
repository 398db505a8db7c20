//! Cluster membership endpoints.

use axum::{Json, extract::State};
use portcullis_common::{ClusterMember, LeaderResponse, MemberQuotes};

use super::ApiError;
use crate::state::AppState;

pub async fn list_members(State(state): State<AppState>) -> Json<Vec<ClusterMember>> {
    Json(state.membership.members())
}

/// Evidence every member was admitted with, for independent re-verification
pub async fn list_quotes(State(state): State<AppState>) -> Json<MemberQuotes> {
    Json(MemberQuotes {
        quotes: state.membership.quotes(),
    })
}

pub async fn current_leader(State(state): State<AppState>) -> Result<Json<LeaderResponse>, ApiError> {
    let leader = state.membership.current_leader()?;
    Ok(Json(LeaderResponse {
        leader,
        term: state.consensus.current_term(),
        commit_index: state.consensus.commit_index(),
    }))
}
