//! Code identity registry endpoints.

use axum::{
    Json,
    extract::State,
    http::HeaderMap,
    response::{AppendHeaders, IntoResponse},
};
use portcullis_common::constants::headers::{X_MEMBER_ID, X_MEMBER_SIGNATURE};
use portcullis_common::{CodeDigest, CodeVersions, GovernanceRequest, GovernanceResponse};

use super::{ApiError, commit_headers};
use crate::governance::{AuthError, GovernanceAction};
use crate::registry::GovernanceReceipt;
use crate::state::AppState;

/// Registry as applied on this member, sorted by digest
pub async fn list_versions(State(state): State<AppState>) -> Json<CodeVersions> {
    Json(CodeVersions {
        versions: state.registry.list_versions(),
    })
}

pub async fn accept_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<GovernanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers, GovernanceAction::Accept, &payload.digest)?;
    let receipt = state.registry.accept(payload.digest).await?;
    Ok(governance_response(receipt))
}

pub async fn retire_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<GovernanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers, GovernanceAction::Retire, &payload.digest)?;
    let receipt = state.registry.retire(payload.digest).await?;
    Ok(governance_response(receipt))
}

fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    action: GovernanceAction,
    digest: &CodeDigest,
) -> Result<(), AuthError> {
    let member = header_str(headers, X_MEMBER_ID)?;
    let signature = header_str(headers, X_MEMBER_SIGNATURE)?;

    if let Err(e) = state.consortium.authorize(member, signature, action, digest) {
        tracing::warn!(member, %action, %digest, error = %e, "Governance call refused");
        return Err(e);
    }

    tracing::info!(member, %action, %digest, "Governance call authorized");
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, AuthError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or(AuthError::MissingHeader(name))
}

fn governance_response(receipt: GovernanceReceipt) -> impl IntoResponse {
    (
        AppendHeaders(commit_headers(receipt.commit_index, receipt.term)),
        Json(GovernanceResponse {
            digest: receipt.digest,
            status: receipt.status,
            commit_index: receipt.commit_index,
            term: receipt.term,
        }),
    )
}
