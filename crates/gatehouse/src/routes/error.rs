//! Mapping of service errors onto the HTTP error body.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use portcullis_common::constants::RETRY_AFTER_SECS;
use portcullis_common::{PortcullisError, TrustStatus};

use crate::admission::AdmissionError;
use crate::consensus::{ConsensusError, SyncError};
use crate::governance::AuthError;
use crate::membership::MembershipError;
use crate::registry::{GovernanceError, RegistryError};

/// Error returned by handlers; rendered as `ErrorBody` JSON
#[derive(Debug)]
pub struct ApiError(pub PortcullisError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::warn!(kind = self.0.kind(), error = %self.0, "Request failed");
        }

        let mut response = (status, Json(self.0.body())).into_response();
        if self.0.is_retryable() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }
        response
    }
}

impl<E> From<E> for ApiError
where
    E: Into<PortcullisError>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl From<ConsensusError> for PortcullisError {
    fn from(e: ConsensusError) -> Self {
        match e {
            ConsensusError::NoLeader => Self::NoLeader,
            other => Self::ProposalFailed(other.to_string()),
        }
    }
}

impl From<SyncError> for PortcullisError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Timeout { node_id, .. } => Self::SyncTimeout { node_id },
            SyncError::ReplicaStopped(node_id) => Self::NodeUnavailable { node_id },
        }
    }
}

impl From<RegistryError> for PortcullisError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::AlreadyAccepted(digest) => Self::AlreadyAccepted { digest },
            RegistryError::AlreadyRetired(digest) => Self::AlreadyRetired { digest },
            RegistryError::Retired(digest) => Self::CodeIdRetired { digest },
            RegistryError::UnknownDigest(digest) => Self::UnknownDigest { digest },
        }
    }
}

impl From<GovernanceError> for PortcullisError {
    fn from(e: GovernanceError) -> Self {
        match e {
            GovernanceError::Registry(e) => e.into(),
            GovernanceError::Consensus(e) => e.into(),
            GovernanceError::NotApplied { source, .. } => source.into(),
            e @ GovernanceError::UnexpectedOutcome(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<MembershipError> for PortcullisError {
    fn from(e: MembershipError) -> Self {
        match e {
            MembershipError::NoLeader => Self::NoLeader,
            MembershipError::ChangeFailed(e) => Self::MembershipChangeFailed(e.to_string()),
            MembershipError::CodeNotTrusted {
                digest,
                status: Some(TrustStatus::Retired),
            } => Self::CodeIdRetired { digest },
            MembershipError::CodeNotTrusted { digest, .. } => Self::CodeIdNotFound { digest },
            MembershipError::Sync(e) => e.into(),
            MembershipError::UnknownMember(node_id) => {
                Self::InvalidInput(format!("node {node_id} is not a cluster member"))
            }
            e @ MembershipError::UnexpectedOutcome(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<AdmissionError> for PortcullisError {
    fn from(e: AdmissionError) -> Self {
        match e {
            AdmissionError::AttestationInvalid(reason) => Self::AttestationInvalid(reason),
            AdmissionError::CodeIdNotFound { digest } => Self::CodeIdNotFound { digest },
            AdmissionError::CodeIdRetired { digest } => Self::CodeIdRetired { digest },
            AdmissionError::JoinTimeout { node_id, .. } => Self::JoinTimeout { node_id },
            AdmissionError::Membership(e) => e.into(),
            AdmissionError::Internal(reason) => Self::Internal(reason),
        }
    }
}

impl From<AuthError> for PortcullisError {
    fn from(e: AuthError) -> Self {
        Self::Unauthorized(e.to_string())
    }
}
