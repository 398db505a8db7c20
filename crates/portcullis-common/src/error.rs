//! Error taxonomy exposed to external callers.

use thiserror::Error;

use crate::types::{CodeDigest, ErrorBody, NodeId, TrustStatus};

/// Errors surfaced by Portcullis endpoints.
///
/// Code-identity rejections are separate variants carrying the digest so
/// callers can branch on the kind instead of the message text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PortcullisError {
    /// Evidence malformed, expired, or failed verification
    #[error("Attestation invalid: {0}")]
    AttestationInvalid(String),

    /// Code identity has never been trusted
    #[error("Code identity {digest} is not in the registry")]
    CodeIdNotFound { digest: CodeDigest },

    /// Code identity was trusted and has been withdrawn
    #[error("Code identity {digest} has been retired")]
    CodeIdRetired { digest: CodeDigest },

    #[error("Code identity {digest} is already accepted")]
    AlreadyAccepted { digest: CodeDigest },

    #[error("Code identity {digest} is already retired")]
    AlreadyRetired { digest: CodeDigest },

    #[error("Code identity {digest} has no registry entry")]
    UnknownDigest { digest: CodeDigest },

    /// Membership proposal did not commit
    #[error("Membership change failed: {0}")]
    MembershipChangeFailed(String),

    /// Governance proposal did not commit
    #[error("Proposal failed: {0}")]
    ProposalFailed(String),

    #[error("Node {node_id} did not reach the commit index in time")]
    SyncTimeout { node_id: NodeId },

    #[error("Node {node_id} did not finish joining in time")]
    JoinTimeout { node_id: NodeId },

    /// Member is recorded but its process is not running
    #[error("Node {node_id} is not running")]
    NodeUnavailable { node_id: NodeId },

    /// Transient state after a leader failure
    #[error("No leader is currently elected")]
    NoLeader,

    /// Authentication/authorization error
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Invalid input/request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PortcullisError {
    /// Stable kind string used in error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AttestationInvalid(_) => "AttestationInvalid",
            Self::CodeIdNotFound { .. } => "CodeIdNotFound",
            Self::CodeIdRetired { .. } => "CodeIdRetired",
            Self::AlreadyAccepted { .. } => "AlreadyAccepted",
            Self::AlreadyRetired { .. } => "AlreadyRetired",
            Self::UnknownDigest { .. } => "UnknownDigest",
            Self::MembershipChangeFailed(_) => "MembershipChangeFailed",
            Self::ProposalFailed(_) => "ProposalFailed",
            Self::SyncTimeout { .. } => "SyncTimeout",
            Self::JoinTimeout { .. } => "JoinTimeout",
            Self::NodeUnavailable { .. } => "NodeUnavailable",
            Self::NoLeader => "NoLeader",
            Self::Unauthorized(_) => "Unauthorized",
            Self::InvalidInput(_) => "InvalidInput",
            Self::Internal(_) => "Internal",
        }
    }

    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::AttestationInvalid(_) => 401,
            Self::CodeIdNotFound { .. } => 403,
            Self::CodeIdRetired { .. } => 403,
            Self::AlreadyAccepted { .. } => 409,
            Self::AlreadyRetired { .. } => 409,
            Self::UnknownDigest { .. } => 404,
            Self::MembershipChangeFailed(_) => 503,
            Self::ProposalFailed(_) => 503,
            Self::SyncTimeout { .. } => 504,
            Self::JoinTimeout { .. } => 504,
            Self::NodeUnavailable { .. } => 503,
            Self::NoLeader => 503,
            Self::Unauthorized(_) => 401,
            Self::InvalidInput(_) => 400,
            Self::Internal(_) => 500,
        }
    }

    /// Returns true if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::MembershipChangeFailed(_)
                | Self::ProposalFailed(_)
                | Self::SyncTimeout { .. }
                | Self::JoinTimeout { .. }
                | Self::NodeUnavailable { .. }
                | Self::NoLeader
        )
    }

    /// Digest the error refers to, if any
    pub fn digest(&self) -> Option<CodeDigest> {
        match self {
            Self::CodeIdNotFound { digest }
            | Self::CodeIdRetired { digest }
            | Self::AlreadyAccepted { digest }
            | Self::AlreadyRetired { digest }
            | Self::UnknownDigest { digest } => Some(*digest),
            _ => None,
        }
    }

    /// Registry status implied by the error, if any
    pub fn trust_status(&self) -> Option<TrustStatus> {
        match self {
            Self::CodeIdRetired { .. } | Self::AlreadyRetired { .. } => Some(TrustStatus::Retired),
            Self::AlreadyAccepted { .. } => Some(TrustStatus::Accepted),
            _ => None,
        }
    }

    /// Member the error refers to, if any
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            Self::SyncTimeout { node_id }
            | Self::JoinTimeout { node_id }
            | Self::NodeUnavailable { node_id } => Some(*node_id),
            _ => None,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.kind().to_string(),
            message: self.to_string(),
            retryable: self.is_retryable(),
            digest: self.digest(),
            status: self.trust_status(),
            node_id: self.node_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_rejections_are_distinct() {
        let digest = CodeDigest::from_bytes([0x42; 32]);
        let not_found = PortcullisError::CodeIdNotFound { digest };
        let retired = PortcullisError::CodeIdRetired { digest };

        assert_ne!(not_found.kind(), retired.kind());
        assert!(!not_found.is_retryable());
        assert!(!retired.is_retryable());

        let body = retired.body();
        assert_eq!(body.error, "CodeIdRetired");
        assert_eq!(body.digest, Some(digest));
        assert_eq!(body.status, Some(TrustStatus::Retired));
        assert_eq!(not_found.body().status, None);
    }

    #[test]
    fn test_cluster_errors_are_retryable() {
        assert!(PortcullisError::NoLeader.is_retryable());
        assert!(PortcullisError::SyncTimeout { node_id: NodeId::new(3) }.is_retryable());
        assert!(PortcullisError::MembershipChangeFailed("quorum".into()).is_retryable());
        assert!(!PortcullisError::AttestationInvalid("expired".into()).is_retryable());
        assert_eq!(PortcullisError::NoLeader.status_code(), 503);

        let stopped = PortcullisError::NodeUnavailable { node_id: NodeId::new(2) };
        assert_eq!(stopped.kind(), "NodeUnavailable");
        assert_eq!(stopped.status_code(), 503);
        assert!(stopped.is_retryable());
        assert_eq!(stopped.body().node_id, Some(NodeId::new(2)));
    }
}
