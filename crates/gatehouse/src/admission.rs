//! Node admission.
//!
//! A join goes through these phases, in order:
//!
//! ```text
//! Pending -> Checking -> Trusted -> Joining -> Joined
//!    \__________\__________\__________\______-> Rejected
//! ```
//!
//! Attestation runs on the blocking pool and holds no shared lock, so a slow
//! verifier never stalls registry reads or other joins. The registry check is
//! advisory: the add-member entry is validated again when it is applied, so a
//! digest retired between the two checks still keeps the node out.

use std::sync::Arc;
use std::time::Duration;

use portcullis_common::{ClusterMember, CodeDigest, JoinRequest, NodeId, TrustStatus};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::attestation::AttestationVerifier;
use crate::consensus::SyncError;
use crate::ledger::LogIndex;
use crate::membership::{MembershipCoordinator, MembershipError};
use crate::registry::CodeIdentityRegistry;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("attestation invalid: {0}")]
    AttestationInvalid(String),

    #[error("code identity {digest} is not in the registry")]
    CodeIdNotFound { digest: CodeDigest },

    #[error("code identity {digest} has been retired")]
    CodeIdRetired { digest: CodeDigest },

    /// Added, but did not catch up in time. A record this attempt created
    /// is rolled back; an existing member is left in place.
    #[error("node {node_id} did not catch up within {timeout_ms}ms")]
    JoinTimeout { node_id: NodeId, timeout_ms: u64 },

    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error("internal: {0}")]
    Internal(String),
}

impl AdmissionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::JoinTimeout { .. } => true,
            Self::Membership(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPhase {
    Pending,
    Checking,
    Trusted,
    Joining,
    Joined,
    Rejected,
}

/// A successful join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub member: ClusterMember,
    /// Index the new member had applied when the join completed
    pub applied_index: LogIndex,
}

/// Tracks one join attempt through its phases
struct JoinAttempt<'a> {
    address: &'a str,
    phase: JoinPhase,
}

impl<'a> JoinAttempt<'a> {
    fn new(address: &'a str) -> Self {
        debug!(address, "Join requested");
        Self {
            address,
            phase: JoinPhase::Pending,
        }
    }

    fn advance(&mut self, next: JoinPhase) {
        debug!(address = self.address, from = ?self.phase, to = ?next, "Join phase");
        self.phase = next;
    }

    fn reject(&mut self, error: AdmissionError) -> AdmissionError {
        warn!(address = self.address, phase = ?self.phase, error = %error, "Join rejected");
        self.phase = JoinPhase::Rejected;
        error
    }
}

/// Verifies candidates and turns them into members
#[derive(Clone)]
pub struct NodeAdmissionController {
    verifier: Arc<dyn AttestationVerifier>,
    registry: CodeIdentityRegistry,
    membership: MembershipCoordinator,
    join_timeout: Duration,
}

impl NodeAdmissionController {
    pub fn new(
        verifier: Arc<dyn AttestationVerifier>,
        registry: CodeIdentityRegistry,
        membership: MembershipCoordinator,
        join_timeout: Duration,
    ) -> Self {
        Self {
            verifier,
            registry,
            membership,
            join_timeout,
        }
    }

    /// Admit a candidate: verify its evidence, check its code identity,
    /// commit the membership change and wait for the new member to catch up.
    pub async fn admit(&self, request: JoinRequest) -> Result<Admission, AdmissionError> {
        let mut attempt = JoinAttempt::new(&request.address);

        let verifier = self.verifier.clone();
        let evidence = request.evidence.clone();
        let verified = tokio::task::spawn_blocking(move || verifier.verify(&evidence))
            .await
            .map_err(|e| AdmissionError::Internal(format!("attestation task failed: {e}")))?;
        let quote = match verified {
            Ok(quote) => quote,
            Err(e) => return Err(attempt.reject(AdmissionError::AttestationInvalid(e.to_string()))),
        };

        if quote.measurement != request.code_digest {
            return Err(attempt.reject(AdmissionError::AttestationInvalid(format!(
                "claimed code identity {} does not match measured {}",
                request.code_digest, quote.measurement
            ))));
        }
        if quote.report_data != request.address {
            return Err(attempt.reject(AdmissionError::AttestationInvalid(format!(
                "evidence is bound to {:?}, not {:?}",
                quote.report_data, request.address
            ))));
        }
        attempt.advance(JoinPhase::Checking);

        let digest = quote.measurement;
        match self.registry.lookup(&digest) {
            Some(TrustStatus::Accepted) => attempt.advance(JoinPhase::Trusted),
            status => return Err(attempt.reject(untrusted(digest, status))),
        }

        // Retried across leader changes without attesting again
        let change = match self
            .membership
            .add_member(&request.address, digest, Some(request.evidence))
            .await
        {
            Ok(change) => change,
            Err(MembershipError::CodeNotTrusted { digest, status }) => {
                return Err(attempt.reject(untrusted(digest, status)));
            }
            Err(e) => return Err(attempt.reject(e.into())),
        };
        let member = change.member;
        attempt.advance(JoinPhase::Joining);

        match self
            .membership
            .wait_for_commit_sync(member.node_id, self.join_timeout)
            .await
        {
            Ok(applied_index) => {
                attempt.advance(JoinPhase::Joined);
                info!(
                    node_id = %member.node_id,
                    address = %member.address,
                    code = %member.code_digest,
                    applied_index,
                    "Node admitted"
                );
                Ok(Admission {
                    member,
                    applied_index,
                })
            }
            Err(e) => {
                if change.created {
                    self.roll_back(member.node_id).await;
                }
                let error = match e {
                    MembershipError::Sync(SyncError::Timeout { .. }) => AdmissionError::JoinTimeout {
                        node_id: member.node_id,
                        timeout_ms: self.join_timeout.as_millis() as u64,
                    },
                    other => other.into(),
                };
                Err(attempt.reject(error))
            }
        }
    }

    /// Remove a member that was added but never finished joining
    async fn roll_back(&self, node_id: NodeId) {
        match self.membership.remove_member(node_id).await {
            Ok(()) => info!(node_id = %node_id, "Removed partially joined member"),
            Err(e) => warn!(node_id = %node_id, error = %e, "Failed to remove partially joined member"),
        }
    }
}

fn untrusted(digest: CodeDigest, status: Option<TrustStatus>) -> AdmissionError {
    match status {
        Some(TrustStatus::Retired) => AdmissionError::CodeIdRetired { digest },
        _ => AdmissionError::CodeIdNotFound { digest },
    }
}
