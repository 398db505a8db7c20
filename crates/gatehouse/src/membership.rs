//! Cluster membership coordination.
//!
//! Membership changes go through the agreement protocol like every other
//! state change. Read-side calls answer from the local replica.

use std::sync::Arc;
use std::time::{Duration, Instant};

use portcullis_common::{
    AttestationEvidence, ClusterMember, CodeDigest, MemberQuote, NodeId, NodeRole, TrustStatus,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::consensus::{CommitReceipt, Consensus, ConsensusError, LeaderRetry, ReplicaHandle, SyncError};
use crate::ledger::{ApplyOutcome, LogIndex, MemberRecord, StateOp};

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("no leader is currently elected")]
    NoLeader,

    #[error("membership change did not commit: {0}")]
    ChangeFailed(ConsensusError),

    /// Refused at apply time; the registry changed after the admission check
    #[error("code identity {digest} is not trusted (status {status:?})")]
    CodeNotTrusted {
        digest: CodeDigest,
        status: Option<TrustStatus>,
    },

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("node {0} is not a cluster member")]
    UnknownMember(NodeId),

    #[error("unexpected apply outcome: {0:?}")]
    UnexpectedOutcome(ApplyOutcome),
}

impl MembershipError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NoLeader => true,
            Self::ChangeFailed(e) => e.is_retryable(),
            Self::Sync(_) => true,
            _ => false,
        }
    }
}

impl From<ConsensusError> for MembershipError {
    fn from(e: ConsensusError) -> Self {
        match e {
            ConsensusError::NoLeader => Self::NoLeader,
            other => Self::ChangeFailed(other),
        }
    }
}

/// Committed result of `add_member`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberChange {
    pub member: ClusterMember,

    /// The record was written by this call: a new member, or one replacing
    /// the member previously recorded at the same address
    pub created: bool,
}

/// Membership view and change coordinator for one member
#[derive(Clone)]
pub struct MembershipCoordinator {
    replica: ReplicaHandle,
    consensus: Arc<dyn Consensus>,
    retry: LeaderRetry,
}

impl MembershipCoordinator {
    pub fn new(replica: ReplicaHandle, consensus: Arc<dyn Consensus>, retry: LeaderRetry) -> Self {
        Self {
            replica,
            consensus,
            retry,
        }
    }

    /// Member this coordinator submits through
    pub fn local_node(&self) -> NodeId {
        self.replica.node_id()
    }

    pub fn current_leader(&self) -> Result<NodeId, MembershipError> {
        self.consensus.current_leader().ok_or(MembershipError::NoLeader)
    }

    /// Committed members, as applied locally, with their current role
    pub fn members(&self) -> Vec<ClusterMember> {
        let leader = self.consensus.current_leader();
        self.replica
            .read(|state| state.members())
            .into_iter()
            .map(|record| describe(record, leader))
            .collect()
    }

    /// Evidence each committed member was admitted with
    pub fn quotes(&self) -> Vec<MemberQuote> {
        self.replica
            .read(|state| state.members())
            .into_iter()
            .map(|record| MemberQuote {
                node_id: record.node_id,
                address: record.address,
                code_digest: record.code_digest,
                evidence: record.evidence,
            })
            .collect()
    }

    /// Add a member. Resolves once the change is committed.
    ///
    /// Re-adding an address on the same code returns the existing member;
    /// on different code the old record is replaced.
    pub async fn add_member(
        &self,
        address: &str,
        code_digest: CodeDigest,
        evidence: Option<AttestationEvidence>,
    ) -> Result<MemberChange, MembershipError> {
        let op = StateOp::AddMember {
            address: address.to_string(),
            code_digest,
            evidence,
        };
        let receipt = self.propose(op, "add_member").await?;
        let leader = self.consensus.current_leader();

        match receipt.outcome {
            ApplyOutcome::MemberAdded(record) => {
                info!(
                    node_id = %record.node_id,
                    address = %record.address,
                    code = %record.code_digest,
                    index = receipt.index,
                    "Member added"
                );
                Ok(MemberChange {
                    member: describe(record, leader),
                    created: true,
                })
            }
            ApplyOutcome::MemberReplaced { previous, record } => {
                info!(
                    previous = %previous.node_id,
                    node_id = %record.node_id,
                    address = %record.address,
                    from = %previous.code_digest,
                    to = %record.code_digest,
                    index = receipt.index,
                    "Member replaced"
                );
                Ok(MemberChange {
                    member: describe(record, leader),
                    created: true,
                })
            }
            ApplyOutcome::MemberExists(record) => {
                debug!(node_id = %record.node_id, address = %record.address, "Member already present");
                Ok(MemberChange {
                    member: describe(record, leader),
                    created: false,
                })
            }
            ApplyOutcome::MemberRefused { digest, status } => {
                Err(MembershipError::CodeNotTrusted { digest, status })
            }
            other => Err(MembershipError::UnexpectedOutcome(other)),
        }
    }

    pub async fn remove_member(&self, node_id: NodeId) -> Result<(), MembershipError> {
        let receipt = self.propose(StateOp::RemoveMember { node_id }, "remove_member").await?;
        match receipt.outcome {
            ApplyOutcome::MemberRemoved(removed) => {
                info!(node_id = %removed, index = receipt.index, "Member removed");
                Ok(())
            }
            ApplyOutcome::MemberNotFound(missing) => Err(MembershipError::UnknownMember(missing)),
            other => Err(MembershipError::UnexpectedOutcome(other)),
        }
    }

    /// Wait until `node_id` has applied everything committed at call time
    pub async fn wait_for_commit_sync(
        &self,
        node_id: NodeId,
        deadline: Duration,
    ) -> Result<LogIndex, MembershipError> {
        let replica = self
            .consensus
            .replica(node_id)
            .ok_or(MembershipError::UnknownMember(node_id))?;
        let target = self.consensus.commit_index();

        let applied = replica.wait_applied(target, deadline).await?;
        debug!(node_id = %node_id, target, applied, "Member caught up");
        Ok(applied)
    }

    /// Wait until every live member has applied the current commit index
    pub async fn wait_for_cluster_sync(&self, deadline: Duration) -> Result<LogIndex, MembershipError> {
        let started = Instant::now();
        let target = self.consensus.commit_index();

        for node_id in self.replica.read(|state| state.member_ids()) {
            let Some(replica) = self.consensus.replica(node_id).filter(ReplicaHandle::is_live) else {
                continue;
            };
            let remaining = deadline.saturating_sub(started.elapsed());
            replica.wait_applied(target, remaining).await?;
        }

        Ok(target)
    }

    async fn propose(&self, op: StateOp, operation: &str) -> Result<CommitReceipt, MembershipError> {
        let via = self.replica.node_id();
        let receipt = self
            .retry
            .run(self.consensus.as_ref(), operation, || {
                let consensus = self.consensus.clone();
                let op = op.clone();
                async move { consensus.propose(via, op).await }
            })
            .await?;
        Ok(receipt)
    }
}

fn describe(record: MemberRecord, leader: Option<NodeId>) -> ClusterMember {
    let role = if leader == Some(record.node_id) {
        NodeRole::Leader
    } else {
        NodeRole::Follower
    };
    ClusterMember {
        node_id: record.node_id,
        address: record.address,
        code_digest: record.code_digest,
        role,
    }
}
