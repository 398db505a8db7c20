//! Code identity trust registry.
//!
//! `CodeRegistry` is the replicated data: one entry per digest, mutated only
//! when a committed log entry is applied. `CodeIdentityRegistry` is the view a
//! single member exposes: reads come from the member's local replica, writes
//! go through the agreement protocol and resolve once applied locally.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use portcullis_common::{CodeDigest, CodeVersionEntry, TrustStatus};
use thiserror::Error;

use crate::consensus::{CommitReceipt, Consensus, ConsensusError, LeaderRetry, ReplicaHandle, SyncError};
use crate::ledger::{ApplyOutcome, StateOp};

/// Registry-level refusal of a governance operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("code identity {0} is already accepted")]
    AlreadyAccepted(CodeDigest),

    #[error("code identity {0} is already retired")]
    AlreadyRetired(CodeDigest),

    /// Retired digests are never re-accepted
    #[error("code identity {0} has been retired and cannot be accepted again")]
    Retired(CodeDigest),

    #[error("code identity {0} has no registry entry")]
    UnknownDigest(CodeDigest),
}

/// Digest -> trust status, ordered by digest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeRegistry {
    entries: BTreeMap<CodeDigest, TrustStatus>,
}

impl CodeRegistry {
    pub fn lookup(&self, digest: &CodeDigest) -> Option<TrustStatus> {
        self.entries.get(digest).copied()
    }

    pub(crate) fn accept(&mut self, digest: CodeDigest) -> Result<(), RegistryError> {
        match self.entries.get(&digest) {
            Some(TrustStatus::Accepted) => Err(RegistryError::AlreadyAccepted(digest)),
            Some(TrustStatus::Retired) => Err(RegistryError::Retired(digest)),
            None => {
                self.entries.insert(digest, TrustStatus::Accepted);
                Ok(())
            }
        }
    }

    pub(crate) fn retire(&mut self, digest: CodeDigest) -> Result<(), RegistryError> {
        match self.entries.get_mut(&digest) {
            Some(status) if *status == TrustStatus::Accepted => {
                *status = TrustStatus::Retired;
                Ok(())
            }
            Some(_) => Err(RegistryError::AlreadyRetired(digest)),
            None => Err(RegistryError::UnknownDigest(digest)),
        }
    }

    /// All entries, sorted by digest
    pub fn list_versions(&self) -> Vec<CodeVersionEntry> {
        self.entries
            .iter()
            .map(|(digest, status)| CodeVersionEntry {
                digest: *digest,
                status: *status,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Failure of a governance call
#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    /// Committed, but the local replica did not apply it in time
    #[error("committed at index {index} but not applied locally: {source}")]
    NotApplied {
        index: u64,
        #[source]
        source: SyncError,
    },

    #[error("unexpected apply outcome: {0:?}")]
    UnexpectedOutcome(ApplyOutcome),
}

/// Result of a committed governance operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernanceReceipt {
    pub digest: CodeDigest,
    pub status: TrustStatus,
    pub commit_index: u64,
    pub term: u64,
}

/// Registry view bound to one member
#[derive(Clone)]
pub struct CodeIdentityRegistry {
    replica: ReplicaHandle,
    consensus: Arc<dyn Consensus>,
    retry: LeaderRetry,
    sync_timeout: Duration,
}

impl CodeIdentityRegistry {
    pub fn new(
        replica: ReplicaHandle,
        consensus: Arc<dyn Consensus>,
        retry: LeaderRetry,
        sync_timeout: Duration,
    ) -> Self {
        Self {
            replica,
            consensus,
            retry,
            sync_timeout,
        }
    }

    /// Status in this member's committed view. Never touches the network.
    pub fn lookup(&self, digest: &CodeDigest) -> Option<TrustStatus> {
        self.replica.read(|state| state.registry().lookup(digest))
    }

    pub fn list_versions(&self) -> Vec<CodeVersionEntry> {
        self.replica.read(|state| state.registry().list_versions())
    }

    pub async fn accept(&self, digest: CodeDigest) -> Result<GovernanceReceipt, GovernanceError> {
        let receipt = self.submit(StateOp::AcceptCode { digest }).await?;
        match receipt.outcome {
            ApplyOutcome::CodeAccepted(accepted) => Ok(GovernanceReceipt {
                digest: accepted,
                status: TrustStatus::Accepted,
                commit_index: receipt.index,
                term: receipt.term,
            }),
            ApplyOutcome::CodeRejected(e) => Err(e.into()),
            other => Err(GovernanceError::UnexpectedOutcome(other)),
        }
    }

    pub async fn retire(&self, digest: CodeDigest) -> Result<GovernanceReceipt, GovernanceError> {
        let receipt = self.submit(StateOp::RetireCode { digest }).await?;
        match receipt.outcome {
            ApplyOutcome::CodeRetired(retired) => Ok(GovernanceReceipt {
                digest: retired,
                status: TrustStatus::Retired,
                commit_index: receipt.index,
                term: receipt.term,
            }),
            ApplyOutcome::CodeRejected(e) => Err(e.into()),
            other => Err(GovernanceError::UnexpectedOutcome(other)),
        }
    }

    /// Propose, then wait until this member has applied the entry so an
    /// immediate read observes it.
    async fn submit(&self, op: StateOp) -> Result<CommitReceipt, GovernanceError> {
        let node_id = self.replica.node_id();
        let receipt = self
            .retry
            .run(self.consensus.as_ref(), "governance", || {
                let consensus = self.consensus.clone();
                let op = op.clone();
                async move { consensus.propose(node_id, op).await }
            })
            .await?;

        self.replica
            .wait_applied(receipt.index, self.sync_timeout)
            .await
            .map_err(|source| GovernanceError::NotApplied {
                index: receipt.index,
                source,
            })?;

        tracing::info!(
            node_id = %node_id,
            index = receipt.index,
            term = receipt.term,
            outcome = ?receipt.outcome,
            "Governance operation committed"
        );

        Ok(receipt)
    }
}
