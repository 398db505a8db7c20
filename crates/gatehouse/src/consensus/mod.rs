//! Seam to the cluster's agreement protocol.
//!
//! The replication engine itself is external. Gatehouse only needs to submit
//! operations, learn where the log is committed, find the current leader, and
//! read a member's local replica of the state machine.
//!
//! ```text
//!   propose(op) ──► leader ──► majority commit ──► every replica applies in order
//!                                  │
//!                        CommitReceipt { index, term, outcome }
//! ```

mod memory;
mod retry;

pub use memory::{ClusterOptions, InMemoryCluster};
pub use retry::LeaderRetry;

use async_trait::async_trait;
use parking_lot::RwLock;
use portcullis_common::NodeId;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::ledger::{ApplyOutcome, LogIndex, ReplicatedState, StateOp, Term};

/// Agreement-protocol failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    #[error("no leader is currently elected")]
    NoLeader,

    #[error("quorum unavailable: {live} of {voters} voters reachable")]
    QuorumUnavailable { live: usize, voters: usize },

    /// The leader failed before the entry was replicated; nothing was committed
    #[error("leader {leader} failed before the proposal committed")]
    LeaderLost { leader: NodeId },

    /// The member a proposal was submitted through is not running
    #[error("node {0} is not a live member")]
    NodeUnavailable(NodeId),
}

impl ConsensusError {
    /// Transient conditions a new leader resolves
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoLeader | Self::QuorumUnavailable { .. } | Self::LeaderLost { .. }
        )
    }
}

/// A committed entry and the outcome every replica computes for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub index: LogIndex,
    pub term: Term,
    pub outcome: ApplyOutcome,
}

#[async_trait]
pub trait Consensus: Send + Sync {
    /// Submit `op` through member `via`; forwarded to the leader and resolved
    /// once the entry commits.
    async fn propose(&self, via: NodeId, op: StateOp) -> Result<CommitReceipt, ConsensusError>;

    /// Current leader, `None` while an election is in progress
    fn current_leader(&self) -> Option<NodeId>;

    fn current_term(&self) -> Term;

    /// Highest committed log index
    fn commit_index(&self) -> LogIndex;

    /// Local replica of a member, if the member ever ran on this engine
    fn replica(&self, node_id: NodeId) -> Option<ReplicaHandle>;
}

/// Failure while waiting for a replica to apply an index
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("node {node_id} applied {applied} of {target} before the deadline")]
    Timeout {
        node_id: NodeId,
        target: LogIndex,
        applied: LogIndex,
    },

    #[error("replica of node {0} is not running")]
    ReplicaStopped(NodeId),
}

/// Read-through view of one member's replicated state.
///
/// Updated on every newly applied index; readers never wait on the network.
#[derive(Clone, Debug)]
pub struct ReplicaHandle {
    node_id: NodeId,
    state: Arc<RwLock<ReplicatedState>>,
    applied: watch::Receiver<LogIndex>,
    live: Arc<AtomicBool>,
}

impl ReplicaHandle {
    pub(crate) fn new(
        node_id: NodeId,
        state: Arc<RwLock<ReplicatedState>>,
        applied: watch::Receiver<LogIndex>,
        live: Arc<AtomicBool>,
    ) -> Self {
        Self {
            node_id,
            state,
            applied,
            live,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn read<R>(&self, f: impl FnOnce(&ReplicatedState) -> R) -> R {
        f(&self.state.read())
    }

    pub fn applied_index(&self) -> LogIndex {
        *self.applied.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Wait until this replica has applied `target`
    pub async fn wait_applied(&self, target: LogIndex, timeout: Duration) -> Result<LogIndex, SyncError> {
        if !self.is_live() {
            return Err(SyncError::ReplicaStopped(self.node_id));
        }

        let mut applied = self.applied.clone();
        let waited = tokio::time::timeout(timeout, async move {
            applied.wait_for(|index| *index >= target).await.map(|index| *index)
        })
        .await;

        match waited {
            Ok(Ok(index)) => Ok(index),
            Ok(Err(_)) => Err(SyncError::ReplicaStopped(self.node_id)),
            Err(_) => Err(SyncError::Timeout {
                node_id: self.node_id,
                target,
                applied: self.applied_index(),
            }),
        }
    }
}
