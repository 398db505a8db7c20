//! Replicated state machine.
//!
//! Every member applies the same log entries in commit order, so any two
//! members at the same applied index hold identical state. Validation of
//! governance and membership operations happens here, at apply time, which
//! makes the outcome of racing operations a function of commit order alone.

use std::collections::BTreeMap;

use portcullis_common::{AttestationEvidence, CodeDigest, NodeId, TrustStatus};
use serde::{Deserialize, Serialize};

use crate::registry::{CodeRegistry, RegistryError};

pub type LogIndex = u64;
pub type Term = u64;

/// Operations carried in the agreed log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StateOp {
    AcceptCode { digest: CodeDigest },
    RetireCode { digest: CodeDigest },
    AddMember {
        address: String,
        code_digest: CodeDigest,
        /// Verified evidence of the candidate; none for the founder
        #[serde(default, skip_serializing_if = "Option::is_none")]
        evidence: Option<AttestationEvidence>,
    },
    RemoveMember { node_id: NodeId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub op: StateOp,
}

/// Replicated membership record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub node_id: NodeId,
    pub address: String,
    pub code_digest: CodeDigest,

    /// Index of the entry that added this member
    pub added_at: LogIndex,

    /// Evidence the member was last admitted with
    pub evidence: Option<AttestationEvidence>,
}

/// Result of applying one entry; identical on every replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    CodeAccepted(CodeDigest),
    CodeRetired(CodeDigest),
    CodeRejected(RegistryError),
    MemberAdded(MemberRecord),
    /// The address was already a member on the same code; only its evidence
    /// is refreshed
    MemberExists(MemberRecord),
    /// The address came back on different code; the old record is dropped
    /// and a new member is assigned
    MemberReplaced {
        previous: MemberRecord,
        record: MemberRecord,
    },
    /// The digest lost its trust between the admission check and the commit
    MemberRefused {
        digest: CodeDigest,
        status: Option<TrustStatus>,
    },
    MemberRemoved(NodeId),
    MemberNotFound(NodeId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicatedState {
    registry: CodeRegistry,
    members: BTreeMap<NodeId, MemberRecord>,
    next_node_id: u64,
    last_applied: LogIndex,
}

impl ReplicatedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &CodeRegistry {
        &self.registry
    }

    pub fn members(&self) -> Vec<MemberRecord> {
        self.members.values().cloned().collect()
    }

    pub fn member(&self, node_id: NodeId) -> Option<&MemberRecord> {
        self.members.get(&node_id)
    }

    pub fn is_member(&self, node_id: NodeId) -> bool {
        self.members.contains_key(&node_id)
    }

    pub fn member_ids(&self) -> Vec<NodeId> {
        self.members.keys().copied().collect()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Apply a committed entry. Entries must be applied in index order.
    pub fn apply(&mut self, entry: &LogEntry) -> ApplyOutcome {
        debug_assert_eq!(entry.index, self.last_applied + 1, "log applied out of order");
        self.last_applied = entry.index;

        match &entry.op {
            StateOp::AcceptCode { digest } => match self.registry.accept(*digest) {
                Ok(()) => ApplyOutcome::CodeAccepted(*digest),
                Err(e) => ApplyOutcome::CodeRejected(e),
            },
            StateOp::RetireCode { digest } => match self.registry.retire(*digest) {
                Ok(()) => ApplyOutcome::CodeRetired(*digest),
                Err(e) => ApplyOutcome::CodeRejected(e),
            },
            StateOp::AddMember {
                address,
                code_digest,
                evidence,
            } => self.add_member(address, *code_digest, evidence.clone(), entry.index),
            StateOp::RemoveMember { node_id } => match self.members.remove(node_id) {
                Some(_) => ApplyOutcome::MemberRemoved(*node_id),
                None => ApplyOutcome::MemberNotFound(*node_id),
            },
        }
    }

    fn add_member(
        &mut self,
        address: &str,
        code_digest: CodeDigest,
        evidence: Option<AttestationEvidence>,
        index: LogIndex,
    ) -> ApplyOutcome {
        let status = self.registry.lookup(&code_digest);
        if status != Some(TrustStatus::Accepted) {
            return ApplyOutcome::MemberRefused {
                digest: code_digest,
                status,
            };
        }

        let existing = self
            .members
            .values()
            .find(|m| m.address == address)
            .map(|m| m.node_id);
        let Some(existing) = existing else {
            return ApplyOutcome::MemberAdded(self.insert_member(address, code_digest, evidence, index));
        };

        if let Some(record) = self.members.get_mut(&existing) {
            if record.code_digest == code_digest {
                if evidence.is_some() {
                    record.evidence = evidence;
                }
                return ApplyOutcome::MemberExists(record.clone());
            }
        }

        match self.members.remove(&existing) {
            Some(previous) => ApplyOutcome::MemberReplaced {
                previous,
                record: self.insert_member(address, code_digest, evidence, index),
            },
            None => ApplyOutcome::MemberAdded(self.insert_member(address, code_digest, evidence, index)),
        }
    }

    fn insert_member(
        &mut self,
        address: &str,
        code_digest: CodeDigest,
        evidence: Option<AttestationEvidence>,
        index: LogIndex,
    ) -> MemberRecord {
        let record = MemberRecord {
            node_id: NodeId::new(self.next_node_id),
            address: address.to_string(),
            code_digest,
            added_at: index,
            evidence,
        };
        self.next_node_id += 1;
        self.members.insert(record.node_id, record.clone());
        record
    }
}
