//! In-process agreement engine.
//!
//! Stands in for the external replication engine when a node runs standalone
//! and in tests. It keeps one agreed log, commits an entry once a majority of
//! the current members is live, elects the most up-to-date live member after
//! the leader stops, and runs one applier task per replica so members catch up
//! asynchronously (optionally slowed by `apply_delay`).

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use portcullis_common::{CodeDigest, NodeId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CommitReceipt, Consensus, ConsensusError, ReplicaHandle};
use crate::ledger::{ApplyOutcome, LogEntry, LogIndex, ReplicatedState, StateOp, Term};

/// Timing knobs of the in-process engine
#[derive(Debug, Clone, Default)]
pub struct ClusterOptions {
    /// Time without a leader after the leader stops
    pub election_delay: Duration,
    /// Delay before each entry a replica applies
    pub apply_delay: Duration,
}

/// Handle to an in-process cluster. Cheap to clone.
#[derive(Clone)]
pub struct InMemoryCluster {
    inner: Arc<Inner>,
}

struct Inner {
    options: ClusterOptions,
    core: Mutex<Core>,
    commits: watch::Sender<LogIndex>,
}

#[derive(Default)]
struct Core {
    log: Vec<LogEntry>,
    /// State at the commit index; source of every `CommitReceipt` outcome
    committed: ReplicatedState,
    term: Term,
    leader: Option<NodeId>,
    replicas: BTreeMap<NodeId, Replica>,
    crash_leader_on_next_proposal: bool,
}

struct Replica {
    state: Arc<RwLock<ReplicatedState>>,
    applied: watch::Receiver<LogIndex>,
    live: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Replica {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

impl Core {
    /// (live voters, voters) of the committed configuration
    fn quorum(&self) -> (usize, usize) {
        let voters = self.committed.member_ids();
        let live = voters
            .iter()
            .filter(|id| self.replicas.get(*id).is_some_and(Replica::is_live))
            .count();
        (live, voters.len())
    }

    fn elect(&mut self) {
        if self.leader.is_some() {
            return;
        }

        let (live, voters) = self.quorum();
        if live * 2 <= voters {
            warn!(live, voters, term = self.term, "Election stalled without quorum");
            return;
        }

        // Most up-to-date live member wins, lowest id breaks ties
        self.leader = self
            .committed
            .member_ids()
            .into_iter()
            .filter_map(|id| {
                self.replicas
                    .get(&id)
                    .filter(|replica| replica.is_live())
                    .map(|replica| (id, *replica.applied.borrow()))
            })
            .max_by(|(a_id, a_applied), (b_id, b_applied)| {
                a_applied.cmp(b_applied).then(b_id.cmp(a_id))
            })
            .map(|(id, _)| id);

        if let Some(leader) = self.leader {
            info!(leader = %leader, term = self.term, "Leader elected");
        }
    }
}

impl InMemoryCluster {
    /// Start a cluster whose founding member runs `founding_code`.
    ///
    /// The founder becomes leader of term 1 and the registry starts with the
    /// founding digest accepted. Must be called from within a tokio runtime.
    pub fn bootstrap(
        options: ClusterOptions,
        founder_address: &str,
        founding_code: CodeDigest,
    ) -> (Self, NodeId) {
        let (commits, _) = watch::channel(0);
        let cluster = Self {
            inner: Arc::new(Inner {
                options,
                core: Mutex::new(Core::default()),
                commits,
            }),
        };

        let (founder, commit_index) = {
            let mut core = cluster.inner.core.lock();
            core.term = 1;
            cluster.append(&mut core, StateOp::AcceptCode { digest: founding_code });
            let receipt = cluster.append(
                &mut core,
                StateOp::AddMember {
                    address: founder_address.to_string(),
                    code_digest: founding_code,
                    evidence: None,
                },
            );
            let founder = match receipt.outcome {
                ApplyOutcome::MemberAdded(record) => record.node_id,
                other => unreachable!("fresh registry refused the founder: {other:?}"),
            };
            core.leader = Some(founder);
            (founder, receipt.index)
        };
        cluster.inner.commits.send_replace(commit_index);

        info!(
            founder = %founder,
            address = founder_address,
            code = %founding_code,
            "Cluster bootstrapped"
        );

        (cluster, founder)
    }

    /// Stop a member's process. Returns false if it was not running.
    pub fn stop_node(&self, node_id: NodeId) -> bool {
        let mut core = self.inner.core.lock();
        self.halt(&mut core, node_id)
    }

    /// Make the leader fail while handling the next proposal, before the
    /// entry is replicated.
    pub fn crash_leader_on_next_proposal(&self) {
        self.inner.core.lock().crash_leader_on_next_proposal = true;
    }

    pub fn is_live(&self, node_id: NodeId) -> bool {
        self.inner
            .core
            .lock()
            .replicas
            .get(&node_id)
            .is_some_and(Replica::is_live)
    }

    /// Members whose replica is running
    pub fn live_members(&self) -> Vec<NodeId> {
        let core = self.inner.core.lock();
        core.committed
            .member_ids()
            .into_iter()
            .filter(|id| core.replicas.get(id).is_some_and(Replica::is_live))
            .collect()
    }

    /// State at the commit index
    pub fn committed_state(&self) -> ReplicatedState {
        self.inner.core.lock().committed.clone()
    }

    pub fn log(&self) -> Vec<LogEntry> {
        self.inner.core.lock().log.clone()
    }

    /// Append and commit one entry; the caller has checked leadership and quorum.
    fn append(&self, core: &mut Core, op: StateOp) -> CommitReceipt {
        let entry = LogEntry {
            index: core.log.len() as LogIndex + 1,
            term: core.term,
            op,
        };
        let outcome = core.committed.apply(&entry);
        let receipt = CommitReceipt {
            index: entry.index,
            term: entry.term,
            outcome,
        };
        core.log.push(entry);

        match &receipt.outcome {
            ApplyOutcome::MemberAdded(record) => self.start_replica(core, record.node_id),
            ApplyOutcome::MemberReplaced { previous, record } => {
                self.start_replica(core, record.node_id);
                self.halt(core, previous.node_id);
            }
            // A stopped member presenting fresh evidence has been restarted
            ApplyOutcome::MemberExists(record)
                if !core.replicas.get(&record.node_id).is_some_and(Replica::is_live) =>
            {
                self.start_replica(core, record.node_id);
            }
            ApplyOutcome::MemberRemoved(node_id) => {
                self.halt(core, *node_id);
            }
            _ => {}
        }

        receipt
    }

    fn start_replica(&self, core: &mut Core, node_id: NodeId) {
        let state = Arc::new(RwLock::new(ReplicatedState::new()));
        let (applied_tx, applied) = watch::channel(0);
        let live = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(run_replica(
            Arc::downgrade(&self.inner),
            state.clone(),
            applied_tx,
            self.inner.commits.subscribe(),
            self.inner.options.apply_delay,
        ));

        core.replicas.insert(
            node_id,
            Replica {
                state,
                applied,
                live,
                task,
            },
        );
        debug!(node_id = %node_id, "Replica started");
    }

    fn halt(&self, core: &mut Core, node_id: NodeId) -> bool {
        let Some(replica) = core.replicas.get(&node_id) else {
            return false;
        };
        if !replica.live.swap(false, Ordering::AcqRel) {
            return false;
        }
        replica.task.abort();
        info!(node_id = %node_id, "Node stopped");

        if core.leader == Some(node_id) {
            self.start_election(core);
        }
        true
    }

    fn start_election(&self, core: &mut Core) {
        core.leader = None;
        core.term += 1;
        warn!(term = core.term, "Leader lost, starting election");

        let delay = self.inner.options.election_delay;
        if delay.is_zero() {
            core.elect();
            return;
        }

        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.core.lock().elect();
            }
        });
    }
}

#[async_trait]
impl Consensus for InMemoryCluster {
    async fn propose(&self, via: NodeId, op: StateOp) -> Result<CommitReceipt, ConsensusError> {
        let receipt = {
            let mut core = self.inner.core.lock();
            if !core.replicas.get(&via).is_some_and(Replica::is_live) {
                return Err(ConsensusError::NodeUnavailable(via));
            }

            let leader = core.leader.ok_or(ConsensusError::NoLeader)?;
            if core.crash_leader_on_next_proposal {
                core.crash_leader_on_next_proposal = false;
                self.halt(&mut core, leader);
                return Err(ConsensusError::LeaderLost { leader });
            }

            let (live, voters) = core.quorum();
            if live * 2 <= voters {
                return Err(ConsensusError::QuorumUnavailable { live, voters });
            }

            self.append(&mut core, op)
        };
        self.inner.commits.send_replace(receipt.index);

        debug!(
            via = %via,
            index = receipt.index,
            term = receipt.term,
            "Entry committed"
        );
        Ok(receipt)
    }

    fn current_leader(&self) -> Option<NodeId> {
        self.inner.core.lock().leader
    }

    fn current_term(&self) -> Term {
        self.inner.core.lock().term
    }

    fn commit_index(&self) -> LogIndex {
        self.inner.core.lock().log.len() as LogIndex
    }

    fn replica(&self, node_id: NodeId) -> Option<ReplicaHandle> {
        let core = self.inner.core.lock();
        core.replicas.get(&node_id).map(|replica| {
            ReplicaHandle::new(
                node_id,
                replica.state.clone(),
                replica.applied.clone(),
                replica.live.clone(),
            )
        })
    }
}

/// Apply committed entries to one replica, in order, until aborted.
async fn run_replica(
    inner: Weak<Inner>,
    state: Arc<RwLock<ReplicatedState>>,
    applied: watch::Sender<LogIndex>,
    mut commits: watch::Receiver<LogIndex>,
    apply_delay: Duration,
) {
    loop {
        commits.borrow_and_update();

        loop {
            let next = state.read().last_applied() + 1;
            let entry = {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let core = inner.core.lock();
                core.log.get(next as usize - 1).cloned()
            };
            let Some(entry) = entry else {
                break;
            };

            if !apply_delay.is_zero() {
                tokio::time::sleep(apply_delay).await;
            }
            state.write().apply(&entry);
            applied.send_replace(entry.index);
        }

        if commits.changed().await.is_err() {
            return;
        }
    }
}
