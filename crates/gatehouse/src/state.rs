//! Application state and shared resources.

use anyhow::{Context, Result};
use portcullis_common::NodeId;
use std::sync::Arc;
use std::time::Instant;

use crate::admission::NodeAdmissionController;
use crate::attestation::{AttestationVerifier, EndorsedQuoteVerifier};
use crate::config::AppConfig;
use crate::consensus::{Consensus, ReplicaHandle};
use crate::governance::Consortium;
use crate::membership::MembershipCoordinator;
use crate::registry::CodeIdentityRegistry;

/// Shared application state of one member
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<AppConfig>,

    /// Member this process serves
    pub node_id: NodeId,

    /// Agreement layer
    pub consensus: Arc<dyn Consensus>,

    /// This member's replica of the state machine
    pub replica: ReplicaHandle,

    pub registry: CodeIdentityRegistry,
    pub membership: MembershipCoordinator,
    pub admission: NodeAdmissionController,

    /// Keys allowed to call governance endpoints
    pub consortium: Arc<Consortium>,

    pub started_at: Instant,
}

impl AppState {
    /// Wire the services of member `node_id` on top of `consensus`
    pub fn new(config: AppConfig, node_id: NodeId, consensus: Arc<dyn Consensus>) -> Result<Self> {
        let replica = consensus
            .replica(node_id)
            .with_context(|| format!("Node {node_id} has no local replica"))?;

        let verifier = EndorsedQuoteVerifier::new(
            &config.attestation.endorsers,
            config.attestation.max_evidence_age_secs,
            config.attestation.clock_skew_secs,
        )
        .context("Failed to load attestation endorsers")?;
        let consortium = Consortium::from_config(&config.governance.members)
            .context("Failed to load consortium members")?;

        tracing::info!(
            node_id = %node_id,
            endorsers = verifier.endorser_count(),
            consortium = consortium.len(),
            "Trust anchors loaded"
        );
        if consortium.is_empty() {
            tracing::warn!("No consortium members configured; governance calls will be rejected");
        }

        let retry = config.admission.retry();
        let registry = CodeIdentityRegistry::new(
            replica.clone(),
            consensus.clone(),
            retry.clone(),
            config.admission.sync_timeout(),
        );
        let membership = MembershipCoordinator::new(replica.clone(), consensus.clone(), retry);
        let verifier: Arc<dyn AttestationVerifier> = Arc::new(verifier);
        let admission = NodeAdmissionController::new(
            verifier,
            registry.clone(),
            membership.clone(),
            config.admission.join_timeout(),
        );

        Ok(Self {
            config: Arc::new(config),
            node_id,
            consensus,
            replica,
            registry,
            membership,
            admission,
            consortium: Arc::new(consortium),
            started_at: Instant::now(),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
