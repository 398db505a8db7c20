use std::future::Future;
use std::time::{Duration, Instant};

use portcullis_common::constants::{
    DEFAULT_RETRY_DEADLINE_MS, DEFAULT_RETRY_INITIAL_BACKOFF_MS, DEFAULT_RETRY_MAX_BACKOFF_MS,
};
use rand::Rng;
use tracing::{info, warn};

use super::{Consensus, ConsensusError};

/// Retry policy for proposals that fail while leadership is changing.
///
/// Retryable errors are retried with jittered exponential backoff until the
/// deadline; everything else is returned on the first failure.
#[derive(Debug, Clone)]
pub struct LeaderRetry {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Total budget across all attempts
    pub deadline: Duration,
}

impl Default for LeaderRetry {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(DEFAULT_RETRY_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_RETRY_MAX_BACKOFF_MS),
            deadline: Duration::from_millis(DEFAULT_RETRY_DEADLINE_MS),
        }
    }
}

impl LeaderRetry {
    pub fn new(initial_backoff: Duration, max_backoff: Duration, deadline: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            deadline,
        }
    }

    /// Run `attempt` until it succeeds, fails permanently, or the deadline passes
    pub async fn run<T, F, Fut>(
        &self,
        consensus: &dyn Consensus,
        operation: &str,
        mut attempt: F,
    ) -> Result<T, ConsensusError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ConsensusError>>,
    {
        let started = Instant::now();
        let mut backoff = self.initial_backoff;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let error = match attempt().await {
                Ok(value) => {
                    if attempts > 1 {
                        info!(
                            operation,
                            attempts,
                            leader = ?consensus.current_leader(),
                            "Succeeded after leader change"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let wait = jittered(backoff);
            if !error.is_retryable() || started.elapsed() + wait > self.deadline {
                return Err(error);
            }

            warn!(
                operation,
                attempt = attempts,
                error = %error,
                leader = ?consensus.current_leader(),
                backoff_ms = wait.as_millis() as u64,
                "Retrying against current leader"
            );
            tokio::time::sleep(wait).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }
}

/// Up to 50% extra so retrying callers don't stampede a new leader
fn jittered(backoff: Duration) -> Duration {
    let millis = backoff.as_millis() as u64;
    if millis < 2 {
        return backoff;
    }
    Duration::from_millis(millis + rand::rng().random_range(0..=millis / 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{ClusterOptions, InMemoryCluster};
    use crate::ledger::StateOp;
    use portcullis_common::CodeDigest;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> LeaderRetry {
        LeaderRetry::new(
            Duration::from_millis(10),
            Duration::from_millis(40),
            Duration::from_secs(2),
        )
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let wait = jittered(Duration::from_millis(100));
            assert!(wait >= Duration::from_millis(100));
            assert!(wait <= Duration::from_millis(150));
        }
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_retries_until_new_leader() {
        let options = ClusterOptions {
            election_delay: Duration::from_millis(50),
            ..Default::default()
        };
        let (cluster, founder) =
            InMemoryCluster::bootstrap(options, "node-0:8080", CodeDigest::from_bytes([1; 32]));
        let follower = match cluster
            .propose(
                founder,
                StateOp::AddMember {
                    address: "node-1:8080".into(),
                    code_digest: CodeDigest::from_bytes([1; 32]),
                    evidence: None,
                },
            )
            .await
            .unwrap()
            .outcome
        {
            crate::ledger::ApplyOutcome::MemberAdded(record) => record.node_id,
            other => panic!("unexpected outcome {other:?}"),
        };
        let third = cluster
            .propose(
                founder,
                StateOp::AddMember {
                    address: "node-2:8080".into(),
                    code_digest: CodeDigest::from_bytes([1; 32]),
                    evidence: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(third.index, 4);

        cluster.stop_node(founder);
        assert_eq!(cluster.current_leader(), None);

        let attempts = AtomicU32::new(0);
        let receipt = fast()
            .run(&cluster, "test", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                let cluster = cluster.clone();
                async move {
                    cluster
                        .propose(follower, StateOp::AcceptCode { digest: CodeDigest::from_bytes([2; 32]) })
                        .await
                }
            })
            .await
            .unwrap();

        assert!(attempts.load(Ordering::SeqCst) > 1);
        assert_eq!(receipt.term, 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_fail_fast() {
        let (cluster, _) = InMemoryCluster::bootstrap(
            ClusterOptions::default(),
            "node-0:8080",
            CodeDigest::from_bytes([1; 32]),
        );
        let stranger = portcullis_common::NodeId::new(42);

        let attempts = AtomicU32::new(0);
        let result = fast()
            .run(&cluster, "test", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                let cluster = cluster.clone();
                async move {
                    cluster
                        .propose(stranger, StateOp::AcceptCode { digest: CodeDigest::from_bytes([2; 32]) })
                        .await
                }
            })
            .await;

        assert_eq!(result, Err(ConsensusError::NodeUnavailable(stranger)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_at_deadline() {
        let (cluster, founder) = InMemoryCluster::bootstrap(
            ClusterOptions::default(),
            "node-0:8080",
            CodeDigest::from_bytes([1; 32]),
        );
        let policy = LeaderRetry::new(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(60),
        );

        let started = Instant::now();
        let result: Result<(), _> = policy
            .run(&cluster, "test", || async { Err(ConsensusError::NoLeader) })
            .await;

        assert_eq!(result, Err(ConsensusError::NoLeader));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(cluster.current_leader(), Some(founder));
    }
}
