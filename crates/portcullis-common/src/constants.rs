//! Shared constants for Portcullis components.

/// Default gatehouse HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Default time a joining node has to catch up to the commit index (3 seconds)
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 3_000;

/// Default wait for a governance write to be applied locally (5 seconds)
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 5_000;

/// First backoff when no leader is available
pub const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 100;

/// Backoff ceiling while waiting for a new leader
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 2_000;

/// Give up re-proposing after this long
pub const DEFAULT_RETRY_DEADLINE_MS: u64 = 10_000;

/// Maximum age of an attestation quote (5 minutes)
pub const DEFAULT_MAX_EVIDENCE_AGE_SECS: u64 = 300;

/// Tolerated clock skew for quotes issued "in the future"
pub const DEFAULT_CLOCK_SKEW_SECS: u64 = 30;

/// Seconds advertised in `Retry-After` for retryable errors
pub const RETRY_AFTER_SECS: u64 = 1;

/// HTTP header names
pub mod headers {
    /// Consortium member submitting a governance call
    pub const X_MEMBER_ID: &str = "x-member-id";

    /// base64url ed25519 signature over `<action>:<digest>`
    pub const X_MEMBER_SIGNATURE: &str = "x-member-signature";

    /// Commit index of the entry a write produced
    pub const X_COMMIT_INDEX: &str = "x-commit-index";

    /// Term in which a write committed
    pub const X_TERM: &str = "x-term";
}
