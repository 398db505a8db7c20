//! Configuration management for Gatehouse.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use portcullis_common::CodeDigest;
use portcullis_common::constants::{
    DEFAULT_CLOCK_SKEW_SECS, DEFAULT_JOIN_TIMEOUT_MS, DEFAULT_LISTEN_ADDR,
    DEFAULT_MAX_EVIDENCE_AGE_SECS, DEFAULT_RETRY_DEADLINE_MS, DEFAULT_RETRY_INITIAL_BACKOFF_MS,
    DEFAULT_RETRY_MAX_BACKOFF_MS, DEFAULT_SYNC_TIMEOUT_MS,
};

use crate::consensus::{ClusterOptions, LeaderRetry};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Address other members and candidates use for this node (defaults to listen_addr)
    #[serde(default)]
    pub advertise_addr: Option<String>,

    /// Hex digest of the code the founding member runs
    #[serde(default)]
    pub founding_digest: Option<String>,

    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub attestation: AttestationConfig,

    #[serde(default)]
    pub governance: GovernanceConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Join and write-path timing
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Time a new member has to reach the commit index
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,

    /// Wait for a governance write to be applied locally
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_ms: u64,

    #[serde(default = "default_retry_initial_backoff")]
    pub retry_initial_backoff_ms: u64,

    #[serde(default = "default_retry_max_backoff")]
    pub retry_max_backoff_ms: u64,

    /// Give up re-proposing after a leader change after this long
    #[serde(default = "default_retry_deadline")]
    pub retry_deadline_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: default_join_timeout(),
            sync_timeout_ms: default_sync_timeout(),
            retry_initial_backoff_ms: default_retry_initial_backoff(),
            retry_max_backoff_ms: default_retry_max_backoff(),
            retry_deadline_ms: default_retry_deadline(),
        }
    }
}

impl AdmissionConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn retry(&self) -> LeaderRetry {
        LeaderRetry::new(
            Duration::from_millis(self.retry_initial_backoff_ms),
            Duration::from_millis(self.retry_max_backoff_ms),
            Duration::from_millis(self.retry_deadline_ms),
        )
    }
}

/// Evidence verification
#[derive(Debug, Clone, Deserialize)]
pub struct AttestationConfig {
    #[serde(default = "default_max_evidence_age")]
    pub max_evidence_age_secs: u64,

    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,

    /// Trusted quote endorsers (endorser id -> base64url ed25519 public key)
    #[serde(default)]
    pub endorsers: HashMap<String, String>,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            max_evidence_age_secs: default_max_evidence_age(),
            clock_skew_secs: default_clock_skew(),
            endorsers: HashMap::new(),
        }
    }
}

/// Consortium allowed to change the trust registry
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GovernanceConfig {
    /// member id -> base64url ed25519 public key
    #[serde(default)]
    pub members: HashMap<String, String>,
}

/// In-process agreement engine timing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub election_delay_ms: u64,

    #[serde(default)]
    pub apply_delay_ms: u64,
}

impl ClusterConfig {
    pub fn options(&self) -> ClusterOptions {
        ClusterOptions {
            election_delay: Duration::from_millis(self.election_delay_ms),
            apply_delay: Duration::from_millis(self.apply_delay_ms),
        }
    }
}

// Default value functions
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_join_timeout() -> u64 { DEFAULT_JOIN_TIMEOUT_MS }
fn default_sync_timeout() -> u64 { DEFAULT_SYNC_TIMEOUT_MS }
fn default_retry_initial_backoff() -> u64 { DEFAULT_RETRY_INITIAL_BACKOFF_MS }
fn default_retry_max_backoff() -> u64 { DEFAULT_RETRY_MAX_BACKOFF_MS }
fn default_retry_deadline() -> u64 { DEFAULT_RETRY_DEADLINE_MS }
fn default_max_evidence_age() -> u64 { DEFAULT_MAX_EVIDENCE_AGE_SECS } // 5 minutes
fn default_clock_skew() -> u64 { DEFAULT_CLOCK_SKEW_SECS }

/// Command-line values that take precedence over the config file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub listen: Option<String>,
    pub founding_digest: Option<String>,
}

impl AppConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, overrides: &ConfigOverrides) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(config_path))
                .build()
                .context("Failed to load config file")?;

            settings
                .try_deserialize()
                .context("Failed to parse config")?
        } else {
            tracing::warn!(path = config_path, "Config file not found, using defaults");
            Self::default()
        };

        if let Some(ref listen) = overrides.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(ref digest) = overrides.founding_digest {
            config.founding_digest = Some(digest.clone());
        }

        Ok(config)
    }

    pub fn advertise_addr(&self) -> &str {
        self.advertise_addr.as_deref().unwrap_or(&self.listen_addr)
    }

    /// Parsed founding digest, if one is configured
    pub fn founding_digest(&self) -> Result<Option<CodeDigest>> {
        self.founding_digest
            .as_deref()
            .map(|hex| {
                hex.trim()
                    .parse::<CodeDigest>()
                    .with_context(|| format!("Invalid founding digest {hex:?}"))
            })
            .transpose()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            advertise_addr: None,
            founding_digest: None,
            admission: AdmissionConfig::default(),
            attestation: AttestationConfig::default(),
            governance: GovernanceConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}
