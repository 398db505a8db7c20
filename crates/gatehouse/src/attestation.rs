//! Attestation evidence verification.
//!
//! A candidate proves which code it runs with an endorsed quote: a small JSON
//! document naming the measured code digest and the address the evidence is
//! bound to, signed with ed25519 by an endorser the cluster trusts. Hardware
//! quote formats plug in behind [`AttestationVerifier`].
//!
//! Evidence format: `quote` = base64url(quote JSON), `signature` = base64url(64 bytes)
//!
//! Verification properties:
//! - Quotes are short-lived (5 minutes default)
//! - Quotes are bound to the candidate's advertised address
//! - Only configured endorsers can produce verifiable quotes

use anyhow::{Context, Result, bail};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use portcullis_common::{AttestationEvidence, CodeDigest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Checks a candidate's evidence and extracts the measured code identity.
///
/// Verification may be slow (certificate chains, collateral lookups); callers
/// run it on the blocking pool.
pub trait AttestationVerifier: Send + Sync {
    fn verify(&self, evidence: &AttestationEvidence) -> Result<VerifiedQuote, AttestationError>;
}

#[derive(Debug, Error)]
pub enum AttestationError {
    #[error("malformed evidence: {0}")]
    Malformed(String),

    #[error("quote endorsed by unknown endorser {0:?}")]
    UnknownEndorser(String),

    #[error("endorsement signature does not verify")]
    BadSignature,

    #[error("quote issued at {issued_at} is older than {max_age_secs}s")]
    Expired { issued_at: i64, max_age_secs: u64 },

    #[error("quote issued at {issued_at} is in the future (now {now})")]
    NotYetValid { issued_at: i64, now: i64 },
}

/// Signed body of the evidence
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Quote {
    /// Digest of the code the candidate runs
    pub measurement: CodeDigest,
    /// Data bound into the quote; the candidate's advertised address
    pub report_data: String,
    /// Unix seconds
    pub issued_at: i64,
    pub endorser: String,
}

/// Evidence that passed verification
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedQuote {
    pub measurement: CodeDigest,
    pub report_data: String,
    pub endorser: String,
    pub issued_at: i64,
}

/// Verifies quotes signed by a fixed set of endorsers
pub struct EndorsedQuoteVerifier {
    endorsers: HashMap<String, VerifyingKey>,
    max_age_secs: u64,
    clock_skew_secs: u64,
}

impl EndorsedQuoteVerifier {
    /// Build from `endorser id -> base64url public key`
    pub fn new(
        endorsers: &HashMap<String, String>,
        max_age_secs: u64,
        clock_skew_secs: u64,
    ) -> Result<Self> {
        let mut keys = HashMap::new();
        for (id, pubkey_b64) in endorsers {
            let key = decode_verifying_key(pubkey_b64)
                .with_context(|| format!("Invalid public key for endorser {id}"))?;
            keys.insert(id.clone(), key);
        }

        if keys.is_empty() {
            tracing::warn!("No attestation endorsers configured; every join will be rejected");
        }

        Ok(Self {
            endorsers: keys,
            max_age_secs,
            clock_skew_secs,
        })
    }

    pub fn add_endorser(&mut self, id: &str, key: VerifyingKey) {
        self.endorsers.insert(id.to_string(), key);
    }

    pub fn endorser_count(&self) -> usize {
        self.endorsers.len()
    }

    fn check_freshness(&self, issued_at: i64) -> Result<(), AttestationError> {
        let now = chrono::Utc::now().timestamp();
        if issued_at > now + self.clock_skew_secs as i64 {
            return Err(AttestationError::NotYetValid { issued_at, now });
        }
        if now - issued_at > self.max_age_secs as i64 {
            return Err(AttestationError::Expired {
                issued_at,
                max_age_secs: self.max_age_secs,
            });
        }
        Ok(())
    }
}

impl AttestationVerifier for EndorsedQuoteVerifier {
    fn verify(&self, evidence: &AttestationEvidence) -> Result<VerifiedQuote, AttestationError> {
        let quote_bytes = URL_SAFE_NO_PAD
            .decode(&evidence.quote)
            .map_err(|e| AttestationError::Malformed(format!("quote encoding: {e}")))?;
        let sig_bytes = URL_SAFE_NO_PAD
            .decode(&evidence.signature)
            .map_err(|e| AttestationError::Malformed(format!("signature encoding: {e}")))?;
        let sig_array: [u8; 64] = sig_bytes.as_slice().try_into().map_err(|_| {
            AttestationError::Malformed(format!("signature is {} bytes, expected 64", sig_bytes.len()))
        })?;
        let signature = Signature::from_bytes(&sig_array);

        // The endorser id is only trusted once the signature checks out
        let quote: Quote = serde_json::from_slice(&quote_bytes)
            .map_err(|e| AttestationError::Malformed(format!("quote body: {e}")))?;
        let key = self
            .endorsers
            .get(&quote.endorser)
            .ok_or_else(|| AttestationError::UnknownEndorser(quote.endorser.clone()))?;
        key.verify(&quote_bytes, &signature)
            .map_err(|_| AttestationError::BadSignature)?;

        self.check_freshness(quote.issued_at)?;

        tracing::debug!(
            endorser = %quote.endorser,
            measurement = %quote.measurement,
            report_data = %quote.report_data,
            "Attestation quote verified"
        );

        Ok(VerifiedQuote {
            measurement: quote.measurement,
            report_data: quote.report_data,
            endorser: quote.endorser,
            issued_at: quote.issued_at,
        })
    }
}

/// Produces endorsed quotes; the counterpart of [`EndorsedQuoteVerifier`]
pub struct QuoteEndorser {
    id: String,
    signing_key: SigningKey,
}

impl QuoteEndorser {
    /// Endorser with a fresh key
    pub fn generate(id: &str) -> Self {
        use rand_core::OsRng;
        Self {
            id: id.to_string(),
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.verifying_key().as_bytes())
    }

    /// Endorse a measurement bound to `report_data`, issued now
    pub fn endorse(&self, measurement: CodeDigest, report_data: &str) -> Result<AttestationEvidence> {
        self.endorse_at(measurement, report_data, chrono::Utc::now().timestamp())
    }

    pub fn endorse_at(
        &self,
        measurement: CodeDigest,
        report_data: &str,
        issued_at: i64,
    ) -> Result<AttestationEvidence> {
        let quote = Quote {
            measurement,
            report_data: report_data.to_string(),
            issued_at,
            endorser: self.id.clone(),
        };
        let quote_bytes = serde_json::to_vec(&quote).context("Failed to encode quote")?;
        let signature = self.signing_key.sign(&quote_bytes);

        Ok(AttestationEvidence {
            quote: URL_SAFE_NO_PAD.encode(&quote_bytes),
            signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
        })
    }
}

/// Parse a base64url ed25519 public key
pub(crate) fn decode_verifying_key(pubkey_b64: &str) -> Result<VerifyingKey> {
    let pubkey_bytes = URL_SAFE_NO_PAD
        .decode(pubkey_b64)
        .context("Failed to decode public key")?;

    if pubkey_bytes.len() != 32 {
        bail!("Invalid public key length (expected 32 bytes, got {})", pubkey_bytes.len());
    }

    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&pubkey_bytes);
    VerifyingKey::from_bytes(&bytes).context("Invalid public key")
}
