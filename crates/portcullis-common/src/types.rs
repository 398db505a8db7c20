//! Core types shared across Portcullis components.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a code identity digest in bytes (SHA-256)
pub const DIGEST_LEN: usize = 32;

/// Code identity: the measurement of one build of the node's trusted code.
///
/// Equality is byte-exact. On the wire a digest is lowercase hex, and the
/// byte ordering used by the registry matches the ordering of that hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodeDigest([u8; DIGEST_LEN]);

impl CodeDigest {
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Measure a code image (SHA-256 over the raw bytes)
    pub fn measure(image: &[u8]) -> Self {
        Self(Sha256::digest(image).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for CodeDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CodeDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeDigest({})", self.to_hex())
    }
}

/// Failure to parse a hex digest
#[derive(Debug, Error, PartialEq)]
pub enum DigestParseError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("expected {DIGEST_LEN} bytes, got {0}")]
    Length(usize),
}

impl FromStr for CodeDigest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())?;
        let bytes: [u8; DIGEST_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| DigestParseError::Length(bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for CodeDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CodeDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Trust status of a code identity in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustStatus {
    /// Permitted for new admissions
    Accepted,
    /// Deliberately withdrawn; kept for audit and precise rejections
    Retired,
}

impl fmt::Display for TrustStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => f.write_str("ACCEPTED"),
            Self::Retired => f.write_str("RETIRED"),
        }
    }
}

/// One registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeVersionEntry {
    pub digest: CodeDigest,
    pub status: TrustStatus,
}

/// Registry snapshot as served by `GET /node/code`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeVersions {
    pub versions: Vec<CodeVersionEntry>,
}

/// Cluster-assigned node identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

/// Role of a member relative to the current leader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Leader,
    Follower,
}

/// A member of the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub node_id: NodeId,

    /// Address the node advertises to its peers
    pub address: String,

    /// Code identity the node was admitted with
    pub code_digest: CodeDigest,

    pub role: NodeRole,
}

/// Attestation evidence presented by a joining node.
///
/// Both fields are base64url (no padding). The encoding of the quote is owned
/// by the verifier; this type only carries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationEvidence {
    pub quote: String,
    pub signature: String,
}

/// Evidence a member was admitted with, as served by `GET /node/quotes`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberQuote {
    pub node_id: NodeId,
    pub address: String,
    pub code_digest: CodeDigest,

    /// Absent for the founding member, which is trusted by configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<AttestationEvidence>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberQuotes {
    pub quotes: Vec<MemberQuote>,
}

/// Join request sent by a prospective node to any current member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Address the candidate will advertise once joined
    pub address: String,

    /// Code identity the candidate claims to run
    pub code_digest: CodeDigest,

    pub evidence: AttestationEvidence,
}

/// Successful join
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub node_id: NodeId,
    pub leader: Option<NodeId>,

    /// Applied index the new node reached before being reported joined
    pub applied_index: u64,
    pub commit_index: u64,
    pub term: u64,
}

/// Body of `POST /gov/code/accept` and `POST /gov/code/retire`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceRequest {
    pub digest: CodeDigest,
}

/// Outcome of a committed governance operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceResponse {
    pub digest: CodeDigest,
    pub status: TrustStatus,
    pub commit_index: u64,
    pub term: u64,
}

/// Current leader as seen by one member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderResponse {
    pub leader: NodeId,
    pub term: u64,
    pub commit_index: u64,
}

/// Error payload returned by every endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error kind, e.g. `CodeIdNotFound`
    pub error: String,
    pub message: String,
    pub retryable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<CodeDigest>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TrustStatus>,
    /// Member the error refers to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_hex_roundtrip_and_order() {
        let low = CodeDigest::from_bytes([0x01; DIGEST_LEN]);
        let high = CodeDigest::from_bytes([0xab; DIGEST_LEN]);

        assert_eq!(low.to_hex().len(), DIGEST_LEN * 2);
        assert_eq!(high.to_hex().parse::<CodeDigest>().unwrap(), high);
        assert!(low < high);
        assert!(low.to_hex() < high.to_hex());
    }

    #[test]
    fn test_digest_rejects_bad_input() {
        assert!(matches!(
            "abcd".parse::<CodeDigest>(),
            Err(DigestParseError::Length(2))
        ));
        assert!(matches!(
            "zz".repeat(DIGEST_LEN).parse::<CodeDigest>(),
            Err(DigestParseError::Hex(_))
        ));
    }

    #[test]
    fn test_measure_is_sha256() {
        // sha256("")
        let empty = CodeDigest::measure(b"");
        assert_eq!(
            empty.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(CodeDigest::measure(b"liblogging"), CodeDigest::measure(b"libjs_generic"));
    }

    #[test]
    fn test_code_versions_wire_shape() {
        let digest = CodeDigest::from_bytes([0x11; DIGEST_LEN]);
        let versions = CodeVersions {
            versions: vec![CodeVersionEntry {
                digest,
                status: TrustStatus::Accepted,
            }],
        };

        let json = serde_json::to_value(&versions).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "versions": [{ "digest": digest.to_hex(), "status": "ACCEPTED" }]
            })
        );

        let retired: TrustStatus = serde_json::from_str("\"RETIRED\"").unwrap();
        assert_eq!(retired, TrustStatus::Retired);
    }
}
