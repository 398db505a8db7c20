//! Consortium authorization for governance calls.
//!
//! Each governance call names a consortium member (`X-Member-Id`) and carries
//! that member's ed25519 signature over `"<action>:<digest>"`
//! (`X-Member-Signature`, base64url).

use anyhow::{Context, Result};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use portcullis_common::CodeDigest;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::attestation::decode_verifying_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernanceAction {
    Accept,
    Retire,
}

impl fmt::Display for GovernanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => write!(f, "accept"),
            Self::Retire => write!(f, "retire"),
        }
    }
}

/// Bytes a member signs to authorize `action` on `digest`
pub fn signing_payload(action: GovernanceAction, digest: &CodeDigest) -> String {
    format!("{action}:{digest}")
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("no consortium members are configured")]
    NoConsortium,

    #[error("unknown consortium member {0:?}")]
    UnknownMember(String),

    #[error("signature is not valid base64url ed25519")]
    BadEncoding,

    #[error("signature does not verify for member {0:?}")]
    BadSignature(String),
}

/// Members allowed to change the trust registry
#[derive(Debug, Default)]
pub struct Consortium {
    members: HashMap<String, VerifyingKey>,
}

impl Consortium {
    /// Build from `member id -> base64url public key`
    pub fn from_config(members: &HashMap<String, String>) -> Result<Self> {
        let mut keys = HashMap::new();
        for (id, pubkey_b64) in members {
            let key = decode_verifying_key(pubkey_b64)
                .with_context(|| format!("Invalid public key for consortium member {id}"))?;
            keys.insert(id.clone(), key);
        }
        Ok(Self { members: keys })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn authorize(
        &self,
        member_id: &str,
        signature_b64: &str,
        action: GovernanceAction,
        digest: &CodeDigest,
    ) -> Result<(), AuthError> {
        if self.members.is_empty() {
            return Err(AuthError::NoConsortium);
        }
        let key = self
            .members
            .get(member_id)
            .ok_or_else(|| AuthError::UnknownMember(member_id.to_string()))?;

        let sig_bytes = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthError::BadEncoding)?;
        let sig_array: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| AuthError::BadEncoding)?;

        key.verify(
            signing_payload(action, digest).as_bytes(),
            &Signature::from_bytes(&sig_array),
        )
        .map_err(|_| AuthError::BadSignature(member_id.to_string()))
    }
}

/// Signing side of a consortium member
pub struct ConsortiumMember {
    id: String,
    signing_key: SigningKey,
}

impl ConsortiumMember {
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

    pub fn public_key_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.verifying_key().as_bytes())
    }

    /// base64url signature for the `X-Member-Signature` header
    pub fn sign(&self, action: GovernanceAction, digest: &CodeDigest) -> String {
        let signature = self.signing_key.sign(signing_payload(action, digest).as_bytes());
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consortium(member: &ConsortiumMember) -> Consortium {
        Consortium::from_config(&HashMap::from([(
            member.id().to_string(),
            member.public_key_b64(),
        )]))
        .unwrap()
    }

    #[test]
    fn test_payload_format() {
        let digest = CodeDigest::from_bytes([0xab; 32]);
        assert_eq!(
            signing_payload(GovernanceAction::Retire, &digest),
            format!("retire:{}", "ab".repeat(32))
        );
    }

    #[test]
    fn test_member_signature_authorizes() {
        let operator = ConsortiumMember::generate("operator");
        let consortium = consortium(&operator);
        let digest = CodeDigest::measure(b"b2");

        let signature = operator.sign(GovernanceAction::Accept, &digest);
        consortium
            .authorize("operator", &signature, GovernanceAction::Accept, &digest)
            .unwrap();
    }

    #[test]
    fn test_signature_bound_to_action_and_digest() {
        let operator = ConsortiumMember::generate("operator");
        let consortium = consortium(&operator);
        let digest = CodeDigest::measure(b"b2");
        let signature = operator.sign(GovernanceAction::Accept, &digest);

        assert!(matches!(
            consortium.authorize("operator", &signature, GovernanceAction::Retire, &digest),
            Err(AuthError::BadSignature(_))
        ));
        assert!(matches!(
            consortium.authorize(
                "operator",
                &signature,
                GovernanceAction::Accept,
                &CodeDigest::measure(b"a1")
            ),
            Err(AuthError::BadSignature(_))
        ));
    }

    #[test]
    fn test_rejections() {
        let operator = ConsortiumMember::generate("operator");
        let digest = CodeDigest::measure(b"b2");
        let signature = operator.sign(GovernanceAction::Accept, &digest);

        assert!(matches!(
            Consortium::default().authorize("operator", &signature, GovernanceAction::Accept, &digest),
            Err(AuthError::NoConsortium)
        ));

        let consortium = consortium(&operator);
        assert!(matches!(
            consortium.authorize("intruder", &signature, GovernanceAction::Accept, &digest),
            Err(AuthError::UnknownMember(_))
        ));
        assert!(matches!(
            consortium.authorize("operator", "%%%", GovernanceAction::Accept, &digest),
            Err(AuthError::BadEncoding)
        ));
    }
}
