//! Cached signing and authentication information.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::{
    source::{AuthKeyMaterial, MemberSigningInfo},
    types::ClientId,
    validity::ValidityPolicy,
};

/// Signing key and certificate of one member, bounded by a validity window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningInfo {
    /// Key handle on the signer.
    pub key_id: String,
    /// Signature mechanism the key supports.
    pub sign_mechanism: String,
    /// Member the key belongs to.
    pub client_id: ClientId,
    /// DER-encoded signing certificate.
    pub cert: Bytes,
    /// Start of validity.
    pub not_before: DateTime<Utc>,
    /// End of validity, bounded by the certificate and its OCSP response.
    pub not_after: DateTime<Utc>,
}

impl SigningInfo {
    /// Builds signing information from a signer answer.
    #[must_use]
    pub fn from_member(client_id: ClientId, member: MemberSigningInfo, policy: &ValidityPolicy) -> Self {
        let not_after = policy.not_after(member.ocsp_response.as_slice(), member.cert.not_after);
        Self {
            key_id: member.key_id,
            sign_mechanism: member.sign_mechanism,
            client_id,
            cert: member.cert.der,
            not_before: member.cert.not_before,
            not_after,
        }
    }

    /// Returns `true` if `now` lies within `[not_before, not_after]`.
    #[must_use]
    pub fn verify_validity(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}

/// Authentication key of this server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthKeyInfo {
    /// Key handle on the signer.
    pub key_id: String,
    /// DER-encoded chain, authentication certificate first.
    pub cert_chain: Vec<Bytes>,
    /// Start of validity.
    pub not_before: DateTime<Utc>,
    /// End of validity, bounded by the certificate and its OCSP responses.
    pub not_after: DateTime<Utc>,
}

impl AuthKeyInfo {
    /// Builds authentication information from a signer answer.
    #[must_use]
    pub fn from_material(material: AuthKeyMaterial, policy: &ValidityPolicy) -> Self {
        let not_after = policy.not_after(&material.ocsp_responses, material.cert.not_after);
        let mut cert_chain = Vec::with_capacity(material.cert_chain.len() + 1);
        cert_chain.push(material.cert.der);
        cert_chain.extend(material.cert_chain);
        Self { key_id: material.key_id, cert_chain, not_before: material.cert.not_before, not_after }
    }

    /// Returns `true` if `now` lies within `[not_before, not_after]`.
    #[must_use]
    pub fn verify_validity(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}

/// A resolved signing context handed to the message signing path.
#[derive(Debug, Clone)]
pub struct SigningContext {
    info: Arc<SigningInfo>,
}

impl SigningContext {
    pub(crate) fn new(info: Arc<SigningInfo>) -> Self {
        Self { info }
    }

    /// Returns the key handle to sign with.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.info.key_id
    }

    /// Returns the signature mechanism.
    #[must_use]
    pub fn sign_mechanism(&self) -> &str {
        &self.info.sign_mechanism
    }

    /// Returns the signing certificate.
    #[must_use]
    pub fn cert(&self) -> &Bytes {
        &self.info.cert
    }

    /// Returns the underlying signing information.
    #[must_use]
    pub fn info(&self) -> &Arc<SigningInfo> {
        &self.info
    }
}
