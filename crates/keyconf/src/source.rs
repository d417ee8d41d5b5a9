//! Remote key information and server identity.
//!
//! [`KeyInfoSource`] is the transport-agnostic view of the signer: the cache
//! asks it for a member's signing key and for the server's own
//! authentication key. Implementations wrap whatever RPC client the host
//! uses.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use keyward_signer::OcspResponse;

use crate::{
    error::SourceError,
    types::{ClientId, ServerId},
};

/// Certificate as reported by the signer.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct CertificateInfo {
    /// DER-encoded certificate.
    pub der: Bytes,
    /// Start of the certificate's validity.
    pub not_before: DateTime<Utc>,
    /// End of the certificate's validity.
    pub not_after: DateTime<Utc>,
}

/// A member's signing key, certificate and current OCSP response.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct MemberSigningInfo {
    /// Key handle on the signer.
    #[builder(into)]
    pub key_id: String,
    /// Signature mechanism the key supports.
    #[builder(into)]
    pub sign_mechanism: String,
    /// Signing certificate.
    pub cert: CertificateInfo,
    /// OCSP response for the signing certificate.
    pub ocsp_response: Option<OcspResponse>,
}

/// The server's authentication key and certificate chain.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct AuthKeyMaterial {
    /// Key handle on the signer.
    #[builder(into)]
    pub key_id: String,
    /// Authentication certificate.
    pub cert: CertificateInfo,
    /// Issuer certificates, nearest issuer first.
    #[builder(default)]
    pub cert_chain: Vec<Bytes>,
    /// OCSP responses for the authentication certificate.
    #[builder(default)]
    pub ocsp_responses: Vec<OcspResponse>,
}

/// Remote source of signing and authentication keys.
#[async_trait]
pub trait KeyInfoSource: Send + Sync + 'static {
    /// Fetches the signing key of a member.
    async fn get_member_signing_info(&self, client_id: &ClientId) -> Result<MemberSigningInfo, SourceError>;

    /// Fetches the authentication key of a server.
    async fn get_auth_key(&self, server_id: &ServerId) -> Result<AuthKeyMaterial, SourceError>;
}

/// Tells the cache which server it runs as.
pub trait ServerIdentityProvider: Send + Sync + 'static {
    /// Returns the server identity, or `None` when none is configured yet.
    fn server_id(&self) -> Option<ServerId>;
}

/// A fixed identity.
impl ServerIdentityProvider for ServerId {
    fn server_id(&self) -> Option<ServerId> {
        Some(self.clone())
    }
}
