//! Token, key and certificate model shared by the worker tree and the merge.
//!
//! Operational fields (`active`, `available`, `status`, cached OCSP
//! responses) describe the running process and are never persisted; the
//! remaining fields are the durable token configuration written by
//! [`TokenConfStore`](crate::token_conf::TokenConfStore).

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default signing mechanism for keys and hardware modules.
pub const DEFAULT_SIGN_MECHANISM: &str = "CKM_RSA_PKCS";

/// RSA-PSS signing mechanism.
pub const RSA_PSS_SIGN_MECHANISM: &str = "CKM_RSA_PKCS_PSS";

/// Runtime status of a token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    /// Token is usable.
    #[default]
    Ok,
    /// Token is present but not initialized.
    NotInitialized,
    /// The user PIN has been locked after too many attempts.
    UserPinLocked,
    /// Few PIN attempts remain.
    UserPinCountLow,
    /// One PIN attempt remains.
    UserPinFinalTry,
    /// The last PIN entered was wrong.
    UserPinIncorrect,
}

/// Registration status of a certificate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertStatus {
    /// Imported but not registered.
    #[default]
    Saved,
    /// Registration request submitted.
    RegistrationInProgress,
    /// Registered with the central authority.
    Registered,
    /// Deletion request submitted.
    DeletionInProgress,
    /// The certificate is not known to global configuration.
    GlobalError,
}

/// Intended use of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    /// Message signing key.
    Signing,
    /// TLS authentication key.
    Authentication,
}

/// A revocation-status response for one certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcspResponse {
    /// Encoded response.
    pub der: Bytes,
    /// Time at which the status was known to be correct.
    pub this_update: DateTime<Utc>,
    /// Time at or before which newer status will be available.
    pub next_update: Option<DateTime<Utc>>,
}

/// A certificate held by exactly one [`Key`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct Cert {
    /// Unique certificate identifier.
    #[builder(into)]
    pub id: String,

    /// Encoded certificate.
    #[serde(with = "der_base64")]
    #[builder(into)]
    pub der: Bytes,

    /// Whether the certificate may be used.
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub active: bool,

    /// Whether the certificate is stored in configuration rather than on the token.
    #[serde(default)]
    #[builder(default)]
    pub saved_to_configuration: bool,

    /// Registration status.
    #[serde(default)]
    #[builder(default)]
    pub status: CertStatus,

    /// Cached revocation status. Never persisted.
    #[serde(skip)]
    pub ocsp_response: Option<OcspResponse>,
}

/// A pending certificate signing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct CertRequest {
    /// Request identifier.
    #[builder(into)]
    pub id: String,

    /// Member the request was made for.
    #[builder(into)]
    pub member_id: Option<String>,

    /// Requested subject distinguished name.
    #[builder(into)]
    pub subject_name: String,
}

/// A key pair handle with its certificates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct Key {
    /// Key identifier, unique only together with [`public_key`](Self::public_key).
    #[builder(into)]
    pub id: String,

    /// Encoded public key.
    #[builder(into)]
    pub public_key: String,

    /// Whether the key is present on the live token. Never persisted.
    #[serde(skip)]
    #[builder(default)]
    pub available: bool,

    /// Label as stored on the token.
    #[serde(default)]
    #[builder(into)]
    pub label: Option<String>,

    /// Human-readable name.
    #[serde(default)]
    #[builder(into)]
    pub friendly_name: Option<String>,

    /// Intended use, once decided.
    #[serde(default)]
    pub usage: Option<KeyUsage>,

    /// Signing mechanism name.
    #[serde(default = "default_sign_mechanism")]
    #[builder(into, default = DEFAULT_SIGN_MECHANISM.to_owned())]
    pub sign_mechanism: String,

    /// Certificates, in configuration order.
    #[serde(default)]
    #[builder(default)]
    pub certs: Vec<Cert>,

    /// Pending certificate signing requests.
    #[serde(default)]
    #[builder(default)]
    pub cert_requests: Vec<CertRequest>,
}

impl Key {
    /// Returns the merge identity of this key.
    #[must_use]
    pub fn identity(&self) -> (&str, &str) {
        (&self.id, &self.public_key)
    }
}

/// One signing token (hardware slot or software store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct Token {
    /// Token identifier, unique within a reconciled set.
    #[builder(into)]
    pub id: String,

    /// Type of the module that owns the token.
    #[builder(into)]
    pub module_id: String,

    /// Human-readable name.
    #[serde(default)]
    #[builder(into)]
    pub friendly_name: Option<String>,

    /// Hardware serial number.
    #[serde(default)]
    #[builder(into)]
    pub serial_number: Option<String>,

    /// Hardware label.
    #[serde(default)]
    #[builder(into)]
    pub label: Option<String>,

    /// Position of the slot in the driver's slot list.
    #[serde(default)]
    pub slot_index: Option<usize>,

    /// Whether several hashes may be signed in one call.
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub batch_signing_enabled: bool,

    /// Whether the token rejects writes.
    #[serde(default)]
    #[builder(default)]
    pub read_only: bool,

    /// PIN has been verified. Never persisted.
    #[serde(skip)]
    #[builder(default)]
    pub active: bool,

    /// A session is open. Never persisted.
    #[serde(skip)]
    #[builder(default)]
    pub available: bool,

    /// Runtime status. Never persisted.
    #[serde(skip)]
    #[builder(default)]
    pub status: TokenStatus,

    /// Free-form token information.
    #[serde(default)]
    #[builder(default)]
    pub info: BTreeMap<String, String>,

    /// Keys, in configuration order.
    #[serde(default)]
    #[builder(default)]
    pub keys: Vec<Key>,
}

impl Token {
    /// Iterates over every certificate on every key.
    pub fn certs(&self) -> impl Iterator<Item = &Cert> {
        self.keys.iter().flat_map(|key| key.certs.iter())
    }

    /// Finds a certificate by id on any key.
    pub fn cert_mut(&mut self, cert_id: &str) -> Option<&mut Cert> {
        self.keys.iter_mut().flat_map(|key| key.certs.iter_mut()).find(|cert| cert.id == cert_id)
    }
}

fn default_true() -> bool {
    true
}

fn default_sign_mechanism() -> String {
    DEFAULT_SIGN_MECHANISM.to_owned()
}

/// Base64 encoding for DER payloads in the JSON token configuration.
mod der_base64 {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub(super) fn serialize<S: Serializer>(der: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(der))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map(Bytes::from).map_err(D::Error::custom)
    }
}
