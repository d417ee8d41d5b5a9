//! Module descriptors produced by configuration reloads.
//!
//! A [`ModuleDescriptor`] is immutable once created. A reload that changes
//! any field produces a new descriptor, and the manager replaces the running
//! worker wholesale.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{config::BackoffPolicy, model::DEFAULT_SIGN_MECHANISM};

/// Module type of the built-in software token store.
pub const SOFTWARE_MODULE_TYPE: &str = "softToken";

/// Default template for hardware token identifiers.
pub const DEFAULT_TOKEN_ID_FORMAT: &str = "{moduleType}{slotIndex}{serialNumber}{label}";

/// Driver kind of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleKind {
    /// A hardware security module reached through a vendor library.
    Hardware(HardwareModuleConf),
    /// The built-in software token store.
    Software,
}

/// One configured signing module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    module_type: String,
    #[serde(flatten)]
    kind: ModuleKind,
}

impl ModuleDescriptor {
    /// Creates a hardware module descriptor.
    #[must_use]
    pub fn hardware(module_type: impl Into<String>, conf: HardwareModuleConf) -> Self {
        Self { module_type: module_type.into(), kind: ModuleKind::Hardware(conf) }
    }

    /// Creates the software module descriptor.
    #[must_use]
    pub fn software() -> Self {
        Self { module_type: SOFTWARE_MODULE_TYPE.to_owned(), kind: ModuleKind::Software }
    }

    /// Returns the unique module type.
    #[must_use]
    pub fn module_type(&self) -> &str {
        &self.module_type
    }

    /// Returns the driver kind.
    #[must_use]
    pub fn kind(&self) -> &ModuleKind {
        &self.kind
    }

    /// Returns `true` for hardware modules.
    #[must_use]
    pub fn is_hardware(&self) -> bool {
        matches!(self.kind, ModuleKind::Hardware(_))
    }

    /// Returns the retry budget for this module.
    ///
    /// Software modules use the default policy.
    #[must_use]
    pub fn backoff(&self) -> BackoffPolicy {
        match &self.kind {
            ModuleKind::Hardware(conf) => conf.backoff,
            ModuleKind::Software => BackoffPolicy::default(),
        }
    }
}

/// Hardware-specific module settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct HardwareModuleConf {
    /// Path of the vendor driver library.
    #[builder(into)]
    pub library: PathBuf,

    /// Tells the library that it may not spawn its own OS threads.
    #[serde(default)]
    pub library_cant_create_os_threads: Option<bool>,

    /// Tells the library it may use native OS locking.
    #[serde(default)]
    pub os_locking_ok: Option<bool>,

    /// Log in with the PIN before every signing operation.
    #[serde(default)]
    #[builder(default)]
    pub sign_verify_pin: bool,

    /// Allow several hashes to be signed in one call.
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub batch_signing_enabled: bool,

    /// Expose every token of this module as read-only.
    #[serde(default)]
    #[builder(default)]
    pub read_only: bool,

    /// Template for token identifiers.
    #[serde(default = "default_token_id_format")]
    #[builder(into, default = DEFAULT_TOKEN_ID_FORMAT.to_owned())]
    pub token_id_format: String,

    /// Signing mechanism for keys on this module.
    #[serde(default = "default_sign_mechanism")]
    #[builder(into, default = DEFAULT_SIGN_MECHANISM.to_owned())]
    pub sign_mechanism: String,

    /// Only these slots are enumerated, when set.
    #[serde(default)]
    pub slot_ids: Option<Vec<u64>>,

    /// Retry budget for initialization and enumeration.
    #[serde(default)]
    #[builder(default)]
    pub backoff: BackoffPolicy,
}

fn default_true() -> bool {
    true
}

fn default_token_id_format() -> String {
    DEFAULT_TOKEN_ID_FORMAT.to_owned()
}

fn default_sign_mechanism() -> String {
    DEFAULT_SIGN_MECHANISM.to_owned()
}

impl HardwareModuleConf {
    /// Renders a token identifier from the configured template.
    ///
    /// Recognized placeholders are `{moduleType}`, `{slotIndex}`,
    /// `{serialNumber}` and `{label}`. Characters outside `[A-Za-z0-9_-]`
    /// in the substituted values are dropped so the id is usable as a file
    /// and URL component.
    #[must_use]
    pub fn render_token_id(
        &self,
        module_type: &str,
        slot_index: usize,
        serial_number: &str,
        label: &str,
    ) -> String {
        self.token_id_format
            .replace("{moduleType}", &sanitize(module_type))
            .replace("{slotIndex}", &slot_index.to_string())
            .replace("{serialNumber}", &sanitize(serial_number))
            .replace("{label}", &sanitize(label))
    }
}

fn sanitize(value: &str) -> String {
    value.trim().chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-').collect()
}
