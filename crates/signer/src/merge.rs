//! Reconciliation of persisted token configuration with live token state.
//!
//! The file view is authoritative for *what exists*: tokens, keys and
//! certificates deleted from configuration stay deleted. The memory view is
//! authoritative for *what is happening now*: activity, availability, status
//! and cached OCSP responses. [`MergeOntoFileTokens`] folds the memory view
//! onto the file view under those rules.
//!
//! The merge performs no I/O and cannot fail.

use std::collections::{HashMap, hash_map::Entry};

use crate::model::{Cert, Key, Token};

/// Output of a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeResult {
    /// The reconciled token set.
    pub tokens: Vec<Token>,
    /// Certificates present in the file view but unknown to memory.
    ///
    /// They are part of [`tokens`](Self::tokens) too; the list tells the
    /// OCSP refresher which certificates need a fresh response.
    pub added_certs_from_file: Vec<Cert>,
}

/// Strategy for combining file and memory token views.
pub trait TokenMergeStrategy: Send + Sync {
    /// Merges `memory_tokens` onto `file_tokens`.
    fn merge(&self, file_tokens: Vec<Token>, memory_tokens: Vec<Token>) -> MergeResult;
}

/// Folds memory facts onto the file view.
///
/// - Tokens known only to memory are added as they are.
/// - For tokens in both views, `active`, `available`, `status`, `module_id` and
///   `read_only` come from memory; `info` is the file map overlaid with memory
///   entries; everything else comes from the file.
/// - Keys are matched by `(id, public_key)`. File keys never gain entries from
///   memory. A matched key takes `available` from memory.
/// - Certificates of a matched key take the cached OCSP response from the
///   memory copy with the same id. File certificates without a memory copy,
///   including every certificate of a file key or file token unknown to
///   memory, are reported in [`MergeResult::added_certs_from_file`].
///   Memory-only certificates are dropped.
/// - Certificate requests are never merged.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOntoFileTokens;

impl TokenMergeStrategy for MergeOntoFileTokens {
    fn merge(&self, file_tokens: Vec<Token>, memory_tokens: Vec<Token>) -> MergeResult {
        let mut tokens: Vec<Token> = Vec::with_capacity(file_tokens.len().max(memory_tokens.len()));
        let mut by_id: HashMap<String, usize> = HashMap::new();
        let mut added_certs_from_file = Vec::new();
        let mut matched = Vec::new();

        for mut token in file_tokens {
            token.keys = collapse_duplicate_keys(&token.id, std::mem::take(&mut token.keys));
            match by_id.entry(token.id.clone()) {
                Entry::Occupied(_) => {
                    tracing::warn!(token_id = %token.id, "duplicate token id in file view, keeping first");
                },
                Entry::Vacant(slot) => {
                    slot.insert(tokens.len());
                    tokens.push(token);
                    matched.push(false);
                },
            }
        }
        let file_count = tokens.len();

        for mut memory_token in memory_tokens {
            memory_token.keys =
                collapse_duplicate_keys(&memory_token.id, std::mem::take(&mut memory_token.keys));
            match by_id.get(&memory_token.id) {
                Some(&index) => {
                    if index < file_count {
                        matched[index] = true;
                    }
                    merge_token(&mut tokens[index], memory_token, &mut added_certs_from_file);
                },
                None => {
                    tracing::debug!(token_id = %memory_token.id, "token known only in memory");
                    by_id.insert(memory_token.id.clone(), tokens.len());
                    tokens.push(memory_token);
                },
            }
        }

        for (token, _) in tokens.iter().zip(&matched).filter(|(_, matched)| !**matched) {
            added_certs_from_file.extend(token.certs().cloned());
        }

        MergeResult { tokens, added_certs_from_file }
    }
}

fn merge_token(file: &mut Token, memory: Token, added: &mut Vec<Cert>) {
    file.active = memory.active;
    file.available = memory.available;
    file.status = memory.status;
    file.module_id = memory.module_id;
    file.read_only = memory.read_only;
    file.info.extend(memory.info);

    let memory_keys: HashMap<(&str, &str), &Key> =
        memory.keys.iter().map(|key| (key.identity(), key)).collect();

    for key in &mut file.keys {
        match memory_keys.get(&key.identity()) {
            Some(memory_key) => merge_key(key, memory_key, added),
            None => added.extend(key.certs.iter().cloned()),
        }
    }
}

fn merge_key(file: &mut Key, memory: &Key, added: &mut Vec<Cert>) {
    file.available = memory.available;

    let memory_certs: HashMap<&str, &Cert> =
        memory.certs.iter().map(|cert| (cert.id.as_str(), cert)).collect();

    for cert in &mut file.certs {
        match memory_certs.get(cert.id.as_str()) {
            Some(memory_cert) => cert.ocsp_response.clone_from(&memory_cert.ocsp_response),
            None => added.push(cert.clone()),
        }
    }
}

/// Merges later keys with an already-seen `(id, public_key)` onto the first.
///
/// Unexpected in practice; the collision is logged and resolved so the rest
/// of the merge sees unique identities.
fn collapse_duplicate_keys(token_id: &str, keys: Vec<Key>) -> Vec<Key> {
    let mut collapsed: Vec<Key> = Vec::with_capacity(keys.len());
    let mut seen: HashMap<(String, String), usize> = HashMap::new();

    for key in keys {
        match seen.entry((key.id.clone(), key.public_key.clone())) {
            Entry::Occupied(first) => {
                tracing::warn!(token_id, key_id = %key.id, "duplicate key identity, merging onto first");
                absorb_duplicate(&mut collapsed[*first.get()], key);
            },
            Entry::Vacant(slot) => {
                slot.insert(collapsed.len());
                collapsed.push(key);
            },
        }
    }
    collapsed
}

fn absorb_duplicate(first: &mut Key, duplicate: Key) {
    first.available |= duplicate.available;
    for cert in duplicate.certs {
        if !first.certs.iter().any(|existing| existing.id == cert.id) {
            first.certs.push(cert);
        }
    }
    for request in duplicate.cert_requests {
        if !first.cert_requests.iter().any(|existing| existing.id == request.id) {
            first.cert_requests.push(request);
        }
    }
}
