//! Shared test utilities for signing-context cache tests.
//!
//! This module provides a counting [`KeyInfoSource`] that can hold fetches
//! behind a gate, a manually advanced [`Clock`], a server identity that can
//! be switched at runtime and a change detector triggered by hand. It is
//! feature-gated behind `testutil` to prevent leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! keyward-keyconf = { path = "../keyconf", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use keyward_keyconf::testutil::{CountingKeyInfoSource, ManualClock};
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use keyward_signer::OcspResponse;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    clock::Clock,
    error::SourceError,
    source::{AuthKeyMaterial, CertificateInfo, KeyInfoSource, MemberSigningInfo, ServerIdentityProvider},
    types::{ClientId, ServerId},
    watch::ChangeDetector,
};

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(Utc::now())
    }
}

impl ManualClock {
    /// Creates a clock frozen at `now`.
    #[must_use]
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: TimeDelta) {
        *self.now.lock() += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

struct SourceState {
    cert_lifetime: TimeDelta,
    failure: Option<SourceError>,
}

/// A [`KeyInfoSource`] that counts calls and can hold them.
///
/// Every answer carries a certificate valid from one day before the clock's
/// current time until `now + cert_lifetime` (30 days unless changed) and an
/// OCSP response produced at `now`. Certificate bytes embed the call number,
/// so tests can tell fetches apart.
pub struct CountingKeyInfoSource {
    clock: Arc<dyn Clock>,
    state: Mutex<SourceState>,
    member_calls: AtomicU32,
    auth_calls: AtomicU32,
    gated: AtomicBool,
    gate: Notify,
    started: Notify,
}

impl CountingKeyInfoSource {
    /// Creates a source answering relative to `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(SourceState { cert_lifetime: TimeDelta::days(30), failure: None }),
            member_calls: AtomicU32::new(0),
            auth_calls: AtomicU32::new(0),
            gated: AtomicBool::new(false),
            gate: Notify::new(),
            started: Notify::new(),
        }
    }

    /// Sets how long issued certificates stay valid. Negative values issue
    /// certificates that already expired.
    pub fn set_cert_lifetime(&self, lifetime: TimeDelta) {
        self.state.lock().cert_lifetime = lifetime;
    }

    /// Makes every call fail with `failure`, or succeed again with `None`.
    pub fn fail_with(&self, failure: Option<SourceError>) {
        self.state.lock().failure = failure;
    }

    /// Holds every call until [`release`](Self::release).
    pub fn hold(&self) {
        self.gated.store(true, Ordering::Release);
    }

    /// Lets held and future calls proceed.
    pub fn release(&self) {
        self.gated.store(false, Ordering::Release);
        self.gate.notify_waiters();
    }

    /// Waits until a call has started since the last wait.
    pub async fn wait_for_call(&self) {
        self.started.notified().await;
    }

    /// Number of `get_member_signing_info` calls.
    pub fn member_calls(&self) -> u32 {
        self.member_calls.load(Ordering::SeqCst)
    }

    /// Number of `get_auth_key` calls.
    pub fn auth_calls(&self) -> u32 {
        self.auth_calls.load(Ordering::SeqCst)
    }

    async fn pass_gate(&self) {
        self.started.notify_one();
        loop {
            // Registered before the flag check so a concurrent release is not missed.
            let released = self.gate.notified();
            if !self.gated.load(Ordering::Acquire) {
                return;
            }
            released.await;
        }
    }

    fn answer(&self, call: u32, subject: &str) -> Result<(CertificateInfo, OcspResponse), SourceError> {
        let state = self.state.lock();
        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }
        let now = self.clock.now();
        let cert = CertificateInfo::builder()
            .der(Bytes::from(format!("cert-{subject}-{call}")))
            .not_before(now - TimeDelta::days(1))
            .not_after(now + state.cert_lifetime)
            .build();
        let ocsp = OcspResponse { der: Bytes::from_static(b"ocsp-good"), this_update: now, next_update: None };
        Ok((cert, ocsp))
    }
}

#[async_trait]
impl KeyInfoSource for CountingKeyInfoSource {
    async fn get_member_signing_info(&self, client_id: &ClientId) -> Result<MemberSigningInfo, SourceError> {
        let call = self.member_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.pass_gate().await;
        let (cert, ocsp) = self.answer(call, client_id.as_str())?;
        Ok(MemberSigningInfo::builder()
            .key_id(format!("sign-{client_id}"))
            .sign_mechanism("CKM_RSA_PKCS")
            .cert(cert)
            .ocsp_response(ocsp)
            .build())
    }

    async fn get_auth_key(&self, server_id: &ServerId) -> Result<AuthKeyMaterial, SourceError> {
        let call = self.auth_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.pass_gate().await;
        let (cert, ocsp) = self.answer(call, server_id.as_str())?;
        Ok(AuthKeyMaterial::builder()
            .key_id(format!("auth-{server_id}"))
            .cert(cert)
            .cert_chain(vec![Bytes::from_static(b"ca")])
            .ocsp_responses(vec![ocsp])
            .build())
    }
}

/// A server identity that can be set, changed or cleared.
#[derive(Debug, Default)]
pub struct SwitchableServerIdentity {
    server_id: Mutex<Option<ServerId>>,
}

impl SwitchableServerIdentity {
    /// Creates a provider reporting `server_id`.
    #[must_use]
    pub fn new(server_id: &str) -> Self {
        Self { server_id: Mutex::new(Some(ServerId::new(server_id))) }
    }

    /// Creates a provider with no identity configured.
    #[must_use]
    pub fn unset() -> Self {
        Self::default()
    }

    /// Replaces the reported identity.
    pub fn set(&self, server_id: Option<&str>) {
        *self.server_id.lock() = server_id.map(ServerId::new);
    }
}

impl ServerIdentityProvider for SwitchableServerIdentity {
    fn server_id(&self) -> Option<ServerId> {
        self.server_id.lock().clone()
    }
}

/// A change detector fired by hand.
#[derive(Debug, Default)]
pub struct ManualChangeDetector {
    pending: AtomicBool,
    polls: AtomicU32,
}

impl ManualChangeDetector {
    /// Reports a change on the next poll.
    pub fn trigger(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    /// Number of polls so far.
    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeDetector for ManualChangeDetector {
    async fn has_changed(&self) -> bool {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.pending.swap(false, Ordering::SeqCst)
    }
}
