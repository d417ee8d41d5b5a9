//! Cached signing contexts with single-flight population.
//!
//! [`SigningContextCache`] keeps two `moka` caches: per-client signing
//! information and the server's authentication key (capacity 1). Both use a
//! fixed TTL, and every hit is additionally checked against the entry's own
//! validity window, so an entry whose OCSP freshness runs out is refetched
//! long before its TTL elapses.
//!
//! ## Single-flight
//!
//! A miss registers one fetch per key in an in-flight map and spawns it as a
//! task. Concurrent callers for the same key subscribe to that task's result
//! instead of issuing their own remote call. The map lock is never held while
//! the remote call runs, and a caller that stops waiting (see
//! [`SigningContextCache::get_signing_context_with_timeout`]) leaves the fetch
//! running for everyone else.
//!
//! ## Invalidation
//!
//! Entries are stamped with the invalidation generation current when their
//! fetch started. [`SigningContextCache::invalidate_all`] bumps the
//! generation, so a fetch that started before an invalidation still answers
//! its callers but never repopulates the cache.

use std::{
    collections::HashMap,
    fmt::Display,
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use fail::fail_point;
use moka::future::Cache;
use tokio::sync::{Mutex, watch};

use crate::{
    clock::{Clock, SystemClock},
    config::KeyConfCacheConfig,
    error::{KeyConfError, KeyConfResult},
    info::{AuthKeyInfo, SigningContext, SigningInfo},
    source::{KeyInfoSource, ServerIdentityProvider},
    types::{ClientId, ServerId},
    validity::ValidityPolicy,
};

/// The authentication key cache only ever holds the current server's key.
const AUTH_KEY_CAPACITY: u64 = 1;

type FlightResult<V> = Option<KeyConfResult<Arc<V>>>;

/// A cached value and the invalidation generation its fetch started in.
struct Stamped<V> {
    value: Arc<V>,
    generation: u64,
}

impl<V> Clone for Stamped<V> {
    fn clone(&self) -> Self {
        Self { value: Arc::clone(&self.value), generation: self.generation }
    }
}

struct Flight<V> {
    id: u64,
    result: watch::Receiver<FlightResult<V>>,
}

impl<V> Flight<V> {
    /// The fetch task ended without publishing a result.
    fn is_abandoned(&self) -> bool {
        self.result.has_changed().is_err() && self.result.borrow().is_none()
    }
}

/// One cache with its in-flight fetches.
struct Tier<K, V> {
    name: &'static str,
    entries: Cache<K, Stamped<V>>,
    flights: Arc<Mutex<HashMap<K, Flight<V>>>>,
    next_flight: AtomicU64,
}

impl<K, V> Tier<K, V>
where
    K: Hash + Eq + Clone + Display + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn new(name: &'static str, capacity: u64, ttl: Duration) -> Self {
        Self {
            name,
            entries: Cache::builder().max_capacity(capacity).time_to_live(ttl).build(),
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_flight: AtomicU64::new(0),
        }
    }

    /// Returns the cached value if it is current and valid, dropping it otherwise.
    async fn lookup(&self, key: &K, generation: u64, is_valid: &impl Fn(&V) -> bool) -> Option<Arc<V>> {
        let entry = self.entries.get(key).await?;
        if entry.generation == generation && is_valid(&entry.value) {
            tracing::debug!(cache = self.name, "cache hit");
            return Some(entry.value);
        }
        tracing::debug!(cache = self.name, stale = entry.generation != generation, "cached entry no longer valid");
        self.entries.invalidate(key).await;
        None
    }

    async fn get_or_fetch<F, Fut>(
        &self,
        key: &K,
        generation: &Arc<AtomicU64>,
        is_valid: impl Fn(&V) -> bool,
        fetch: F,
    ) -> KeyConfResult<Arc<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = KeyConfResult<V>> + Send + 'static,
    {
        if let Some(hit) = self.lookup(key, generation.load(Ordering::Acquire), &is_valid).await {
            return Ok(hit);
        }
        tracing::debug!(cache = self.name, "cache miss");

        let receiver = {
            let mut flights = self.flights.lock().await;
            // Snapshot under the lock; `invalidate_all` bumps before it clears flights.
            let gen_before = generation.load(Ordering::Acquire);
            if let Some(hit) = self.lookup(key, gen_before, &is_valid).await {
                return Ok(hit);
            }
            let in_flight =
                flights.get(key).filter(|flight| !flight.is_abandoned()).map(|flight| flight.result.clone());
            match in_flight {
                Some(receiver) => {
                    tracing::debug!(cache = self.name, "joining in-flight fetch");
                    receiver
                },
                None => {
                    let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
                    let (sender, receiver) = watch::channel(None);
                    flights.insert(key.clone(), Flight { id, result: receiver.clone() });
                    self.spawn_fetch(key.clone(), id, gen_before, Arc::clone(generation), sender, fetch());
                    receiver
                },
            }
        };

        wait_for(receiver, key).await
    }

    fn spawn_fetch<Fut>(
        &self,
        key: K,
        id: u64,
        gen_before: u64,
        generation: Arc<AtomicU64>,
        sender: watch::Sender<FlightResult<V>>,
        fetch: Fut,
    ) where
        Fut: Future<Output = KeyConfResult<V>> + Send + 'static,
    {
        let name = self.name;
        let entries = self.entries.clone();
        let flights = Arc::clone(&self.flights);

        tokio::spawn(async move {
            let outcome = fetch.await.map(Arc::new);

            if let Ok(value) = &outcome {
                if generation.load(Ordering::Acquire) == gen_before {
                    entries
                        .insert(key.clone(), Stamped { value: Arc::clone(value), generation: gen_before })
                        .await;
                } else {
                    tracing::debug!(
                        cache = name,
                        key = %key,
                        "discarding fetch result: invalidation occurred during fetch"
                    );
                }
            }
            sender.send_replace(Some(outcome));

            let mut flights = flights.lock().await;
            if flights.get(&key).is_some_and(|flight| flight.id == id) {
                flights.remove(&key);
            }
        });
    }

    async fn clear(&self) -> (u64, usize) {
        let evicted = self.entries.entry_count();
        self.entries.invalidate_all();
        let mut flights = self.flights.lock().await;
        let abandoned = flights.len();
        flights.clear();
        (evicted, abandoned)
    }
}

async fn wait_for<V>(mut receiver: watch::Receiver<FlightResult<V>>, key: &impl Display) -> KeyConfResult<Arc<V>> {
    loop {
        let published = receiver.borrow_and_update().clone();
        if let Some(result) = published {
            return result;
        }
        if receiver.changed().await.is_err() {
            return Err(KeyConfError::FetchAborted { identity: key.to_string() });
        }
    }
}

#[tracing::instrument(skip(source, clock, policy))]
async fn fetch_signing_info(
    source: Arc<dyn KeyInfoSource>,
    clock: Arc<dyn Clock>,
    policy: ValidityPolicy,
    client_id: ClientId,
) -> KeyConfResult<SigningInfo> {
    fail_point!("cache-before-fetch", |_| {
        Err(KeyConfError::from(crate::error::SourceError::internal("injected failure before fetch")))
    });
    let member = source.get_member_signing_info(&client_id).await?;
    let info = SigningInfo::from_member(client_id, member, &policy);
    if !info.verify_validity(clock.now()) {
        return Err(KeyConfError::SigningInfoExpired { client_id: info.client_id, not_after: info.not_after });
    }
    Ok(info)
}

#[tracing::instrument(skip(source, clock, policy))]
async fn fetch_auth_key(
    source: Arc<dyn KeyInfoSource>,
    clock: Arc<dyn Clock>,
    policy: ValidityPolicy,
    server_id: ServerId,
) -> KeyConfResult<AuthKeyInfo> {
    fail_point!("cache-before-fetch", |_| {
        Err(KeyConfError::from(crate::error::SourceError::internal("injected failure before fetch")))
    });
    let material = source.get_auth_key(&server_id).await?;
    let info = AuthKeyInfo::from_material(material, &policy);
    if !info.verify_validity(clock.now()) {
        tracing::warn!(not_after = %info.not_after, "authentication key is outside its validity window");
    }
    Ok(info)
}

fn default_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Time-bounded cache of signing contexts and the server authentication key.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use keyward_keyconf::{ClientId, KeyInfoSource, ServerId, SigningContextCache};
///
/// # async fn example(source: Arc<dyn KeyInfoSource>) -> keyward_keyconf::KeyConfResult<()> {
/// let cache = SigningContextCache::builder()
///     .source(source)
///     .identity(Arc::new(ServerId::new("EE/COM/1234/ss1")))
///     .build();
///
/// let context = cache.get_signing_context(&ClientId::new("EE/GOV/70000001")).await?;
/// println!("signing with {}", context.key_id());
/// # Ok(())
/// # }
/// ```
pub struct SigningContextCache {
    source: Arc<dyn KeyInfoSource>,
    identity: Arc<dyn ServerIdentityProvider>,
    clock: Arc<dyn Clock>,
    config: KeyConfCacheConfig,
    signing: Tier<ClientId, SigningInfo>,
    auth: Tier<ServerId, AuthKeyInfo>,
    /// Bumped by every `invalidate_all`; entries from older fetches are ignored.
    invalidation_gen: Arc<AtomicU64>,
}

#[bon::bon]
impl SigningContextCache {
    /// Creates an empty cache.
    #[builder]
    pub fn new(
        source: Arc<dyn KeyInfoSource>,
        identity: Arc<dyn ServerIdentityProvider>,
        #[builder(default)] config: KeyConfCacheConfig,
        #[builder(default = default_clock())] clock: Arc<dyn Clock>,
    ) -> Self {
        let ttl = config.signing_info_ttl();
        Self {
            source,
            identity,
            clock,
            signing: Tier::new("signing_info", config.signing_info_capacity(), ttl),
            auth: Tier::new("auth_key", AUTH_KEY_CAPACITY, ttl),
            config,
            invalidation_gen: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the cache configuration.
    #[must_use]
    pub fn config(&self) -> &KeyConfCacheConfig {
        &self.config
    }

    /// Returns a signing context for `client_id`.
    ///
    /// A cached entry is used only while `now` lies inside its validity
    /// window. Otherwise the signing information is fetched once, however
    /// many callers are waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`KeyConfError::Source`] if the signer lookup fails,
    /// [`KeyConfError::SigningInfoExpired`] if the fetched information is
    /// already outside its validity window, and [`KeyConfError::FetchAborted`]
    /// if the fetch task died.
    #[tracing::instrument(skip(self), fields(client_id = %client_id))]
    pub async fn get_signing_context(&self, client_id: &ClientId) -> KeyConfResult<SigningContext> {
        let clock = Arc::clone(&self.clock);
        let source = Arc::clone(&self.source);
        let policy = self.config.validity;
        let owned_id = client_id.clone();

        let info = self
            .signing
            .get_or_fetch(
                client_id,
                &self.invalidation_gen,
                |info| info.verify_validity(self.clock.now()),
                move || fetch_signing_info(source, clock, policy, owned_id),
            )
            .await?;
        Ok(SigningContext::new(info))
    }

    /// Like [`get_signing_context`](Self::get_signing_context), but gives up
    /// waiting after `timeout`.
    ///
    /// Only this caller stops waiting; the fetch keeps running and still
    /// populates the cache for later callers.
    ///
    /// # Errors
    ///
    /// Returns [`KeyConfError::Timeout`] when the deadline passes, or any
    /// error of [`get_signing_context`](Self::get_signing_context).
    pub async fn get_signing_context_with_timeout(
        &self,
        client_id: &ClientId,
        timeout: Duration,
    ) -> KeyConfResult<SigningContext> {
        tokio::time::timeout(timeout, self.get_signing_context(client_id))
            .await
            .map_err(|_| KeyConfError::Timeout { client_id: client_id.clone(), elapsed: timeout })?
    }

    /// Returns the authentication key of this server.
    ///
    /// `None` means either that no server identity is configured yet or that
    /// the key could not be fetched. Fetch failures are logged, never
    /// returned, so health checks degrade instead of failing.
    #[tracing::instrument(skip(self))]
    pub async fn get_auth_key(&self) -> Option<Arc<AuthKeyInfo>> {
        let Some(server_id) = self.identity.server_id() else {
            tracing::debug!("no server identity configured");
            return None;
        };

        let clock = Arc::clone(&self.clock);
        let source = Arc::clone(&self.source);
        let policy = self.config.validity;
        let owned_id = server_id.clone();

        let result = self
            .auth
            .get_or_fetch(
                &server_id,
                &self.invalidation_gen,
                |info| info.verify_validity(self.clock.now()),
                move || fetch_auth_key(source, clock, policy, owned_id),
            )
            .await;

        match result {
            Ok(info) => Some(info),
            Err(error) => {
                tracing::error!(server_id = %server_id, error = %error, "failed to load authentication key");
                None
            },
        }
    }

    /// Drops every cached entry and forgets in-flight fetches.
    ///
    /// Fetches already running still answer the callers waiting on them but
    /// never repopulate the cache; the next lookup starts a fresh fetch.
    /// An audit event is emitted at INFO level.
    #[tracing::instrument(skip(self))]
    pub async fn invalidate_all(&self) {
        self.invalidation_gen.fetch_add(1, Ordering::Release);
        let (signing_evicted, signing_flights) = self.signing.clear().await;
        let (auth_evicted, auth_flights) = self.auth.clear().await;
        tracing::info!(
            audit.action = "invalidate_key_conf",
            audit.resource = "all_signing_contexts",
            audit.result = "success",
            audit.signing_evicted = signing_evicted,
            audit.auth_evicted = auth_evicted,
            audit.flights_abandoned = signing_flights + auth_flights,
            "audit_event"
        );
    }
}
