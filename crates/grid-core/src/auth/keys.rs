//! Per-issuer verification key sets and their TTL-bound cache.

use super::{AuthError, IssuerConfig};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::DecodingKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Where published key sets come from. Production uses [`HttpKeySource`]; tests inject
/// in-memory sets.
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn fetch(&self, issuer: &IssuerConfig) -> anyhow::Result<JwkSet>;
}

#[derive(Debug, Clone)]
pub struct HttpKeySource {
    http: reqwest::Client,
}

impl HttpKeySource {
    pub fn new(timeout: Duration) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build jwks http client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch(&self, issuer: &IssuerConfig) -> anyhow::Result<JwkSet> {
        let resp = self
            .http
            .get(&issuer.jwks_url)
            .send()
            .await
            .with_context(|| format!("GET {}", issuer.jwks_url))?
            .error_for_status()
            .with_context(|| format!("jwks status for issuer={}", issuer.name))?;
        resp.json::<JwkSet>()
            .await
            .with_context(|| format!("decode jwks for issuer={}", issuer.name))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    /// Entries older than this are refreshed on next use.
    pub ttl: Duration,
    /// An expired entry younger than `ttl + stale_grace` keeps being served while a background
    /// refresh runs, and while the key source is unreachable. Zero disables stale reuse.
    pub stale_grace: Duration,
    /// After a failed fetch, no new fetch for that issuer starts until this much time has passed.
    pub refresh_backoff: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            stale_grace: Duration::from_secs(600),
            refresh_backoff: Duration::from_secs(30),
        }
    }
}

pub struct VerifierKey {
    pub kid: Option<String>,
    pub key: DecodingKey,
}

impl std::fmt::Debug for VerifierKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifierKey")
            .field("kid", &self.kid)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// One issuer's verification material as of `fetched_at`.
#[derive(Debug)]
pub struct CachedKeySet {
    pub issuer: String,
    pub keys: Vec<VerifierKey>,
    pub fetched_at: DateTime<Utc>,
}

impl CachedKeySet {
    pub fn from_jwks(issuer: &str, jwks: &JwkSet, fetched_at: DateTime<Utc>) -> Self {
        let keys = jwks
            .keys
            .iter()
            .filter_map(|jwk| match DecodingKey::from_jwk(jwk) {
                Ok(key) => Some(VerifierKey {
                    kid: jwk.common.key_id.clone(),
                    key,
                }),
                Err(err) => {
                    tracing::warn!(
                        event = "grid.auth.jwks.key_skipped",
                        issuer,
                        kid = ?jwk.common.key_id,
                        error = %err,
                        "unusable key in jwks"
                    );
                    None
                }
            })
            .collect();
        Self {
            issuer: issuer.to_string(),
            keys,
            fetched_at,
        }
    }

    /// Select the key for a token header `kid`. A token without `kid` only resolves when the set
    /// holds exactly one key.
    pub fn key_for(&self, kid: Option<&str>) -> Option<&DecodingKey> {
        match kid {
            Some(kid) => self
                .keys
                .iter()
                .find(|k| k.kid.as_deref() == Some(kid))
                .map(|k| &k.key),
            None if self.keys.len() == 1 => self.keys.first().map(|k| &k.key),
            None => None,
        }
    }

    fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.fetched_at
    }
}

/// Key sets cached per issuer name.
///
/// Readers take the read lock only long enough to clone an `Arc`. An entry past its TTL but
/// inside the grace window is returned immediately while a single background refresh for that
/// issuer fetches a replacement and swaps it in. Callers only wait on a fetch when no usable
/// entry exists, and then at most one fetch per issuer runs at a time.
#[derive(Clone)]
pub struct KeySetCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    source: Arc<dyn KeySource>,
    policy: CachePolicy,
    entries: RwLock<HashMap<String, Arc<CachedKeySet>>>,
    gates: Mutex<HashMap<String, Arc<RefreshGate>>>,
}

/// Per-issuer refresh serialization and failure backoff.
#[derive(Default)]
struct RefreshGate {
    running: Arc<tokio::sync::Mutex<()>>,
    last_failure: Mutex<Option<DateTime<Utc>>>,
}

impl RefreshGate {
    fn backing_off(&self, now: DateTime<Utc>, backoff: Duration) -> bool {
        self.last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|failed_at| now - failed_at < to_chrono(backoff))
    }

    fn record(&self, outcome: Option<DateTime<Utc>>) {
        *self.last_failure.lock().unwrap_or_else(PoisonError::into_inner) = outcome;
    }
}

impl std::fmt::Debug for KeySetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySetCache")
            .field("policy", &self.inner.policy)
            .finish_non_exhaustive()
    }
}

/// A cache lookup result; `refreshed` tells whether the entry was fetched by this lookup.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub keys: Arc<CachedKeySet>,
    pub refreshed: bool,
}

impl KeySetCache {
    pub fn new(source: Arc<dyn KeySource>, policy: CachePolicy) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                source,
                policy,
                entries: RwLock::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn policy(&self) -> CachePolicy {
        self.inner.policy
    }

    pub fn cached(&self, issuer: &str) -> Option<Arc<CachedKeySet>> {
        self.inner.cached(issuer)
    }

    /// Key set for `issuer` at `now`. Must be called from within a tokio runtime: a stale entry
    /// schedules its refresh with `tokio::spawn`.
    pub async fn get(
        &self,
        issuer: &IssuerConfig,
        now: DateTime<Utc>,
    ) -> Result<Lookup, AuthError> {
        if let Some(entry) = self.inner.cached(&issuer.name) {
            match self.inner.freshness(&entry, now) {
                Freshness::Fresh => {
                    return Ok(Lookup {
                        keys: entry,
                        refreshed: false,
                    })
                }
                Freshness::Stale => {
                    self.refresh_in_background(issuer, now);
                    return Ok(Lookup {
                        keys: entry,
                        refreshed: false,
                    });
                }
                Freshness::Unusable => {}
            }
        }

        let gate = self.inner.gate(&issuer.name);
        let _running = gate.running.lock().await;
        // Another caller may have installed a usable entry while this one waited.
        if let Some(entry) = self.inner.cached(&issuer.name) {
            if !matches!(self.inner.freshness(&entry, now), Freshness::Unusable) {
                return Ok(Lookup {
                    keys: entry,
                    refreshed: false,
                });
            }
        }
        if gate.backing_off(now, self.inner.policy.refresh_backoff) {
            return Err(AuthError::KeySourceUnavailable(issuer.name.clone()));
        }
        let keys = self.inner.fetch_and_install(issuer, &gate, now).await?;
        Ok(Lookup {
            keys,
            refreshed: true,
        })
    }

    /// Fetch the issuer's key set and install it, replacing any previous entry. Waits for a
    /// refresh of the same issuer that is already running.
    pub async fn refresh(
        &self,
        issuer: &IssuerConfig,
        now: DateTime<Utc>,
    ) -> Result<Arc<CachedKeySet>, AuthError> {
        let gate = self.inner.gate(&issuer.name);
        let _running = gate.running.lock().await;
        self.inner.fetch_and_install(issuer, &gate, now).await
    }

    fn refresh_in_background(&self, issuer: &IssuerConfig, now: DateTime<Utc>) {
        let gate = self.inner.gate(&issuer.name);
        if gate.backing_off(now, self.inner.policy.refresh_backoff) {
            return;
        }
        let Ok(running) = gate.running.clone().try_lock_owned() else {
            return;
        };

        let inner = self.inner.clone();
        let issuer = issuer.clone();
        tokio::spawn(async move {
            let _running = running;
            // Failures are logged and recorded for backoff inside; readers keep the stale entry.
            let _ = inner.fetch_and_install(&issuer, &gate, now).await;
        });
    }
}

enum Freshness {
    Fresh,
    Stale,
    Unusable,
}

impl CacheInner {
    fn cached(&self, issuer: &str) -> Option<Arc<CachedKeySet>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(issuer)
            .cloned()
    }

    fn freshness(&self, entry: &CachedKeySet, now: DateTime<Utc>) -> Freshness {
        let age = entry.age(now);
        let ttl = to_chrono(self.policy.ttl);
        if age < ttl {
            return Freshness::Fresh;
        }
        let grace = ttl
            .checked_add(&to_chrono(self.policy.stale_grace))
            .unwrap_or(chrono::Duration::MAX);
        if !self.policy.stale_grace.is_zero() && age < grace {
            tracing::debug!(
                event = "grid.auth.jwks.stale_reuse",
                issuer = %entry.issuer,
                fetched_at = %entry.fetched_at,
                "serving expired key set within grace window"
            );
            Freshness::Stale
        } else {
            Freshness::Unusable
        }
    }

    fn gate(&self, issuer: &str) -> Arc<RefreshGate> {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(issuer.to_string())
            .or_default()
            .clone()
    }

    async fn fetch_and_install(
        &self,
        issuer: &IssuerConfig,
        gate: &RefreshGate,
        now: DateTime<Utc>,
    ) -> Result<Arc<CachedKeySet>, AuthError> {
        let jwks = match self.source.fetch(issuer).await {
            Ok(jwks) => jwks,
            Err(err) => {
                gate.record(Some(now));
                tracing::warn!(
                    event = "grid.auth.jwks.fetch_failed",
                    issuer = %issuer.name,
                    error = %format!("{err:#}"),
                    backoff_ms =
                        u64::try_from(self.policy.refresh_backoff.as_millis()).unwrap_or(u64::MAX),
                    "jwks fetch failed"
                );
                return Err(AuthError::KeySourceUnavailable(issuer.name.clone()));
            }
        };
        gate.record(None);

        let fresh = Arc::new(CachedKeySet::from_jwks(&issuer.name, &jwks, now));
        tracing::debug!(
            event = "grid.auth.jwks.refreshed",
            issuer = %issuer.name,
            keys = fresh.keys.len(),
            "jwks refreshed"
        );

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let keep_existing = entries
            .get(&issuer.name)
            .is_some_and(|existing| existing.fetched_at > fresh.fetched_at);
        if keep_existing {
            return Ok(entries[&issuer.name].clone());
        }
        entries.insert(issuer.name.clone(), fresh.clone());
        Ok(fresh)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
