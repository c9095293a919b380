//! Identity provider key set fetching and caching
//!
//! The key set is read-mostly shared state. Reads take a short `parking_lot`
//! read lock; refreshes are serialized behind an async mutex so concurrent
//! verifiers that all find the cache stale produce a single fetch.

use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet};
use jsonwebtoken::DecodingKey;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Path of the public key set under the issuer base
pub const CERTS_PATH: &str = "/cdn-cgi/access/certs";
/// Path of the provider's logout endpoint under the issuer base
pub const LOGOUT_PATH: &str = "/cdn-cgi/access/logout";

#[derive(Debug, Error)]
pub enum KeySetError {
    #[error("failed to build key set client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("key set request failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("key set endpoint returned status {0}")]
    Status(u16),
    #[error("key set contains no keys")]
    Empty,
    #[error("no key matches kid {0:?}")]
    NoMatchingKey(Option<String>),
    #[error("token has no kid and the key set holds {0} keys")]
    AmbiguousKey(usize),
    #[error("key {0:?} is not an RSA or EC signing key")]
    UnsupportedKey(Option<String>),
    #[error("invalid key material: {0}")]
    InvalidKey(#[source] jsonwebtoken::errors::Error),
}

struct CachedKeySet {
    keys: Arc<JwkSet>,
    fetched_at: Instant,
    ttl: Duration,
    /// Set after a failed refresh; stale keys are served until then
    retry_at: Option<Instant>,
}

impl CachedKeySet {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < self.ttl || self.backing_off()
    }

    fn backing_off(&self) -> bool {
        self.retry_at.is_some_and(|at| Instant::now() < at)
    }
}

/// Cached view of the provider's published signing keys
pub struct KeySetCache {
    certs_url: String,
    client: reqwest::Client,
    default_ttl: Duration,
    refresh_cooldown: Duration,
    cached: RwLock<Option<CachedKeySet>>,
    refresh_lock: tokio::sync::Mutex<()>,
    fetches: AtomicU64,
}

impl KeySetCache {
    pub fn new(
        certs_url: impl Into<String>,
        default_ttl: Duration,
        refresh_cooldown: Duration,
    ) -> Result<Self, KeySetError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(KeySetError::Client)?;

        Ok(Self {
            certs_url: certs_url.into(),
            client,
            default_ttl,
            refresh_cooldown,
            cached: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            fetches: AtomicU64::new(0),
        })
    }

    pub fn certs_url(&self) -> &str {
        &self.certs_url
    }

    /// Number of network fetches performed so far
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Resolve the decoding key for a token header's `kid`.
    ///
    /// An unknown `kid` forces one refresh (the provider may have rotated
    /// keys) unless the set was fetched within the cooldown window.
    pub async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, KeySetError> {
        let keys = self.key_set(false).await?;
        match select_key(&keys, kid) {
            Err(KeySetError::NoMatchingKey(_)) if kid.is_some() => {
                debug!(kid, "Key id not in cached set, refreshing");
                let keys = self.key_set(true).await?;
                to_decoding_key(select_key(&keys, kid)?)
            }
            other => to_decoding_key(other?),
        }
    }

    async fn key_set(&self, force: bool) -> Result<Arc<JwkSet>, KeySetError> {
        if !force {
            if let Some(keys) = self.cached_keys(|cached| cached.is_fresh()) {
                return Ok(keys);
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock
        let cooldown = self.refresh_cooldown;
        let reusable = self.cached_keys(|cached| {
            if force {
                cached.fetched_at.elapsed() < cooldown || cached.backing_off()
            } else {
                cached.is_fresh()
            }
        });
        if let Some(keys) = reusable {
            return Ok(keys);
        }

        match self.fetch().await {
            Ok((keys, ttl)) => {
                let keys = Arc::new(keys);
                *self.cached.write() = Some(CachedKeySet {
                    keys: Arc::clone(&keys),
                    fetched_at: Instant::now(),
                    ttl,
                    retry_at: None,
                });
                Ok(keys)
            }
            Err(e) => {
                let mut cached = self.cached.write();
                match cached.as_mut() {
                    Some(stale) => {
                        stale.retry_at = Some(Instant::now() + cooldown);
                        warn!(
                            url = %self.certs_url,
                            error = %e,
                            retry_in_secs = cooldown.as_secs(),
                            "Key set refresh failed, serving stale keys"
                        );
                        Ok(Arc::clone(&stale.keys))
                    }
                    None => Err(e),
                }
            }
        }
    }

    fn cached_keys<F>(&self, usable: F) -> Option<Arc<JwkSet>>
    where
        F: FnOnce(&CachedKeySet) -> bool,
    {
        self.cached
            .read()
            .as_ref()
            .filter(|cached| usable(*cached))
            .map(|cached| Arc::clone(&cached.keys))
    }

    async fn fetch(&self) -> Result<(JwkSet, Duration), KeySetError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);

        let response = self.client.get(&self.certs_url).send().await?;
        if !response.status().is_success() {
            return Err(KeySetError::Status(response.status().as_u16()));
        }

        let ttl = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(max_age)
            .unwrap_or(self.default_ttl);

        let keys: JwkSet = response.json().await?;
        if keys.keys.is_empty() {
            return Err(KeySetError::Empty);
        }

        info!(url = %self.certs_url, keys = keys.keys.len(), ttl_secs = ttl.as_secs(), "Fetched identity provider key set");
        Ok((keys, ttl))
    }
}

fn select_key<'a>(keys: &'a JwkSet, kid: Option<&str>) -> Result<&'a Jwk, KeySetError> {
    match kid {
        Some(kid) => keys
            .find(kid)
            .ok_or_else(|| KeySetError::NoMatchingKey(Some(kid.to_string()))),
        None => match keys.keys.as_slice() {
            [only] => Ok(only),
            [] => Err(KeySetError::NoMatchingKey(None)),
            many => Err(KeySetError::AmbiguousKey(many.len())),
        },
    }
}

fn to_decoding_key(jwk: &Jwk) -> Result<DecodingKey, KeySetError> {
    match jwk.algorithm {
        AlgorithmParameters::RSA(_) | AlgorithmParameters::EllipticCurve(_) => {
            DecodingKey::from_jwk(jwk).map_err(KeySetError::InvalidKey)
        }
        _ => Err(KeySetError::UnsupportedKey(jwk.common.key_id.clone())),
    }
}

/// Extract `max-age` from a Cache-Control value
fn max_age(cache_control: &str) -> Option<Duration> {
    cache_control
        .split(',')
        .map(str::trim)
        .find_map(|directive| directive.strip_prefix("max-age="))
        .and_then(|secs| secs.trim_matches('"').parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::service::service_fn;
    use hyper::{Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;

    const CERTS: &str = include_str!("../tests/fixtures/certs.json");

    /// Serve `body` from a local port; returns the certs URL and a hit counter
    async fn serve_certs(body: &'static str, cache_control: Option<&'static str>) -> (String, Arc<AtomicUsize>) {
        serve_certs_failing_after(body, cache_control, usize::MAX).await
    }

    /// Like `serve_certs`, but answers 500 once `healthy` requests have been served
    async fn serve_certs_failing_after(
        body: &'static str,
        cache_control: Option<&'static str>,
        healthy: usize,
    ) -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let service = service_fn(move |_req| {
                        let served = counter.fetch_add(1, Ordering::SeqCst);
                        let status = if served < healthy {
                            StatusCode::OK
                        } else {
                            StatusCode::INTERNAL_SERVER_ERROR
                        };
                        let mut builder = Response::builder()
                            .status(status)
                            .header("content-type", "application/json");
                        if let Some(cc) = cache_control {
                            builder = builder.header("cache-control", cc);
                        }
                        async move { Ok::<_, Infallible>(builder.body(Full::new(Bytes::from(body))).unwrap()) }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (format!("http://{}{}", addr, CERTS_PATH), hits)
    }

    #[test]
    fn test_max_age_parsing() {
        assert_eq!(max_age("public, max-age=3600"), Some(Duration::from_secs(3600)));
        assert_eq!(max_age("max-age=60,must-revalidate"), Some(Duration::from_secs(60)));
        assert_eq!(max_age("no-store"), None);
        assert_eq!(max_age("max-age=0"), None);
        assert_eq!(max_age("max-age=abc"), None);
    }

    #[test]
    fn test_select_key_by_kid() {
        let keys: JwkSet = serde_json::from_str(CERTS).unwrap();
        assert!(select_key(&keys, Some("test-key-1")).is_ok());
        assert!(matches!(
            select_key(&keys, Some("missing")),
            Err(KeySetError::NoMatchingKey(Some(_)))
        ));
        // A single-key set serves tokens without a kid
        assert!(select_key(&keys, None).is_ok());
    }

    #[test]
    fn test_select_key_ambiguous_without_kid() {
        let mut keys: JwkSet = serde_json::from_str(CERTS).unwrap();
        let mut second = keys.keys[0].clone();
        second.common.key_id = Some("test-key-2".to_string());
        keys.keys.push(second);

        assert!(matches!(select_key(&keys, None), Err(KeySetError::AmbiguousKey(2))));
    }

    #[test]
    fn test_symmetric_keys_rejected() {
        let keys: JwkSet = serde_json::from_str(
            r#"{"keys":[{"kty":"oct","kid":"hmac","k":"c2VjcmV0"}]}"#,
        )
        .unwrap();
        let jwk = select_key(&keys, Some("hmac")).unwrap();
        assert!(matches!(to_decoding_key(jwk), Err(KeySetError::UnsupportedKey(_))));
    }

    #[tokio::test]
    async fn test_keys_are_cached() {
        let (url, hits) = serve_certs(CERTS, None).await;
        let cache = KeySetCache::new(url, Duration::from_secs(600), Duration::from_secs(30)).unwrap();

        for _ in 0..5 {
            cache.decoding_key(Some("test-key-1")).await.unwrap();
        }

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(cache.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_cold_lookups_share_one_fetch() {
        let (url, hits) = serve_certs(CERTS, None).await;
        let cache = Arc::new(
            KeySetCache::new(url, Duration::from_secs(600), Duration::from_secs(30)).unwrap(),
        );

        let lookups = (0..10).map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.decoding_key(Some("test-key-1")).await.is_ok() })
        });
        for ok in futures::future::join_all(lookups).await {
            assert!(ok.unwrap());
        }

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_cache_refetches() {
        let (url, hits) = serve_certs(CERTS, None).await;
        let cache = KeySetCache::new(url, Duration::from_millis(50), Duration::ZERO).unwrap();

        cache.decoding_key(Some("test-key-1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        cache.decoding_key(Some("test-key-1")).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_control_overrides_default_ttl() {
        let (url, hits) = serve_certs(CERTS, Some("public, max-age=3600")).await;
        let cache = KeySetCache::new(url, Duration::from_millis(1), Duration::ZERO).unwrap();

        cache.decoding_key(Some("test-key-1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.decoding_key(Some("test-key-1")).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_kid_forces_refresh_outside_cooldown() {
        let (url, hits) = serve_certs(CERTS, None).await;
        let cache = KeySetCache::new(url, Duration::from_secs(600), Duration::ZERO).unwrap();

        cache.decoding_key(Some("test-key-1")).await.unwrap();
        let result = cache.decoding_key(Some("rotated-key")).await;

        assert!(matches!(result, Err(KeySetError::NoMatchingKey(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_kid_within_cooldown_does_not_refetch() {
        let (url, hits) = serve_certs(CERTS, None).await;
        let cache = KeySetCache::new(url, Duration::from_secs(600), Duration::from_secs(30)).unwrap();

        cache.decoding_key(Some("test-key-1")).await.unwrap();
        for _ in 0..3 {
            assert!(cache.decoding_key(Some("rotated-key")).await.is_err());
        }

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_backs_off_while_serving_stale_keys() {
        let (url, hits) = serve_certs_failing_after(CERTS, None, 1).await;
        let cache = KeySetCache::new(url, Duration::from_millis(200), Duration::from_secs(30)).unwrap();

        cache.decoding_key(Some("test-key-1")).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;

        // Refresh fails, the stale set still verifies
        cache.decoding_key(Some("test-key-1")).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        for _ in 0..5 {
            cache.decoding_key(Some("test-key-1")).await.unwrap();
        }
        // An unknown kid does not bypass the backoff either
        assert!(matches!(
            cache.decoding_key(Some("rotated")).await,
            Err(KeySetError::NoMatchingKey(_))
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(cache.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cache = KeySetCache::new(
            format!("http://{}{}", addr, CERTS_PATH),
            Duration::from_secs(600),
            Duration::from_secs(30),
        )
        .unwrap();

        assert!(matches!(
            cache.decoding_key(Some("test-key-1")).await,
            Err(KeySetError::Fetch(_))
        ));
    }
}
