//! In-memory segment cache.
//!
//! Maps segment references to locally playable URLs. Stored segments are
//! downloaded through the relay and materialized as blobs owned by the cache;
//! concurrent requests for the same reference share a single download.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::{Notify, OnceCell};
use tracing::{debug, info, trace, warn};
use url::Url;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::error::PlayerError;
use crate::reference::{SegmentKind, SegmentRef};
use crate::resolver::SegmentResolver;

/// Downloaded segment body.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub bytes: Bytes,
    pub mime: Option<String>,
}

/// Byte download capability.
#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    /// Download `url` in one attempt. Non-2xx responses are errors carrying the status.
    async fn fetch(&self, url: &Url) -> Result<FetchedBody, PlayerError>;
}

/// reqwest-backed fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl SegmentFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedBody, PlayerError> {
        let response = self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| PlayerError::fetch(url.as_str(), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PlayerError::http_status(url.as_str(), status));
        }

        let mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PlayerError::fetch(url.as_str(), e.to_string()))?;

        trace!(url = %url, len = bytes.len(), "Fetched segment body");
        Ok(FetchedBody { bytes, mime })
    }
}

/// Capability for creating and revoking locally playable handles.
pub trait BlobStore: Send + Sync {
    fn create(&self, bytes: Bytes, mime: &str) -> Result<Url, PlayerError>;
    fn revoke(&self, url: &Url);
}

#[derive(Debug, Clone)]
pub struct Blob {
    pub bytes: Bytes,
    pub mime: String,
}

/// Blob store keeping bodies in process memory under `blob:stitch/<uuid>` handles.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Blob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &Url) -> Option<Blob> {
        self.blobs.lock().get(url.as_str()).cloned()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn create(&self, bytes: Bytes, mime: &str) -> Result<Url, PlayerError> {
        let raw = format!("blob:stitch/{}", Uuid::new_v4());
        let url = Url::parse(&raw).map_err(|e| PlayerError::internal(e.to_string()))?;
        self.blobs.lock().insert(
            raw,
            Blob {
                bytes,
                mime: mime.to_string(),
            },
        );
        Ok(url)
    }

    fn revoke(&self, url: &Url) {
        self.blobs.lock().remove(url.as_str());
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    url: Url,
    /// Blob created by this cache; revoked on release.
    owned: bool,
}

type InFlightResult = Result<Url, PlayerError>;

struct InFlightState {
    result: OnceCell<InFlightResult>,
    notify: Notify,
}

impl InFlightState {
    fn new() -> Self {
        Self {
            result: OnceCell::new(),
            notify: Notify::new(),
        }
    }

    fn set_result(&self, result: InFlightResult) {
        let _ = self.result.set(result);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> InFlightResult {
        loop {
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            let notified = self.notify.notified();
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            notified.await;
        }
    }
}

type InFlightRequest = Arc<InFlightState>;

/// Fails the in-flight slot if the owning fetch future is dropped before completing.
struct InFlightGuard<'a> {
    cache: &'a SegmentCache,
    segment: &'a SegmentRef,
    request: InFlightRequest,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.fail_in_flight(
                self.segment,
                &self.request,
                PlayerError::internal("segment fetch abandoned"),
            );
        }
    }
}

/// Segment reference → playable URL cache with in-flight de-duplication.
pub struct SegmentCache {
    entries: DashMap<SegmentRef, CacheEntry>,
    in_flight: DashMap<SegmentRef, InFlightRequest>,
    generation: AtomicU64,
    resolver: Arc<dyn SegmentResolver>,
    fetcher: Arc<dyn SegmentFetcher>,
    blobs: Arc<dyn BlobStore>,
    config: CacheConfig,
}

impl SegmentCache {
    pub fn new(
        resolver: Arc<dyn SegmentResolver>,
        fetcher: Arc<dyn SegmentFetcher>,
        blobs: Arc<dyn BlobStore>,
        config: CacheConfig,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            generation: AtomicU64::new(0),
            resolver,
            fetcher,
            blobs,
            config,
        }
    }

    pub fn resolver(&self) -> &Arc<dyn SegmentResolver> {
        &self.resolver
    }

    /// Current cache generation; bumped by [`release_all`](Self::release_all).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Cached URL for `segment`, without fetching.
    pub fn get(&self, segment: &SegmentRef) -> Option<Url> {
        self.entries.get(segment).map(|e| e.url.clone())
    }

    pub fn contains(&self, segment: &SegmentRef) -> bool {
        self.entries.contains_key(segment)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Return a playable URL for `segment`, fetching it on a miss.
    pub async fn get_or_fetch(&self, segment: &SegmentRef) -> Result<Url, PlayerError> {
        if let Some(url) = self.get(segment) {
            trace!(segment = %segment, "Segment cache hit");
            return Ok(url);
        }

        match segment.kind() {
            SegmentKind::Local => {
                let url = self.resolver.resolve(segment).await?;
                self.insert(segment, url.clone(), false);
                return Ok(url);
            }
            SegmentKind::Direct if !self.config.materialize_direct_urls => {
                let url = self.resolver.resolve(segment).await?;
                self.insert(segment, url.clone(), false);
                return Ok(url);
            }
            _ => {}
        }

        let (request, is_new) = self.get_or_create_in_flight(segment);
        if !is_new {
            trace!(segment = %segment, "Joining in-flight segment fetch");
            return request.wait().await;
        }

        let mut guard = InFlightGuard {
            cache: self,
            segment,
            request: request.clone(),
            armed: true,
        };

        let started = self.generation();
        let result = self.materialize(segment).await;
        guard.armed = false;

        match result {
            Ok(url) => {
                let current = self.generation();
                if current != started {
                    self.blobs.revoke(&url);
                    let err = PlayerError::Stale { started, current };
                    debug!(segment = %segment, started, current, "Discarding fetch from released cache");
                    self.fail_in_flight(segment, &request, err.clone());
                    return Err(err);
                }
                self.complete_in_flight(segment, &request, url.clone());
                debug!(segment = %segment, "Segment cached");
                Ok(url)
            }
            Err(e) => {
                warn!(segment = %segment, error = %e, "Segment fetch failed");
                self.fail_in_flight(segment, &request, e.clone());
                Err(e)
            }
        }
    }

    /// Warm up to `lookahead` of `upcoming` in the background.
    ///
    /// Returns the number of fetches started.
    pub fn prefetch<I>(self: &Arc<Self>, upcoming: I) -> usize
    where
        I: IntoIterator<Item = SegmentRef>,
    {
        let mut started = 0;
        for segment in upcoming.into_iter().take(self.config.lookahead) {
            if self.contains(&segment) || self.in_flight.contains_key(&segment) {
                continue;
            }
            let cache = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = cache.get_or_fetch(&segment).await
                    && !e.is_superseded()
                {
                    debug!(segment = %segment, error = %e, "Prefetch failed");
                }
            });
            started += 1;
        }
        started
    }

    /// Revoke every owned blob, drop all entries and fail in-flight waiters.
    pub fn release_all(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        for entry in self.in_flight.iter() {
            entry.value().set_result(Err(PlayerError::Released {
                reference: entry.key().to_string(),
            }));
        }
        self.in_flight.clear();

        let mut revoked = 0usize;
        for entry in self.entries.iter() {
            if entry.owned {
                self.blobs.revoke(&entry.url);
                revoked += 1;
            }
        }
        let released = self.entries.len();
        self.entries.clear();

        info!(generation, released, revoked, "Segment cache released");
    }

    async fn materialize(&self, segment: &SegmentRef) -> Result<Url, PlayerError> {
        if let Some((mime, parts)) = segment.chunked_parts() {
            return self.materialize_chunked(segment, mime, &parts).await;
        }

        let url = self.resolver.resolve(segment).await?;
        let body = self.fetcher.fetch(&url).await?;
        let mime = body.mime.as_deref().unwrap_or(&self.config.default_mime);
        self.blobs.create(body.bytes, mime)
    }

    async fn materialize_chunked(
        &self,
        segment: &SegmentRef,
        mime: Option<&str>,
        parts: &[SegmentRef],
    ) -> Result<Url, PlayerError> {
        if parts.is_empty() {
            return Err(PlayerError::not_resolvable(segment.as_str(), "chunked reference has no parts"));
        }

        let mut assembled = BytesMut::new();
        for (i, part) in parts.iter().enumerate() {
            let url = self.resolver.resolve(part).await?;
            let body = self.fetcher.fetch(&url).await?;
            trace!(segment = %segment, part = i, len = body.bytes.len(), "Fetched chunk");
            assembled.extend_from_slice(&body.bytes);
        }

        debug!(segment = %segment, parts = parts.len(), len = assembled.len(), "Assembled chunked segment");
        self.blobs.create(
            assembled.freeze(),
            mime.unwrap_or(&self.config.default_mime),
        )
    }

    fn insert(&self, segment: &SegmentRef, url: Url, owned: bool) {
        self.entries.insert(segment.clone(), CacheEntry { url, owned });
    }

    fn get_or_create_in_flight(&self, segment: &SegmentRef) -> (InFlightRequest, bool) {
        if let Some(existing) = self.in_flight.get(segment) {
            return (existing.clone(), false);
        }

        let request = Arc::new(InFlightState::new());
        match self.in_flight.entry(segment.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => (entry.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(request.clone());
                (request, true)
            }
        }
    }

    fn complete_in_flight(&self, segment: &SegmentRef, request: &InFlightRequest, url: Url) {
        let removed = self
            .in_flight
            .remove_if(segment, |_, current| Arc::ptr_eq(current, request));
        if removed.is_some() {
            self.insert(segment, url.clone(), true);
        }
        request.set_result(Ok(url));
    }

    fn fail_in_flight(&self, segment: &SegmentRef, request: &InFlightRequest, err: PlayerError) {
        self.in_flight
            .remove_if(segment, |_, current| Arc::ptr_eq(current, request));
        request.set_result(Err(err));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use reqwest::StatusCode;

    use super::*;

    /// Resolves every reference to `http://relay.test/?url=<ref>`.
    struct StaticResolver;

    #[async_trait]
    impl SegmentResolver for StaticResolver {
        async fn resolve(&self, segment: &SegmentRef) -> Result<Url, PlayerError> {
            if segment.kind() == SegmentKind::Local {
                return Url::parse(segment.as_str())
                    .map_err(|e| PlayerError::not_resolvable(segment.as_str(), e.to_string()));
            }
            crate::resolver::relay_url("http://relay.test/", segment.as_str())
        }
    }

    /// Returns the target id as the body, after an optional gate.
    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
        started: Notify,
        missing: Vec<&'static str>,
    }

    #[async_trait]
    impl SegmentFetcher for CountingFetcher {
        async fn fetch(&self, url: &Url) -> Result<FetchedBody, PlayerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            if let Some(gate) = &self.gate {
                gate.notified().await;
            } else {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let target = url
                .query_pairs()
                .find(|(k, _)| k == "url")
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default();
            if self.missing.contains(&target.as_str()) {
                return Err(PlayerError::http_status(url.as_str(), StatusCode::NOT_FOUND));
            }
            Ok(FetchedBody {
                bytes: Bytes::from(target),
                mime: None,
            })
        }
    }

    fn cache_with(fetcher: Arc<CountingFetcher>, config: CacheConfig) -> (Arc<SegmentCache>, Arc<MemoryBlobStore>) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let cache = Arc::new(SegmentCache::new(
            Arc::new(StaticResolver),
            fetcher,
            blobs.clone(),
            config,
        ));
        (cache, blobs)
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_fetch() {
        let fetcher = Arc::new(CountingFetcher::default());
        let (cache, blobs) = cache_with(fetcher.clone(), CacheConfig::default());
        let segment = SegmentRef::new("abc");

        let (a, b) = tokio::join!(cache.get_or_fetch(&segment), cache.get_or_fetch(&segment));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a, b);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(blobs.get(&a).unwrap().bytes, Bytes::from("abc"));
        assert_eq!(blobs.get(&a).unwrap().mime, "video/mp4");

        // Hit.
        let c = cache.get_or_fetch(&segment).await.unwrap();
        assert_eq!(a, c);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_and_direct_urls_are_not_owned() {
        let fetcher = Arc::new(CountingFetcher::default());
        let (cache, blobs) = cache_with(fetcher.clone(), CacheConfig::default());

        let local = cache.get_or_fetch(&SegmentRef::new("blob:external/1")).await.unwrap();
        assert_eq!(local.as_str(), "blob:external/1");

        let direct = cache
            .get_or_fetch(&SegmentRef::new("https://cdn.test/a.mp4"))
            .await
            .unwrap();
        assert!(direct.as_str().starts_with("http://relay.test/"));

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.len(), 2);
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn direct_urls_materialize_when_configured() {
        let fetcher = Arc::new(CountingFetcher::default());
        let config = CacheConfig {
            materialize_direct_urls: true,
            ..Default::default()
        };
        let (cache, blobs) = cache_with(fetcher.clone(), config);

        let url = cache
            .get_or_fetch(&SegmentRef::new("https://cdn.test/a.mp4"))
            .await
            .unwrap();
        assert_eq!(url.scheme(), "blob");
        assert_eq!(blobs.len(), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let fetcher = Arc::new(CountingFetcher {
            missing: vec!["gone"],
            ..Default::default()
        });
        let (cache, _) = cache_with(fetcher.clone(), CacheConfig::default());
        let segment = SegmentRef::new("gone");

        let err = cache.get_or_fetch(&segment).await.unwrap_err();
        assert!(err.is_skippable());
        assert!(!cache.contains(&segment));

        let _ = cache.get_or_fetch(&segment).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn release_all_revokes_owned_blobs_only() {
        let fetcher = Arc::new(CountingFetcher::default());
        let (cache, blobs) = cache_with(fetcher, CacheConfig::default());

        cache.get_or_fetch(&SegmentRef::new("a")).await.unwrap();
        cache.get_or_fetch(&SegmentRef::new("b")).await.unwrap();
        cache.get_or_fetch(&SegmentRef::new("blob:external/1")).await.unwrap();
        assert_eq!(blobs.len(), 2);

        let before = cache.generation();
        cache.release_all();

        assert!(blobs.is_empty());
        assert!(cache.is_empty());
        assert_eq!(cache.generation(), before + 1);
    }

    #[tokio::test]
    async fn fetch_completing_after_release_is_stale() {
        let gate = Arc::new(Notify::new());
        let fetcher = Arc::new(CountingFetcher {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let (cache, blobs) = cache_with(fetcher.clone(), CacheConfig::default());
        let segment = SegmentRef::new("slow");

        let owner = {
            let cache = cache.clone();
            let segment = segment.clone();
            tokio::spawn(async move { cache.get_or_fetch(&segment).await })
        };
        fetcher.started.notified().await;

        let mut waiter = Box::pin(cache.get_or_fetch(&segment));
        assert!(futures::poll!(&mut waiter).is_pending());

        cache.release_all();
        let waiter = waiter.await.unwrap_err();
        assert!(matches!(waiter, PlayerError::Released { .. }));

        gate.notify_one();
        let owner = owner.await.unwrap().unwrap_err();
        assert!(matches!(owner, PlayerError::Stale { .. }));

        assert!(!cache.contains(&segment));
        assert!(blobs.is_empty());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn chunked_reference_is_assembled_in_order() {
        let fetcher = Arc::new(CountingFetcher::default());
        let (cache, blobs) = cache_with(fetcher.clone(), CacheConfig::default());

        let url = cache
            .get_or_fetch(&SegmentRef::new("chunked:video/webm|p1,p2,p3"))
            .await
            .unwrap();

        let blob = blobs.get(&url).unwrap();
        assert_eq!(blob.bytes, Bytes::from("p1p2p3"));
        assert_eq!(blob.mime, "video/webm");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn http_fetcher_reports_status_and_mime() {
        use axum::{Router, http::header, routing::get};

        let app = Router::new()
            .route("/ok", get(|| async { ([(header::CONTENT_TYPE, "video/webm")], "body") }))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        crate::http::install_rustls_provider();
        let fetcher = HttpFetcher::new(Client::new(), Duration::from_secs(5));

        let ok = Url::parse(&format!("http://{addr}/ok")).unwrap();
        let body = fetcher.fetch(&ok).await.unwrap();
        assert_eq!(body.bytes, Bytes::from("body"));
        assert_eq!(body.mime.as_deref(), Some("video/webm"));

        let missing = Url::parse(&format!("http://{addr}/missing")).unwrap();
        match fetcher.fetch(&missing).await.unwrap_err() {
            PlayerError::Fetch { status, .. } => assert_eq!(status, Some(StatusCode::NOT_FOUND)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn prefetch_honours_lookahead() {
        let fetcher = Arc::new(CountingFetcher::default());
        let (cache, _) = cache_with(fetcher.clone(), CacheConfig::default());

        let upcoming = ["a", "b", "c", "d", "e"].map(SegmentRef::new);
        assert_eq!(cache.prefetch(upcoming.clone()), 3);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.contains(&upcoming[0]));
        assert!(cache.contains(&upcoming[2]));
        assert!(!cache.contains(&upcoming[3]));

        // Already cached; nothing new.
        assert_eq!(cache.prefetch(upcoming[..3].to_vec()), 0);
    }
}
