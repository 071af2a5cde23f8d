//! Turns opaque segment references into fetchable URLs.
//!
//! Every URL handed out points at the relay, so neither the resolver nor the
//! decoder ever talks to a third-party origin directly. Local handles are the
//! only exception: they are already playable and are returned unchanged.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::ResolverConfig;
use crate::error::PlayerError;
use crate::http::build_client;
use crate::reference::{SegmentKind, SegmentRef};

/// Resolution capability used by the cache and the poster lookup.
#[async_trait]
pub trait SegmentResolver: Send + Sync {
    /// Resolve one reference. A single attempt; callers decide about retries.
    async fn resolve(&self, segment: &SegmentRef) -> Result<Url, PlayerError>;
}

/// Wrap `target` so it is fetched through the relay at `endpoint`.
pub fn relay_url(endpoint: &str, target: &str) -> Result<Url, PlayerError> {
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    let composed = format!("{endpoint}{separator}url={}", urlencoding::encode(target));
    Url::parse(&composed)
        .map_err(|e| PlayerError::configuration(format!("invalid relay endpoint `{endpoint}`: {e}")))
}

/// Resolve a poster image reference. URLs and local handles pass through
/// untouched; stored ids go through `resolver`.
pub async fn resolve_poster(resolver: &dyn SegmentResolver, raw: &str) -> Result<Url, PlayerError> {
    let poster = SegmentRef::new(raw.trim());
    match poster.kind() {
        SegmentKind::Direct | SegmentKind::Local => Url::parse(poster.as_str())
            .map_err(|e| PlayerError::not_resolvable(poster.as_str(), e.to_string())),
        SegmentKind::Stored | SegmentKind::Chunked => resolver.resolve(&poster).await,
    }
}

#[derive(Debug, Deserialize)]
struct GetFileResponse {
    ok: bool,
    #[serde(default)]
    result: Option<FileInfo>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    #[serde(default)]
    file_path: Option<String>,
}

/// Resolver backed by the external file service, reached through the relay.
#[derive(Debug, Clone)]
pub struct HttpResolver {
    client: Client,
    config: ResolverConfig,
}

impl HttpResolver {
    pub fn new(config: ResolverConfig) -> Result<Self, PlayerError> {
        let client = build_client(&config)?;
        Ok(Self { client, config })
    }

    pub fn with_client(client: Client, config: ResolverConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    fn relay(&self, target: &str) -> Result<Url, PlayerError> {
        relay_url(&self.config.relay_endpoint, target)
    }

    async fn resolve_stored(&self, segment: &SegmentRef, file_id: &str) -> Result<Url, PlayerError> {
        let not_resolvable = |reason: String| PlayerError::not_resolvable(segment.as_str(), reason);

        let token = self
            .config
            .bot_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| not_resolvable("file service token is not configured".to_string()))?;

        let base = self.config.file_api_base.trim_end_matches('/');
        let lookup = format!(
            "{base}/bot{token}/getFile?file_id={}",
            urlencoding::encode(file_id)
        );
        let lookup = self.relay(&lookup)?;

        let response = self
            .client
            .get(lookup)
            .timeout(self.config.resolve_timeout())
            .send()
            .await
            .map_err(|e| not_resolvable(format!("lookup request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(not_resolvable(format!("lookup returned HTTP {status}")));
        }

        let body: GetFileResponse = response
            .json()
            .await
            .map_err(|e| not_resolvable(format!("malformed lookup response: {e}")))?;

        if !body.ok {
            return Err(not_resolvable(
                body.description
                    .unwrap_or_else(|| "file service rejected the lookup".to_string()),
            ));
        }

        let file_path = body
            .result
            .and_then(|r| r.file_path)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| not_resolvable("lookup response has no file path".to_string()))?;

        debug!(file_id, file_path = %file_path, "Resolved stored segment");
        self.relay(&format!("{base}/file/bot{token}/{file_path}"))
    }
}

#[async_trait]
impl SegmentResolver for HttpResolver {
    async fn resolve(&self, segment: &SegmentRef) -> Result<Url, PlayerError> {
        match segment.kind() {
            SegmentKind::Direct => self.relay(segment.as_str()),
            SegmentKind::Local => Url::parse(segment.as_str())
                .map_err(|e| PlayerError::not_resolvable(segment.as_str(), e.to_string())),
            SegmentKind::Stored => {
                let Some(file_id) = segment.store_id() else {
                    return Err(PlayerError::not_resolvable(segment.as_str(), "empty identifier"));
                };
                self.resolve_stored(segment, file_id).await.inspect_err(|e| {
                    warn!(segment = %segment, error = %e, "Failed to resolve segment");
                })
            }
            SegmentKind::Chunked => Err(PlayerError::not_resolvable(
                segment.as_str(),
                "chunked references resolve per part",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::{Json, Router, extract::Query, routing::get};
    use serde_json::json;

    use super::*;

    async fn spawn_fake_relay() -> String {
        async fn relay(Query(params): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
            let target = params.get("url").cloned().unwrap_or_default();
            if target.contains("file_id=good") {
                Json(json!({ "ok": true, "result": { "file_path": "videos/file_1.mp4" } }))
            } else if target.contains("file_id=nopath") {
                Json(json!({ "ok": true, "result": {} }))
            } else {
                Json(json!({ "ok": false, "description": "Bad Request: invalid file_id" }))
            }
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/api/proxy", get(relay)))
                .await
                .unwrap();
        });
        format!("http://{addr}/api/proxy")
    }

    fn resolver(endpoint: &str, token: Option<&str>) -> HttpResolver {
        crate::http::install_rustls_provider();
        HttpResolver::with_client(
            Client::new(),
            ResolverConfig {
                relay_endpoint: endpoint.to_string(),
                file_api_base: "https://files.example.org".to_string(),
                bot_token: token.map(str::to_string),
                ..Default::default()
            },
        )
    }

    #[test]
    fn relay_url_encodes_target() {
        let url = relay_url("http://localhost/api/proxy", "https://cdn.example.com/a b.mp4?x=1&y=2")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost/api/proxy?url=https%3A%2F%2Fcdn.example.com%2Fa%20b.mp4%3Fx%3D1%26y%3D2"
        );

        let url = relay_url("http://localhost/p?k=v", "https://a/b").unwrap();
        assert!(url.as_str().starts_with("http://localhost/p?k=v&url="));
    }

    #[tokio::test]
    async fn direct_urls_go_through_relay() {
        let resolver = resolver("http://localhost/api/proxy", None);
        let url = resolver
            .resolve(&SegmentRef::new("https://cdn.example.com/seg0.mp4"))
            .await
            .unwrap();
        let target: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(target["url"], "https://cdn.example.com/seg0.mp4");
    }

    #[tokio::test]
    async fn local_handles_are_returned_unchanged() {
        let resolver = resolver("http://localhost/api/proxy", None);
        let url = resolver.resolve(&SegmentRef::new("blob:stitch/abc")).await.unwrap();
        assert_eq!(url.as_str(), "blob:stitch/abc");
    }

    #[tokio::test]
    async fn stored_id_without_token_is_not_resolvable() {
        let resolver = resolver("http://localhost/api/proxy", None);
        let err = resolver.resolve(&SegmentRef::new("good")).await.unwrap_err();
        assert!(matches!(err, PlayerError::NotResolvable { .. }));
        assert!(err.is_skippable());
    }

    #[tokio::test]
    async fn stored_id_resolves_to_relayed_download_url() {
        let endpoint = spawn_fake_relay().await;
        let resolver = resolver(&endpoint, Some("123:abc"));

        let url = resolver.resolve(&SegmentRef::new("telegram:good")).await.unwrap();
        let target: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(
            target["url"],
            "https://files.example.org/file/bot123:abc/videos/file_1.mp4"
        );
        assert!(url.as_str().starts_with(&endpoint));
    }

    #[tokio::test]
    async fn posters_pass_urls_through_and_resolve_ids() {
        let endpoint = spawn_fake_relay().await;
        let resolver = resolver(&endpoint, Some("123:abc"));

        let url = resolve_poster(&resolver, "https://img.example.com/thumb.jpg")
            .await
            .unwrap();
        assert_eq!(url.as_str(), "https://img.example.com/thumb.jpg");

        let url = resolve_poster(&resolver, "good").await.unwrap();
        assert!(url.as_str().starts_with(&endpoint));
    }

    #[tokio::test]
    async fn lookup_failures_are_not_resolvable() {
        let endpoint = spawn_fake_relay().await;
        let resolver = resolver(&endpoint, Some("123:abc"));

        let err = resolver.resolve(&SegmentRef::new("missing")).await.unwrap_err();
        assert!(err.to_string().contains("invalid file_id"));

        let err = resolver.resolve(&SegmentRef::new("nopath")).await.unwrap_err();
        assert!(matches!(err, PlayerError::NotResolvable { .. }));
    }
}
