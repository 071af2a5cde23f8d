//! Same-origin media relay.
//!
//! Decoders cannot read cross-origin media that lacks CORS headers, and some
//! origins refuse requests carrying a browser `Referer`. This route fetches
//! `?url=<target>` on the caller's behalf, forwards `Range` so seeking works,
//! and streams the body back with permissive CORS headers.

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::TryStreamExt;
use serde::Deserialize;
use tracing::{debug, warn};
use url::{Host, Url};

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Identity and credential headers never sent upstream.
const STRIPPED_REQUEST: [&str; 5] = ["host", "cookie", "authorization", "referer", "origin"];

#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    pub url: Option<String>,
}

/// Create the relay router.
pub fn router() -> Router<AppState> {
    Router::new()
        // Mounted under `/api/proxy` by the main router.
        .route(
            "/",
            get(proxy_request)
                .head(proxy_request)
                .post(proxy_request)
                .options(proxy_options),
        )
}

fn cors_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, HEAD, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Range"),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Content-Length, Content-Range, Accept-Ranges, Content-Type"),
    );
    headers
}

async fn proxy_options() -> impl IntoResponse {
    (StatusCode::NO_CONTENT, cors_headers())
}

/// Reject non-http(s) targets, and local or private hosts unless allowed.
fn check_target(target: &Url, allow_private: bool) -> ApiResult<()> {
    match target.scheme() {
        "http" | "https" => {}
        _ => return Err(ApiError::bad_request("Only http/https URLs are allowed")),
    }
    if allow_private {
        return Ok(());
    }

    let blocked = match target.host() {
        Some(Host::Domain(domain)) => {
            domain.eq_ignore_ascii_case("localhost")
                || domain.to_ascii_lowercase().ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => {
            ip.is_loopback()
                || ip.is_private()
                || ip.is_link_local()
                || ip.is_unspecified()
                || ip.is_broadcast()
        }
        Some(Host::Ipv6(ip)) => {
            ip.is_loopback()
                || ip.is_unspecified()
                || ip.is_unique_local()
                || ip.is_unicast_link_local()
                || ip.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback() || v4.is_private())
        }
        None => true,
    };

    if blocked {
        Err(ApiError::bad_request("Private network targets are not allowed"))
    } else {
        Ok(())
    }
}

fn forward_request_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in incoming {
        let name_str = name.as_str();
        if HOP_BY_HOP.contains(&name_str) || STRIPPED_REQUEST.contains(&name_str) {
            continue;
        }
        // The client negotiates its own encoding and length upstream.
        if name == header::ACCEPT_ENCODING || name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

fn forward_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if HOP_BY_HOP.contains(&name.as_str())
            || name == header::CONTENT_ENCODING
            || name == header::CONTENT_LENGTH
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    for (name, value) in cors_headers() {
        if let Some(name) = name {
            headers.insert(name, value);
        }
    }
    headers
}

pub async fn proxy_request(
    State(state): State<AppState>,
    Query(query): Query<ProxyQuery>,
    req: Request,
) -> ApiResult<Response> {
    let raw = query
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(ApiError::missing_url)?;

    // A target that cannot be parsed fails like a request that could not be sent.
    let target = Url::parse(raw).map_err(|e| ApiError::proxy(format!("Invalid url: {e}")))?;
    check_target(&target, state.config.allow_private_targets)?;

    let (parts, body) = req.into_parts();
    let method = parts.method;
    let host = target.host_str().unwrap_or_default().to_string();

    let mut upstream = state
        .client
        .request(method.clone(), target)
        .headers(forward_request_headers(&parts.headers));

    if method != Method::GET && method != Method::HEAD {
        let body = to_bytes(body, state.config.body_limit)
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read request body: {e}")))?;
        upstream = upstream.body(body);
    }

    let upstream = upstream.send().await.map_err(|e| {
        warn!(%method, host = %host, error = %e, "Upstream request failed");
        ApiError::proxy(e.to_string())
    })?;

    let status = upstream.status();
    debug!(%method, host = %host, status = status.as_u16(), "Relaying upstream response");

    let headers = forward_response_headers(upstream.headers());
    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from_stream(upstream.bytes_stream().map_err(std::io::Error::other))
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Bytes;
    use axum::http::Request as HttpRequest;
    use axum::routing::post;
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    use crate::config::RelayConfig;

    const SENSITIVE: [&str; 4] = ["cookie", "authorization", "referer", "origin"];

    async fn upstream_handler(req: HttpRequest<Body>) -> impl IntoResponse {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

        // Report which sensitive headers made it through.
        let seen: Vec<&str> = SENSITIVE
            .into_iter()
            .filter(|name| req.headers().contains_key(*name))
            .collect();
        headers.insert(
            "x-seen",
            HeaderValue::from_str(&seen.join(",")).unwrap_or(HeaderValue::from_static("")),
        );
        if let Some(custom) = req.headers().get("x-custom") {
            headers.insert("x-custom-echo", custom.clone());
        }

        let status = if req.headers().contains_key(header::RANGE) {
            headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("bytes 0-1/3"));
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };

        (status, headers, "abc")
    }

    async fn echo_handler(body: Bytes) -> Bytes {
        body
    }

    async fn spawn_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route("/video", get(upstream_handler))
            .route("/echo", post(echo_handler))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn app(allow_private_targets: bool) -> Router {
        let state = AppState::new(RelayConfig {
            allow_private_targets,
            ..Default::default()
        })
        .unwrap();
        Router::new()
            .nest("/api/proxy", super::router())
            .with_state(state)
    }

    fn proxy_uri(target: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("url", target)
            .finish();
        format!("/api/proxy?{query}")
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn proxy_forwards_range_and_sets_cors_headers() {
        let upstream = spawn_upstream().await;

        let request = HttpRequest::builder()
            .uri(proxy_uri(&format!("{upstream}/video")))
            .header(header::RANGE, "bytes=0-1")
            .header(header::COOKIE, "session=secret")
            .header(header::AUTHORIZATION, "Bearer secret")
            .header(header::REFERER, "https://app.example.com/")
            .header(header::ORIGIN, "https://app.example.com")
            .header("x-custom", "kept")
            .body(Body::empty())
            .unwrap();

        let response = app(true).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);

        let headers = response.headers();
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert_eq!(headers.get(header::CONTENT_RANGE).unwrap(), "bytes 0-1/3");
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "video/mp4");
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(headers.get("x-seen").unwrap(), "");
        assert_eq!(headers.get("x-custom-echo").unwrap(), "kept");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"abc");
    }

    #[tokio::test]
    async fn proxy_returns_upstream_status_verbatim() {
        let upstream = spawn_upstream().await;
        let request = HttpRequest::builder()
            .uri(proxy_uri(&format!("{upstream}/missing")))
            .body(Body::empty())
            .unwrap();

        let response = app(true).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn proxy_forwards_post_body() {
        let upstream = spawn_upstream().await;
        let request = HttpRequest::builder()
            .method(Method::POST)
            .uri(proxy_uri(&format!("{upstream}/echo")))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"file_id":"abc"}"#))
            .unwrap();

        let response = app(true).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"file_id":"abc"}"#);
    }

    #[tokio::test]
    async fn proxy_head_has_no_body() {
        let upstream = spawn_upstream().await;
        let request = HttpRequest::builder()
            .method(Method::HEAD)
            .uri(proxy_uri(&format!("{upstream}/video")))
            .body(Body::empty())
            .unwrap();

        let response = app(true).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn proxy_answers_preflight() {
        let request = HttpRequest::builder()
            .method(Method::OPTIONS)
            .uri("/api/proxy")
            .header(header::ORIGIN, "https://app.example.com")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .body(Body::empty())
            .unwrap();

        let response = app(false).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_METHODS).unwrap(),
            "GET, POST, HEAD, OPTIONS"
        );
    }

    #[tokio::test]
    async fn proxy_requires_url_parameter() {
        let request = HttpRequest::builder()
            .uri("/api/proxy")
            .body(Body::empty())
            .unwrap();

        let response = app(false).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({ "error": "Missing url parameter" })
        );
    }

    #[tokio::test]
    async fn proxy_reports_unparsable_url_as_proxy_error() {
        let request = HttpRequest::builder()
            .uri(proxy_uri("http://exa mple.com:99999/a.mp4"))
            .body(Body::empty())
            .unwrap();

        let response = app(false).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = json_body(response).await;
        assert_eq!(json["error"], "Proxy Error");
        assert!(json["details"].as_str().unwrap().starts_with("Invalid url"));
    }

    #[tokio::test]
    async fn proxy_rejects_non_http_schemes() {
        let request = HttpRequest::builder()
            .uri(proxy_uri("file:///etc/passwd"))
            .body(Body::empty())
            .unwrap();

        let response = app(true).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn proxy_rejects_private_targets_by_default() {
        for target in [
            "http://localhost/a.mp4",
            "http://127.0.0.1:8080/a.mp4",
            "http://10.0.0.7/a.mp4",
            "http://192.168.1.2/a.mp4",
            "http://[::1]/a.mp4",
        ] {
            let request = HttpRequest::builder()
                .uri(proxy_uri(target))
                .body(Body::empty())
                .unwrap();
            let response = app(false).oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{target}");
        }
    }

    #[tokio::test]
    async fn proxy_reports_upstream_failure_as_json() {
        // Reserve a port, then close it so the connection is refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let request = HttpRequest::builder()
            .uri(proxy_uri(&format!("http://{addr}/video")))
            .body(Body::empty())
            .unwrap();

        let response = app(true).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = json_body(response).await;
        assert_eq!(json["error"], "Proxy Error");
        assert!(json["details"].is_string());
    }

    #[test]
    fn public_targets_pass_the_guard() {
        let target = Url::parse("https://cdn.example.com/seg.mp4").unwrap();
        assert!(check_target(&target, false).is_ok());
        let target = Url::parse("http://93.184.216.34/seg.mp4").unwrap();
        assert!(check_target(&target, false).is_ok());
    }

    #[test]
    fn request_headers_drop_hop_by_hop_and_credentials() {
        let mut incoming = HeaderMap::new();
        incoming.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        incoming.insert(header::HOST, HeaderValue::from_static("relay.local"));
        incoming.insert(header::COOKIE, HeaderValue::from_static("a=b"));
        incoming.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("br"));
        incoming.insert(header::RANGE, HeaderValue::from_static("bytes=10-"));
        incoming.insert(header::USER_AGENT, HeaderValue::from_static("player"));

        let forwarded = forward_request_headers(&incoming);
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded.get(header::RANGE).unwrap(), "bytes=10-");
        assert_eq!(forwarded.get(header::USER_AGENT).unwrap(), "player");
    }

    #[test]
    fn response_headers_drop_encoding_and_length() {
        let mut upstream = HeaderMap::new();
        upstream.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        upstream.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        upstream.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        upstream.insert(header::ETAG, HeaderValue::from_static("\"v1\""));

        let headers = forward_response_headers(&upstream);
        assert!(headers.get(header::CONTENT_ENCODING).is_none());
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(headers.get(header::ETAG).unwrap(), "\"v1\"");
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    }
}
