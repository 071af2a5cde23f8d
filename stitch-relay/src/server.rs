//! Relay server setup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::Request;
use axum::response::Response;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{Span, debug, info_span};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::routes;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server start time for uptime calculation
    pub start_time: Instant,
    /// Upstream client; no overall request timeout so long media bodies can stream
    pub client: reqwest::Client,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Result<Self> {
        stitch_engine::http::install_rustls_provider();
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .tcp_nodelay(true)
            .pool_max_idle_per_host(20)
            .build()?;

        Ok(Self {
            start_time: Instant::now(),
            client,
            config: Arc::new(config),
        })
    }
}

/// Span for one relayed request. Health probes get none; the query is left
/// out because it carries the target URL.
fn request_span(req: &Request) -> Span {
    if req.uri().path().starts_with("/health") {
        return Span::none();
    }
    info_span!("request", method = %req.method(), path = %req.uri().path())
}

/// Relay HTTP server.
pub struct RelayServer {
    state: AppState,
    cancel_token: CancellationToken,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Result<Self> {
        Ok(Self {
            state: AppState::new(config)?,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Get the cancellation token for graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Build the router with all middleware and routes.
    pub fn build_router(&self) -> Router {
        routes::create_router(self.state.clone()).layer(
            TraceLayer::new_for_http()
                .make_span_with(request_span)
                .on_request(())
                .on_response(|res: &Response, latency: Duration, span: &Span| {
                    if span.is_disabled() {
                        return;
                    }
                    debug!(
                        parent: span,
                        status = res.status().as_u16(),
                        latency_ms = latency.as_millis() as u64,
                        "Request finished"
                    );
                }),
        )
    }

    /// Serve until the cancellation token fires.
    pub async fn run(&self) -> Result<()> {
        let address = self.state.config.socket_address();
        let addr: SocketAddr = address.parse().map_err(|e: std::net::AddrParseError| {
            RelayError::InvalidAddress {
                address: address.clone(),
                reason: e.to_string(),
            }
        })?;

        let router = self.build_router();
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("Relay listening on http://{}", listener.local_addr()?);

        let cancel_token = self.cancel_token.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("Relay shutting down...");
            })
            .await?;

        Ok(())
    }

    /// Stop accepting connections and drain in-flight requests.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use tower::ServiceExt;

    use super::*;

    #[test]
    fn test_app_state_creation() {
        let state = AppState::new(RelayConfig::default()).unwrap();
        assert!(state.start_time.elapsed().as_secs() < 1);
        assert_eq!(state.config.port, 12556);
    }

    #[test]
    fn test_server_creation() {
        let server = RelayServer::new(RelayConfig::default()).unwrap();
        let token = server.cancel_token();
        assert!(!token.is_cancelled());
        server.shutdown();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_router_serves_health() {
        let server = RelayServer::new(RelayConfig::default()).unwrap();
        let response = server
            .build_router()
            .oneshot(
                HttpRequest::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let config = RelayConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        };
        let server = Arc::new(RelayServer::new(config).unwrap());
        let handle = tokio::spawn({
            let server = server.clone();
            async move { server.run().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_address_is_rejected() {
        let config = RelayConfig {
            bind_address: "not an address".to_string(),
            ..Default::default()
        };
        let server = RelayServer::new(config).unwrap();
        let err = server.run().await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidAddress { .. }));
    }
}
