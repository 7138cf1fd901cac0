use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::{JwtTokenVerifier, TokenVerifier};
use crate::config::GatewayConfig;
use crate::connection::{ConnectionManager, ConnectionRegistry};
use crate::error::{attach_request_id_header, ErrorCode, GatewayError, REQUEST_ID_HEADER};
use crate::metrics::GatewayMetrics;
use crate::pool::ConnectionPool;
use crate::presence::ResourceSessionHandler;
use crate::ws::{self, WsState};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Everything one gateway process shares between requests.
#[derive(Clone)]
pub struct Gateway {
    config: Arc<GatewayConfig>,
    manager: Arc<ConnectionManager>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let verifier =
            JwtTokenVerifier::new(&config.jwt_secret, &config.jwt_issuer, &config.jwt_audience)
                .context("invalid gateway JWT settings")?;
        Ok(Self::with_verifier(config, Arc::new(verifier)))
    }

    pub fn with_verifier(config: GatewayConfig, verifier: Arc<dyn TokenVerifier>) -> Self {
        let registry = Arc::new(ConnectionRegistry::default());
        let sessions = Arc::new(ResourceSessionHandler::new(registry.clone()));
        let manager = Arc::new(ConnectionManager::new(
            verifier,
            ConnectionPool::new(config.max_connections_per_user),
            registry,
            sessions,
            Arc::new(GatewayMetrics::default()),
        ));
        Self { config: Arc::new(config), manager }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn router(&self) -> Router {
        let ws_state = WsState { manager: self.manager.clone(), heartbeat: self.config.heartbeat };
        let api = Router::new()
            .route("/v1/gateway/stats", get(stats))
            .route("/metrics", get(metrics))
            .with_state(self.manager.clone());

        apply_middleware(
            Router::new()
                .route("/healthz", get(healthz))
                .merge(ws::router(ws_state))
                .merge(api)
                .fallback(not_found),
            self.manager.metrics().clone(),
        )
    }

    /// Broadcast the shutdown notice and drain connections.
    pub async fn shutdown(&self) {
        self.manager.shutdown(self.config.shutdown_grace).await;
    }
}

/// Serve until `signal` resolves, then run the connection shutdown sequence
/// before letting axum finish.
pub async fn serve<F>(listener: TcpListener, gateway: Gateway, signal: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = gateway.router();
    let local_addr = listener.local_addr().context("failed to read gateway listen address")?;
    info!(listen_addr = %local_addr, "starting collaboration gateway");

    let drain = async move {
        signal.await;
        gateway.shutdown().await;
        info!("connection shutdown complete");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(drain)
        .await
        .context("gateway server exited unexpectedly")
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(error = %error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

fn apply_middleware(router: Router, metrics: Arc<GatewayMetrics>) -> Router {
    router
        .layer(middleware::from_fn_with_state(metrics, request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn stats(State(manager): State<Arc<ConnectionManager>>) -> impl IntoResponse {
    Json(manager.stats().await)
}

async fn metrics(State(manager): State<Arc<ConnectionManager>>) -> impl IntoResponse {
    let body = manager.metrics().render_prometheus(manager.gauges().await);
    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body)
}

async fn not_found() -> GatewayError {
    GatewayError::from_code(ErrorCode::NotFound)
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            GatewayError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(
    State(metrics): State<Arc<GatewayMetrics>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = next.run(request).await;
    attach_request_id_header(&mut response, &request_id);

    let latency_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
    metrics.record_http_request(method.as_str(), &path, response.status().as_u16(), latency_ms);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms,
        "request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        routing::get,
        Router,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    const SECRET: &str = "gateway_test_secret_that_is_definitely_long_enough";

    fn test_gateway() -> Gateway {
        let config = GatewayConfig {
            jwt_secret: SECRET.to_string(),
            ..GatewayConfig::default()
        };
        Gateway::new(config).expect("test gateway should initialize")
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request should build")
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        serde_json::from_slice(&bytes).expect("response body should be JSON")
    }

    #[tokio::test]
    async fn health_check_has_request_id_header() {
        let response = test_gateway()
            .router()
            .oneshot(get_request("/healthz"))
            .await
            .expect("healthz request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn incoming_request_id_is_echoed() {
        let response = test_gateway()
            .router()
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .header("x-request-id", "req-42")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("healthz request should succeed");

        assert_eq!(response.headers()["x-request-id"], "req-42");
    }

    #[tokio::test]
    async fn stats_start_empty() {
        let response = test_gateway()
            .router()
            .oneshot(get_request("/v1/gateway/stats"))
            .await
            .expect("stats request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["totalConnections"], 0);
        assert_eq!(body["connectedUsers"], 0);
        assert_eq!(body["activeResources"], 0);
        assert_eq!(body["shuttingDown"], false);
    }

    #[tokio::test]
    async fn handshake_without_token_is_unauthorized() {
        let gateway = test_gateway();
        let response = gateway
            .router()
            .oneshot(get_request("/ws/collaboration"))
            .await
            .expect("handshake request should return a response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key("x-request-id"));
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "AUTH_MISSING_TOKEN");
        assert_eq!(gateway.manager().pool().total_connections().await, 0);
    }

    #[tokio::test]
    async fn handshake_with_expired_token_is_unauthorized() {
        let gateway = test_gateway();
        let verifier = JwtTokenVerifier::new(SECRET, "collabornest", "collabornest-users")
            .expect("verifier should build");
        let issued_at = chrono::Utc::now().timestamp() - 7200;
        let token = verifier
            .issue_token_at("user-123", Some("testuser"), None, issued_at, 3600)
            .expect("token should be issued");

        let response = gateway
            .router()
            .oneshot(get_request(&format!("/ws/collaboration?token={token}")))
            .await
            .expect("handshake request should return a response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "AUTH_TOKEN_EXPIRED");
        assert_eq!(gateway.manager().pool().total_connections().await, 0);
    }

    #[tokio::test]
    async fn handshake_is_refused_while_shutting_down() {
        let gateway = test_gateway();
        gateway.manager().shutdown(Duration::ZERO).await;

        let response = gateway
            .router()
            .oneshot(get_request("/ws/collaboration?token=a.b.c"))
            .await
            .expect("handshake request should return a response");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "SERVER_SHUTTING_DOWN");
        assert_eq!(body["error"]["retryable"], true);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_prometheus_text() {
        let router = test_gateway().router();
        let _ = router
            .clone()
            .oneshot(get_request("/ws/collaboration"))
            .await
            .expect("handshake request should return a response");

        let response = router
            .oneshot(get_request("/metrics"))
            .await
            .expect("metrics request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], PROMETHEUS_CONTENT_TYPE);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        let text = String::from_utf8(bytes.to_vec()).expect("metrics should be utf-8");
        assert!(text.contains("gateway_auth_rejections_total{code=\"auth_missing_token\"} 1"));
        assert!(text.contains("gateway_connections 0"));
    }

    #[tokio::test]
    async fn unknown_routes_return_structured_not_found() {
        let response = test_gateway()
            .router()
            .oneshot(get_request("/nope"))
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn panic_handler_returns_internal_server_error() {
        async fn panic_route() -> &'static str {
            panic!("test panic");
        }

        let app = apply_middleware(
            Router::new().route("/panic", get(panic_route)),
            Arc::new(GatewayMetrics::default()),
        );

        let response = app
            .oneshot(get_request("/panic"))
            .await
            .expect("panic request should return a response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
