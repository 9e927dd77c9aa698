//! Router assembly.

use axum::{
    extract::DefaultBodyLimit,
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::CorsLayer, limit::RequestBodyLimitLayer, services::ServeDir, trace::TraceLayer,
};

use crate::api::chat::chat_process;
use crate::api::handlers::{health, metrics_handler, session, verify, GatewayState};
use crate::api::proxy::proxy_handler;
use crate::api::upload::{pre_signed, provider_asset, transcriptions, upload_file};
use crate::core::config::AppConfig;
use crate::core::middleware::{request_id_middleware, MetricsMiddleware};
use crate::services::upload_service::UPLOADS_URL_PREFIX;

/// Upper bound on establishing an upstream connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Create HTTP client with connection pooling.
///
/// Only connecting is bounded here. Calls that relay a body bound the wait
/// for response headers themselves, so long but live streams are not cut off.
pub fn create_http_client(config: &AppConfig) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(!config.verify_ssl)
        .connect_timeout(CONNECT_TIMEOUT.min(Duration::from_secs(config.request_timeout_secs)))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .http2_keep_alive_interval(Duration::from_secs(30))
        .http2_keep_alive_timeout(Duration::from_secs(10))
        .build()
}

/// Routes the web client calls, mounted both at `/` and under `/api`.
fn client_routes() -> Router<Arc<GatewayState>> {
    Router::new()
        .route("/chat-process", post(chat_process))
        .route("/session", post(session))
        .route("/verify", post(verify))
}

/// Build the gateway router.
///
/// Specific routes win over the provider fallback, so `/openapi/pre_signed`
/// never reaches the OpenAI proxy.
pub fn build_app(state: Arc<GatewayState>) -> Router {
    let max_body = state.config.max_body_bytes;
    let uploads_dir = ServeDir::new(&state.config.upload.local_dir);

    Router::new()
        .merge(client_routes())
        .nest("/api", client_routes())
        .route("/openapi/v1/upload", post(upload_file))
        .route("/openapi/pre_signed", post(pre_signed))
        .route("/openapi/v1/audio/transcriptions", post(transcriptions))
        .route("/viggle/asset", post(provider_asset))
        .route("/pro/viggle/asset", post(provider_asset))
        .route("/ideogram/remix", post(provider_asset))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .nest_service(UPLOADS_URL_PREFIX, uploads_dir)
        .fallback(proxy_handler)
        .layer(DefaultBodyLimit::max(max_body))
        .layer(RequestBodyLimitLayer::new(max_body))
        .layer(from_fn(MetricsMiddleware::track_metrics))
        .layer(from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
