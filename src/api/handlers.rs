//! Shared gateway state and the small JSON endpoints.
//!
//! `/session` and `/verify` are what the web client calls before anything
//! else; `/health` and `/metrics` are for operators.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::api::auth::{Authenticator, ChallengeVerifier};
use crate::api::streaming::{framing_from_name, ChatFraming};
use crate::core::config::{AppConfig, ClientFeatures, GATEWAY_VERSION};
use crate::core::error::{AppError, Result};
use crate::core::error_types::{STATUS_FAIL, STATUS_SUCCESS};
use crate::core::logging::get_request_id;
use crate::core::metrics::render_metrics;
use crate::core::rate_limiter::RateLimiter;
use crate::services::presign::ObjectStorePresigner;
use crate::services::provider_adapter::{HttpProviderAdapter, ProviderAdapter};
use crate::services::route_table::RouteTable;
use crate::services::upload_service::UploadService;

/// Chat backend name reported to the web client.
const CHAT_API_MODEL: &str = "ChatGPTAPI";

/// Everything a handler needs, built once at startup and shared read-only.
#[derive(Clone)]
pub struct GatewayState {
    pub config: AppConfig,
    pub routes: RouteTable,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub authenticator: Authenticator,
    pub challenge: Option<ChallengeVerifier>,
    pub uploads: UploadService,
    pub presigner: Option<ObjectStorePresigner>,
    pub rate_limiter: RateLimiter,
    pub framing: Arc<dyn ChatFraming>,
}

impl GatewayState {
    pub fn new(config: AppConfig, http_client: reqwest::Client) -> Self {
        let adapter: Arc<dyn ProviderAdapter> =
            Arc::new(HttpProviderAdapter::new(
                http_client.clone(),
                Duration::from_secs(config.request_timeout_secs),
            ));

        let routes = RouteTable::from_config(&config);
        let authenticator = Authenticator::new(&config.auth);
        let challenge = config
            .auth
            .challenge
            .clone()
            .map(|c| ChallengeVerifier::new(c, http_client.clone()));
        let uploads = UploadService::new(&config.upload, http_client.clone());
        let presigner = config.object_store.clone().map(ObjectStorePresigner::new);
        let rate_limiter = RateLimiter::per_hour(config.chat.max_requests_per_hour);
        let framing = framing_from_name(&config.chat.framing);

        Self {
            config,
            routes,
            adapter,
            authenticator,
            challenge,
            uploads,
            presigner,
            rate_limiter,
            framing,
        }
    }

    /// Replace the upstream transport, mainly for tests.
    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapter = adapter;
        self
    }
}

/// Standard `{status, message, data}` envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub status: &'static str,
    pub message: String,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: STATUS_SUCCESS,
            message: String::new(),
            data,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    #[serde(flatten)]
    pub features: ClientFeatures,
    pub auth: bool,
    pub model: &'static str,
    pub amodel: String,
    pub is_upload: bool,
    #[serde(rename = "isUploadR2")]
    pub is_upload_r2: bool,
    pub user_management_enabled: bool,
}

impl SessionData {
    pub fn from_state(state: &GatewayState) -> Self {
        let config = &state.config;
        Self {
            features: config.features.clone(),
            auth: state.authenticator.has_shared_secret(),
            model: CHAT_API_MODEL,
            amodel: config.chat.model.clone(),
            is_upload: state.uploads.is_enabled(),
            is_upload_r2: config
                .object_store
                .as_ref()
                .is_some_and(|store| !store.public_domain.is_empty()),
            user_management_enabled: config.auth.jwt_secret.is_some(),
        }
    }
}

/// `POST /session`: deployment features for the web client. Public.
pub async fn session(State(state): State<Arc<GatewayState>>) -> Json<ApiResponse<SessionData>> {
    tracing::debug!(request_id = %get_request_id(), "Session requested");
    Json(ApiResponse::success(SessionData::from_state(&state)))
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub token: Option<String>,
}

/// `POST /verify`: check a candidate shared secret.
///
/// A missing or unreadable body counts as an empty secret.
pub async fn verify(State(state): State<Arc<GatewayState>>, body: Bytes) -> Response {
    let request: VerifyRequest =
        serde_json::from_slice(&body).unwrap_or(VerifyRequest { token: None });

    let outcome = match request.token.as_deref().filter(|t| !t.is_empty()) {
        None => Err("Secret key is empty"),
        Some(token) if state.authenticator.verify_secret(token) => Ok(()),
        Some(_) => Err("密钥无效 | Secret key is invalid"),
    };

    match outcome {
        Ok(()) => Json(json!({
            "status": STATUS_SUCCESS,
            "message": "Verify successfully",
            "data": null
        }))
        .into_response(),
        Err(message) => {
            tracing::info!(request_id = %get_request_id(), "Secret verification failed");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "status": STATUS_FAIL, "message": message, "data": null })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub routes: usize,
    pub upload_backend: &'static str,
    pub presign: bool,
    pub rate_limited: bool,
}

/// `GET /health`: liveness plus a summary of the active configuration.
#[tracing::instrument(skip(state))]
pub async fn health(State(state): State<Arc<GatewayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: GATEWAY_VERSION,
        routes: state.routes.entries().len(),
        upload_backend: state.uploads.kind().label(),
        presign: state.presigner.is_some(),
        rate_limited: state.rate_limiter.is_enabled(),
    })
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler() -> Result<Response> {
    let body = render_metrics().map_err(|e| AppError::Internal(e.to_string()))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}
