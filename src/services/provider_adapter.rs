//! Provider adapter: the single contract every upstream is reached through.
//!
//! Rewriting is a pure function, [`build_outgoing`], from a provider record
//! and the incoming request to the outgoing request. Transport sits behind
//! the [`ProviderAdapter`] trait so handlers can be exercised without a
//! network.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::time::{Duration, Instant};

use crate::core::config::{CredentialHeader, ProviderConfig, GATEWAY_VERSION, VERSION_HEADER};
use crate::core::error::{AppError, Result};
use crate::core::header_policy::{
    forwardable_request_headers, forwardable_response_headers, to_upstream_headers,
};
use crate::core::logging::{get_identity, get_request_id};
use crate::core::metrics::get_metrics;
use crate::services::upload_service::UploadedFile;

/// Request body as received from the client.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Bytes(Bytes),
    /// Buffered multipart form, re-encoded on the way out
    Multipart(MultipartPayload),
}

#[derive(Debug, Clone, Default)]
pub struct MultipartPayload {
    /// Plain text fields in arrival order
    pub fields: Vec<(String, String)>,
    pub files: Vec<UploadedFile>,
}

/// A client request after dispatch, with the path already rewritten.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

/// Fully rewritten request ready to send upstream.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

pub type ByteStream = BoxStream<'static, std::result::Result<Bytes, std::io::Error>>;

/// Upstream status, headers and a lazily pulled body.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Apply a provider's rewrite rules to an incoming request.
///
/// Header rewrites happen in a fixed order: drop what the gateway owns,
/// inject the provider secret, force the content type for non-multipart
/// bodies, stamp the gateway version. Method, query and body pass unchanged.
pub fn build_outgoing(provider: &ProviderConfig, incoming: IncomingRequest) -> Result<OutgoingRequest> {
    let mut headers = forwardable_request_headers(&incoming.headers);

    if let Some(key) = provider.api_key.as_deref() {
        match &provider.credential_header {
            CredentialHeader::Bearer => {
                let value = HeaderValue::from_str(&format!("Bearer {}", key))
                    .map_err(|_| AppError::Internal(format!("invalid key for {}", provider.name)))?;
                headers.insert(axum::http::header::AUTHORIZATION, value);
            }
            CredentialHeader::Custom(name) => {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| AppError::Internal(format!("invalid header {}", name)))?;
                let value = HeaderValue::from_str(key)
                    .map_err(|_| AppError::Internal(format!("invalid key for {}", provider.name)))?;
                headers.insert(name, value);
            }
        }
    }

    match (&incoming.body, provider.content_type.as_deref()) {
        (RequestBody::Bytes(_), Some(content_type)) => {
            if let Ok(value) = HeaderValue::from_str(content_type) {
                headers.insert(axum::http::header::CONTENT_TYPE, value);
            }
        }
        // reqwest writes its own boundary header for multipart bodies
        (RequestBody::Multipart(_), _) => {
            headers.remove(axum::http::header::CONTENT_TYPE);
        }
        _ => {}
    }

    headers.insert(VERSION_HEADER, HeaderValue::from_static(GATEWAY_VERSION));

    let mut url = format!(
        "{}{}",
        provider.api_base.trim_end_matches('/'),
        incoming.path
    );
    if let Some(query) = incoming.query.as_deref().filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }

    Ok(OutgoingRequest {
        method: incoming.method,
        url,
        headers,
        body: incoming.body,
    })
}

/// Re-encode a buffered multipart payload for the upstream client.
pub fn to_multipart_form(payload: MultipartPayload) -> Result<reqwest::multipart::Form> {
    let mut form = reqwest::multipart::Form::new();
    for (name, value) in payload.fields {
        form = form.text(name, value);
    }
    for file in payload.files {
        let mut part = reqwest::multipart::Part::bytes(file.data.to_vec()).file_name(file.file_name);
        if let Some(content_type) = file.content_type.as_deref() {
            part = part.mime_str(content_type)?;
        }
        form = form.part(file.field_name, part);
    }
    Ok(form)
}

/// Forwards a request to one provider and returns its response unread.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn forward(
        &self,
        provider: &ProviderConfig,
        request: IncomingRequest,
    ) -> Result<UpstreamResponse>;
}

/// Adapter backed by the shared HTTP client.
///
/// `response_timeout` bounds the wait for response headers only; once the
/// upstream has started answering, its body may take as long as it needs.
#[derive(Clone)]
pub struct HttpProviderAdapter {
    client: reqwest::Client,
    response_timeout: Duration,
}

impl HttpProviderAdapter {
    pub fn new(client: reqwest::Client, response_timeout: Duration) -> Self {
        Self {
            client,
            response_timeout,
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    async fn forward(
        &self,
        provider: &ProviderConfig,
        request: IncomingRequest,
    ) -> Result<UpstreamResponse> {
        let request_id = get_request_id();
        let path = request.path.clone();
        let outgoing = build_outgoing(provider, request)?;
        let method = reqwest::Method::from_bytes(outgoing.method.as_str().as_bytes())
            .map_err(|_| AppError::BadRequest(format!("unsupported method {}", outgoing.method)))?;

        tracing::debug!(
            request_id = %request_id,
            subject = %get_identity(),
            provider = %provider.name,
            method = %outgoing.method,
            url = %outgoing.url,
            "Forwarding request upstream"
        );

        let mut builder = self
            .client
            .request(method, &outgoing.url)
            .headers(to_upstream_headers(&outgoing.headers));
        builder = match outgoing.body {
            RequestBody::Bytes(bytes) if bytes.is_empty() => builder,
            RequestBody::Bytes(bytes) => builder.body(bytes),
            RequestBody::Multipart(payload) => builder.multipart(to_multipart_form(payload)?),
        };

        let start = Instant::now();
        let metrics = get_metrics();
        let sent = match tokio::time::timeout(self.response_timeout, builder.send()).await {
            Ok(result) => result.map_err(UpstreamFailure::from),
            Err(_) => Err(UpstreamFailure::TimedOut),
        };
        let response = match sent {
            Ok(response) => response,
            Err(failure) => {
                metrics
                    .upstream_errors
                    .with_label_values(&[&provider.name, failure.kind()])
                    .inc();
                tracing::error!(
                    request_id = %request_id,
                    provider = %provider.name,
                    method = %outgoing.method,
                    path = %path,
                    kind = failure.kind(),
                    error = %failure,
                    "Upstream request failed"
                );
                return Err(failure.into());
            }
        };

        let latency = start.elapsed().as_secs_f64();
        metrics
            .upstream_latency
            .with_label_values(&[&provider.name])
            .observe(latency);

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        if status.is_server_error() {
            metrics
                .upstream_errors
                .with_label_values(&[&provider.name, "status"])
                .inc();
        }
        tracing::info!(
            request_id = %request_id,
            provider = %provider.name,
            method = %outgoing.method,
            path = %path,
            status = status.as_u16(),
            latency = format!("{:.3}s", latency),
            "Upstream responded"
        );

        let headers = forwardable_response_headers(response.headers());
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// Why no upstream response arrived.
#[derive(Debug, thiserror::Error)]
enum UpstreamFailure {
    #[error("no response headers before the timeout")]
    TimedOut,
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

impl UpstreamFailure {
    fn kind(&self) -> &'static str {
        match self {
            UpstreamFailure::TimedOut => "timeout",
            UpstreamFailure::Transport(e) if e.is_timeout() => "timeout",
            UpstreamFailure::Transport(e) if e.is_connect() => "connect",
            UpstreamFailure::Transport(_) => "transport",
        }
    }
}

impl From<UpstreamFailure> for AppError {
    fn from(failure: UpstreamFailure) -> Self {
        match failure {
            UpstreamFailure::TimedOut => AppError::Timeout,
            UpstreamFailure::Transport(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn provider(header: CredentialHeader, key: Option<&str>) -> ProviderConfig {
        ProviderConfig {
            name: "openai".to_string(),
            api_base: "http://upstream:8080/".to_string(),
            api_key: key.map(String::from),
            credential_header: header,
            content_type: Some("application/json".to_string()),
        }
    }

    fn incoming(path: &str, query: Option<&str>, body: RequestBody) -> IncomingRequest {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer client-secret".parse().unwrap());
        headers.insert("content-type", "text/plain".parse().unwrap());
        headers.insert("accept", "*/*".parse().unwrap());
        IncomingRequest {
            method: Method::POST,
            path: path.to_string(),
            query: query.map(String::from),
            headers,
            body,
        }
    }

    #[test]
    fn test_bearer_injection_and_url() {
        let out = build_outgoing(
            &provider(CredentialHeader::Bearer, Some("sk-upstream")),
            incoming("/v1/models", Some("limit=5"), RequestBody::Bytes(Bytes::new())),
        )
        .unwrap();

        assert_eq!(out.url, "http://upstream:8080/v1/models?limit=5");
        assert_eq!(out.headers["authorization"], "Bearer sk-upstream");
        assert_eq!(out.headers["content-type"], "application/json");
        assert_eq!(out.headers["accept"], "*/*");
        assert_eq!(out.headers[VERSION_HEADER], GATEWAY_VERSION);
        assert_eq!(out.method, Method::POST);
    }

    #[test]
    fn test_custom_header_injection() {
        let out = build_outgoing(
            &provider(
                CredentialHeader::Custom("mj-api-secret".to_string()),
                Some("mj-key"),
            ),
            incoming("/mj/submit/imagine", None, RequestBody::Bytes(Bytes::new())),
        )
        .unwrap();

        assert_eq!(out.headers["mj-api-secret"], "mj-key");
        // the caller's credential never reaches the provider
        assert!(out.headers.get("authorization").is_none());
    }

    #[test]
    fn test_no_key_injects_nothing() {
        let out = build_outgoing(
            &provider(CredentialHeader::Custom("mj-api-secret".to_string()), None),
            incoming("/x", None, RequestBody::Bytes(Bytes::new())),
        )
        .unwrap();
        assert!(out.headers.get("mj-api-secret").is_none());
        assert!(out.headers.get("authorization").is_none());
    }

    #[test]
    fn test_multipart_keeps_boundary_free_content_type() {
        let out = build_outgoing(
            &provider(CredentialHeader::Bearer, Some("k")),
            incoming(
                "/viggle/asset",
                None,
                RequestBody::Multipart(MultipartPayload::default()),
            ),
        )
        .unwrap();
        assert!(out.headers.get("content-type").is_none());
    }

    #[test]
    fn test_body_passes_unchanged() {
        let body = Bytes::from_static(br#"{"prompt":"a cat"}"#);
        let out = build_outgoing(
            &provider(CredentialHeader::Bearer, Some("k")),
            incoming("/luma/generations", None, RequestBody::Bytes(body.clone())),
        )
        .unwrap();
        match out.body {
            RequestBody::Bytes(b) => assert_eq!(b, body),
            RequestBody::Multipart(_) => panic!("body kind changed"),
        }
    }

    #[test]
    fn test_empty_query_is_dropped() {
        let out = build_outgoing(
            &provider(CredentialHeader::Bearer, None),
            incoming("/v1/models", Some(""), RequestBody::Bytes(Bytes::new())),
        )
        .unwrap();
        assert_eq!(out.url, "http://upstream:8080/v1/models");
    }

    fn live_provider(api_base: String) -> ProviderConfig {
        ProviderConfig {
            name: "luma".to_string(),
            api_base,
            api_key: Some("k".to_string()),
            credential_header: CredentialHeader::Bearer,
            content_type: None,
        }
    }

    #[tokio::test]
    async fn test_slow_headers_time_out() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::any())
            .respond_with(
                wiremock::ResponseTemplate::new(200).set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let adapter =
            HttpProviderAdapter::new(reqwest::Client::new(), Duration::from_millis(100));
        let err = adapter
            .forward(
                &live_provider(server.uri()),
                incoming("/generations", None, RequestBody::Bytes(Bytes::new())),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Timeout));
    }

    #[tokio::test]
    async fn test_fast_headers_are_relayed() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::any())
            .respond_with(wiremock::ResponseTemplate::new(201).set_body_string("queued"))
            .mount(&server)
            .await;

        let adapter = HttpProviderAdapter::new(reqwest::Client::new(), Duration::from_secs(5));
        let response = adapter
            .forward(
                &live_provider(server.uri()),
                incoming("/generations", None, RequestBody::Bytes(Bytes::new())),
            )
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        let body: Vec<Bytes> = response.body.map(|chunk| chunk.unwrap()).collect().await;
        assert_eq!(body.concat(), b"queued".to_vec());
    }
}
