//! `/chat-process`: streamed chat completions relayed as framed envelopes.
//!
//! The relay moves through `Init -> Streaming -> Done | Error`. Nothing is
//! written to the client until the first upstream delta arrives, so any
//! failure before that point becomes an ordinary JSON error response. After
//! that the status is committed and a failure is written as one more framed
//! envelope before the body ends.

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::api::auth::Identity;
use crate::api::disconnect::DisconnectStream;
use crate::api::handlers::GatewayState;
use crate::api::streaming::{SseDecoder, SseEvent};
use crate::core::cancel::StreamCancelHandle;
use crate::core::error::{AppError, Result};
use crate::core::error_types::STATUS_FAIL;
use crate::core::logging::get_request_id;
use crate::core::metrics::get_metrics;
use crate::core::middleware::ProviderName;
use crate::services::provider_adapter::{ByteStream, IncomingRequest, RequestBody};
use crate::with_request_context;

const CHAT_PROVIDER: &str = "openai";
const CHAT_ROUTE: &str = "/chat-process";
const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
/// Upper bound on an upstream error body read before streaming starts
const MAX_ERROR_BODY: usize = 64 * 1024;

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOptions {
    pub conversation_id: Option<String>,
    pub parent_message_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatProcessRequest {
    pub prompt: String,
    #[serde(default)]
    pub options: ChatOptions,
    pub system_message: Option<String>,
    pub temperature: Option<f64>,
    #[serde(rename = "top_p")]
    pub top_p: Option<f64>,
    pub model: Option<String>,
}

/// One unit of the client-facing stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEnvelope {
    pub id: String,
    pub role: &'static str,
    /// Everything generated so far
    pub text: String,
    /// What this envelope added
    pub delta: String,
    pub parent_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Raw upstream chunk
    pub detail: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Init,
    Streaming,
    Done,
    Error,
}

/// Chat completion request body sent upstream.
pub fn build_upstream_payload(request: &ChatProcessRequest, default_model: &str) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = request.system_message.as_deref().filter(|s| !s.is_empty()) {
        messages.push(json!({ "role": "system", "content": system }));
    }
    messages.push(json!({ "role": "user", "content": request.prompt }));

    let mut payload = json!({
        "model": request.model.as_deref().filter(|m| !m.is_empty()).unwrap_or(default_model),
        "messages": messages,
        "stream": true,
    });
    if let Some(temperature) = request.temperature {
        payload["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        payload["top_p"] = json!(top_p);
    }
    payload
}

/// Error envelope written after streaming has begun. Clients tell it apart
/// from a normal envelope only by its shape.
pub fn stream_error_payload(message: &str) -> Value {
    json!({ "status": STATUS_FAIL, "message": message, "data": null })
}

/// Pulls upstream events one envelope at a time.
///
/// Each call reads only as much of the upstream body as it needs, so a slow
/// client slows the upstream read instead of growing a buffer.
pub struct ChatRelay {
    body: ByteStream,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
    upstream_ended: bool,
    state: RelayState,
    delivered: usize,
    text: String,
    parent_message_id: Option<String>,
    conversation_id: Option<String>,
}

impl ChatRelay {
    pub fn new(body: ByteStream, options: &ChatOptions) -> Self {
        Self {
            body,
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            upstream_ended: false,
            state: RelayState::Init,
            delivered: 0,
            text: String::new(),
            parent_message_id: options.parent_message_id.clone(),
            conversation_id: options.conversation_id.clone(),
        }
    }

    /// Cap the size of a single upstream event.
    pub fn with_event_limit(mut self, max_event_bytes: usize) -> Self {
        self.decoder = SseDecoder::with_limit(max_event_bytes);
        self
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Envelopes handed out so far.
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    fn fail(&mut self, message: String) -> AppError {
        self.state = RelayState::Error;
        AppError::upstream(StatusCode::BAD_GATEWAY, message)
    }

    /// Next envelope, `None` once the upstream is done.
    pub async fn next_envelope(&mut self) -> Result<Option<ChatEnvelope>> {
        if matches!(self.state, RelayState::Done | RelayState::Error) {
            return Ok(None);
        }

        loop {
            if let Some(event) = self.pending.pop_front() {
                let data = match event {
                    SseEvent::Done => {
                        self.state = RelayState::Done;
                        return Ok(None);
                    }
                    SseEvent::Data(data) => data,
                };

                let chunk: Value = match serde_json::from_str(&data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping unparseable upstream chunk");
                        continue;
                    }
                };

                if let Some(error) = chunk.get("error") {
                    let message = error
                        .get("message")
                        .and_then(Value::as_str)
                        .map(String::from)
                        .unwrap_or_else(|| error.to_string());
                    return Err(self.fail(message));
                }

                let delta = chunk
                    .pointer("/choices/0/delta/content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                // role-only and finish chunks carry no content
                if delta.is_empty() {
                    continue;
                }

                self.text.push_str(delta);
                self.state = RelayState::Streaming;
                self.delivered += 1;
                let id = chunk
                    .get("id")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

                return Ok(Some(ChatEnvelope {
                    id,
                    role: "assistant",
                    text: self.text.clone(),
                    delta: delta.to_string(),
                    parent_message_id: self.parent_message_id.clone(),
                    conversation_id: self.conversation_id.clone(),
                    detail: chunk,
                }));
            }

            if self.upstream_ended {
                self.state = RelayState::Done;
                return Ok(None);
            }

            match self.body.next().await {
                Some(Ok(bytes)) => match self.decoder.push(&bytes) {
                    Ok(events) => self.pending.extend(events),
                    Err(e) => {
                        tracing::error!(error = %e, "Upstream chat event too large");
                        self.state = RelayState::Error;
                        return Err(e);
                    }
                },
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Upstream chat stream failed");
                    return Err(self.fail(format!("upstream stream interrupted: {}", e)));
                }
                None => {
                    let events = self.decoder.finish();
                    self.pending.extend(events);
                    self.upstream_ended = true;
                }
            }
        }
    }
}

/// Rate-limit key: user id for per-user tokens, otherwise the client IP.
pub fn client_key(identity: &Identity, headers: &HeaderMap) -> String {
    if identity.is_user() {
        return identity.subject();
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        })
        .unwrap_or("unknown")
        .to_string()
}

/// Read a small upstream error body and pull a readable message out of it.
async fn read_error_message(mut body: ByteStream, status: StatusCode) -> String {
    let mut buf = Vec::new();
    while let Some(Ok(chunk)) = body.next().await {
        buf.extend_from_slice(&chunk);
        if buf.len() >= MAX_ERROR_BODY {
            break;
        }
    }
    serde_json::from_slice::<Value>(&buf)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .and_then(Value::as_str)
                .map(String::from)
        })
        .or_else(|| {
            let text = String::from_utf8_lossy(&buf).trim().to_string();
            (!text.is_empty()).then_some(text)
        })
        .unwrap_or_else(|| format!("HTTP {}", status))
}

/// Message written into a mid-stream error envelope.
fn stream_error_message(error: &AppError) -> String {
    match error {
        AppError::Upstream { message, .. } => message.clone(),
        other => other.client_message(),
    }
}

fn encode(value: &impl Serialize) -> Vec<u8> {
    match serde_json::to_vec(value) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode chat envelope");
            encode_error("failed to encode envelope")
        }
    }
}

fn encode_error(message: &str) -> Vec<u8> {
    stream_error_payload(message).to_string().into_bytes()
}

/// Handler for `POST /chat-process`.
pub async fn chat_process(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (identity, auth_result) = match state
        .authenticator
        .authenticate(&headers, state.authenticator.chat_level())
    {
        Ok(identity) => (identity.subject(), Ok(identity)),
        Err(e) => ("anonymous".to_string(), Err(e)),
    };

    let mut response = with_request_context!(
        get_request_id(),
        identity,
        CHAT_PROVIDER.to_string(),
        async {
            match auth_result {
                Ok(identity) => chat_process_inner(&state, &headers, body, identity)
                    .await
                    .unwrap_or_else(IntoResponse::into_response),
                Err(e) => e.into_response(),
            }
        }
    );
    response
        .extensions_mut()
        .insert(ProviderName(CHAT_PROVIDER.to_string()));
    response
}

async fn chat_process_inner(
    state: &GatewayState,
    headers: &HeaderMap,
    body: Bytes,
    identity: Identity,
) -> Result<Response> {
    state
        .rate_limiter
        .check_rate_limit(&client_key(&identity, headers))?;

    let request: ChatProcessRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid chat request: {}", e)))?;

    let provider = state
        .config
        .provider(CHAT_PROVIDER)
        .ok_or_else(|| AppError::Internal("chat provider not configured".to_string()))?;

    let payload = build_upstream_payload(&request, &state.config.chat.model);
    tracing::info!(
        subject = %identity.subject(),
        model = %payload["model"],
        "Chat request accepted"
    );

    let upstream = state
        .adapter
        .forward(
            provider,
            IncomingRequest {
                method: Method::POST,
                path: CHAT_COMPLETIONS_PATH.to_string(),
                query: None,
                headers: HeaderMap::new(),
                body: RequestBody::Bytes(Bytes::from(payload.to_string())),
            },
        )
        .await?;

    if !upstream.status.is_success() {
        let message = read_error_message(upstream.body, upstream.status).await;
        tracing::warn!(status = upstream.status.as_u16(), error = %message, "Chat upstream rejected request");
        return Err(AppError::upstream(StatusCode::BAD_GATEWAY, message));
    }

    let mut relay = ChatRelay::new(upstream.body, &request.options)
        .with_event_limit(state.config.max_body_bytes);
    let framing = state.framing.clone();

    // INIT: hold the response until there is something to send.
    let first = match relay.next_envelope().await? {
        Some(envelope) => envelope,
        None => {
            tracing::info!("Chat upstream ended without content");
            return Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, framing.content_type())],
                Body::empty(),
            )
                .into_response());
        }
    };

    let content_type = framing.content_type();
    let cancel_handle = StreamCancelHandle::new();
    let producer_handle = cancel_handle.clone();
    let request_id = get_request_id();

    let stream = async_stream::stream! {
        let metrics = get_metrics();
        yield Ok::<Bytes, std::io::Error>(framing.frame(0, &encode(&first)));
        metrics.stream_chunks.with_label_values(&["delta"]).inc();

        loop {
            // frame position of the next write
            let index = relay.delivered();
            match relay.next_envelope().await {
                Ok(Some(envelope)) => {
                    yield Ok(framing.frame(index, &encode(&envelope)));
                    metrics.stream_chunks.with_label_values(&["delta"]).inc();
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(request_id = %request_id, error = %e, "Chat stream failed mid-flight");
                    yield Ok(framing.frame(index, &encode_error(&stream_error_message(&e))));
                    metrics.stream_chunks.with_label_values(&["error"]).inc();
                    break;
                }
            }
        }

        producer_handle.mark_completed();
        tracing::debug!(request_id = %request_id, envelopes = relay.delivered(), state = ?relay.state(), "Chat stream finished");
    };

    let body = Body::from_stream(DisconnectStream::new(
        Box::pin(stream),
        cancel_handle,
        CHAT_ROUTE,
    ));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}
