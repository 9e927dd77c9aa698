//! Generic provider proxy.
//!
//! Every path not claimed by a specific handler lands here. The pipeline is
//! fixed: dispatch, authenticate, challenge, buffer the body, forward, relay.
//! Each step can end the request; nothing reaches the provider before the
//! caller is authenticated.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{HeaderMap, Method},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::api::auth::Identity;
use crate::api::disconnect::DisconnectStream;
use crate::api::handlers::GatewayState;
use crate::core::cancel::StreamCancelHandle;
use crate::core::error::{AppError, Result};
use crate::core::logging::{get_request_id, IDENTITY_CONTEXT};
use crate::core::middleware::{ProviderName, RouteLabel};
use crate::services::provider_adapter::{IncomingRequest, RequestBody, UpstreamResponse};
use crate::services::route_table::RouteMatch;
use crate::with_request_context;

/// Per-request facts, fixed once dispatch and authentication are done.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub identity: Identity,
    pub original_path: String,
    pub route_prefix: String,
    pub provider: String,
    pub upstream_path: String,
}

impl RequestContext {
    pub fn new(identity: Identity, original_path: &str, route: &RouteMatch<'_>) -> Self {
        Self {
            request_id: get_request_id(),
            identity,
            original_path: original_path.to_string(),
            route_prefix: route.entry.prefix.clone(),
            provider: route.entry.provider.clone(),
            upstream_path: route.upstream_path.clone(),
        }
    }
}

/// Turn an upstream response into the client response, streaming the body.
///
/// Status and the forwardable headers pass through unchanged; dropping the
/// client response drops the upstream body with it.
pub fn relay_upstream(upstream: UpstreamResponse, route: &'static str) -> Response {
    let body = Body::from_stream(DisconnectStream::new(
        upstream.body,
        StreamCancelHandle::new(),
        route,
    ));
    let mut response = Response::new(body);
    *response.status_mut() = upstream.status;
    *response.headers_mut() = upstream.headers;
    response
}

/// Dispatch and authenticate. Shared by every handler that forwards to a
/// routed provider.
pub async fn admit(
    state: &GatewayState,
    path: &str,
    headers: &HeaderMap,
) -> Result<RequestContext> {
    let route = state.routes.dispatch(path)?;
    let identity = state.authenticator.authenticate(headers, route.entry.auth)?;

    if route.entry.challenge {
        if let Some(verifier) = &state.challenge {
            verifier.verify(headers).await?;
        }
    }

    let context = RequestContext::new(identity, path, &route);
    tracing::debug!(
        path = %context.original_path,
        prefix = %context.route_prefix,
        provider = %context.provider,
        upstream_path = %context.upstream_path,
        subject = %context.identity.subject(),
        "Request admitted"
    );
    Ok(context)
}

/// Forward an admitted request and relay the answer.
pub async fn forward(
    state: &GatewayState,
    context: &RequestContext,
    method: Method,
    query: Option<String>,
    headers: HeaderMap,
    body: RequestBody,
) -> Result<Response> {
    let provider = state
        .config
        .provider(&context.provider)
        .ok_or_else(|| AppError::RouteNotFound(context.original_path.clone()))?;

    let upstream = state
        .adapter
        .forward(
            provider,
            IncomingRequest {
                method,
                path: context.upstream_path.clone(),
                query,
                headers,
                body,
            },
        )
        .await?;

    Ok(relay_upstream(upstream, "proxy"))
}

/// Provider name and route prefix for logging and metrics, known before
/// authentication has happened.
fn route_labels(state: &GatewayState, path: &str) -> (String, Option<String>) {
    match state.routes.dispatch(path) {
        Ok(route) => (route.entry.provider.clone(), Some(route.entry.prefix.clone())),
        Err(_) => ("none".to_string(), None),
    }
}

/// Fallback handler for all routed provider paths.
pub async fn proxy_handler(State(state): State<Arc<GatewayState>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let (provider, prefix) = route_labels(&state, &path);

    let mut response = with_request_context!(
        get_request_id(),
        "anonymous".to_string(),
        provider.clone(),
        async {
            proxy_inner(&state, &path, request)
                .await
                .unwrap_or_else(IntoResponse::into_response)
        }
    );
    response.extensions_mut().insert(ProviderName(provider));
    if let Some(prefix) = prefix {
        response.extensions_mut().insert(RouteLabel(prefix));
    }
    response
}

async fn proxy_inner(state: &GatewayState, path: &str, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let context = admit(state, path, &parts.headers).await?;

    let limit = state.config.max_body_bytes;
    let body = to_bytes(body, limit).await.map_err(|e| {
        tracing::warn!(error = %e, limit, "Request body rejected");
        AppError::PayloadTooLarge(limit)
    })?;

    IDENTITY_CONTEXT
        .scope(
            context.identity.subject(),
            forward(
                state,
                &context,
                parts.method,
                parts.uri.query().map(String::from),
                parts.headers,
                RequestBody::Bytes(body),
            ),
        )
        .await
}
