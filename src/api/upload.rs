//! Upload endpoints.
//!
//! `/openapi/v1/upload` goes to the configured upload backend,
//! `/openapi/pre_signed` hands out object-store URLs, and the transcription
//! and provider asset routes buffer one file in memory before forwarding it
//! upstream as a fresh multipart request.

use axum::{
    extract::{FromRequest, Multipart, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::api::auth::AuthLevel;
use crate::api::handlers::{ApiResponse, GatewayState};
use crate::api::proxy::{admit, forward};
use crate::core::error::{AppError, Result};
use crate::core::logging::get_request_id;
use crate::core::middleware::ProviderName;
use crate::services::presign::PresignedUpload;
use crate::services::provider_adapter::{
    ByteStream, IncomingRequest, MultipartPayload, RequestBody,
};
use crate::services::upload_service::{relay_failure, UploadResult, UploadedFile};
use crate::with_request_context;

const TRANSCRIPTION_PROVIDER: &str = "openai";
const TRANSCRIPTION_PATH: &str = "/v1/audio/transcriptions";

/// Body returned when the expected file field is missing.
fn upload_fail() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "uploader fail" })),
    )
        .into_response()
}

/// Buffer a whole multipart form, failing once it grows past `limit` bytes.
///
/// Fields that carry a file name become [`UploadedFile`]s; the rest are kept
/// as text.
pub async fn read_multipart(multipart: &mut Multipart, limit: usize) -> Result<MultipartPayload> {
    let mut payload = MultipartPayload::default();
    let mut total = 0usize;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(String::from);
        let content_type = field.content_type().map(String::from);

        let mut data = BytesMut::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| AppError::BadRequest(format!("invalid multipart body: {}", e)))?
        {
            total += chunk.len();
            if total > limit {
                return Err(AppError::PayloadTooLarge(limit));
            }
            data.extend_from_slice(&chunk);
        }

        match file_name {
            Some(file_name) => payload.files.push(UploadedFile {
                field_name: name,
                file_name,
                content_type,
                data: data.freeze(),
            }),
            None => payload
                .fields
                .push((name, String::from_utf8_lossy(&data).into_owned())),
        }
    }
    Ok(payload)
}

async fn extract_multipart(request: Request, limit: usize) -> Result<MultipartPayload> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| AppError::BadRequest(e.body_text()))?;
    read_multipart(&mut multipart, limit).await
}

/// Take the file sent under `field`, if any.
fn take_file(payload: &mut MultipartPayload, field: &str) -> Option<UploadedFile> {
    let index = payload.files.iter().position(|f| f.field_name == field)?;
    Some(payload.files.remove(index))
}

/// `POST /openapi/v1/upload`
pub async fn upload_file(State(state): State<Arc<GatewayState>>, request: Request) -> Response {
    upload_inner(&state, request)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn upload_inner(state: &GatewayState, request: Request) -> Result<Response> {
    state
        .authenticator
        .authenticate(request.headers(), AuthLevel::SharedSecret)?;

    if !state.uploads.is_enabled() {
        return Ok(UploadResult::Disabled {
            created: chrono::Utc::now().timestamp_millis(),
        }
        .into_response());
    }

    let mut payload = extract_multipart(request, state.config.max_body_bytes).await?;
    let Some(file) = take_file(&mut payload, "file") else {
        tracing::warn!(request_id = %get_request_id(), "Upload without a file field");
        return Ok(upload_fail());
    };

    Ok(state.uploads.store(file).await?.into_response())
}

#[derive(Debug, Deserialize)]
pub struct PresignRequest {
    #[serde(default)]
    pub file_name: String,
    #[serde(rename = "ContentType")]
    pub content_type: Option<String>,
}

/// `POST /openapi/pre_signed`
///
/// The body is parsed only after the caller is authenticated.
pub async fn pre_signed(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<PresignedUpload>>> {
    state
        .authenticator
        .authenticate(&headers, AuthLevel::SharedSecret)?;

    let request: PresignRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid presign request: {}", e)))?;

    let presigner = state
        .presigner
        .as_ref()
        .ok_or_else(|| AppError::Signing("object store is not configured".to_string()))?;

    let signed = presigner.presign_put(
        &request.file_name,
        request.content_type.as_deref(),
        chrono::Utc::now(),
    )?;
    tracing::info!(key = %signed.key, "Issued presigned upload");
    Ok(Json(ApiResponse::success(signed)))
}

/// Collect an upstream body, giving up past `limit` bytes.
async fn collect_body(mut body: ByteStream, limit: usize) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if buf.len() + chunk.len() > limit {
            return Err(AppError::PayloadTooLarge(limit));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// `POST /openapi/v1/audio/transcriptions`
pub async fn transcriptions(State(state): State<Arc<GatewayState>>, request: Request) -> Response {
    let mut response = with_request_context!(
        get_request_id(),
        "anonymous".to_string(),
        TRANSCRIPTION_PROVIDER.to_string(),
        async {
            transcriptions_inner(&state, request)
                .await
                .unwrap_or_else(IntoResponse::into_response)
        }
    );
    response
        .extensions_mut()
        .insert(ProviderName(TRANSCRIPTION_PROVIDER.to_string()));
    response
}

async fn transcriptions_inner(state: &GatewayState, request: Request) -> Result<Response> {
    state
        .authenticator
        .authenticate(request.headers(), AuthLevel::SharedSecret)?;

    let provider = state
        .config
        .provider(TRANSCRIPTION_PROVIDER)
        .ok_or_else(|| AppError::Internal("transcription provider not configured".to_string()))?;

    let limit = state.config.max_body_bytes;
    let mut payload = extract_multipart(request, limit).await?;
    let Some(file) = take_file(&mut payload, "file") else {
        return Ok(upload_fail());
    };
    let model = payload
        .fields
        .iter()
        .find(|(name, _)| name == "model")
        .map(|(_, value)| value.clone())
        .unwrap_or_default();

    let upstream = state
        .adapter
        .forward(
            provider,
            IncomingRequest {
                method: Method::POST,
                path: TRANSCRIPTION_PATH.to_string(),
                query: None,
                headers: HeaderMap::new(),
                body: RequestBody::Multipart(MultipartPayload {
                    fields: vec![("model".to_string(), model)],
                    files: vec![file],
                }),
            },
        )
        .await
        .map_err(|e| relay_failure(None, e.client_message()))?;

    let status = upstream.status;
    let body = collect_body(upstream.body, limit)
        .await
        .map_err(|e| relay_failure(Some(status.as_u16()), e.client_message()))?;

    if !status.is_success() {
        tracing::warn!(status = status.as_u16(), "Transcription rejected upstream");
        return Err(relay_failure(
            Some(status.as_u16()),
            String::from_utf8_lossy(&body).into_owned(),
        ));
    }

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response())
}

/// Multipart field holding the asset for a pre-upload route.
pub fn asset_field(path: &str) -> &'static str {
    if path.starts_with("/ideogram/") {
        "image_file"
    } else {
        "file"
    }
}

/// `POST /viggle/asset`, `/pro/viggle/asset` and `/ideogram/remix`.
///
/// The file is buffered, then forwarded with the remaining text fields to the
/// provider the path routes to.
pub async fn provider_asset(State(state): State<Arc<GatewayState>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let provider = state
        .routes
        .dispatch(&path)
        .map(|route| route.entry.provider.clone())
        .unwrap_or_else(|_| "none".to_string());

    let mut response = with_request_context!(
        get_request_id(),
        "anonymous".to_string(),
        provider.clone(),
        async {
            provider_asset_inner(&state, &path, request)
                .await
                .unwrap_or_else(IntoResponse::into_response)
        }
    );
    response.extensions_mut().insert(ProviderName(provider));
    response
}

async fn provider_asset_inner(
    state: &GatewayState,
    path: &str,
    request: Request,
) -> Result<Response> {
    let context = admit(state, path, request.headers()).await?;
    let headers = request.headers().clone();
    let query = request.uri().query().map(String::from);

    let mut payload = extract_multipart(request, state.config.max_body_bytes).await?;
    let Some(file) = take_file(&mut payload, asset_field(path)) else {
        return Ok(upload_fail());
    };
    tracing::debug!(
        file = %file.file_name,
        bytes = file.data.len(),
        provider = %context.provider,
        "Asset buffered for provider"
    );

    forward(
        state,
        &context,
        Method::POST,
        query,
        headers,
        RequestBody::Multipart(MultipartPayload {
            fields: payload.fields,
            files: vec![file],
        }),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_field() {
        assert_eq!(asset_field("/ideogram/remix"), "image_file");
        assert_eq!(asset_field("/viggle/asset"), "file");
        assert_eq!(asset_field("/pro/viggle/asset"), "file");
    }

    #[test]
    fn test_take_file_by_field() {
        let mut payload = MultipartPayload {
            fields: vec![("prompt".into(), "a cat".into())],
            files: vec![
                UploadedFile {
                    field_name: "other".into(),
                    file_name: "x.bin".into(),
                    content_type: None,
                    data: Bytes::from_static(b"x"),
                },
                UploadedFile {
                    field_name: "image_file".into(),
                    file_name: "cat.png".into(),
                    content_type: Some("image/png".into()),
                    data: Bytes::from_static(b"png"),
                },
            ],
        };
        let file = take_file(&mut payload, "image_file").unwrap();
        assert_eq!(file.file_name, "cat.png");
        assert!(take_file(&mut payload, "image_file").is_none());
        assert_eq!(payload.files.len(), 1);
    }

    #[tokio::test]
    async fn test_collect_body_limit() {
        let body: ByteStream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"12345")),
            Ok(Bytes::from_static(b"67890")),
        ])
        .boxed();
        let err = collect_body(body, 8).await.unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge(8)));
    }

    #[test]
    fn test_presign_request_field_names() {
        let request: PresignRequest =
            serde_json::from_str(r#"{"file_name":"a.png","ContentType":"image/png"}"#).unwrap();
        assert_eq!(request.file_name, "a.png");
        assert_eq!(request.content_type.as_deref(), Some("image/png"));
    }
}
