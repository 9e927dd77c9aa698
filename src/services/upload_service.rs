//! Upload multiplexer.
//!
//! Exactly one backend handles `/openapi/v1/upload`, chosen once at startup:
//! remote relay when uploads are enabled and a relay endpoint is set, local
//! disk when only enabled, otherwise a stub that answers 200 with an
//! error-shaped body. Pre-signed object-store uploads live in
//! [`crate::services::presign`] and are independent of this choice.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::core::config::UploadConfig;
use crate::core::error::{AppError, Result};
use crate::core::metrics::get_metrics;
use crate::services::provider_adapter::{to_multipart_form, MultipartPayload};

/// Error text of the disabled-uploader stub.
pub const UPLOAD_DISABLED_MESSAGE: &str = "uploader disabled";

/// URL prefix the local upload tree is served under.
pub const UPLOADS_URL_PREFIX: &str = "/uploads";

/// Whole-exchange bound for one relayed upload.
const RELAY_TIMEOUT: Duration = Duration::from_secs(300);

/// A file held in memory after multipart parsing.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub field_name: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Which backend serves uploads for this deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadBackendKind {
    RemoteRelay(String),
    LocalDisk(PathBuf),
    Disabled,
}

impl UploadBackendKind {
    pub fn label(&self) -> &'static str {
        match self {
            UploadBackendKind::RemoteRelay(_) => "remote_relay",
            UploadBackendKind::LocalDisk(_) => "local_disk",
            UploadBackendKind::Disabled => "disabled",
        }
    }
}

/// Pick the upload backend: remote relay, then local disk, then disabled.
pub fn select_backend(config: &UploadConfig) -> UploadBackendKind {
    match (config.enabled, config.remote_endpoint.as_deref()) {
        (true, Some(endpoint)) => UploadBackendKind::RemoteRelay(endpoint.to_string()),
        (true, None) => UploadBackendKind::LocalDisk(PathBuf::from(&config.local_dir)),
        (false, _) => UploadBackendKind::Disabled,
    }
}

/// What a backend produced for one upload.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadResult {
    /// Written to the local tree and served statically
    Stored { url: String, created: i64 },
    /// Remote relay's JSON body, passed through verbatim
    Relayed(Bytes),
    /// Uploads are turned off
    Disabled { created: i64 },
}

impl IntoResponse for UploadResult {
    fn into_response(self) -> Response {
        match self {
            UploadResult::Stored { url, created } => {
                Json(json!({ "url": url, "created": created })).into_response()
            }
            UploadResult::Relayed(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response(),
            // 200 on purpose: clients read the `error` field, not the status
            UploadResult::Disabled { created } => Json(json!({
                "error": UPLOAD_DISABLED_MESSAGE,
                "created": created
            }))
            .into_response(),
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The active upload backend.
#[derive(Clone)]
pub struct UploadService {
    kind: UploadBackendKind,
    client: reqwest::Client,
}

impl UploadService {
    pub fn new(config: &UploadConfig, client: reqwest::Client) -> Self {
        let kind = select_backend(config);
        tracing::info!(backend = kind.label(), "Upload backend selected");
        Self { kind, client }
    }

    pub fn kind(&self) -> &UploadBackendKind {
        &self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.kind != UploadBackendKind::Disabled
    }

    /// Store one file with the active backend.
    pub async fn store(&self, file: UploadedFile) -> Result<UploadResult> {
        let result = match &self.kind {
            UploadBackendKind::Disabled => Ok(UploadResult::Disabled {
                created: now_millis(),
            }),
            UploadBackendKind::LocalDisk(root) => store_local(root, &file).await,
            UploadBackendKind::RemoteRelay(endpoint) => {
                relay_remote(&self.client, endpoint, file).await
            }
        };

        let outcome = if result.is_ok() { "ok" } else { "error" };
        get_metrics()
            .uploads
            .with_label_values(&[self.kind.label(), outcome])
            .inc();
        result
    }
}

/// Extension of the client file name including the dot, or empty.
fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default()
}

/// Write `file` under `<root>/<YYYY-MM-DD>/<millis><ext>`.
///
/// Names never overwrite: on collision the timestamp is bumped until a free
/// name is found.
pub async fn store_local(root: &Path, file: &UploadedFile) -> Result<UploadResult> {
    let date = chrono::Local::now().format("%Y-%m-%d").to_string();
    let dir = root.join(&date);
    tokio::fs::create_dir_all(&dir).await?;

    let ext = extension_of(&file.file_name);
    let mut stamp = now_millis();
    loop {
        let name = format!("{}{}", stamp, ext);
        let path = dir.join(&name);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut handle) => {
                handle.write_all(&file.data).await?;
                handle.flush().await?;
                tracing::info!(path = %path.display(), bytes = file.data.len(), "Stored upload");
                return Ok(UploadResult::Stored {
                    url: format!("{}/{}/{}", UPLOADS_URL_PREFIX, date, name),
                    created: now_millis(),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => stamp += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Wrap a relay failure the way upload clients expect: 400 with `{error}`.
pub fn relay_failure(status: Option<u16>, message: String) -> AppError {
    let body = json!({ "error": { "message": message, "status": status } });
    AppError::Upstream {
        status: StatusCode::BAD_REQUEST,
        message,
        body: Some(Bytes::from(body.to_string())),
    }
}

/// Forward `file` as multipart field `file` to the relay endpoint.
async fn relay_remote(
    client: &reqwest::Client,
    endpoint: &str,
    file: UploadedFile,
) -> Result<UploadResult> {
    let payload = MultipartPayload {
        fields: Vec::new(),
        files: vec![UploadedFile {
            field_name: "file".to_string(),
            ..file
        }],
    };
    let form = to_multipart_form(payload)?;

    let response = client
        .post(endpoint)
        .timeout(RELAY_TIMEOUT)
        .multipart(form)
        .send()
        .await
        .map_err(|e| {
            tracing::error!(endpoint = %endpoint, error = %e, "Upload relay unreachable");
            relay_failure(None, "upload relay unreachable".to_string())
        })?;

    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| relay_failure(Some(status.as_u16()), e.to_string()))?;

    if !status.is_success() {
        tracing::warn!(status = status.as_u16(), "Upload relay rejected file");
        return Err(relay_failure(
            Some(status.as_u16()),
            String::from_utf8_lossy(&body).into_owned(),
        ));
    }
    Ok(UploadResult::Relayed(body))
}
