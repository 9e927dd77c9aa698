//! Pre-signed object-store uploads.
//!
//! Produces AWS Signature V4 query-string presigned PUT URLs for an
//! S3-compatible store (Cloudflare R2 by default, path-style addressing,
//! region `auto`). The client uploads directly with the `up` URL and later
//! reads the object back through the public domain.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::core::config::ObjectStoreConfig;
use crate::core::error::{AppError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of a presigned URL in seconds.
pub const PRESIGN_EXPIRES_SECS: u64 = 60 * 60;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

#[derive(Debug, Clone, Serialize)]
pub struct PresignedUpload {
    /// Presigned PUT URL
    pub up: String,
    /// Public GET URL of the object once uploaded
    pub url: String,
    #[serde(skip)]
    pub key: String,
}

/// Inputs to one SigV4 query presign.
#[derive(Debug, Clone)]
pub(crate) struct SigV4Query<'a> {
    pub method: &'a str,
    /// `scheme://host[:port]`, no trailing slash
    pub endpoint: &'a str,
    /// Already-encoded canonical URI
    pub uri: &'a str,
    pub region: &'a str,
    pub service: &'a str,
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub content_type: Option<&'a str>,
    pub expires: u64,
    pub now: DateTime<Utc>,
}

fn hmac(key: &[u8], data: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| AppError::Signing(format!("invalid signing key: {err}")))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Percent-encode each path segment, keeping the separators.
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn host_of(endpoint: &str) -> Result<&str> {
    let rest = endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"))
        .ok_or_else(|| AppError::Signing(format!("invalid endpoint {endpoint}")))?;
    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() {
        return Err(AppError::Signing(format!("invalid endpoint {endpoint}")));
    }
    Ok(host)
}

/// Build a presigned URL per the SigV4 query-string scheme.
pub(crate) fn presign_url(q: &SigV4Query<'_>) -> Result<String> {
    let host = host_of(q.endpoint)?;
    let amz_date = q.now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = q.now.format("%Y%m%d").to_string();
    let scope = format!("{}/{}/{}/aws4_request", date_stamp, q.region, q.service);

    // Canonical headers are sorted by name; content-type sorts before host.
    let mut canonical_headers = String::new();
    let signed_headers = match q.content_type {
        Some(content_type) => {
            canonical_headers.push_str(&format!("content-type:{}\n", content_type.trim()));
            canonical_headers.push_str(&format!("host:{}\n", host));
            "content-type;host"
        }
        None => {
            canonical_headers.push_str(&format!("host:{}\n", host));
            "host"
        }
    };

    let mut params = [
        ("X-Amz-Algorithm", ALGORITHM.to_string()),
        ("X-Amz-Credential", format!("{}/{}", q.access_key, scope)),
        ("X-Amz-Date", amz_date.clone()),
        ("X-Amz-Expires", q.expires.to_string()),
        ("X-Amz-SignedHeaders", signed_headers.to_string()),
    ];
    params.sort_by(|a, b| a.0.cmp(b.0));
    let canonical_query = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        q.method, q.uri, canonical_query, canonical_headers, signed_headers, UNSIGNED_PAYLOAD
    );
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        sha256_hex(&canonical_request)
    );

    let k_date = hmac(format!("AWS4{}", q.secret_key).as_bytes(), &date_stamp)?;
    let k_region = hmac(&k_date, q.region)?;
    let k_service = hmac(&k_region, q.service)?;
    let k_signing = hmac(&k_service, "aws4_request")?;
    let signature = hex::encode(hmac(&k_signing, &string_to_sign)?);

    Ok(format!(
        "{}{}?{}&X-Amz-Signature={}",
        q.endpoint, q.uri, canonical_query, signature
    ))
}

/// Signs PUT URLs for the configured bucket.
#[derive(Clone)]
pub struct ObjectStorePresigner {
    config: ObjectStoreConfig,
}

impl ObjectStorePresigner {
    pub fn new(config: ObjectStoreConfig) -> Self {
        Self { config }
    }

    /// Object key: `<YYYY-MM-DD>/<uuid><file_name>`, dated in UTC.
    pub fn object_key(file_name: &str, now: DateTime<Utc>) -> String {
        format!(
            "{}/{}{}",
            now.format("%Y-%m-%d"),
            uuid::Uuid::new_v4(),
            file_name
        )
    }

    /// Presign a one-hour PUT for a fresh key derived from `file_name`.
    pub fn presign_put(
        &self,
        file_name: &str,
        content_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PresignedUpload> {
        if self.config.access_key_id.is_empty() || self.config.secret_access_key.is_empty() {
            return Err(AppError::Signing("missing credentials".to_string()));
        }

        let key = Self::object_key(file_name, now);
        let endpoint = self.config.endpoint_url();
        let uri = format!(
            "/{}/{}",
            urlencoding::encode(&self.config.bucket),
            encode_path(&key)
        );

        let up = presign_url(&SigV4Query {
            method: "PUT",
            endpoint: &endpoint,
            uri: &uri,
            region: "auto",
            service: "s3",
            access_key: &self.config.access_key_id,
            secret_key: &self.config.secret_access_key,
            content_type: content_type.filter(|ct| !ct.is_empty()),
            expires: PRESIGN_EXPIRES_SECS,
            now,
        })?;

        tracing::debug!(bucket = %self.config.bucket, key = %key, "Presigned PUT issued");

        Ok(PresignedUpload {
            up,
            url: format!(
                "{}/{}",
                self.config.public_domain.trim_end_matches('/'),
                key
            ),
            key,
        })
    }
}
