//! Request authentication.
//!
//! Routes declare one of three [`AuthLevel`]s. Credentials always arrive as
//! `Authorization: Bearer <token>`, where the token is either the deployment's
//! shared secret or a per-user HS256 token.

use axum::http::HeaderMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::core::config::{AuthConfig, ChallengeConfig};
use crate::core::error::Result;
use crate::core::AppError;

/// Message returned on every authentication failure.
pub const UNAUTHORIZED_MESSAGE: &str = "Error: 无访问权限 | No access rights";

/// Header carrying the Turnstile challenge token.
pub const CHALLENGE_HEADER: &str = "x-vtoken";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthLevel {
    /// No credential checked
    Public,
    /// Shared secret or a valid user token; open when no secret is configured
    SharedSecret,
    /// Valid user token only
    StrictIdentity,
}

/// Who the caller was resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Anonymous,
    SharedSecret,
    User { id: String, role: String },
}

impl Identity {
    /// Subject used for logging and rate-limit keys.
    pub fn subject(&self) -> String {
        match self {
            Identity::Anonymous => "anonymous".to_string(),
            Identity::SharedSecret => "shared-secret".to_string(),
            Identity::User { id, .. } => id.clone(),
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Identity::User { .. })
    }
}

/// Claims carried by per-user tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub id: String,
    pub role: String,
    pub exp: usize,
}

/// Hash a secret using SHA-256.
pub fn hash_key(key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

/// Compare two digests without short-circuiting on the first difference.
fn digests_equal(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Extract Bearer token from Authorization header.
fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Validates caller credentials against the configured secrets.
#[derive(Clone)]
pub struct Authenticator {
    shared_secret: Option<[u8; 32]>,
    jwt_key: Option<DecodingKey>,
}

impl Authenticator {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            shared_secret: config.shared_secret.as_deref().map(hash_key),
            jwt_key: config
                .jwt_secret
                .as_deref()
                .map(|secret| DecodingKey::from_secret(secret.as_bytes())),
        }
    }

    /// Whether any credential is configured at all.
    pub fn is_enabled(&self) -> bool {
        self.shared_secret.is_some() || self.jwt_key.is_some()
    }

    pub fn has_shared_secret(&self) -> bool {
        self.shared_secret.is_some()
    }

    /// Level applied to `/chat-process`: per-user tokens when they are
    /// enabled, otherwise the shared secret.
    pub fn chat_level(&self) -> AuthLevel {
        if self.jwt_key.is_some() {
            AuthLevel::StrictIdentity
        } else {
            AuthLevel::SharedSecret
        }
    }

    /// Check the shared secret alone, as the verify endpoint does.
    pub fn verify_secret(&self, token: &str) -> bool {
        match &self.shared_secret {
            Some(expected) => digests_equal(expected, &hash_key(token)),
            None => false,
        }
    }

    fn decode_user(&self, token: &str) -> Option<Identity> {
        let key = self.jwt_key.as_ref()?;
        match decode::<Claims>(token, key, &Validation::new(Algorithm::HS256)) {
            Ok(data) => Some(Identity::User {
                id: data.claims.id,
                role: data.claims.role,
            }),
            Err(e) => {
                tracing::debug!(error = %e, "User token rejected");
                None
            }
        }
    }

    /// Authenticate a request for the given level.
    ///
    /// # Returns
    ///
    /// * `Ok(identity)` - the resolved caller
    /// * `Err(AppError::Unauthorized)` - missing or invalid credential
    pub fn authenticate(&self, headers: &HeaderMap, level: AuthLevel) -> Result<Identity> {
        let token = extract_bearer(headers);

        match level {
            AuthLevel::Public => Ok(Identity::Anonymous),
            AuthLevel::SharedSecret => {
                if let Some(token) = token {
                    if self.verify_secret(token) {
                        return Ok(Identity::SharedSecret);
                    }
                    if let Some(user) = self.decode_user(token) {
                        return Ok(user);
                    }
                }
                if self.shared_secret.is_none() {
                    Ok(Identity::Anonymous)
                } else {
                    Err(AppError::Unauthorized(UNAUTHORIZED_MESSAGE.to_string()))
                }
            }
            AuthLevel::StrictIdentity => token
                .and_then(|token| self.decode_user(token))
                .ok_or_else(|| AppError::Unauthorized(UNAUTHORIZED_MESSAGE.to_string())),
        }
    }
}

/// Issue a per-user token valid for `ttl_secs`.
pub fn issue_user_token(secret: &str, id: &str, role: &str, ttl_secs: i64) -> Result<String> {
    let exp = (chrono::Utc::now().timestamp() + ttl_secs).max(0) as usize;
    let claims = Claims {
        id: id.to_string(),
        role: role.to_string(),
        exp,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("Failed to sign user token: {}", e)))
}

#[derive(Serialize)]
struct SiteVerifyRequest<'a> {
    secret: &'a str,
    response: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    remoteip: Option<&'a str>,
}

#[derive(Deserialize)]
struct SiteVerifyResponse {
    success: bool,
}

/// Whole-exchange bound for one siteverify call.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Server-side Turnstile token verification.
#[derive(Clone)]
pub struct ChallengeVerifier {
    config: ChallengeConfig,
    client: reqwest::Client,
}

impl ChallengeVerifier {
    pub fn new(config: ChallengeConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    /// Verify the challenge token from the request headers.
    ///
    /// Any failure, including an unreachable verifier, rejects the request.
    pub async fn verify(&self, headers: &HeaderMap) -> Result<()> {
        let token = headers
            .get(CHALLENGE_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::ChallengeFailed("missing challenge token".to_string()))?;

        let remote_ip = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim);

        let response = self
            .client
            .post(&self.config.verify_url)
            .timeout(VERIFY_TIMEOUT)
            .json(&SiteVerifyRequest {
                secret: &self.config.secret,
                response: token,
                remoteip: remote_ip,
            })
            .send()
            .await
            .map_err(|e| AppError::ChallengeFailed(format!("verifier unreachable: {}", e)))?;

        let result: SiteVerifyResponse = response
            .json()
            .await
            .map_err(|e| AppError::ChallengeFailed(format!("invalid verifier response: {}", e)))?;

        if result.success {
            Ok(())
        } else {
            tracing::warn!("Challenge token rejected");
            Err(AppError::ChallengeFailed("challenge token rejected".to_string()))
        }
    }
}
