//! Configuration management for the media gateway.
//!
//! All options are read once from the process environment (after `.env` is
//! loaded by `main`) into an immutable [`AppConfig`]. Nothing in here is
//! mutated after startup; handlers receive it through shared state.

use serde::Serialize;
use std::collections::HashMap;

/// Header value stamped on every upstream request so providers can see which
/// gateway build relayed the call.
pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the version header injected on outgoing requests.
pub const VERSION_HEADER: &str = "mj-version";

const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Media providers reachable under `/{provider}/*`, with the environment
/// prefix used for their `*_SERVER` / `*_KEY` variables.
pub const MEDIA_PROVIDERS: &[(&str, &str)] = &[
    ("suno", "SUNO"),
    ("luma", "LUMA"),
    ("viggle", "VIGGLE"),
    ("runway", "RUNWAY"),
    ("runwayml", "RUNWAYML"),
    ("kling", "KLING"),
    ("ideogram", "IDEOGRAM"),
    ("pika", "PIKA"),
    ("udio", "UDIO"),
    ("pixverse", "PIXVERSE"),
];

/// Main application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server configuration (host, port)
    pub server: ServerConfig,

    /// Whether to verify SSL certificates for upstream requests
    pub verify_ssl: bool,

    /// Request timeout in seconds for upstream providers
    pub request_timeout_secs: u64,

    /// Ceiling for request bodies, including memory-buffered uploads
    pub max_body_bytes: usize,

    /// Credentials accepted from callers
    pub auth: AuthConfig,

    /// Upstream providers keyed by name (`openai`, `mj`, `suno`, ...)
    pub providers: HashMap<String, ProviderConfig>,

    /// File upload backend options
    pub upload: UploadConfig,

    /// Object store used for pre-signed uploads, when fully configured
    pub object_store: Option<ObjectStoreConfig>,

    /// Chat relay options
    pub chat: ChatConfig,

    /// Flags handed to the web client through the session endpoint
    pub features: ClientFeatures,
}

/// Server-specific configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to bind to
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3002,
        }
    }
}

/// Caller authentication settings.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Shared secret expected as a bearer token on shared-secret routes
    pub shared_secret: Option<String>,

    /// HMAC secret for per-user tokens; enables strict-identity routes
    pub jwt_secret: Option<String>,

    /// Turnstile challenge settings for the OpenAI passthrough
    pub challenge: Option<ChallengeConfig>,
}

/// Cloudflare Turnstile server-side verification.
#[derive(Debug, Clone)]
pub struct ChallengeConfig {
    pub secret: String,
    pub verify_url: String,
}

/// How the provider's credential is attached to outgoing requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialHeader {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// A provider-specific header carrying the raw key
    Custom(String),
}

/// Typed per-provider record: where to send traffic and what to inject.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Provider name (for logging and metrics)
    pub name: String,

    /// Base URL for the provider's API
    pub api_base: String,

    /// Secret injected on every forwarded request, if any
    pub api_key: Option<String>,

    /// Header used to carry `api_key`
    pub credential_header: CredentialHeader,

    /// Content-Type forced on forwarded requests with a plain body
    pub content_type: Option<String>,
}

/// Upload backend options. Backend selection happens in
/// [`crate::services::upload_service::select_backend`].
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// `API_UPLOADER` set to a non-empty value
    pub enabled: bool,

    /// Remote relay endpoint (`FILE_SERVER`)
    pub remote_endpoint: Option<String>,

    /// Root of the local-disk upload tree
    pub local_dir: String,
}

/// Cloudflare R2 (S3-compatible) credentials for pre-signed uploads.
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    /// Public domain prefix for the final GET URL
    pub public_domain: String,
    /// Overrides `https://<account>.r2.cloudflarestorage.com`
    pub endpoint: Option<String>,
}

impl ObjectStoreConfig {
    /// Base endpoint for signed requests, without trailing slash.
    pub fn endpoint_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}.r2.cloudflarestorage.com", self.account_id),
        }
    }
}

/// Chat relay options.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Default model when the client does not pick one
    pub model: String,

    /// Wire framing for the chat stream (`newline` or `sse`)
    pub framing: String,

    /// Per-client hourly request ceiling; 0 disables limiting
    pub max_requests_per_hour: u32,
}

/// Flags exposed to the web client through `/session`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFeatures {
    pub theme: String,
    pub menu_disable: String,
    pub cmodels: String,
    pub vision_model: String,
    pub custom_vision_model: String,
    pub system_message: String,
    pub notify: String,
    pub disable_gpt4: String,
    pub is_hide_server: bool,
    pub is_api_gallery: bool,
    pub is_wsrv: String,
    pub upload_img_size: String,
    pub upload_type: String,
    pub gpt_url: String,
    pub is_close_md_preview: bool,
    pub background_image: String,
    pub baidu_id: String,
    pub google_id: String,
    pub turnstile: String,
    pub is_hk: bool,
}

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Empty values are treated as unset, matching how the web client's
    /// deployment scripts blank out options.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let get_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let mut server = ServerConfig::default();
        if let Some(host) = get("HOST") {
            server.host = host;
        }
        if let Some(port) = get("PORT").and_then(|p| p.parse::<u16>().ok()) {
            server.port = port;
        }

        let openai_base = get_or("OPENAI_API_BASE_URL", DEFAULT_OPENAI_BASE);
        let openai_key = get("OPENAI_API_KEY");

        let mut providers = HashMap::new();
        providers.insert(
            "openai".to_string(),
            ProviderConfig {
                name: "openai".to_string(),
                api_base: openai_base.clone(),
                api_key: openai_key.clone(),
                credential_header: CredentialHeader::Bearer,
                content_type: Some("application/json".to_string()),
            },
        );
        providers.insert(
            "mj".to_string(),
            ProviderConfig {
                name: "mj".to_string(),
                api_base: get_or("MJ_SERVER", DEFAULT_OPENAI_BASE),
                api_key: get("MJ_API_SECRET"),
                credential_header: CredentialHeader::Custom("mj-api-secret".to_string()),
                content_type: Some("application/json".to_string()),
            },
        );
        for (name, env_prefix) in MEDIA_PROVIDERS {
            providers.insert(
                name.to_string(),
                ProviderConfig {
                    name: name.to_string(),
                    api_base: get(&format!("{}_SERVER", env_prefix))
                        .unwrap_or_else(|| openai_base.clone()),
                    api_key: get(&format!("{}_KEY", env_prefix)).or_else(|| openai_key.clone()),
                    credential_header: CredentialHeader::Bearer,
                    content_type: Some("application/json".to_string()),
                },
            );
        }

        let challenge = get("TURNSTILE_SECRET_KEY").map(|secret| ChallengeConfig {
            secret,
            verify_url: get_or(
                "TURNSTILE_VERIFY_URL",
                "https://challenges.cloudflare.com/turnstile/v0/siteverify",
            ),
        });

        let object_store = match (
            get("R2_ACCOUNT_ID"),
            get("R2_KEY_ID"),
            get("R2_KEY_SECRET"),
            get("R2_BUCKET_NAME"),
        ) {
            (Some(account_id), Some(access_key_id), Some(secret_access_key), Some(bucket)) => {
                Some(ObjectStoreConfig {
                    account_id,
                    access_key_id,
                    secret_access_key,
                    bucket,
                    public_domain: get_or("R2_DOMAIN", ""),
                    endpoint: get("R2_ENDPOINT"),
                })
            }
            _ => None,
        };

        let is_hk = ["OPENAI_API_BASE_URL", "LUMA_SERVER", "VIGGLE_SERVER"]
            .iter()
            .filter_map(|key| get(key))
            .any(|url| url.to_lowercase().find("-hk").is_some_and(|idx| idx > 0));

        let features = ClientFeatures {
            theme: get_or("SYS_THEME", "dark"),
            menu_disable: get_or("MENU_DISABLE", ""),
            cmodels: get_or("CUSTOM_MODELS", ""),
            vision_model: get_or("VISION_MODEL", ""),
            custom_vision_model: get_or("CUSTOM_VISION_MODELS", ""),
            system_message: get_or("SYSTEM_MESSAGE", ""),
            notify: get_or("SYS_NOTIFY", ""),
            disable_gpt4: get_or("DISABLE_GPT4", ""),
            is_hide_server: get("HIDE_SERVER").is_some(),
            is_api_gallery: get("MJ_API_GALLERY").is_some(),
            is_wsrv: get_or("MJ_IMG_WSRV", ""),
            upload_img_size: get_or("UPLOAD_IMG_SIZE", "1"),
            upload_type: get_or("UPLOAD_TYPE", ""),
            gpt_url: get_or("GPT_URL", ""),
            is_close_md_preview: get("CLOSE_MD_PREVIEW").is_some(),
            background_image: get_or("BACKGROUND_IMAGE", ""),
            baidu_id: get_or("TJ_BAIDU_ID", ""),
            google_id: get_or("TJ_GOOGLE_ID", ""),
            turnstile: get_or("TURNSTILE_SITE", ""),
            is_hk,
        };

        Self {
            server,
            verify_ssl: get("VERIFY_SSL").map(|v| str_to_bool(&v)).unwrap_or(true),
            request_timeout_secs: get("REQUEST_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            max_body_bytes: get("MAX_BODY_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_BODY_BYTES),
            auth: AuthConfig {
                shared_secret: get("AUTH_SECRET_KEY"),
                jwt_secret: get("JWT_SECRET"),
                challenge,
            },
            providers,
            upload: UploadConfig {
                enabled: get("API_UPLOADER").is_some(),
                remote_endpoint: get("FILE_SERVER"),
                local_dir: get_or("UPLOAD_DIR", "uploads"),
            },
            object_store,
            chat: ChatConfig {
                model: get_or("OPENAI_API_MODEL", DEFAULT_MODEL),
                framing: get_or("CHAT_FRAMING", "newline"),
                max_requests_per_hour: get("MAX_REQUEST_PER_HOUR")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            },
            features,
        }
    }

    /// Look up a provider by name.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }
}

/// Convert string to boolean.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive)
pub fn str_to_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}
