//! Media Gateway - an authenticating reverse proxy for AI media providers
//!
//! This library provides the HTTP gateway that sits between a chat/media web
//! client and its upstream providers:
//!
//! - **Prefix routing**: longest-prefix dispatch to OpenAI, Midjourney, Suno,
//!   Luma, Viggle, Runway, Kling, Ideogram, Pika, Udio and PixVerse relays
//! - **Credential injection**: caller credentials are stripped and replaced by
//!   the provider's own key
//! - **Chat streaming**: upstream server-sent events re-framed per envelope
//! - **Uploads**: local disk, remote relay or disabled, plus presigned R2 URLs
//! - **Authentication**: shared secret, per-user HS256 tokens and Turnstile
//! - **Metrics & Monitoring**: Prometheus metrics for observability
//!
//! # Architecture
//!
//! - [`core`]: configuration, errors, logging context, metrics, middleware
//! - [`services`]: routing table, provider adapter, uploads, presigning
//! - [`api`]: handlers, authentication, chat relay and the router
//!
//! # Configuration
//!
//! Everything is read from the environment (and `.env`) at startup:
//! - `HOST` / `PORT`: bind address (default `0.0.0.0:3002`)
//! - `OPENAI_API_BASE_URL`, `OPENAI_API_KEY`: chat and `/openapi` upstream
//! - `AUTH_SECRET_KEY`, `JWT_SECRET`: caller credentials
//! - `REQUEST_TIMEOUT_SECS`: seconds to wait for upstream response headers (default: 300)

pub mod api;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{build_app, create_http_client, GatewayState};
pub use core::{AppConfig, AppError, Result};
