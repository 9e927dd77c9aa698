//! Core functionality for the media gateway.
//!
//! This module contains fundamental components used throughout the application:
//! - Configuration management
//! - Error handling
//! - Logging context and metrics collection
//! - HTTP middleware and rate limiting

pub mod cancel;
pub mod config;
pub mod error;
pub mod error_types;
pub mod header_policy;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod rate_limiter;

// Re-export commonly used types
pub use cancel::StreamCancelHandle;
pub use config::{AppConfig, ProviderConfig, ServerConfig};
pub use error::{AppError, Result};
pub use logging::{get_provider_context, get_request_id, init_tracing, PROVIDER_CONTEXT};
pub use metrics::{get_metrics, init_metrics, Metrics};
pub use middleware::{request_id_middleware, MetricsMiddleware, ProviderName};
pub use rate_limiter::RateLimiter;
