//! HTTP layer of the gateway.
//!
//! Handlers, authentication, the chat relay and the streaming primitives
//! shared between them.

pub mod app;
pub mod auth;
pub mod chat;
pub mod disconnect;
pub mod handlers;
pub mod proxy;
pub mod streaming;
pub mod upload;

// Re-export commonly used types
pub use app::{build_app, create_http_client};
pub use auth::{AuthLevel, Authenticator, ChallengeVerifier, Identity};
pub use handlers::GatewayState;
pub use streaming::{framing_from_name, ChatFraming, NewlineFraming};
