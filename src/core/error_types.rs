//! Shared constants for structured error bodies.

pub const ERROR_TYPE_API: &str = "api_error";
pub const ERROR_TYPE_TIMEOUT: &str = "timeout_error";
pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_AUTHENTICATION: &str = "authentication_error";
pub const ERROR_TYPE_CHALLENGE: &str = "challenge_error";
pub const ERROR_TYPE_RATE_LIMIT: &str = "rate_limit_error";
pub const ERROR_TYPE_NOT_FOUND: &str = "route_not_found";
pub const ERROR_TYPE_UPSTREAM: &str = "upstream_error";
pub const ERROR_TYPE_SIGNING: &str = "signing_error";

/// Value of the `status` field the web client checks on every response.
pub const STATUS_SUCCESS: &str = "Success";
pub const STATUS_FAIL: &str = "Fail";
pub const STATUS_ERROR: &str = "Error";
pub const STATUS_UNAUTHORIZED: &str = "Unauthorized";
