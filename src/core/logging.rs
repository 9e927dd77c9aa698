//! Logging utilities with request context support.
//!
//! Request ids, the resolved provider and the caller identity are carried in
//! task-local storage so every log line emitted while handling a request can
//! include them without threading them through each function.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

tokio::task_local! {
    /// Task-local storage for the current provider name.
    pub static PROVIDER_CONTEXT: String;
}

tokio::task_local! {
    /// Task-local storage for the current request ID.
    pub static REQUEST_ID: String;
}

tokio::task_local! {
    /// Task-local storage for the authenticated subject.
    pub static IDENTITY_CONTEXT: String;
}

/// Get the current provider name from context, if set.
///
/// Returns an empty string if no provider context is set.
pub fn get_provider_context() -> String {
    PROVIDER_CONTEXT
        .try_with(|ctx| ctx.clone())
        .unwrap_or_default()
}

/// Get the current request ID from context, if set.
///
/// Returns an empty string if no request ID is set.
pub fn get_request_id() -> String {
    REQUEST_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Get the current caller subject from context.
///
/// Returns "anonymous" if no identity is set.
pub fn get_identity() -> String {
    IDENTITY_CONTEXT
        .try_with(|subject| subject.clone())
        .unwrap_or_else(|_| "anonymous".to_string())
}

/// Generate a new unique request ID using UUID v4.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Custom time formatter that uses local timezone (respects TZ environment variable)
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` picks the base filter (default `info,media_gateway=debug`); noisy
/// HTTP library logs are always suppressed. `NO_COLOR` disables ANSI output and
/// `LOG_FORMAT=json` switches to structured JSON lines.
pub fn init_tracing() {
    let base_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,media_gateway=debug".to_string());

    // Appended last so a bare `RUST_LOG=trace` does not flood the output
    let filter_str = format!(
        "{},hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn",
        base_filter
    );
    let filter = tracing_subscriber::EnvFilter::new(filter_str);

    let no_color = std::env::var("NO_COLOR").is_ok();
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_timer(LocalTime))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(LocalTime)
                    .with_ansi(!no_color),
            )
            .init();
    }
}

/// Execute an async block with request context (request_id, identity, provider).
///
/// # Example
///
/// ```ignore
/// with_request_context!(request_id, subject, provider_name, async {
///     // handler logic here
/// })
/// ```
#[macro_export]
macro_rules! with_request_context {
    ($request_id:expr, $identity:expr, $provider_name:expr, $body:expr) => {
        $crate::core::logging::REQUEST_ID
            .scope($request_id, async {
                $crate::core::logging::IDENTITY_CONTEXT
                    .scope($identity, async {
                        $crate::core::logging::PROVIDER_CONTEXT
                            .scope($provider_name, $body)
                            .await
                    })
                    .await
            })
            .await
    };
    // Version without provider context
    ($request_id:expr, $identity:expr, $body:expr) => {
        $crate::core::logging::REQUEST_ID
            .scope($request_id, async {
                $crate::core::logging::IDENTITY_CONTEXT
                    .scope($identity, $body)
                    .await
            })
            .await
    };
}
