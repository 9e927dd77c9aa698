//! HTTP middleware for request ids and metrics tracking.

use crate::core::logging::{generate_request_id, REQUEST_ID};
use crate::core::metrics::get_metrics;
use axum::{
    extract::{MatchedPath, Request},
    http::{HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

/// Header carrying the per-request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Extension type for storing provider name in response
#[derive(Clone, Debug)]
pub struct ProviderName(pub String);

/// Route label for responses from the provider fallback: the matched
/// route-table prefix, never the raw path.
#[derive(Clone, Debug)]
pub struct RouteLabel(pub String);

/// Label for requests no route or prefix claimed.
pub const UNMATCHED_LABEL: &str = "unmatched";

/// In-flight label for requests handled by the fallback.
pub const FALLBACK_LABEL: &str = "fallback";

/// Metric label for a finished request.
///
/// Labels only ever come from the router's own route templates or the
/// route table, so arbitrary client paths cannot mint new series.
pub fn route_label(matched: Option<&MatchedPath>, response: Option<&RouteLabel>) -> String {
    match (matched, response) {
        (Some(path), _) => path.as_str().to_string(),
        (None, Some(label)) => label.0.clone(),
        (None, None) => UNMATCHED_LABEL.to_string(),
    }
}

/// Standard methods label as themselves, extension methods as `OTHER`.
fn method_label(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::PATCH => "PATCH",
        Method::DELETE => "DELETE",
        Method::HEAD => "HEAD",
        Method::OPTIONS => "OPTIONS",
        _ => "OTHER",
    }
}

/// Assign a request id, scope it for logging and echo it back to the client.
///
/// A well-formed incoming `x-request-id` is reused so ids line up with an
/// outer proxy's logs.
pub async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(|v| v.to_string())
        .unwrap_or_else(generate_request_id);

    let mut response = REQUEST_ID
        .scope(request_id.clone(), next.run(request))
        .await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Middleware for tracking request metrics.
pub struct MetricsMiddleware;

impl MetricsMiddleware {
    /// Track metrics for incoming requests.
    ///
    /// Duration is measured to response headers; for streamed bodies that is
    /// time to first byte, not time to completion.
    pub async fn track_metrics(request: Request, next: Next) -> Response {
        let path = request.uri().path().to_string();
        let method = method_label(request.method());

        // Skip metrics endpoint itself to avoid recursion
        if path == "/metrics" {
            return next.run(request).await;
        }

        let matched = request.extensions().get::<MatchedPath>().cloned();
        let in_flight = matched
            .as_ref()
            .map_or(FALLBACK_LABEL, |m| m.as_str())
            .to_string();
        let metrics = get_metrics();
        metrics.active_requests.with_label_values(&[&in_flight]).inc();

        let start = Instant::now();
        let response = next.run(request).await;
        let duration = start.elapsed().as_secs_f64();
        let status_code = response.status().as_u16().to_string();
        let route = route_label(matched.as_ref(), response.extensions().get::<RouteLabel>());

        let provider = response
            .extensions()
            .get::<ProviderName>()
            .map(|p| p.0.as_str())
            .unwrap_or("none");

        metrics
            .request_count
            .with_label_values(&[method, &route, provider, &status_code])
            .inc();
        metrics
            .request_duration
            .with_label_values(&[method, &route, provider])
            .observe(duration);

        tracing::info!(
            "{} {} - status={} provider={} duration={:.3}s",
            method,
            path,
            status_code,
            provider,
            duration
        );

        metrics.active_requests.with_label_values(&[&in_flight]).dec();

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::logging::get_request_id;
    use crate::core::metrics::init_metrics;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_route_template_is_the_label() {
        let metrics = init_metrics();
        let app = Router::new()
            .route("/tasks/:id", get(|| async { "task" }))
            .layer(middleware::from_fn(MetricsMiddleware::track_metrics));

        for id in ["41", "42"] {
            app.clone()
                .oneshot(Request::get(format!("/tasks/{}", id)).body(Body::empty()).unwrap())
                .await
                .unwrap();
        }

        let count = metrics
            .request_count
            .with_label_values(&["GET", "/tasks/:id", "none", "200"])
            .get();
        assert!(count >= 2);
    }

    #[tokio::test]
    async fn test_unrouted_paths_share_one_label() {
        let metrics = init_metrics();
        let app = Router::new()
            .route("/known", get(|| async { "ok" }))
            .fallback(|| async { StatusCode::NOT_FOUND })
            .layer(middleware::from_fn(MetricsMiddleware::track_metrics));

        let before = metrics
            .request_count
            .with_label_values(&["GET", UNMATCHED_LABEL, "none", "404"])
            .get();
        for junk in ["/zz-junk-a1/x", "/zz-junk-b2/y", "/zz-junk-c3"] {
            let response = app
                .clone()
                .oneshot(Request::get(junk).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }

        let after = metrics
            .request_count
            .with_label_values(&["GET", UNMATCHED_LABEL, "none", "404"])
            .get();
        assert!(after >= before + 3);
        let rendered = crate::core::metrics::render_metrics().unwrap();
        assert!(!rendered.contains("zz-junk"));
    }

    #[tokio::test]
    async fn test_request_id_is_generated_and_scoped() {
        async fn handler() -> String {
            get_request_id()
        }

        let app = Router::new()
            .route("/test", get(handler))
            .layer(middleware::from_fn(request_id_middleware));

        let request = Request::builder().uri("/test").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        let header = response
            .headers()
            .get("x-request-id")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(!header.is_empty());
        assert_eq!(header.as_bytes(), &body[..]);
    }

    #[tokio::test]
    async fn test_request_id_is_reused() {
        let app = Router::new()
            .route("/test", get(|| async { "ok" }))
            .layer(middleware::from_fn(request_id_middleware));

        let request = Request::builder()
            .uri("/test")
            .header("x-request-id", "outer-123")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.headers()["x-request-id"], "outer-123");
    }

    #[tokio::test]
    async fn test_metrics_endpoint_is_not_counted() {
        let metrics = init_metrics();
        let app = Router::new()
            .route("/metrics", get(|| async { "scrape" }))
            .layer(middleware::from_fn(MetricsMiddleware::track_metrics));

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let counted = metrics
            .request_count
            .with_label_values(&["GET", "/metrics", "none", "200"])
            .get();
        assert_eq!(counted, 0);
    }

    #[tokio::test]
    async fn test_active_gauge_tracks_in_flight_request() {
        let metrics = init_metrics();
        let route = "/gauge-probe";
        let gauge = metrics.active_requests.with_label_values(&[route]);
        let before = gauge.get();

        let entered = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let (entered_tx, release_rx) = (entered.clone(), release.clone());

        let app = Router::new()
            .route(
                route,
                get(move || {
                    let (entered, release) = (entered_tx.clone(), release_rx.clone());
                    async move {
                        entered.notify_one();
                        release.notified().await;
                        "done"
                    }
                }),
            )
            .layer(middleware::from_fn(MetricsMiddleware::track_metrics));

        let call = tokio::spawn(app.oneshot(Request::get(route).body(Body::empty()).unwrap()));
        entered.notified().await;
        assert_eq!(gauge.get(), before + 1.0);

        release.notify_one();
        call.await.unwrap().unwrap();
        assert_eq!(gauge.get(), before);
    }

    #[tokio::test]
    async fn test_fallback_uses_route_table_label() {
        let metrics = init_metrics();
        let app = Router::new()
            .fallback(|| async {
                let mut response = Response::new(Body::from("queued"));
                response
                    .extensions_mut()
                    .insert(ProviderName("kling".to_string()));
                response
                    .extensions_mut()
                    .insert(RouteLabel("/kling".to_string()));
                response
            })
            .layer(middleware::from_fn(MetricsMiddleware::track_metrics));

        app.oneshot(
            Request::get("/kling/v1/videos/abc-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

        let count = metrics
            .request_count
            .with_label_values(&["GET", "/kling", "kling", "200"])
            .get();
        assert!(count >= 1);
        assert_eq!(
            metrics
                .active_requests
                .with_label_values(&[FALLBACK_LABEL])
                .get(),
            0.0
        );
    }
}
