//! Upload multiplexer, presign, transcription and provider asset tests.

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use media_gateway::{build_app, core::AppConfig, create_http_client, GatewayState};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

const BOUNDARY: &str = "gateway-test-boundary";

fn config(upstream: &str, extra: &[(&str, &str)]) -> AppConfig {
    let mut env: HashMap<String, String> = HashMap::new();
    env.insert("OPENAI_API_BASE_URL".into(), upstream.into());
    env.insert("OPENAI_API_KEY".into(), "sk-upstream".into());
    env.insert("VIGGLE_SERVER".into(), upstream.into());
    env.insert("VIGGLE_KEY".into(), "viggle-key".into());
    env.insert("IDEOGRAM_SERVER".into(), upstream.into());
    env.insert("IDEOGRAM_KEY".into(), "ideogram-key".into());
    for (key, value) in extra {
        env.insert(key.to_string(), value.to_string());
    }
    AppConfig::from_lookup(|key| env.get(key).cloned())
}

fn app(config: AppConfig) -> Router {
    let client = create_http_client(&config).unwrap();
    build_app(Arc::new(GatewayState::new(config, client)))
}

enum Part<'a> {
    Text(&'a str, &'a str),
    File(&'a str, &'a str, &'a [u8]),
}

fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                        .as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File(name, file_name, data) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n",
                        name, file_name
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

fn multipart_request(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
    Request::post(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}

fn presign_request(file_name: &str) -> Request<Body> {
    Request::post("/openapi/pre_signed")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"file_name": file_name, "ContentType": "image/png"}).to_string(),
        ))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ============================================================================
// Upload multiplexer
// ============================================================================

#[tokio::test]
async fn test_disabled_uploader_answers_200_with_error() {
    let server = MockServer::start().await;
    let response = app(config(&server.uri(), &[]))
        .oneshot(multipart_request(
            "/openapi/v1/upload",
            &[Part::File("file", "cat.png", b"png-bytes")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["error"], "uploader disabled");
    assert!(body["created"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_local_disk_upload_is_served_back() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let upload_dir = dir.path().to_string_lossy().into_owned();
    let config = config(
        &server.uri(),
        &[("API_UPLOADER", "1"), ("UPLOAD_DIR", &upload_dir)],
    );

    let response = app(config.clone())
        .oneshot(multipart_request(
            "/openapi/v1/upload",
            &[Part::File("file", "cat.png", b"png-bytes")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let url = body["url"].as_str().unwrap().to_string();
    let date = chrono::Local::now().format("%Y-%m-%d").to_string();
    assert!(url.starts_with(&format!("/uploads/{}/", date)));
    assert!(url.ends_with(".png"));

    let served = app(config)
        .oneshot(Request::get(&url).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(served.status(), StatusCode::OK);
    let bytes = to_bytes(served.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"png-bytes");
}

#[tokio::test]
async fn test_remote_relay_wins_over_local_disk() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/store"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"url": "https://files.example/x.png"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();
    let upload_dir = dir.path().to_string_lossy().into_owned();
    let relay = format!("{}/store", server.uri());

    let response = app(config(
        &server.uri(),
        &[
            ("API_UPLOADER", "1"),
            ("UPLOAD_DIR", &upload_dir),
            ("FILE_SERVER", &relay),
        ],
    ))
    .oneshot(multipart_request(
        "/openapi/v1/upload",
        &[Part::File("file", "cat.png", b"png-bytes")],
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({"url": "https://files.example/x.png"})
    );
    // nothing written locally
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    let received = server.received_requests().await.unwrap();
    let relayed = String::from_utf8_lossy(&received[0].body);
    assert!(relayed.contains("name=\"file\""));
    assert!(relayed.contains("png-bytes"));
}

#[tokio::test]
async fn test_remote_relay_failure_is_400() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/store"))
        .respond_with(ResponseTemplate::new(500).set_body_string("disk full"))
        .mount(&server)
        .await;
    let relay = format!("{}/store", server.uri());

    let response = app(config(
        &server.uri(),
        &[("API_UPLOADER", "1"), ("FILE_SERVER", &relay)],
    ))
    .oneshot(multipart_request(
        "/openapi/v1/upload",
        &[Part::File("file", "cat.png", b"png-bytes")],
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["status"], 500);
}

#[tokio::test]
async fn test_missing_file_field_is_uploader_fail() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let upload_dir = dir.path().to_string_lossy().into_owned();

    let response = app(config(
        &server.uri(),
        &[("API_UPLOADER", "1"), ("UPLOAD_DIR", &upload_dir)],
    ))
    .oneshot(multipart_request(
        "/openapi/v1/upload",
        &[Part::Text("note", "no file here")],
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await, json!({"error": "uploader fail"}));
}

#[tokio::test]
async fn test_upload_requires_secret() {
    let server = MockServer::start().await;
    let response = app(config(
        &server.uri(),
        &[("API_UPLOADER", "1"), ("AUTH_SECRET_KEY", "s3cret")],
    ))
    .oneshot(multipart_request(
        "/openapi/v1/upload",
        &[Part::File("file", "cat.png", b"png-bytes")],
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ============================================================================
// Presign
// ============================================================================

#[tokio::test]
async fn test_presign_without_object_store_is_500() {
    let server = MockServer::start().await;
    let response = app(config(&server.uri(), &[]))
        .oneshot(presign_request("cat.png"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["status"], "Error");
    assert!(body["message"]
        .as_str()
        .unwrap()
        .starts_with("Couldn't get presigned URL for PutObject"));
}

#[tokio::test]
async fn test_presign_checks_secret_before_body() {
    let server = MockServer::start().await;
    let config = config(&server.uri(), &[("AUTH_SECRET_KEY", "s3cret")]);

    // no content type, no body
    let response = app(config.clone())
        .oneshot(
            Request::post("/openapi/pre_signed")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["status"], "Unauthorized");

    // authenticated but unparseable
    let response = app(config)
        .oneshot(
            Request::post("/openapi/pre_signed")
                .header("authorization", "Bearer s3cret")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["status"], "Fail");
}

#[tokio::test]
async fn test_presign_returns_distinct_urls() {
    let server = MockServer::start().await;
    let config = config(
        &server.uri(),
        &[
            ("R2_ACCOUNT_ID", "acct"),
            ("R2_KEY_ID", "AKID"),
            ("R2_KEY_SECRET", "SECRET"),
            ("R2_BUCKET_NAME", "media"),
            ("R2_DOMAIN", "https://cdn.example.com"),
        ],
    );

    let mut urls = Vec::new();
    for _ in 0..2 {
        let response = app(config.clone())
            .oneshot(presign_request("cat.png"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "Success");
        assert_eq!(body["message"], "");

        let up = body["data"]["up"].as_str().unwrap().to_string();
        let url = body["data"]["url"].as_str().unwrap().to_string();
        assert!(up.starts_with("https://acct.r2.cloudflarestorage.com/media/"));
        assert!(up.contains("X-Amz-Signature="));
        assert!(url.starts_with("https://cdn.example.com/"));
        assert!(url.ends_with("cat.png"));
        urls.push(url);
    }
    assert_ne!(urls[0], urls[1]);
}

// ============================================================================
// Transcriptions and provider assets
// ============================================================================

#[tokio::test]
async fn test_transcription_forwards_file_and_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/transcriptions"))
        .and(header("authorization", "Bearer sk-upstream"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "hello"})))
        .expect(1)
        .mount(&server)
        .await;

    let response = app(config(&server.uri(), &[]))
        .oneshot(multipart_request(
            "/openapi/v1/audio/transcriptions",
            &[
                Part::File("file", "speech.mp3", b"mp3-bytes"),
                Part::Text("model", "whisper-1"),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"text": "hello"}));

    let received = server.received_requests().await.unwrap();
    let sent = String::from_utf8_lossy(&received[0].body);
    assert!(sent.contains("whisper-1"));
    assert!(sent.contains("mp3-bytes"));
}

#[tokio::test]
async fn test_transcription_upstream_failure_is_400() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/transcriptions"))
        .respond_with(ResponseTemplate::new(413).set_body_string("too big"))
        .mount(&server)
        .await;

    let response = app(config(&server.uri(), &[]))
        .oneshot(multipart_request(
            "/openapi/v1/audio/transcriptions",
            &[
                Part::File("file", "speech.mp3", b"mp3-bytes"),
                Part::Text("model", "whisper-1"),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["message"], "too big");
}

#[tokio::test]
async fn test_viggle_asset_is_reencoded_for_provider() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pro/viggle/asset"))
        .and(header("authorization", "Bearer viggle-key"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"asset_id": "a1"})))
        .expect(1)
        .mount(&server)
        .await;

    let response = app(config(&server.uri(), &[]))
        .oneshot(multipart_request(
            "/pro/viggle/asset",
            &[Part::File("file", "dance.mp4", b"mp4-bytes")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(json_body(response).await["asset_id"], "a1");

    let received = server.received_requests().await.unwrap();
    let content_type = received[0].headers["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("multipart/form-data"));
    assert!(!content_type.contains(BOUNDARY));
}

#[tokio::test]
async fn test_ideogram_remix_keeps_text_fields() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ideogram/remix"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .expect(1)
        .mount(&server)
        .await;

    let response = app(config(&server.uri(), &[]))
        .oneshot(multipart_request(
            "/ideogram/remix",
            &[
                Part::Text("image_request", "{\"prompt\":\"a cat\"}"),
                Part::File("image_file", "cat.png", b"png-bytes"),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let received = server.received_requests().await.unwrap();
    let sent = String::from_utf8_lossy(&received[0].body);
    assert!(sent.contains("name=\"image_request\""));
    assert!(sent.contains("name=\"image_file\""));
}

#[tokio::test]
async fn test_asset_without_file_is_uploader_fail() {
    let server = MockServer::start().await;
    let response = app(config(&server.uri(), &[]))
        .oneshot(multipart_request(
            "/viggle/asset",
            &[Part::Text("note", "nothing")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(server.received_requests().await.unwrap().len(), 0);
}
