mod common;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use common::{Harness, harness};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;
use video_upload_sessions::{
    config::UploadPolicy,
    db,
    routes::routes,
    services::{
        gateway::{BoundedGateway, local::LocalObjectStore},
        notifier::TracingNotifier,
        registrar::VideoRegistrar,
        session_manager::SessionManager,
        session_store::SessionStore,
    },
    state::AppState,
};

fn app(h: &Harness) -> Router {
    routes::routes().with_state(AppState {
        manager: h.manager.clone(),
        db: h.db.clone(),
        local_store: None,
    })
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn create_body(file_size: u64, filename: &str) -> Value {
    json!({
        "fileSize": file_size,
        "contentType": "video/mp4",
        "filename": filename,
    })
}

#[tokio::test]
async fn health_endpoints_report_ok() {
    let h = harness().await;
    let app = app(&h);

    let (status, body) = send(&app, Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(&app, Method::GET, "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["sqlite"]["ok"], true);
    assert!(body["checks"].get("disk").is_none());
}

#[tokio::test]
async fn session_flow_over_http() {
    let h = harness().await;
    let app = app(&h);

    let (status, created) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(create_body(10 * common::MIB, "lecture.mp4")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["partCount"], 2);
    assert_eq!(created["parts"].as_array().unwrap().len(), 2);
    let id = created["sessionId"].as_str().unwrap().to_string();
    let session_id = id.parse().unwrap();

    let etag = h.upload(session_id, 1).await;
    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/sessions/{}/parts/1", id),
        Some(json!({ "etag": etag })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true, "partNumber": 1, "recorded": true }));

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/sessions/{}/complete", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "incomplete_part_set");
    assert_eq!(body["missingParts"], json!([2]));

    let (status, progress) = send(
        &app,
        Method::GET,
        &format!("/sessions/{}/progress", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progress["partsReported"], 1);
    assert_eq!(progress["percentage"], 50.0);

    let etag = h.upload(session_id, 2).await;
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/sessions/{}/parts/2", id),
        Some(json!({ "etag": format!("\"{}\"", etag) })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, done) = send(
        &app,
        Method::POST,
        &format!("/sessions/{}/complete", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(done["videoId"], id.as_str());
    assert!(done["libraryKey"].as_str().unwrap().starts_with("library/"));

    let status_uri = format!("/videos/{}/status", id);
    let (status, body) = send(
        &app,
        Method::PATCH,
        &status_uri,
        Some(json!({ "status": "published" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_transition");

    for next in ["review", "approved", "published"] {
        let (status, video) = send(
            &app,
            Method::PATCH,
            &status_uri,
            Some(json!({ "status": next })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(video["workflowStatus"], next);
    }
    let (_, video) = send(&app, Method::GET, &format!("/videos/{}", id), None).await;
    assert!(video["approvedAt"].is_string());
    assert!(video["publishedAt"].is_string());

    let (status, body) = send(&app, Method::DELETE, &format!("/sessions/{}", id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_state");
}

#[tokio::test]
async fn abort_over_http_is_idempotent() {
    let h = harness().await;
    let app = app(&h);
    let (_, created) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(create_body(common::MIB, "clip.mov")),
    )
    .await;
    let id = created["sessionId"].as_str().unwrap().to_string();

    for _ in 0..2 {
        let (status, body) = send(&app, Method::DELETE, &format!("/sessions/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true, "status": "aborted" }));
    }

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/sessions/{}/parts/1", id),
        Some(json!({ "etag": "abc" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_state");

    let (status, sessions) = send(&app, Method::GET, "/sessions?status=aborted", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sessions.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn errors_render_stable_codes() {
    let h = harness().await;
    let app = app(&h);

    let (status, body) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(create_body(common::MIB, "notes.txt")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_file");
    assert_eq!(body["status"], 400);

    let missing = uuid::Uuid::new_v4();
    let (status, body) = send(&app, Method::GET, &format!("/sessions/{}", missing), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "session_not_found");

    let (status, body) = send(&app, Method::GET, &format!("/videos/{}", missing), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "video_not_found");

    let (status, _) = send(&app, Method::GET, "/sessions?status=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, created) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(create_body(common::MIB, "clip.mp4")),
    )
    .await;
    let id = created["sessionId"].as_str().unwrap();
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/sessions/{}/parts/1", id),
        Some(json!({ "etag": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/sessions/{}/parts/9", id),
        Some(json!({ "etag": "abc" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_part");

    let (status, _) = send(&app, Method::GET, "/store/objects/library/x.mp4", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// Whole upload against the local provider: bytes go to the presigned URLs
/// served by this router and come back out of the library.
#[tokio::test]
async fn local_provider_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        LocalObjectStore::new(dir.path(), "http://localhost", b"test-secret")
            .await
            .unwrap(),
    );
    let policy = UploadPolicy {
        part_size: 8,
        ..UploadPolicy::default()
    };
    let pool = Arc::new(db::connect_in_memory().await.unwrap());
    let manager = SessionManager::new(
        SessionStore::new(pool.clone()),
        Arc::new(BoundedGateway::from_policy(store.clone(), &policy)),
        VideoRegistrar::new(pool.clone()),
        Arc::new(TracingNotifier),
        policy,
    );
    let app = routes::routes().with_state(AppState {
        manager,
        db: pool,
        local_store: Some(store),
    });

    let content: &[u8] = b"frames of a small video";
    let (status, created) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(create_body(content.len() as u64, "clip.mp4")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["sessionId"].as_str().unwrap().to_string();
    let parts = created["parts"].as_array().unwrap().clone();
    assert_eq!(parts.len(), 3);

    for (index, chunk) in content.chunks(8).enumerate() {
        let part = &parts[index];
        let url = part["uploadUrl"].as_str().unwrap();
        let path = url.strip_prefix("http://localhost").unwrap();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::PUT)
                    .uri(path)
                    .body(Body::from(chunk.to_vec()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let etag = response.headers()[header::ETAG].to_str().unwrap().to_string();
        assert_eq!(etag, format!("\"{:x}\"", md5::compute(chunk)));

        let (status, _) = send(
            &app,
            Method::POST,
            &format!("/sessions/{}/parts/{}", id, part["partNumber"]),
            Some(json!({ "etag": etag })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, done) = send(
        &app,
        Method::POST,
        &format!("/sessions/{}/complete", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let library_key = done["libraryKey"].as_str().unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/store/objects/{}", library_key))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], content);

    let (_, session) = send(&app, Method::GET, &format!("/sessions/{}", id), None).await;
    let staging_key = session["stagingKey"].as_str().unwrap();
    let (status, _) = send(
        &app,
        Method::GET,
        &format!("/store/objects/{}", staging_key),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, ready) = send(&app, Method::GET, "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ready["checks"]["disk"]["ok"], true);
}

#[tokio::test]
async fn tampered_part_urls_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        LocalObjectStore::new(dir.path(), "http://localhost", b"test-secret")
            .await
            .unwrap(),
    );
    let pool = Arc::new(db::connect_in_memory().await.unwrap());
    let policy = UploadPolicy {
        part_size: 8,
        ..UploadPolicy::default()
    };
    let manager = SessionManager::new(
        SessionStore::new(pool.clone()),
        store.clone(),
        VideoRegistrar::new(pool.clone()),
        Arc::new(TracingNotifier),
        policy,
    );
    let app = routes::routes().with_state(AppState {
        manager,
        db: pool,
        local_store: Some(store),
    });

    let (_, created) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(create_body(4, "clip.mp4")),
    )
    .await;
    let url = created["parts"][0]["uploadUrl"].as_str().unwrap();
    let path = url.strip_prefix("http://localhost").unwrap();
    let (base, _) = path.split_once("&signature=").unwrap();
    let forged = format!("{}&signature=AAAA", base);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::PUT)
                .uri(forged)
                .body(Body::from("data"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["code"], "invalid_signature");
}
