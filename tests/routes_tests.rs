//! HTTP routes over the in-memory metadata store.

use app_packager::{router, AppState, MemoryMetadataStore, Packager, PackagerSettings, StorageRegistry};
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "packager-test-boundary";

fn app(store: &MemoryMetadataStore, dir: &TempDir) -> Router {
    let settings = Arc::new(PackagerSettings {
        temp_dir: dir.path().join("tmp"),
        ..PackagerSettings::default()
    });
    let packager = Packager::new(
        Arc::new(store.clone()),
        Arc::new(StorageRegistry::new(settings.clone())),
        settings,
    );
    router(AppState::new(packager))
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn file_part(name: &str, file_name: &str, bytes: &[u8]) -> Vec<u8> {
    let mut part = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    part.extend_from_slice(bytes);
    part.extend_from_slice(b"\r\n");
    part
}

fn multipart_request(parts: Vec<Vec<u8>>) -> Request<Body> {
    let mut body: Vec<u8> = parts.into_iter().flatten().collect();
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    Request::post("/system/package")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

async fn exported_todo(store: &MemoryMetadataStore, dir: &TempDir) -> Vec<u8> {
    let app_id = store.seed_app(json!({"name": "todo"})).await.unwrap();
    let response = app(store, dir)
        .oneshot(
            Request::post(format!("/system/package/{app_id}/export"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

#[tokio::test]
async fn health_and_ready() {
    let dir = TempDir::new().unwrap();
    let store = MemoryMetadataStore::default();
    let health = app(&store, &dir)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let ready = app(&store, &dir)
        .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::OK);
    assert_eq!(body_json(ready).await["metadata"], "ok");
}

#[tokio::test]
async fn export_route_returns_attachment() {
    let dir = TempDir::new().unwrap();
    let store = MemoryMetadataStore::default();
    let app_id = store.seed_app(json!({"name": "todo"})).await.unwrap();

    let response = app(&store, &dir)
        .oneshot(
            Request::post(format!("/system/package/{app_id}/export"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({"include_files": false}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/zip");
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"todo.dfpkg\""
    );
}

#[tokio::test]
async fn export_of_unknown_app_reports_phase() {
    let dir = TempDir::new().unwrap();
    let store = MemoryMetadataStore::default();
    let response = app(&store, &dir)
        .oneshot(Request::post("/system/package/404/export").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "not_found");
    assert_eq!(body["error"]["details"]["phase"], "application");
}

#[tokio::test]
async fn multipart_import_creates_application() {
    let dir = TempDir::new().unwrap();
    let source = MemoryMetadataStore::default();
    let package = exported_todo(&source, &dir).await;

    let target = MemoryMetadataStore::default();
    let fields = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"fields\"\r\n\r\n{}\r\n",
        json!({"name": "todo-copy"})
    )
    .into_bytes();
    let response = app(&target, &dir)
        .oneshot(multipart_request(vec![file_part("file", "todo.dfpkg", &package), fields]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["data"]["app"]["name"], "todo-copy");
    assert_eq!(body["data"]["applied"], json!(["application"]));
    assert_eq!(target.app_count().await, 1);
}

#[tokio::test]
async fn multipart_import_accepts_one_file_only() {
    let dir = TempDir::new().unwrap();
    let source = MemoryMetadataStore::default();
    let package = exported_todo(&source, &dir).await;

    let target = MemoryMetadataStore::default();
    let response = app(&target, &dir)
        .oneshot(multipart_request(vec![
            file_part("file", "a.dfpkg", &package),
            file_part("package", "b.dfpkg", &package),
        ]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "bad_request");
    assert_eq!(target.app_count().await, 0);
}

#[tokio::test]
async fn url_import_rejects_wrong_extension() {
    let dir = TempDir::new().unwrap();
    let store = MemoryMetadataStore::default();
    let response = app(&store, &dir)
        .oneshot(
            Request::post("/system/package/url")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({"url": "http://127.0.0.1:9/todo.tar"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
