//! Router-level tests: endpoint wiring, status-code mapping and the admin
//! gate, exercised with `tower::ServiceExt::oneshot` against an in-memory
//! store.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use iptv_gateway::config::Settings;
use iptv_gateway::database::Database;
use iptv_gateway::models::{m3u_stream_id, M3uStream};
use iptv_gateway::services::catalog_sync::CatalogSyncService;
use iptv_gateway::services::geo_bypass::GeoBypassService;
use iptv_gateway::services::health_worker::HealthWorker;
use iptv_gateway::services::stream_proxy::StreamProxyService;
use iptv_gateway::services::transcoder::TranscoderManager;
use iptv_gateway::web::{AppState, WebServer};

async fn test_app() -> (Router, Database, TempDir) {
    let tmp = TempDir::new().unwrap();
    let db = Database::connect("sqlite::memory:").await.unwrap();
    db.initialize().await.unwrap();

    let settings = Settings {
        admin_api_key: Some("test-key".to_string()),
        ..Settings::default()
    };

    let geo = Arc::new(GeoBypassService::new().unwrap());
    let transcoder = Arc::new(TranscoderManager::new(tmp.path().join("hls")));
    let proxy = Arc::new(
        StreamProxyService::new(db.clone(), Arc::clone(&geo), Arc::clone(&transcoder)).unwrap(),
    );
    let sync = Arc::new(CatalogSyncService::new(db.clone(), settings.clone()).unwrap());
    let health_worker =
        Arc::new(HealthWorker::new(db.clone(), tmp.path().to_path_buf()).unwrap());

    let state = AppState {
        db: db.clone(),
        settings,
        sync,
        proxy,
        transcoder,
        health_worker,
    };

    (WebServer::create_router(state), db, tmp)
}

async fn send(app: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("host", "api.local")
        .body(Body::empty())
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _db, _tmp) = test_app().await;
    let (status, body) = send(&app, Method::GET, "/api/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_list_channels_empty_store() {
    let (app, _db, _tmp) = test_app().await;
    let (status, body) = send(&app, Method::GET, "/api/channels").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 0);
    assert_eq!(body["page"], 1);
    assert_eq!(body["per_page"], 50);
    assert_eq!(body["has_more"], false);
}

#[tokio::test]
async fn test_per_page_is_clamped() {
    let (app, _db, _tmp) = test_app().await;
    let (status, body) = send(&app, Method::GET, "/api/channels?per_page=500").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["per_page"], 100);
}

#[tokio::test]
async fn test_unknown_channel_returns_404() {
    let (app, _db, _tmp) = test_app().await;
    let (status, _) = send(&app, Method::GET, "/api/channels/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sync_requires_admin_key() {
    let (app, _db, _tmp) = test_app().await;

    let (status, body) = send(&app, Method::POST, "/api/sync").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .to_lowercase()
        .contains("admin api key"));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/sync")
        .header("host", "api.local")
        .header("x-admin-key", "wrong-key")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_play_manifest_unknown_stream_returns_404() {
    let (app, _db, _tmp) = test_app().await;
    let (status, _) = send(&app, Method::GET, "/api/streams/nope/play.m3u8").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_segment_with_invalid_encoding_returns_400() {
    let (app, db, _tmp) = test_app().await;

    let id = m3u_stream_id("http://x/1.m3u8", "US", "");
    db.upsert_m3u_streams(&[M3uStream {
        id: id.clone(),
        channel_id: Some("ABC.us".to_string()),
        feed: None,
        title: "ABC".to_string(),
        url: "http://x/1.m3u8".to_string(),
        quality: None,
        country: Some("US".to_string()),
        provider: None,
        source_file: "us.m3u".to_string(),
    }])
    .await
    .unwrap();

    let uri = format!("/api/streams/{}/segment/!!not-base64!!", id);
    let (status, _) = send(&app, Method::GET, &uri).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_local_file_path_traversal_is_forbidden() {
    let (app, _db, _tmp) = test_app().await;

    let (status, _) =
        send(&app, Method::GET, "/api/streams/s1/local/..%2F..%2Fsecret.txt").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_local_file_missing_returns_404() {
    let (app, _db, _tmp) = test_app().await;
    let (status, _) = send(&app, Method::GET, "/api/streams/s1/local/index.m3u8").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_epg_timeline_requires_channels() {
    let (app, _db, _tmp) = test_app().await;

    let (status, _) = send(&app, Method::GET, "/api/epg/timeline").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, Method::GET, "/api/epg/timeline?channels=%20").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("channel"));
}

#[tokio::test]
async fn test_epg_timeline_rejects_bad_start() {
    let (app, _db, _tmp) = test_app().await;
    let (status, _) = send(
        &app,
        Method::GET,
        "/api/epg/timeline?channels=ABC.us&start=yesterday",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_epg_stats_and_clear() {
    let (app, _db, _tmp) = test_app().await;

    let (status, body) = send(&app, Method::GET, "/api/epg/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_programs"], 0);

    let (status, body) = send(&app, Method::DELETE, "/api/epg/clear").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn test_epg_import_rejects_non_xml() {
    let (app, _db, _tmp) = test_app().await;
    let (status, _) = send(&app, Method::POST, "/api/epg/import?filename=guide.txt").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_worker_stats_endpoint() {
    let (app, _db, _tmp) = test_app().await;
    let (status, body) = send(&app, Method::GET, "/api/streams/health-worker").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], false);
    assert_eq!(body["state"], "stopped");
    assert_eq!(body["total_tested"], 0);
}

#[tokio::test]
async fn test_stream_stats_endpoint() {
    let (app, _db, _tmp) = test_app().await;
    let (status, body) = send(&app, Method::GET, "/api/streams/stats").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_streams"], 0);
    assert_eq!(body["channels_with_streams"], 0);
}
