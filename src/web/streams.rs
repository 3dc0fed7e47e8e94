//! Streaming proxy endpoints and health observability.

use axum::extract::{Host, Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Component;

use super::AppState;
use crate::errors::AppError;
use crate::ingestor::import_m3u_directory;
use crate::services::catalog_sync::CatalogSyncService;
use crate::services::stream_proxy::{PlayOutcome, ProxiedBody};

/// Every proxied response is CORS-open so browser players can consume it.
fn proxied_response(body: ProxiedBody) -> Response {
    (
        [
            (header::CONTENT_TYPE, body.content_type),
            (
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                "*".to_string(),
            ),
            (header::CACHE_CONTROL, body.cache_control.to_string()),
        ],
        body.body,
    )
        .into_response()
}

pub async fn play_manifest(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    Host(host): Host,
) -> Result<Response, AppError> {
    let base_url = format!("http://{}", host);
    match state.proxy.play(&stream_id, &base_url).await? {
        PlayOutcome::Redirect(url) => Ok(Redirect::temporary(&url).into_response()),
        PlayOutcome::Manifest(body) => Ok(proxied_response(body)),
    }
}

pub async fn proxy_segment(
    State(state): State<AppState>,
    Path((stream_id, encoded)): Path<(String, String)>,
    Host(host): Host,
) -> Result<Response, AppError> {
    let base_url = format!("http://{}", host);
    let body = state
        .proxy
        .proxy_segment(&stream_id, &encoded, &base_url)
        .await?;
    Ok(proxied_response(body))
}

/// Serve a file from the transcoder output directory. The resolved path must
/// stay inside the stream's own directory.
pub async fn serve_transcode_file(
    State(state): State<AppState>,
    Path((stream_id, filename)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let relative = std::path::Path::new(&filename);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(AppError::forbidden("path escapes transcode directory"));
    }

    let dir = state.transcoder.stream_dir(&stream_id);
    let candidate = dir.join(relative);

    let canonical_dir = tokio::fs::canonicalize(&dir)
        .await
        .map_err(|_| AppError::not_found("Transcode output not found"))?;
    let canonical = tokio::fs::canonicalize(&candidate)
        .await
        .map_err(|_| AppError::not_found("File not found"))?;
    if !canonical.starts_with(&canonical_dir) {
        return Err(AppError::forbidden("path escapes transcode directory"));
    }

    let bytes = tokio::fs::read(&canonical)
        .await
        .map_err(|_| AppError::not_found("File not found"))?;

    let content_type = if filename.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else {
        "video/mp2t"
    };

    Ok(proxied_response(ProxiedBody {
        content_type: content_type.to_string(),
        cache_control: "no-cache",
        body: bytes,
    }))
}

pub async fn stream_status(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let status = state.proxy.check_stream_health(&stream_id).await?;
    Ok(Json(status))
}

pub async fn get_stream_stats(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let stats = state.db.get_stream_stats().await?;
    Ok(Json(serde_json::to_value(stats).map_err(anyhow::Error::from)?))
}

#[derive(Debug, Deserialize)]
pub struct HealthUpdatesQuery {
    #[serde(default = "default_since")]
    pub since: i64,
}

fn default_since() -> i64 {
    60
}

pub async fn get_health_updates(
    State(state): State<AppState>,
    Query(query): Query<HealthUpdatesQuery>,
) -> Result<Json<Value>, AppError> {
    let updates = state
        .db
        .get_recent_health_updates(query.since.clamp(1, 3600))
        .await?;
    Ok(Json(json!({
        "updates": updates,
        "count": updates.len(),
    })))
}

pub async fn get_health_stats(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let stats = state.db.get_health_stats().await?;
    Ok(Json(serde_json::to_value(stats).map_err(anyhow::Error::from)?))
}

pub async fn get_health_worker(State(state): State<AppState>) -> Json<Value> {
    Json(state.health_worker.get_stats().await)
}

#[derive(Debug, Deserialize)]
pub struct ImportQuery {
    pub countries: Option<String>,
}

/// Import streams from the local playlist tree, optionally filtered to a
/// comma-separated list of country codes.
pub async fn import_m3u(
    State(state): State<AppState>,
    Query(query): Query<ImportQuery>,
) -> Result<Json<Value>, AppError> {
    let dir = CatalogSyncService::find_m3u_directory()
        .ok_or_else(|| AppError::not_found("Streams directory not found"))?;

    let countries: Option<Vec<String>> = query.countries.map(|raw| {
        raw.split(',')
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect()
    });

    let summary = import_m3u_directory(&state.db, &dir, countries.as_deref()).await?;
    state.db.recompute_channel_stream_counts().await?;

    Ok(Json(json!({
        "success": true,
        "message": format!(
            "Imported {} streams from {} files",
            summary.streams, summary.files_processed
        ),
        "files_processed": summary.files_processed,
        "total_streams": summary.streams,
    })))
}
