//! EPG read endpoints and guide import management.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::errors::AppError;
use crate::ingestor::{FileImporter, XmltvParser};
use crate::services::epg_mapper::EpgMapper;
use crate::utils::{format_timestamp, now_timestamp, parse_timestamp};

pub async fn get_epg_stats(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let stats = state.db.get_epg_stats().await?;
    Ok(Json(serde_json::to_value(stats).map_err(anyhow::Error::from)?))
}

#[derive(Debug, Deserialize)]
pub struct ChannelEpgQuery {
    #[serde(default = "default_hours")]
    pub hours: i64,
}

fn default_hours() -> i64 {
    24
}

pub async fn get_channel_epg(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Query(query): Query<ChannelEpgQuery>,
) -> Result<Json<Value>, AppError> {
    let hours = query.hours.clamp(1, 168);
    let programs = state.db.get_epg_for_channel(&channel_id, hours).await?;

    Ok(Json(json!({
        "channel_id": channel_id,
        "programs": programs,
        "count": programs.len(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct NowPlayingQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn get_now_playing(
    State(state): State<AppState>,
    Query(query): Query<NowPlayingQuery>,
) -> Result<Json<Value>, AppError> {
    let programs = state.db.get_now_playing(query.limit.clamp(1, 200)).await?;

    Ok(Json(json!({
        "timestamp": now_timestamp(),
        "programs": programs,
        "count": programs.len(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    pub channels: String,
    pub start: Option<String>,
    #[serde(default = "default_timeline_hours")]
    pub hours: i64,
}

fn default_timeline_hours() -> i64 {
    6
}

/// EPG timeline for a set of channels, for the guide grid view.
pub async fn get_timeline(
    State(state): State<AppState>,
    Query(query): Query<TimelineQuery>,
) -> Result<Json<Value>, AppError> {
    let channel_ids: Vec<String> = query
        .channels
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();

    if channel_ids.is_empty() {
        return Err(AppError::bad_input("At least one channel ID required"));
    }
    if channel_ids.len() > 50 {
        return Err(AppError::bad_input("Maximum 50 channels per request"));
    }

    let start_time = match &query.start {
        Some(raw) => parse_timestamp(raw)
            .ok_or_else(|| AppError::bad_input("Invalid start time format"))?,
        None => chrono::Utc::now(),
    };
    let hours = query.hours.clamp(1, 24);
    let end_time = start_time + chrono::Duration::hours(hours);

    let mut channels = Vec::with_capacity(channel_ids.len());
    for channel_id in &channel_ids {
        let programs = state.db.get_epg_for_channel(channel_id, hours).await?;
        let channel_name = state
            .db
            .get_channel_by_id(channel_id)
            .await?
            .map(|c| c.name)
            .unwrap_or_else(|| channel_id.clone());

        channels.push(json!({
            "channel_id": channel_id,
            "channel_name": channel_name,
            "programs": programs,
        }));
    }

    Ok(Json(json!({
        "start_time": format_timestamp(start_time),
        "end_time": format_timestamp(end_time),
        "channels": channels,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ImportQuery {
    #[serde(default = "default_filename")]
    pub filename: String,
}

fn default_filename() -> String {
    "pluto_guide.xml".to_string()
}

/// Import a guide file from the data directory, then refresh the channel
/// id mapping so the new programs resolve under catalog ids.
pub async fn import_epg(
    State(state): State<AppState>,
    Query(query): Query<ImportQuery>,
) -> Result<Json<Value>, AppError> {
    if !query.filename.ends_with(".xml") {
        return Err(AppError::bad_input("Only XML files supported"));
    }

    let filepath = state.settings.data_dir().join(&query.filename);
    if !filepath.exists() {
        return Err(AppError::NotFound(format!(
            "File not found: {}",
            query.filename
        )));
    }

    let parser = XmltvParser::new(state.db.clone());
    let summary = parser.import_file(&filepath).await?;

    let mut mapper = EpgMapper::new(state.db.clone()).map_err(AppError::Internal)?;
    let mapping = mapper.map_all().await?;

    Ok(Json(json!({
        "success": true,
        "message": format!(
            "Imported {} programs from {} channels",
            summary.programs, summary.channels
        ),
        "channels": summary.channels,
        "programs": summary.programs,
        "mapping": mapping,
    })))
}

pub async fn clear_epg(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    state.db.clear_epg().await?;
    Ok(Json(json!({
        "success": true,
        "message": "EPG data cleared",
    })))
}
