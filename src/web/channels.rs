//! Channel discovery, catalog listings and the admin sync endpoint.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::database::ChannelFilters;
use crate::errors::AppError;

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn get_stats(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let total_channels = state.db.count_channels().await?;
    let countries = state.db.get_countries().await?;
    let categories = state.db.get_categories().await?;
    let countries_with_channels = countries.iter().filter(|c| c.channel_count > 0).count();

    Ok(Json(json!({
        "total_channels": total_channels,
        "total_countries": countries.len(),
        "total_categories": categories.len(),
        "countries_with_channels": countries_with_channels,
    })))
}

fn default_true() -> bool {
    true
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    50
}

#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    pub country: Option<String>,
    pub category: Option<String>,
    pub provider: Option<String>,
    pub search: Option<String>,
    #[serde(default = "default_true")]
    pub playable_only: bool,
    #[serde(default)]
    pub include_epg: bool,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

pub async fn list_channels(
    State(state): State<AppState>,
    Query(query): Query<ChannelQuery>,
) -> Result<Json<Value>, AppError> {
    let page = query.page.max(1);
    let per_page = query.per_page.clamp(1, 100);

    let filters = ChannelFilters {
        country: query.country,
        category: query.category,
        provider: query.provider,
        search: query.search,
        playable_only: query.playable_only,
    };
    let (mut channels, total) = state.db.get_channels(&filters, page, per_page).await?;

    if query.include_epg && !channels.is_empty() {
        let ids: Vec<String> = channels.iter().map(|c| c.channel.id.clone()).collect();
        let now_playing = state.db.get_now_playing_for_channels(&ids).await?;
        for entry in &mut channels {
            entry.now_playing = now_playing.get(&entry.channel.id).cloned();
        }
    }

    Ok(Json(json!({
        "channels": channels,
        "total": total,
        "page": page,
        "per_page": per_page,
        "has_more": (page as i64) * (per_page as i64) < total,
    })))
}

pub async fn get_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let channel = state
        .db
        .get_channel_by_id(&channel_id)
        .await?
        .ok_or_else(|| AppError::not_found("Channel not found"))?;

    let streams = state.db.get_streams_for_channel(&channel_id).await?;
    let logos = state.db.get_logos_for_channel(&channel_id).await?;

    let mut body = serde_json::to_value(&channel).map_err(anyhow::Error::from)?;
    if let Some(map) = body.as_object_mut() {
        map.insert("streams".into(), serde_json::to_value(&streams).map_err(anyhow::Error::from)?);
        map.insert("logos".into(), serde_json::to_value(&logos).map_err(anyhow::Error::from)?);
    }
    Ok(Json(body))
}

pub async fn list_categories(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let categories = state.db.get_categories().await?;
    Ok(Json(json!({ "categories": categories })))
}

pub async fn list_countries(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let countries = state.db.get_countries().await?;
    Ok(Json(json!({ "countries": countries })))
}

pub async fn list_languages(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let languages = state.sync.get_languages().await?;
    Ok(Json(json!({ "languages": languages })))
}

pub async fn list_regions(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let regions = state.sync.get_regions().await?;
    Ok(Json(json!({ "regions": regions })))
}

pub async fn list_providers(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let providers = state.db.get_providers().await?;
    Ok(Json(json!({ "providers": providers })))
}

/// Admin-gated full catalog sync. The `X-Admin-Key` header must match the
/// configured secret; without a configured secret the endpoint stays closed.
pub async fn trigger_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let provided = headers
        .get("x-admin-key")
        .and_then(|value| value.to_str().ok());

    match (&state.settings.admin_api_key, provided) {
        (Some(expected), Some(provided)) if expected == provided => {}
        _ => return Err(AppError::Unauthorized),
    }

    let results = state.sync.sync_all().await?;
    Ok(Json(json!({ "status": "completed", "synced": results })))
}
