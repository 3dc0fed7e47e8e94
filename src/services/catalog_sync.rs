//! Catalog sync: mirrors the upstream JSON catalogs into the store and
//! caches the ancillary sets in the KV table.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use crate::config::Settings;
use crate::database::Database;
use crate::ingestor::import_m3u_directory;
use crate::models::*;

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Well-known locations for a bundled playlist tree, probed in order.
const M3U_SEARCH_PATHS: [&str; 3] = ["/app/iptv_streams", "data/iptv_streams", "iptv/streams"];

pub struct CatalogSyncService {
    db: Database,
    settings: Settings,
    client: reqwest::Client,
}

impl CatalogSyncService {
    pub fn new(db: Database, settings: Settings) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self {
            db,
            settings,
            client,
        })
    }

    /// Fetch one endpoint, logging and absorbing failures so a broken
    /// endpoint never aborts the overall sync.
    async fn fetch_endpoint<T: DeserializeOwned>(&self, endpoint: &str) -> Option<T> {
        let url = format!("{}{}", self.settings.iptv_api_base, endpoint);
        info!("Fetching catalog data from {}", url);

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to fetch {}: {}", endpoint, e);
                return None;
            }
        };
        let response = match response.error_for_status() {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to fetch {}: {}", endpoint, e);
                return None;
            }
        };
        match response.json::<T>().await {
            Ok(data) => Some(data),
            Err(e) => {
                error!("Failed to decode {}: {}", endpoint, e);
                None
            }
        }
    }

    /// Sync every catalog endpoint. Returns a per-entity count summary.
    pub async fn sync_all(&self) -> Result<Map<String, Value>> {
        let mut results = Map::new();

        if let Some(channels) = self
            .fetch_endpoint::<Vec<UpstreamChannel>>("/channels.json")
            .await
        {
            let count = self.db.upsert_channels(&channels).await?;
            results.insert("channels".into(), json!(count));
            info!("Synced {} channels", count);
        }

        if let Some(streams) = self
            .fetch_endpoint::<Vec<UpstreamStream>>("/streams.json")
            .await
        {
            let count = self.db.upsert_streams(&streams).await?;
            results.insert("streams".into(), json!(count));
            info!("Synced {} streams", count);

            let counts = self.db.recompute_channel_stream_counts().await?;
            results.insert("playable_channels".into(), json!(counts.playable));
            results.insert("total_channels".into(), json!(counts.total));
            info!(
                "Playable channels: {} / {} total",
                counts.playable, counts.total
            );
        }

        if let Some(logos) = self.fetch_endpoint::<Vec<UpstreamLogo>>("/logos.json").await {
            let count = self.db.store_logos(&logos).await?;
            results.insert("logos".into(), json!(count));
            info!("Synced {} logos", count);
        }

        if let Some(categories) = self
            .fetch_endpoint::<Vec<UpstreamCategory>>("/categories.json")
            .await
        {
            let count = self.db.store_categories(&categories).await?;
            results.insert("categories".into(), json!(count));
            info!("Synced {} categories", count);
        }

        if let Some(countries) = self
            .fetch_endpoint::<Vec<UpstreamCountry>>("/countries.json")
            .await
        {
            let count = self.db.store_countries(&countries).await?;
            results.insert("countries".into(), json!(count));
            info!("Synced {} countries", count);
        }

        // Ancillary sets go to the KV cache as-is.
        for key in ["languages", "regions", "guides", "feeds"] {
            if let Some(data) = self
                .fetch_endpoint::<Value>(&format!("/{}.json", key))
                .await
            {
                let count = data.as_array().map(Vec::len).unwrap_or(0);
                self.db
                    .kv_set(key, &data, self.settings.cache_ttl_seconds)
                    .await?;
                results.insert(key.into(), json!(count));
                info!("Cached {} {}", count, key);
            }
        }

        let m3u_imported = self.import_local_m3u().await;
        if m3u_imported > 0 {
            results.insert("m3u_streams".into(), json!(m3u_imported));
            let counts = self.db.recompute_channel_stream_counts().await?;
            results.insert("playable_channels".into(), json!(counts.playable));
            results.insert("total_channels".into(), json!(counts.total));
            info!(
                "Updated playable: {} / {}",
                counts.playable, counts.total
            );
        }

        Ok(results)
    }

    /// First existing well-known playlist directory, if any.
    pub fn find_m3u_directory() -> Option<PathBuf> {
        M3U_SEARCH_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_dir())
    }

    async fn import_local_m3u(&self) -> u64 {
        let Some(dir) = Self::find_m3u_directory() else {
            info!("No local M3U directory found, skipping playlist import");
            return 0;
        };

        match import_m3u_directory(&self.db, &dir, None).await {
            Ok(summary) => {
                info!(
                    "Imported {} streams from {} playlist files in {}",
                    summary.streams,
                    summary.files_processed,
                    dir.display()
                );
                summary.streams
            }
            Err(e) => {
                error!("Failed to import M3U directory {}: {}", dir.display(), e);
                0
            }
        }
    }

    /// Cached languages with read-through to the upstream endpoint.
    pub async fn get_languages(&self) -> Result<Value> {
        self.cached_set("languages").await
    }

    /// Cached regions with read-through to the upstream endpoint.
    pub async fn get_regions(&self) -> Result<Value> {
        self.cached_set("regions").await
    }

    async fn cached_set(&self, key: &str) -> Result<Value> {
        if let Some(data) = self.db.kv_get(key).await? {
            return Ok(data);
        }
        if let Some(data) = self
            .fetch_endpoint::<Value>(&format!("/{}.json", key))
            .await
        {
            self.db
                .kv_set(key, &data, self.settings.cache_ttl_seconds)
                .await?;
            return Ok(data);
        }
        Ok(Value::Array(Vec::new()))
    }
}
