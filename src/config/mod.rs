use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Application settings.
///
/// Defaults below are overridden by an optional `config.toml` and then by
/// `IPTV_`-prefixed environment variables (`IPTV_PORT=9000`,
/// `IPTV_ADMIN_API_KEY=...`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub rate_limit_per_minute: u32,
    pub stream_rate_limit_per_minute: u32,
    pub iptv_api_base: String,
    pub cache_ttl_seconds: i64,
    pub epg_cache_days: u32,
    pub sync_interval_hours: u64,
    pub database_path: String,
    pub admin_api_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec!["*".to_string()],
            rate_limit_per_minute: 100,
            stream_rate_limit_per_minute: 30,
            iptv_api_base: "https://iptv-org.github.io/api".to_string(),
            cache_ttl_seconds: 3600,
            epg_cache_days: 7,
            sync_interval_hours: 24,
            database_path: "data/iptv_cache.db".to_string(),
            admin_api_key: None,
        }
    }
}

impl Settings {
    pub fn load(config_file: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(config_file).required(false))
            .add_source(config::Environment::with_prefix("IPTV").try_parsing(true))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Directory holding the database, the health snapshot and imported
    /// guide files.
    pub fn data_dir(&self) -> PathBuf {
        Path::new(&self.database_path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn transcode_dir(&self) -> PathBuf {
        self.data_dir().join("hls_transcodes")
    }
}
