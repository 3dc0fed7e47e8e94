use anyhow::{anyhow, Result};
use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use tracing::{error, info};

use super::{FileImporter, ImportSummary};
use crate::database::Database;
use crate::models::{m3u_stream_id, M3uStream};

/// Parses local M3U playlist files named `<country>[_<provider>].m3u`
/// (`us.m3u`, `us_pluto.m3u`) and upserts the entries as streams.
pub struct M3uParser {
    db: Database,
    extinf: Regex,
}

impl M3uParser {
    pub fn new(db: Database) -> Result<Self> {
        Ok(Self {
            db,
            extinf: Regex::new(r#"#EXTINF:-?\d+\s*(?:tvg-id="([^"]*)")?[^,]*,(.+)"#)?,
        })
    }

    /// Parse playlist text. Each `#EXTINF` line carries an optional
    /// `tvg-id="Channel.country[@Feed]"` and a display name; the following
    /// non-comment line is the URL.
    pub fn parse_playlist(
        &self,
        content: &str,
        country: Option<&str>,
        provider: Option<&str>,
        source_file: &str,
    ) -> Vec<M3uStream> {
        let mut streams = Vec::new();
        let mut current: Option<(String, String)> = None;

        for raw in content.lines() {
            let line = raw.trim();

            if line.starts_with("#EXTINF:") {
                if let Some(caps) = self.extinf.captures(line) {
                    let tvg_id = caps.get(1).map(|m| m.as_str()).unwrap_or("").to_string();
                    let name = caps
                        .get(2)
                        .map(|m| m.as_str().trim())
                        .unwrap_or("")
                        .to_string();
                    current = Some((tvg_id, name));
                }
            } else if !line.is_empty() && !line.starts_with('#') {
                if let Some((tvg_id, name)) = current.take() {
                    let (channel_id, feed) = split_tvg_id(&tvg_id);
                    let id =
                        m3u_stream_id(line, country.unwrap_or(""), provider.unwrap_or(""));
                    streams.push(M3uStream {
                        id,
                        channel_id,
                        feed,
                        quality: extract_quality(&name),
                        title: name,
                        url: line.to_string(),
                        country: country.map(str::to_string),
                        provider: provider.map(str::to_string),
                        source_file: source_file.to_string(),
                    });
                }
            }
        }

        streams
    }

    pub async fn parse_file(&self, path: &Path) -> Result<Vec<M3uStream>> {
        if !path.exists() {
            return Err(anyhow!("M3U file not found: {}", path.display()));
        }
        info!("Parsing M3U file: {}", path.display());

        let content = tokio::fs::read_to_string(path).await?;
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        let (country, provider) = split_filename(stem);
        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_string();

        let streams =
            self.parse_playlist(&content, country.as_deref(), provider.as_deref(), &file_name);
        info!("Parsed {} streams from {}", streams.len(), file_name);
        Ok(streams)
    }
}

#[async_trait]
impl FileImporter for M3uParser {
    async fn import_file(&self, path: &Path) -> Result<ImportSummary> {
        let streams = self.parse_file(path).await?;
        let count = self.db.upsert_m3u_streams(&streams).await?;
        Ok(ImportSummary {
            files_processed: 1,
            streams: count,
            ..Default::default()
        })
    }
}

/// `us_pluto` → (US, pluto); `us` → (US, None).
fn split_filename(stem: &str) -> (Option<String>, Option<String>) {
    if stem.is_empty() {
        return (None, None);
    }
    match stem.split_once('_') {
        Some((country, provider)) => {
            (Some(country.to_uppercase()), Some(provider.to_string()))
        }
        None => (Some(stem.to_uppercase()), None),
    }
}

/// `ABC.us@East` → (Some("ABC.us"), Some("East")); `ABC.us` → (Some("ABC.us"), None).
fn split_tvg_id(tvg_id: &str) -> (Option<String>, Option<String>) {
    if tvg_id.is_empty() {
        return (None, None);
    }
    match tvg_id.rsplit_once('@') {
        Some((channel, feed)) => (Some(channel.to_string()), Some(feed.to_string())),
        None => (Some(tvg_id.to_string()), None),
    }
}

fn extract_quality(name: &str) -> Option<String> {
    let lower = name.to_lowercase();
    if lower.contains("4k") || lower.contains("2160") {
        Some("4K".to_string())
    } else if lower.contains("1080") {
        Some("1080p".to_string())
    } else if lower.contains("720") {
        Some("720p".to_string())
    } else if lower.contains("480") {
        Some("480p".to_string())
    } else if lower.contains("360") {
        Some("360p".to_string())
    } else {
        None
    }
}

/// Import every `*.m3u` file in a directory, optionally filtered by country
/// code. Per-file failures are logged and skipped.
pub async fn import_m3u_directory(
    db: &Database,
    dir: &Path,
    countries: Option<&[String]>,
) -> Result<ImportSummary> {
    let parser = M3uParser::new(db.clone())?;

    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("m3u"))
        .collect();
    paths.sort();

    let mut all_streams = Vec::new();
    let mut summary = ImportSummary::default();

    for path in paths {
        if let Some(countries) = countries {
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            let file_country = stem.split('_').next().unwrap_or("").to_lowercase();
            if !countries.iter().any(|c| c.to_lowercase() == file_country) {
                continue;
            }
        }

        match parser.parse_file(&path).await {
            Ok(streams) => {
                summary.files_processed += 1;
                all_streams.extend(streams);
            }
            Err(e) => error!("Failed to parse {}: {}", path.display(), e),
        }
    }

    if !all_streams.is_empty() {
        summary.streams = db.upsert_m3u_streams(&all_streams).await?;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> M3uParser {
        let db = tokio_test::block_on(Database::connect("sqlite::memory:")).unwrap();
        M3uParser::new(db).unwrap()
    }

    #[test]
    fn test_parse_entry_with_feed_and_provider() {
        let parser = parser();
        let content = "#EXTINF:-1 tvg-id=\"ABC.us@East\",ABC East\nhttp://x/1.m3u8\n";
        let streams = parser.parse_playlist(content, Some("US"), Some("pluto"), "us_pluto.m3u");

        assert_eq!(streams.len(), 1);
        let stream = &streams[0];
        assert_eq!(stream.channel_id.as_deref(), Some("ABC.us"));
        assert_eq!(stream.feed.as_deref(), Some("East"));
        assert_eq!(stream.title, "ABC East");
        assert_eq!(stream.url, "http://x/1.m3u8");
        assert_eq!(stream.country.as_deref(), Some("US"));
        assert_eq!(stream.provider.as_deref(), Some("pluto"));
        assert_eq!(stream.quality, None);
        assert_eq!(stream.id, m3u_stream_id("http://x/1.m3u8", "US", "pluto"));
    }

    #[test]
    fn test_parse_entry_without_tvg_id() {
        let parser = parser();
        let content = "#EXTINF:-1 group-title=\"News\",Some Channel 1080\nhttp://x/hd.m3u8\n";
        let streams = parser.parse_playlist(content, Some("UK"), None, "uk.m3u");

        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].channel_id, None);
        assert_eq!(streams[0].feed, None);
        assert_eq!(streams[0].quality.as_deref(), Some("1080p"));
    }

    #[test]
    fn test_comment_lines_between_entries_are_ignored() {
        let parser = parser();
        let content = "#EXTM3U\n#EXTINF:-1 tvg-id=\"CNN.us\",CNN\n#EXTVLCOPT:http-referrer=x\nhttp://x/cnn.m3u8\n";
        let streams = parser.parse_playlist(content, Some("US"), None, "us.m3u");

        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].channel_id.as_deref(), Some("CNN.us"));
        assert_eq!(streams[0].url, "http://x/cnn.m3u8");
    }

    #[test]
    fn test_extract_quality_tokens() {
        assert_eq!(extract_quality("Channel 4K"), Some("4K".to_string()));
        assert_eq!(extract_quality("Channel 2160"), Some("4K".to_string()));
        assert_eq!(extract_quality("Channel 720"), Some("720p".to_string()));
        assert_eq!(extract_quality("Channel 360"), Some("360p".to_string()));
        assert_eq!(extract_quality("Channel"), None);
    }

    #[test]
    fn test_split_filename() {
        assert_eq!(
            split_filename("us_pluto"),
            (Some("US".to_string()), Some("pluto".to_string()))
        );
        assert_eq!(split_filename("us"), (Some("US".to_string()), None));
        assert_eq!(split_filename(""), (None, None));
    }
}
