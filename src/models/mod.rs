use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Liveness classification assigned by the health worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Working,
    Warning,
    Failed,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Working => "working",
            HealthStatus::Warning => "warning",
            HealthStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "working" => HealthStatus::Working,
            "warning" => HealthStatus::Warning,
            "failed" => HealthStatus::Failed,
            _ => HealthStatus::Unknown,
        }
    }
}

/// A channel row in the local catalog.
///
/// `has_streams` and `stream_count` are derived from the streams table by
/// [`crate::database::Database::recompute_channel_stream_counts`] and always
/// agree: `has_streams == (stream_count > 0)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub alt_names: Vec<String>,
    pub network: Option<String>,
    pub country: String,
    pub categories: Vec<String>,
    pub is_nsfw: bool,
    pub launched: Option<String>,
    pub closed: Option<String>,
    pub replaced_by: Option<String>,
    pub website: Option<String>,
    pub has_streams: bool,
    pub stream_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub id: String,
    pub channel_id: Option<String>,
    pub feed: Option<String>,
    pub title: String,
    pub url: String,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    pub quality: Option<String>,
    pub country: Option<String>,
    pub provider: Option<String>,
    pub health_status: HealthStatus,
    pub health_checked_at: Option<DateTime<Utc>>,
    pub health_response_ms: Option<i64>,
    pub health_error: Option<String>,
    pub next_check_due: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logo {
    pub id: String,
    pub channel_id: String,
    pub feed: Option<String>,
    pub url: String,
    pub width: i64,
    pub height: i64,
    pub format: Option<String>,
    pub tags: Vec<String>,
}

/// An EPG program row. `channel_id` is the XMLTV channel id as found in the
/// guide file; translation to catalog ids happens at read time through the
/// stored EPG mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub id: String,
    pub channel_id: String,
    pub title: String,
    pub sub_title: Option<String>,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub category: Option<String>,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub channel_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Country {
    pub code: String,
    pub name: String,
    pub languages: Vec<String>,
    pub flag: String,
    pub channel_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub id: String,
    pub name: String,
    pub stream_count: i64,
}

/// Channel plus its hydrated stream rows, as returned by the discovery
/// endpoints. Stream entries carry the latest health fields so the UI gets
/// liveness signals without extra round trips.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelWithStreams {
    #[serde(flatten)]
    pub channel: Channel,
    pub streams: Vec<Stream>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub now_playing: Option<NowPlaying>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NowPlaying {
    pub title: String,
    pub start: String,
    pub stop: String,
}

/// The subset of stream fields the health worker needs for one probe.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub id: String,
    pub url: String,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    pub channel_id: Option<String>,
    pub health_status: HealthStatus,
}

/// A recently updated health row, for UI polling.
#[derive(Debug, Clone, Serialize)]
pub struct HealthUpdate {
    pub id: String,
    pub channel_id: Option<String>,
    pub health_status: HealthStatus,
    pub health_error: Option<String>,
    pub health_checked_at: Option<String>,
    pub health_response_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub total_streams: i64,
    pub channels_with_streams: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpgStats {
    pub total_programs: i64,
    pub channels_with_epg: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PlayableCounts {
    pub playable: i64,
    pub total: i64,
}

/// A stream parsed from a local playlist file.
#[derive(Debug, Clone, PartialEq)]
pub struct M3uStream {
    pub id: String,
    pub channel_id: Option<String>,
    pub feed: Option<String>,
    pub title: String,
    pub url: String,
    pub quality: Option<String>,
    pub country: Option<String>,
    pub provider: Option<String>,
    pub source_file: String,
}

// ---- upstream catalog records (iptv-org JSON API shapes) ----

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamChannel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub alt_names: Vec<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub is_nsfw: bool,
    #[serde(default)]
    pub launched: Option<String>,
    #[serde(default)]
    pub closed: Option<String>,
    #[serde(default)]
    pub replaced_by: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamStream {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub feed: Option<String>,
    #[serde(default)]
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamLogo {
    pub channel: String,
    #[serde(default)]
    pub feed: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub width: i64,
    #[serde(default)]
    pub height: i64,
    #[serde(default)]
    pub format: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamCategory {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamCountry {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub flag: String,
}

/// Batch mapping outcome reported by the EPG mapper.
#[derive(Debug, Clone, Serialize)]
pub struct MappingSummary {
    pub total: usize,
    pub mapped: usize,
    pub fuzzy_matched: usize,
    pub unmapped: usize,
    pub mapping_rate: String,
    pub sample_unmapped: Vec<String>,
}

/// Stored EPG mapping dictionary: XMLTV channel id → catalog channel id.
pub type EpgMappings = HashMap<String, String>;

/// Stable stream id for catalog streams: 12-hex prefix of MD5(url + channel).
pub fn stable_stream_id(url: &str, channel: &str) -> String {
    let digest = md5::compute(format!("{}{}", url, channel));
    format!("{:x}", digest)[..12].to_string()
}

/// Stream id for locally imported playlist entries: 12-hex prefix of
/// MD5(url + country + provider).
pub fn m3u_stream_id(url: &str, country: &str, provider: &str) -> String {
    let digest = md5::compute(format!("{}{}{}", url, country, provider));
    format!("{:x}", digest)[..12].to_string()
}

/// Program id: 16-hex prefix of MD5(channel + raw start attribute + title).
pub fn program_id(channel: &str, start_raw: &str, title: &str) -> String {
    let digest = md5::compute(format!("{}{}{}", channel, start_raw, title));
    format!("{:x}", digest)[..16].to_string()
}

/// Logo id: 12-hex prefix of MD5(url + channel + index), index-salted because
/// the upstream feed contains duplicate (url, channel) pairs.
pub fn logo_id(url: &str, channel: &str, index: usize) -> String {
    let digest = md5::compute(format!("{}{}{}", url, channel, index));
    format!("{:x}", digest)[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_stream_id_is_deterministic() {
        let a = stable_stream_id("https://example.com/stream1.m3u8", "ch1");
        let b = stable_stream_id("https://example.com/stream1.m3u8", "ch1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_stream_ids_differ_by_channel() {
        let a = stable_stream_id("https://example.com/stream1.m3u8", "ch1");
        let b = stable_stream_id("https://example.com/stream1.m3u8", "ch2");
        assert_ne!(a, b);
    }

    #[test]
    fn test_program_id_length() {
        let id = program_id("ABC.us", "20251212040000 +0000", "Evening News");
        assert_eq!(id.len(), 16);
    }

    #[test]
    fn test_health_status_round_trip() {
        for status in [
            HealthStatus::Unknown,
            HealthStatus::Working,
            HealthStatus::Warning,
            HealthStatus::Failed,
        ] {
            assert_eq!(HealthStatus::parse(status.as_str()), status);
        }
        assert_eq!(HealthStatus::parse("healthy"), HealthStatus::Unknown);
    }
}
