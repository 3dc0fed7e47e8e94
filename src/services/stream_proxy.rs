//! Stream proxy: serves rewritten, origin-concealing HLS manifests and
//! relays segments so players only ever talk to this gateway.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, REFERER, USER_AGENT};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use crate::database::Database;
use crate::errors::AppError;
use crate::models::Stream;
use crate::services::geo_bypass::{GeoBypassService, DESKTOP_USER_AGENT};
use crate::services::transcoder::TranscoderManager;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 2;

const HLS_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

/// Wait this long, in 500 ms steps, for a fresh remuxer to produce its
/// playlist before giving up.
const TRANSCODE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const TRANSCODE_POLL_ATTEMPTS: u32 = 20;

/// A proxied response body with the headers the web layer must attach.
pub struct ProxiedBody {
    pub content_type: String,
    pub cache_control: &'static str,
    pub body: Vec<u8>,
}

/// Result of the `play.m3u8` dispatch.
pub enum PlayOutcome {
    /// Origin handles the format natively (YouTube); send the client there.
    Redirect(String),
    /// A rewritten manifest ready to serve.
    Manifest(ProxiedBody),
}

pub struct StreamProxyService {
    db: Database,
    geo: Arc<GeoBypassService>,
    transcoder: Arc<TranscoderManager>,
    client: reqwest::Client,
}

impl StreamProxyService {
    pub fn new(
        db: Database,
        geo: Arc<GeoBypassService>,
        transcoder: Arc<TranscoderManager>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            db,
            geo,
            transcoder,
            client,
        })
    }

    /// `play.m3u8` dispatch: YouTube URLs redirect to the origin, DASH/MP4
    /// inputs go through the transcoder, everything else is HLS passthrough.
    pub async fn play(&self, stream_id: &str, base_url: &str) -> Result<PlayOutcome, AppError> {
        let stream = self
            .db
            .get_stream_by_id(stream_id)
            .await?
            .ok_or_else(|| AppError::not_found("Stream not found"))?;

        let host = Url::parse(&stream.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        if host.contains("youtube.com") || host.contains("youtu.be") {
            return Ok(PlayOutcome::Redirect(stream.url));
        }

        let url_lower = stream.url.to_lowercase();
        if url_lower.contains(".mpd") || url_lower.contains(".mp4") {
            let body = self.transcode_manifest(&stream, base_url).await?;
            return Ok(PlayOutcome::Manifest(body));
        }

        let body = self.proxy_manifest(&stream, base_url).await?;
        Ok(PlayOutcome::Manifest(body))
    }

    /// HLS passthrough with retries (timeouts and 5xx only) and a single
    /// geo-bypass attempt on 403.
    pub async fn proxy_manifest(
        &self,
        stream: &Stream,
        base_url: &str,
    ) -> Result<ProxiedBody, AppError> {
        let headers = build_headers(stream);
        let mut geo_bypass_attempted = false;
        let mut attempt: u32 = 0;

        loop {
            let result = self
                .client
                .get(&stream.url)
                .headers(headers.clone())
                .send()
                .await;

            match result {
                Ok(mut response) => {
                    if response.status() == StatusCode::FORBIDDEN && !geo_bypass_attempted {
                        geo_bypass_attempted = true;
                        info!("Stream {} returned 403, attempting geo-bypass", stream.id);
                        match self
                            .geo
                            .fetch_with_bypass(&stream.url, &headers, None, true, false)
                            .await
                        {
                            Ok(bypass) if bypass.status() == StatusCode::OK => {
                                response = bypass;
                            }
                            Ok(bypass) => {
                                warn!(
                                    "Geo-bypass failed for {}, still {}",
                                    stream.id,
                                    bypass.status()
                                );
                            }
                            Err(e) => {
                                warn!("Geo-bypass request failed for {}: {}", stream.id, e);
                            }
                        }
                    }

                    let status = response.status();
                    if status.is_success() {
                        let final_url = response.url().to_string();
                        let content_type = response
                            .headers()
                            .get(CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or(HLS_CONTENT_TYPE)
                            .to_string();
                        let content = response.text().await?;
                        let rewritten =
                            rewrite_manifest(&content, &final_url, &stream.id, base_url);
                        return Ok(ProxiedBody {
                            content_type,
                            cache_control: "no-cache, no-store, must-revalidate",
                            body: rewritten.into_bytes(),
                        });
                    }

                    if status == StatusCode::FORBIDDEN {
                        return Err(AppError::UpstreamGeoBlocked);
                    }
                    if status.is_server_error() && attempt < MAX_RETRIES {
                        let wait = retry_backoff(attempt);
                        warn!(
                            "Stream {} upstream error {}, retry {}/{} in {:?}",
                            stream.id,
                            status,
                            attempt + 1,
                            MAX_RETRIES,
                            wait
                        );
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(AppError::UpstreamStatus(status.as_u16()));
                }
                Err(e) if e.is_timeout() => {
                    if attempt < MAX_RETRIES {
                        let wait = retry_backoff(attempt);
                        warn!(
                            "Stream {} timeout, retry {}/{} in {:?}",
                            stream.id,
                            attempt + 1,
                            MAX_RETRIES,
                            wait
                        );
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(AppError::UpstreamTimeout);
                }
                Err(e) => return Err(AppError::Http(e)),
            }
        }
    }

    /// Segment relay: media bytes pass through untouched, nested playlists
    /// are rewritten so every URI keeps pointing back at the gateway.
    pub async fn proxy_segment(
        &self,
        stream_id: &str,
        encoded_url: &str,
        base_url: &str,
    ) -> Result<ProxiedBody, AppError> {
        let stream = self
            .db
            .get_stream_by_id(stream_id)
            .await?
            .ok_or_else(|| AppError::not_found("Stream not found"))?;

        let segment_url = URL_SAFE
            .decode(encoded_url)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| AppError::bad_input("Invalid segment URL"))?;

        let headers = build_headers(&stream);
        let response = self
            .client
            .get(&segment_url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::UpstreamTimeout
                } else {
                    AppError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(if status == StatusCode::NOT_FOUND {
                AppError::not_found("Segment not found upstream")
            } else {
                AppError::UpstreamStatus(status.as_u16())
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();

        if content_type.contains("mpegurl") || segment_url.ends_with(".m3u8") {
            let final_url = response.url().to_string();
            let content = response.text().await?;
            let rewritten = rewrite_manifest(&content, &final_url, stream_id, base_url);
            Ok(ProxiedBody {
                content_type: HLS_CONTENT_TYPE.to_string(),
                cache_control: "no-cache",
                body: rewritten.into_bytes(),
            })
        } else {
            let body = response.bytes().await?.to_vec();
            Ok(ProxiedBody {
                content_type: SEGMENT_CONTENT_TYPE.to_string(),
                cache_control: "max-age=3600",
                body,
            })
        }
    }

    /// One-shot liveness probe backing `/api/streams/{id}/status`.
    pub async fn check_stream_health(&self, stream_id: &str) -> Result<serde_json::Value, AppError> {
        let Some(stream) = self.db.get_stream_by_id(stream_id).await? else {
            return Ok(serde_json::json!({
                "status": "error",
                "message": "Stream not found",
            }));
        };

        let headers = build_headers(&stream);
        match self.client.head(&stream.url).headers(headers).send().await {
            Ok(response) if response.status() == StatusCode::OK => Ok(serde_json::json!({
                "status": "ok",
                "stream_id": stream_id,
                "quality": stream.quality,
                "content_type": response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok()),
            })),
            Ok(response) => Ok(serde_json::json!({
                "status": "error",
                "message": format!("Stream returned status {}", response.status().as_u16()),
            })),
            Err(e) if e.is_timeout() => Ok(serde_json::json!({
                "status": "error",
                "message": "Stream connection timed out",
            })),
            Err(e) => Ok(serde_json::json!({
                "status": "error",
                "message": e.to_string(),
            })),
        }
    }

    /// Start (or reuse) a remuxer for a DASH/MP4 input, wait for its playlist
    /// and serve it with segment names routed through the local-file handler.
    async fn transcode_manifest(
        &self,
        stream: &Stream,
        base_url: &str,
    ) -> Result<ProxiedBody, AppError> {
        if !self.transcoder.start_transcode(&stream.id, &stream.url).await {
            return Err(AppError::TranscodeUnavailable);
        }

        let mut path = None;
        for _ in 0..TRANSCODE_POLL_ATTEMPTS {
            if let Some(found) = self.transcoder.manifest_path(&stream.id).await {
                path = Some(found);
                break;
            }
            tokio::time::sleep(TRANSCODE_POLL_INTERVAL).await;
        }
        let path = path.ok_or(AppError::TranscodeUnavailable)?;

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| AppError::Internal(e.into()))?;
        let rewritten = rewrite_local_manifest(&content, &stream.id, base_url);

        Ok(ProxiedBody {
            content_type: HLS_CONTENT_TYPE.to_string(),
            cache_control: "no-cache",
            body: rewritten.into_bytes(),
        })
    }
}

fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 * 2u64.pow(attempt))
}

fn build_headers(stream: &Stream) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let ua = stream.user_agent.as_deref().unwrap_or(DESKTOP_USER_AGENT);
    if let Ok(value) = HeaderValue::from_str(ua) {
        headers.insert(USER_AGENT, value);
    }
    if let Some(referrer) = &stream.referrer {
        if let Ok(value) = HeaderValue::from_str(referrer) {
            headers.insert(REFERER, value);
        }
    }
    headers
}

/// Rewrite an HLS manifest so every resource URI routes back through the
/// gateway. Line order is preserved exactly; comment lines are copied
/// verbatim except for `URI="…"` attribute substitution.
pub fn rewrite_manifest(content: &str, origin_url: &str, stream_id: &str, base_url: &str) -> String {
    let mut lines = Vec::new();

    for raw in content.split('\n') {
        let line = raw.trim();
        if line.is_empty() {
            lines.push(String::new());
            continue;
        }

        if line.starts_with('#') {
            if line.contains("URI=\"") {
                lines.push(rewrite_uri_attribute(line, origin_url, stream_id, base_url));
            } else {
                lines.push(line.to_string());
            }
            continue;
        }

        let absolute = resolve_url(origin_url, line);
        lines.push(segment_route(&absolute, stream_id, base_url));
    }

    lines.join("\n")
}

/// Rewrite a transcoder-generated playlist: segment filenames become
/// local-file routes, everything else passes through.
pub fn rewrite_local_manifest(content: &str, stream_id: &str, base_url: &str) -> String {
    let mut lines = Vec::new();

    for raw in content.split('\n') {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            lines.push(line.to_string());
            continue;
        }
        lines.push(format!(
            "{}/api/streams/{}/local/{}",
            base_url, stream_id, line
        ));
    }

    lines.join("\n")
}

fn rewrite_uri_attribute(line: &str, origin_url: &str, stream_id: &str, base_url: &str) -> String {
    let Some(start) = line.find("URI=\"") else {
        return line.to_string();
    };
    let rest = &line[start + 5..];
    let Some(end) = rest.find('"') else {
        return line.to_string();
    };

    let uri = &rest[..end];
    let absolute = resolve_url(origin_url, uri);
    let proxied = segment_route(&absolute, stream_id, base_url);
    format!("{}URI=\"{}\"{}", &line[..start], proxied, &rest[end + 1..])
}

fn resolve_url(origin_url: &str, reference: &str) -> String {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return reference.to_string();
    }
    match Url::parse(origin_url).and_then(|base| base.join(reference)) {
        Ok(url) => url.to_string(),
        Err(_) => reference.to_string(),
    }
}

fn segment_route(absolute_url: &str, stream_id: &str, base_url: &str) -> String {
    format!(
        "{}/api/streams/{}/segment/{}",
        base_url,
        stream_id,
        URL_SAFE.encode(absolute_url)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_relative_segment() {
        let manifest = "#EXTM3U\n#EXTINF:4,\nsegment0.ts";
        let rewritten = rewrite_manifest(
            manifest,
            "http://ex.com/live/stream.m3u8",
            "s",
            "http://api.local",
        );

        let expected_encoded = URL_SAFE.encode("http://ex.com/live/segment0.ts");
        let lines: Vec<&str> = rewritten.split('\n').collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXTINF:4,");
        assert_eq!(
            lines[2],
            format!("http://api.local/api/streams/s/segment/{}", expected_encoded)
        );
    }

    #[test]
    fn test_rewrite_round_trips_absolute_urls() {
        let manifest = "https://cdn.example.com/hls/chunk_001.ts";
        let rewritten = rewrite_manifest(manifest, "http://ex.com/live/x.m3u8", "s1", "http://api");

        let encoded = rewritten.rsplit('/').next().unwrap();
        let decoded = URL_SAFE.decode(encoded).unwrap();
        assert_eq!(
            String::from_utf8(decoded).unwrap(),
            "https://cdn.example.com/hls/chunk_001.ts"
        );
    }

    #[test]
    fn test_rewrite_preserves_blank_lines_and_order() {
        let manifest = "#EXTM3U\n\n#EXT-X-VERSION:3\nseg.ts\n";
        let rewritten =
            rewrite_manifest(manifest, "http://ex.com/live/x.m3u8", "s", "http://api");
        let lines: Vec<&str> = rewritten.split('\n').collect();

        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "");
        assert_eq!(lines[2], "#EXT-X-VERSION:3");
        assert!(lines[3].starts_with("http://api/api/streams/s/segment/"));
        assert_eq!(lines[4], "");
    }

    #[test]
    fn test_rewrite_uri_attribute_in_key_tag() {
        let manifest = "#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\",IV=0x1234";
        let rewritten =
            rewrite_manifest(manifest, "http://ex.com/live/x.m3u8", "s", "http://api");

        let encoded = URL_SAFE.encode("http://ex.com/live/key.bin");
        assert_eq!(
            rewritten,
            format!(
                "#EXT-X-KEY:METHOD=AES-128,URI=\"http://api/api/streams/s/segment/{}\",IV=0x1234",
                encoded
            )
        );
    }

    #[test]
    fn test_rewrite_local_manifest_routes_segments() {
        let manifest = "#EXTM3U\n#EXTINF:4.0,\nsegment_001.ts";
        let rewritten = rewrite_local_manifest(manifest, "s9", "http://api");
        let lines: Vec<&str> = rewritten.split('\n').collect();

        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[2], "http://api/api/streams/s9/local/segment_001.ts");
    }

    #[test]
    fn test_retry_backoff_is_exponential() {
        assert_eq!(retry_backoff(0), Duration::from_millis(500));
        assert_eq!(retry_backoff(1), Duration::from_millis(1000));
        assert_eq!(retry_backoff(2), Duration::from_millis(2000));
    }
}
