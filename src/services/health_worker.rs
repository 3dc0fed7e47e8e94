//! Background health worker: continuously probes stream liveness, persists
//! results with an adaptive recheck schedule, and warm-starts from a
//! snapshot file across restarts.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header::{HeaderMap, HeaderValue, RANGE, REFERER, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::database::Database;
use crate::models::{HealthStatus, ProbeTarget};
use crate::services::geo_bypass::DESKTOP_USER_AGENT;
use crate::utils::{now_timestamp, parse_timestamp};

const BATCH_SIZE: i64 = 30;
const BATCH_DELAY: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(8);
const CONCURRENT_PROBES: usize = 10;
const IDLE_DELAY: Duration = Duration::from_secs(60);
const ERROR_BACKOFF: Duration = Duration::from_secs(30);
const STARTUP_DELAY: Duration = Duration::from_secs(10);
const SNAPSHOT_FILENAME: &str = "health_snapshot.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerStats {
    pub total_tested: u64,
    pub working: u64,
    pub failed: u64,
    pub started_at: Option<String>,
    pub last_full_pass: Option<String>,
    pub snapshot_loaded: bool,
    pub full_pass_complete: bool,
}

#[derive(Debug, Clone)]
struct ProbeResult {
    status: HealthStatus,
    response_ms: Option<i64>,
    error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    timestamp: String,
    stats: WorkerStats,
    health_summary: HashMap<String, i64>,
    streams: Vec<SnapshotStream>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotStream {
    id: String,
    channel_id: Option<String>,
    status: String,
    response_ms: Option<i64>,
}

pub struct HealthWorker {
    db: Database,
    client: reqwest::Client,
    data_dir: PathBuf,
    state: RwLock<WorkerState>,
    stats: RwLock<WorkerStats>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthWorker {
    pub fn new(db: Database, data_dir: PathBuf) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            db,
            client,
            data_dir,
            state: RwLock::new(WorkerState::Stopped),
            stats: RwLock::new(WorkerStats::default()),
            stop_tx,
            task: Mutex::new(None),
        })
    }

    /// Start the worker: load the warm-start snapshot, then spawn the probe
    /// loop. A no-op when already running.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.write().await;
            if *state != WorkerState::Stopped {
                warn!("Health worker already running");
                return;
            }
            *state = WorkerState::Starting;
        }

        self.load_snapshot().await;

        self.stop_tx.send_replace(false);
        self.stats.write().await.started_at = Some(now_timestamp());
        *self.state.write().await = WorkerState::Running;

        let worker = Arc::clone(self);
        let handle = tokio::spawn(async move { worker.run_loop().await });
        *self.task.lock().await = Some(handle);

        info!("Health worker started");
    }

    /// Stop the worker, cancelling in-flight probes, and persist a snapshot.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            if !matches!(*state, WorkerState::Running | WorkerState::Starting) {
                return;
            }
            *state = WorkerState::Stopping;
        }

        self.stop_tx.send_replace(true);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }

        self.save_snapshot().await;
        *self.state.write().await = WorkerState::Stopped;
        info!("Health worker stopped (snapshot saved)");
    }

    pub async fn get_stats(&self) -> serde_json::Value {
        let state = *self.state.read().await;
        let stats = self.stats.read().await.clone();
        let uptime_seconds = stats
            .started_at
            .as_deref()
            .and_then(parse_timestamp)
            .map(|started| (Utc::now() - started).num_seconds().max(0))
            .unwrap_or(0);

        let mut value = serde_json::to_value(&stats).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.insert("state".into(), serde_json::json!(state));
            map.insert(
                "running".into(),
                serde_json::json!(state == WorkerState::Running),
            );
            map.insert("uptime_seconds".into(), serde_json::json!(uptime_seconds));
        }
        value
    }

    async fn run_loop(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        info!("Health worker loop starting");

        // Let the initial catalog sync land before the first batch.
        if Self::sleep_or_stop(&mut stop_rx, STARTUP_DELAY).await {
            return;
        }

        loop {
            let outcome = tokio::select! {
                _ = Self::wait_for_stop(&mut stop_rx) => return,
                result = self.process_batch() => result,
            };

            let delay = match outcome {
                Ok(true) => BATCH_DELAY,
                Ok(false) => {
                    let first_completion = {
                        let mut stats = self.stats.write().await;
                        if stats.full_pass_complete {
                            false
                        } else {
                            stats.full_pass_complete = true;
                            stats.last_full_pass = Some(now_timestamp());
                            true
                        }
                    };
                    if first_completion {
                        info!("Full health pass complete, saving snapshot");
                        self.save_snapshot().await;
                    }
                    IDLE_DELAY
                }
                Err(e) => {
                    error!("Health worker error: {}", e);
                    ERROR_BACKOFF
                }
            };

            if Self::sleep_or_stop(&mut stop_rx, delay).await {
                return;
            }
        }
    }

    async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep, returning true if a stop arrived first.
    async fn sleep_or_stop(rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = Self::wait_for_stop(rx) => true,
        }
    }

    /// Probe one batch of due streams. Returns false when nothing was due.
    async fn process_batch(&self) -> anyhow::Result<bool> {
        let streams = self.db.get_unchecked_streams(BATCH_SIZE).await?;
        if streams.is_empty() {
            return Ok(false);
        }

        debug!("Probing batch of {} streams", streams.len());
        let semaphore = Arc::new(Semaphore::new(CONCURRENT_PROBES));

        let probes = streams.iter().map(|stream| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await.ok();
                self.probe_stream(stream).await
            }
        });
        let results = futures::future::join_all(probes).await;

        let now = Utc::now();
        let mut working = 0u64;
        for (stream, result) in streams.iter().zip(&results) {
            let next_check = next_check_after(result.status, result.error.as_deref(), now);
            self.db
                .update_stream_health(
                    &stream.id,
                    result.status,
                    result.response_ms,
                    result.error.as_deref(),
                    Some(next_check),
                )
                .await?;

            let mut stats = self.stats.write().await;
            stats.total_tested += 1;
            match result.status {
                HealthStatus::Working => {
                    stats.working += 1;
                    working += 1;
                }
                HealthStatus::Failed => stats.failed += 1,
                _ => {}
            }
        }

        info!("Batch complete: {}/{} working", working, streams.len());
        Ok(true)
    }

    /// HEAD with the stream's recorded identity; servers that reject HEAD
    /// get a one-byte ranged GET instead.
    async fn probe_stream(&self, stream: &ProbeTarget) -> ProbeResult {
        let started = Instant::now();

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

        let outcome = self
            .client
            .head(&stream.url)
            .headers(headers.clone())
            .send()
            .await;

        let response = match outcome {
            Ok(response) if response.status() == StatusCode::METHOD_NOT_ALLOWED => {
                match self
                    .client
                    .get(&stream.url)
                    .headers(headers)
                    .header(RANGE, "bytes=0-0")
                    .send()
                    .await
                {
                    Ok(response) => response,
                    Err(e) => return probe_error(e),
                }
            }
            Ok(response) => response,
            Err(e) => return probe_error(e),
        };

        let elapsed_ms = started.elapsed().as_millis() as i64;
        match response.status().as_u16() {
            200 | 206 => ProbeResult {
                status: HealthStatus::Working,
                response_ms: Some(elapsed_ms),
                error: None,
            },
            403 => ProbeResult {
                status: HealthStatus::Warning,
                response_ms: Some(elapsed_ms),
                error: Some("403 Forbidden (possible geo-block)".to_string()),
            },
            404 => ProbeResult {
                status: HealthStatus::Failed,
                response_ms: None,
                error: Some("404 Not Found".to_string()),
            },
            code => ProbeResult {
                status: HealthStatus::Failed,
                response_ms: None,
                error: Some(format!("HTTP {}", code)),
            },
        }
    }

    fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILENAME)
    }

    /// Persist non-unknown health rows plus aggregate stats. Failures are
    /// logged; the snapshot is only a warm-start optimization.
    async fn save_snapshot(&self) {
        let result: anyhow::Result<usize> = async {
            let health_summary = self.db.get_health_stats().await?;
            let streams = self.db.get_streams_by_health(None).await?;

            let snapshot = Snapshot {
                timestamp: now_timestamp(),
                stats: self.stats.read().await.clone(),
                health_summary,
                streams: streams
                    .iter()
                    .filter(|s| s.health_status != HealthStatus::Unknown)
                    .map(|s| SnapshotStream {
                        id: s.id.clone(),
                        channel_id: s.channel_id.clone(),
                        status: s.health_status.as_str().to_string(),
                        response_ms: s.health_response_ms,
                    })
                    .collect(),
            };

            let path = self.snapshot_path();
            tokio::fs::write(&path, serde_json::to_vec_pretty(&snapshot)?).await?;
            Ok(snapshot.streams.len())
        }
        .await;

        match result {
            Ok(count) => info!("Health snapshot saved: {} streams", count),
            Err(e) => error!("Failed to save health snapshot: {}", e),
        }
    }

    /// Apply a previous snapshot so health state survives restarts. The
    /// store wins again as soon as the first live probe lands.
    async fn load_snapshot(&self) {
        let path = self.snapshot_path();
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(_) => {
                info!("No health snapshot found, probing from scratch");
                return;
            }
        };

        let snapshot: Snapshot = match serde_json::from_slice(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Failed to parse health snapshot: {}", e);
                return;
            }
        };

        let mut loaded = 0usize;
        for stream in &snapshot.streams {
            let status = HealthStatus::parse(&stream.status);
            if let Err(e) = self
                .db
                .update_stream_health(&stream.id, status, stream.response_ms, None, None)
                .await
            {
                warn!("Failed to apply snapshot entry {}: {}", stream.id, e);
                continue;
            }
            loaded += 1;
        }

        self.stats.write().await.snapshot_loaded = true;
        info!(
            "Loaded health snapshot: {} streams from {}",
            loaded, snapshot.timestamp
        );
    }
}

fn probe_error(e: reqwest::Error) -> ProbeResult {
    let error = if e.is_timeout() {
        "Timeout".to_string()
    } else if e.is_connect() {
        "Connection refused".to_string()
    } else {
        e.to_string().chars().take(100).collect()
    };
    ProbeResult {
        status: HealthStatus::Failed,
        response_ms: None,
        error: Some(error),
    }
}

/// Adaptive recheck schedule: healthy streams get probed again soon,
/// long-dead links are left alone for a week.
pub fn next_check_after(
    status: HealthStatus,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let error = error.unwrap_or("");
    match status {
        HealthStatus::Working => now + ChronoDuration::hours(6),
        HealthStatus::Warning => now + ChronoDuration::days(7),
        _ if error.contains("404") || error.contains("Not Found") => now + ChronoDuration::days(7),
        _ if error.contains("Timeout") => now + ChronoDuration::hours(1),
        _ if error.contains("Connection refused") => now + ChronoDuration::days(1),
        _ => now + ChronoDuration::hours(1),
    }
}
