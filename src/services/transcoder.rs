//! Transcoder manager: supervises ffmpeg remux subprocesses that turn
//! non-HLS inputs (DASH manifests, plain MP4) into local sliding-window HLS
//! playlists. Stream copy only; codec-incompatible inputs are out of scope.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{error, info};

const STOP_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

struct TranscodeEntry {
    child: Child,
    last_access: DateTime<Utc>,
}

pub struct TranscoderManager {
    root: PathBuf,
    entries: Mutex<HashMap<String, TranscodeEntry>>,
}

impl TranscoderManager {
    pub fn new(root: PathBuf) -> Self {
        if let Err(e) = std::fs::create_dir_all(&root) {
            error!("Failed to create transcode directory {}: {}", root.display(), e);
        }
        Self {
            root,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn stream_dir(&self, stream_id: &str) -> PathBuf {
        self.root.join(stream_id)
    }

    /// Start (or reuse) a remuxer for a stream. Holding the table lock across
    /// the spawn guarantees that concurrent requests for the same stream id
    /// start exactly one process.
    pub async fn start_transcode(&self, stream_id: &str, input_url: &str) -> bool {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(stream_id) {
            if matches!(entry.child.try_wait(), Ok(None)) {
                entry.last_access = Utc::now();
                return true;
            }
            // process died; clear the stale entry and start over
            entries.remove(stream_id);
        }

        let stream_dir = self.stream_dir(stream_id);
        if stream_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&stream_dir) {
                error!("Failed to clear transcode dir {}: {}", stream_dir.display(), e);
                return false;
            }
        }
        if let Err(e) = std::fs::create_dir_all(&stream_dir) {
            error!("Failed to create transcode dir {}: {}", stream_dir.display(), e);
            return false;
        }

        let playlist = stream_dir.join("index.m3u8");
        let segments = stream_dir.join("segment_%03d.ts");

        let spawned = Command::new("ffmpeg")
            .arg("-i")
            .arg(input_url)
            .args([
                "-c:v",
                "copy",
                "-c:a",
                "copy",
                "-f",
                "hls",
                "-hls_time",
                "4",
                "-hls_list_size",
                "5",
                "-hls_flags",
                "delete_segments",
                "-hls_segment_filename",
            ])
            .arg(&segments)
            .arg(&playlist)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(child) => {
                info!("Started remuxer for {} from {}", stream_id, input_url);
                entries.insert(
                    stream_id.to_string(),
                    TranscodeEntry {
                        child,
                        last_access: Utc::now(),
                    },
                );
                true
            }
            Err(e) => {
                error!("Failed to start remuxer for {}: {}", stream_id, e);
                false
            }
        }
    }

    /// Stop a remuxer: signal it, wait up to the grace period, then kill.
    /// The entry and its output directory are removed either way.
    pub async fn stop_transcode(&self, stream_id: &str) {
        let entry = self.entries.lock().await.remove(stream_id);

        if let Some(mut entry) = entry {
            if matches!(entry.child.try_wait(), Ok(None)) {
                let _ = entry.child.start_kill();
                if tokio::time::timeout(STOP_GRACE, entry.child.wait())
                    .await
                    .is_err()
                {
                    let _ = entry.child.kill().await;
                }
            }
        }

        let stream_dir = self.stream_dir(stream_id);
        if let Err(e) = tokio::fs::remove_dir_all(&stream_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!("Failed to remove transcode dir {}: {}", stream_dir.display(), e);
            }
        }
    }

    /// Path to the generated playlist, if the remuxer has produced one yet.
    /// Touches the entry's last-access time.
    pub async fn manifest_path(&self, stream_id: &str) -> Option<PathBuf> {
        if let Some(entry) = self.entries.lock().await.get_mut(stream_id) {
            entry.last_access = Utc::now();
        }
        let path = self.stream_dir(stream_id).join("index.m3u8");
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            Some(path)
        } else {
            None
        }
    }

    pub async fn is_ready(&self, stream_id: &str) -> bool {
        self.manifest_path(stream_id).await.is_some()
    }

    /// Terminate entries idle past the threshold and sweep on-disk
    /// directories that no tracked entry owns. Returns how many were
    /// cleaned.
    pub async fn cleanup_stale_transcodes(&self, max_age_minutes: i64) -> usize {
        let cutoff = Utc::now() - Duration::minutes(max_age_minutes);
        let stale: Vec<String> = self
            .entries
            .lock()
            .await
            .iter()
            .filter(|(_, entry)| entry.last_access < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        let mut cleaned = 0;
        for stream_id in stale {
            info!("Cleaning up stale transcode: {}", stream_id);
            self.stop_transcode(&stream_id).await;
            cleaned += 1;
        }

        let tracked: HashSet<String> = self.entries.lock().await.keys().cloned().collect();
        if let Ok(mut read_dir) = tokio::fs::read_dir(&self.root).await {
            while let Ok(Some(item)) = read_dir.next_entry().await {
                let name = item.file_name().to_string_lossy().into_owned();
                let is_dir = item
                    .file_type()
                    .await
                    .map(|t| t.is_dir())
                    .unwrap_or(false);
                if is_dir && !tracked.contains(&name) {
                    match tokio::fs::remove_dir_all(item.path()).await {
                        Ok(()) => {
                            info!("Cleaned orphaned transcode dir: {}", name);
                            cleaned += 1;
                        }
                        Err(e) => error!("Failed to remove orphaned dir {}: {}", name, e),
                    }
                }
            }
        }

        cleaned
    }

    /// Stop every tracked remuxer. Used on shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        for stream_id in ids {
            self.stop_transcode(&stream_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_manifest_path_requires_playlist_on_disk() {
        let tmp = TempDir::new().unwrap();
        let manager = TranscoderManager::new(tmp.path().join("hls"));

        assert!(!manager.is_ready("s1").await);

        let dir = manager.stream_dir("s1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.m3u8"), "#EXTM3U\n").unwrap();

        assert!(manager.is_ready("s1").await);
        assert_eq!(
            manager.manifest_path("s1").await,
            Some(dir.join("index.m3u8"))
        );
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_orphaned_directories() {
        let tmp = TempDir::new().unwrap();
        let manager = TranscoderManager::new(tmp.path().join("hls"));

        let orphan = manager.stream_dir("orphan");
        std::fs::create_dir_all(&orphan).unwrap();
        std::fs::write(orphan.join("segment_000.ts"), b"x").unwrap();

        let cleaned = manager.cleanup_stale_transcodes(5).await;
        assert_eq!(cleaned, 1);
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn test_stop_transcode_removes_directory() {
        let tmp = TempDir::new().unwrap();
        let manager = TranscoderManager::new(tmp.path().join("hls"));

        let dir = manager.stream_dir("gone");
        std::fs::create_dir_all(&dir).unwrap();

        manager.stop_transcode("gone").await;
        assert!(!dir.exists());
    }
}
