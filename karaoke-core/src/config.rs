use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::ResultCache;
use crate::engine::Device;
use crate::error::{KaraokeError, Result};

/// Service-wide settings. Every field has a default, so a partial JSON
/// document (or none at all) is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Finished tracks and the cache index.
    pub cache_dir: PathBuf,
    /// Progressive output, overwritten in place while a track processes.
    pub serving_dir: PathBuf,
    /// Scratch space for the transcoder and the separation tool.
    pub work_dir: PathBuf,
    pub cache_capacity_bytes: u64,
    pub overlap_seconds: f64,
    pub decode_timeout_secs: u64,
    /// Decode at most this much of each source.
    pub max_decode_seconds: Option<f64>,
    /// How long a finished session keeps answering status polls.
    pub session_retention_secs: u64,
    pub wait_timeout_secs: u64,
    pub wait_poll_ms: u64,
    pub max_predict_jobs: usize,
    /// Prepended to every URL the service hands out.
    pub url_prefix: String,
    pub ffmpeg_program: String,
    pub separator_program: String,
    pub mp3_bitrate: String,
    /// Skip probing and run on this device.
    pub force_device: Option<Device>,
    pub model: Option<String>,
    pub model_instances: Option<usize>,
    pub chunk_seconds: Option<f64>,
    /// Chunk duration after a GPU failure forces the CPU.
    pub fallback_chunk_seconds: f64,
    /// Run the startup micro-benchmark.
    pub benchmark: bool,
    /// Track length assumed for ETAs before the real duration is known.
    pub nominal_track_seconds: f64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let root = ResultCache::default_dir()
            .unwrap_or_else(|| std::env::temp_dir().join("karaoke-server"));
        Self {
            cache_dir: root.join("results"),
            serving_dir: root.join("serving"),
            work_dir: root.join("work"),
            cache_capacity_bytes: 2 * 1024 * 1024 * 1024,
            overlap_seconds: 0.5,
            decode_timeout_secs: 120,
            max_decode_seconds: None,
            session_retention_secs: 30,
            wait_timeout_secs: 120,
            wait_poll_ms: 500,
            max_predict_jobs: 3,
            url_prefix: String::new(),
            ffmpeg_program: "ffmpeg".to_owned(),
            separator_program: "demucs".to_owned(),
            mp3_bitrate: "192k".to_owned(),
            force_device: None,
            model: None,
            model_instances: None,
            chunk_seconds: None,
            fallback_chunk_seconds: 5.0,
            benchmark: true,
            nominal_track_seconds: 180.0,
        }
    }
}

impl ServiceConfig {
    /// Defaults with every directory placed under `root`.
    pub fn with_root(root: &Path) -> Self {
        Self {
            cache_dir: root.join("results"),
            serving_dir: root.join("serving"),
            work_dir: root.join("work"),
            ..Self::default()
        }
    }

    pub fn decode_timeout(&self) -> Duration {
        Duration::from_secs(self.decode_timeout_secs)
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms.max(1))
    }

    /// Where the best-known version of a track is served while it processes.
    pub fn progressive_url(&self, track_id: &str) -> String {
        format!("{}/stream/result/{track_id}", self.url_prefix)
    }

    /// Canonical URL of the finished track.
    pub fn final_url(&self, track_id: &str) -> String {
        format!("{}/stream/full/{track_id}", self.url_prefix)
    }
}

const MAX_TRACK_ID_LEN: usize = 256;

/// Track ids are placed into URL paths as they are, so only characters that
/// need no percent-encoding in a path segment are accepted.
pub fn validate_track_id(track_id: &str) -> Result<()> {
    let usable = !track_id.is_empty()
        && track_id.len() <= MAX_TRACK_ID_LEN
        && track_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | ':'))
        && !track_id.chars().all(|c| c == '.');
    if usable {
        Ok(())
    } else {
        Err(KaraokeError::InvalidRequest(format!(
            "track_id {track_id:?} must be 1-{MAX_TRACK_ID_LEN} characters of A-Z a-z 0-9 - _ . ~ :"
        )))
    }
}
