//! Transport-agnostic facade over the whole streaming service.
//!
//! Every request the HTTP layer serves maps onto one method here, taking and
//! returning the serde types below.

use std::fs;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cache::{hash_key, CacheStats, ResultCache};
use crate::codec::{AudioCodec, MediaSource};
use crate::config::{validate_track_id, ServiceConfig};
use crate::engine::{Device, EngineLoader};
use crate::error::{KaraokeError, Result};
use crate::events::{EventHub, SessionEvent};
use crate::hardware::{HardwareProfile, QualityMode};
use crate::pipeline::ChunkPipeline;
use crate::policy::{QualityPolicy, QualitySettings};
use crate::pool::{ModelInstancePool, PoolOptions};
use crate::scheduler::{PredictJob, PredictiveScheduler};
use crate::session::{Admission, SessionRegistry, SessionStatus, StreamingSession};
use crate::worker::TrackProcessor;

const JANITOR_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRef {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    pub url: String,
    pub track_id: String,
    #[serde(default)]
    pub predict_next: Vec<TrackRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HardwareSummary {
    pub device: Device,
    pub rtf: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    pub success: bool,
    pub first_chunk_url: String,
    pub full_track_url: String,
    pub is_cached: bool,
    pub is_complete: bool,
    pub estimated_total_seconds: f64,
    pub hardware: HardwareSummary,
}

/// Status as reported on the wire. Every non-terminal lifecycle state is
/// `processing`; the detail is in `stage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WireStatus {
    Processing,
    Complete,
    Error,
    NotFound,
}

impl From<SessionStatus> for WireStatus {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Starting | SessionStatus::Downloading | SessionStatus::Processing => {
                WireStatus::Processing
            }
            SessionStatus::Complete => WireStatus::Complete,
            SessionStatus::Error => WireStatus::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusResponse {
    pub status: WireStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_chunk_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusResponse {
    fn not_found() -> Self {
        Self {
            status: WireStatus::NotFound,
            progress: None,
            stage: None,
            first_chunk_url: None,
            url: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictRequest {
    pub tracks: Vec<TrackRef>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PredictResponse {
    pub success: bool,
    pub queued: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearCacheResponse {
    pub success: bool,
    pub removed_entries: usize,
    pub removed_files: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub device: Device,
    pub model: String,
    pub mode: QualityMode,
    pub gpu_failed: bool,
    pub gpu_available: bool,
    pub instances: usize,
    pub idle_instances: usize,
    pub rtf: f64,
    pub cache: CacheStats,
    pub active_sessions: usize,
    pub predictive_queue: usize,
}

/// Encoded audio plus what kind it is.
#[derive(Debug, Clone)]
pub struct AudioBody {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    /// `false` while this is still a progressive rendering.
    pub is_final: bool,
}

pub struct KaraokeService {
    processor: Arc<TrackProcessor>,
    profile: HardwareProfile,
    scheduler: PredictiveScheduler,
    janitor_stop: Mutex<Option<Sender<()>>>,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl KaraokeService {
    /// Build the pool, open the cache and start the background workers.
    pub fn new(
        config: ServiceConfig,
        profile: HardwareProfile,
        loader: Arc<dyn EngineLoader>,
        codec: Arc<dyn AudioCodec>,
    ) -> Result<Self> {
        fs::create_dir_all(&config.serving_dir)?;
        fs::create_dir_all(&config.work_dir)?;

        let policy = Arc::new(QualityPolicy::from_profile(
            &profile,
            config.model.as_deref(),
            config.chunk_seconds,
            config.fallback_chunk_seconds,
        ));
        let pool = ModelInstancePool::initialize(
            loader,
            policy,
            PoolOptions {
                instances: config.model_instances.unwrap_or(profile.instances),
                baseline_rtf: profile.estimated_rtf,
                benchmark: config.benchmark,
            },
        )?;
        let cache = Arc::new(ResultCache::open(&config.cache_dir, config.cache_capacity_bytes)?);
        let sessions = Arc::new(SessionRegistry::new(config.session_retention()));

        let processor = Arc::new(TrackProcessor {
            pipeline: ChunkPipeline::new(Arc::new(pool), config.overlap_seconds),
            config,
            cache,
            codec,
            events: Arc::new(EventHub::new()),
            sessions,
        });

        let scheduler =
            PredictiveScheduler::start(processor.clone(), processor.sessions.in_flight().clone())?;

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let janitor = {
            let processor = Arc::clone(&processor);
            thread::Builder::new()
                .name("karaoke-janitor".into())
                .spawn(move || janitor_loop(&processor, &stop_rx))?
        };

        Ok(Self {
            processor,
            profile,
            scheduler,
            janitor_stop: Mutex::new(Some(stop_tx)),
            janitor: Mutex::new(Some(janitor)),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.processor.config
    }

    pub fn profile(&self) -> &HardwareProfile {
        &self.profile
    }

    pub fn settings(&self) -> Arc<QualitySettings> {
        self.pool().policy().snapshot()
    }

    pub fn content_type(&self) -> &'static str {
        self.processor.codec.content_type()
    }

    fn pool(&self) -> &ModelInstancePool {
        self.processor.pipeline.pool()
    }

    fn cache(&self) -> &ResultCache {
        &self.processor.cache
    }

    fn sessions(&self) -> &SessionRegistry {
        &self.processor.sessions
    }

    fn hardware(&self) -> HardwareSummary {
        HardwareSummary {
            device: self.pool().device(),
            rtf: self.pool().rtf(),
        }
    }

    /// Begin processing `track_id`, or report on work already under way.
    pub fn start(&self, request: StartRequest) -> Result<StartResponse> {
        let track_id = request.track_id.trim().to_owned();
        if track_id.is_empty() || request.url.trim().is_empty() {
            return Err(KaraokeError::InvalidRequest(
                "track_id and url are required".into(),
            ));
        }
        validate_track_id(&track_id)?;

        let response = self.start_track(&track_id, &request.url)?;
        if !request.predict_next.is_empty() {
            self.predict(request.predict_next);
        }
        Ok(response)
    }

    fn start_track(&self, track_id: &str, url: &str) -> Result<StartResponse> {
        let config = self.config();
        if self.cache().has(track_id) {
            log::info!("start {track_id}: served from cache");
            return Ok(StartResponse {
                success: true,
                first_chunk_url: config.final_url(track_id),
                full_track_url: config.final_url(track_id),
                is_cached: true,
                is_complete: true,
                estimated_total_seconds: 0.0,
                hardware: self.hardware(),
            });
        }

        // Registered before any background work so an immediate status poll
        // never reports "not found".
        let (session, claim) = match self.sessions().admit(track_id) {
            Admission::Existing(session) => {
                if let Some(promotion) = session.promote_to_foreground() {
                    log::info!("start {track_id}: promoted predictive session");
                    if let Some(url) = promotion.missed_first_chunk {
                        self.processor.events.publish(SessionEvent::FirstChunk {
                            track_id: track_id.to_owned(),
                            url,
                        });
                    }
                }
                return Ok(self.view(&session));
            }
            // The predictive worker holds the claim; it will drive this
            // session and, since it is not predictive, notify for it.
            Admission::Handed(session) => return Ok(self.view(&session)),
            Admission::Claimed(session, claim) => (session, claim),
        };

        let processor = Arc::clone(&self.processor);
        let worker_session = Arc::clone(&session);
        let source = MediaSource::Url(url.to_owned());
        // A closure that never runs drops the claim, which fails the session.
        thread::Builder::new()
            .name("karaoke-session".into())
            .spawn(move || {
                let _ = processor.process_session(&worker_session, &source, claim);
            })?;

        log::info!("start {track_id}: processing");
        Ok(self.view(&session))
    }

    fn view(&self, session: &StreamingSession) -> StartResponse {
        let config = self.config();
        let track_id = session.track_id();
        StartResponse {
            success: true,
            first_chunk_url: config.progressive_url(track_id),
            full_track_url: config.final_url(track_id),
            is_cached: false,
            is_complete: session.status() == SessionStatus::Complete,
            estimated_total_seconds: self.pool().estimate_seconds(config.nominal_track_seconds),
            hardware: self.hardware(),
        }
    }

    pub fn status(&self, track_id: &str) -> StatusResponse {
        if let Some(session) = self.sessions().get(track_id) {
            let snap = session.snapshot();
            return StatusResponse {
                status: snap.status.into(),
                progress: Some(snap.progress),
                stage: Some(snap.stage),
                first_chunk_url: snap.first_chunk_url,
                url: snap.url,
                error: snap.error,
            };
        }
        if self.cache().has(track_id) {
            return StatusResponse {
                status: WireStatus::Complete,
                progress: Some(100),
                stage: Some("complete".into()),
                first_chunk_url: None,
                url: Some(self.config().final_url(track_id)),
                error: None,
            };
        }
        StatusResponse::not_found()
    }

    /// Best-known version of a track: the cached result, else the current
    /// progressive file.
    pub fn result(&self, track_id: &str) -> Result<AudioBody> {
        if let Some(path) = self.cache().get(track_id) {
            return Ok(AudioBody {
                bytes: fs::read(path)?,
                content_type: self.content_type(),
                is_final: true,
            });
        }
        let session = self
            .sessions()
            .get(track_id)
            .ok_or_else(|| KaraokeError::NotFound(track_id.to_owned()))?;
        let progressive = self.processor.progressive_path(track_id);
        match fs::read(&progressive) {
            Ok(bytes) => Ok(AudioBody {
                bytes,
                content_type: self.content_type(),
                is_final: session.status() == SessionStatus::Complete,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(KaraokeError::NotFound(format!("{track_id} (no output yet)")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Block until the final result exists, polling the cache and the session
    /// table at the configured interval.
    pub fn wait_for_result(&self, track_id: &str) -> Result<AudioBody> {
        let config = self.config();
        let started = Instant::now();
        loop {
            if let Some(path) = self.cache().get(track_id) {
                return Ok(AudioBody {
                    bytes: fs::read(path)?,
                    content_type: self.content_type(),
                    is_final: true,
                });
            }
            match self.sessions().get(track_id) {
                None => return Err(KaraokeError::NotFound(track_id.to_owned())),
                Some(session) => match session.status() {
                    SessionStatus::Error => {
                        return Err(KaraokeError::SessionFailed(
                            session.error().unwrap_or_else(|| "unknown error".into()),
                        ))
                    }
                    // Finished but not cached: the progressive file holds it.
                    SessionStatus::Complete => return self.result(track_id),
                    _ => {}
                },
            }

            let waited = started.elapsed();
            if waited >= config.wait_timeout() {
                return Err(KaraokeError::Timeout {
                    what: format!("track {track_id}"),
                    waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                });
            }
            thread::sleep(config.wait_poll());
        }
    }

    /// Queue up to `max_predict_jobs` speculative jobs, in order.
    pub fn predict(&self, tracks: Vec<TrackRef>) -> PredictResponse {
        let limit = self.config().max_predict_jobs;
        let mut response = PredictResponse {
            success: true,
            ..PredictResponse::default()
        };
        for (i, track) in tracks.into_iter().enumerate() {
            let accepted = i < limit
                && validate_track_id(&track.id).is_ok()
                && !self.sessions().get(&track.id).is_some_and(|s| !s.status().is_terminal())
                && self.scheduler.enqueue(PredictJob {
                    priority: i as u32,
                    track_id: track.id.clone(),
                    url: track.url,
                });
            if accepted {
                response.queued.push(track.id);
            } else {
                response.skipped.push(track.id);
            }
        }
        response
    }

    /// Ask a running session to stop before its next chunk.
    pub fn cancel(&self, track_id: &str) -> Result<bool> {
        let session = self
            .sessions()
            .get(track_id)
            .ok_or_else(|| KaraokeError::NotFound(track_id.to_owned()))?;
        let accepted = session.cancel();
        if accepted {
            log::info!("cancel requested for {track_id}");
        }
        Ok(accepted)
    }

    /// Wipe the result cache and every serving artifact.
    pub fn clear_cache(&self) -> Result<ClearCacheResponse> {
        let removed_entries = self.cache().clear()?;
        let mut removed_files = 0;
        for entry in fs::read_dir(&self.config().serving_dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(&path)?;
                removed_files += 1;
            }
        }
        log::info!("cleared cache: {removed_entries} entries, {removed_files} serving files");
        Ok(ClearCacheResponse {
            success: true,
            removed_entries,
            removed_files,
        })
    }

    /// Separate raw uploaded media and return the encoded instrumental.
    pub fn separate_bytes(&self, data: Vec<u8>, content_type: Option<String>) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Err(KaraokeError::InvalidRequest("no audio provided".into()));
        }
        let key = hash_key(&data);
        self.processor
            .separate_once(&key, &MediaSource::Bytes { data, content_type })
    }

    /// Separate the media at `url` and return the encoded instrumental.
    pub fn separate_url(&self, url: &str) -> Result<Vec<u8>> {
        if url.trim().is_empty() {
            return Err(KaraokeError::InvalidRequest("no url provided".into()));
        }
        let key = hash_key(url.as_bytes());
        self.processor
            .separate_once(&key, &MediaSource::Url(url.to_owned()))
    }

    pub fn health(&self) -> HealthResponse {
        let settings = self.settings();
        HealthResponse {
            status: "ok",
            device: settings.device,
            model: settings.model_id.clone(),
            mode: settings.mode,
            gpu_failed: settings.gpu_failed,
            gpu_available: self.profile.device().is_gpu() && !settings.gpu_failed,
            instances: self.pool().len(),
            idle_instances: self.pool().available(),
            rtf: self.pool().rtf(),
            cache: self.cache().stats(),
            active_sessions: self.sessions().active_count(),
            predictive_queue: self.scheduler.len(),
        }
    }

    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.processor.events.subscribe()
    }

    /// Stop the predictive worker and the session janitor. Sessions already
    /// running finish on their own threads.
    pub fn shutdown(&self) {
        self.scheduler.stop();
        self.janitor_stop.lock().take();
        if let Some(handle) = self.janitor.lock().take() {
            if handle.join().is_err() {
                log::error!("session janitor panicked");
            }
        }
    }
}

impl Drop for KaraokeService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn janitor_loop(processor: &TrackProcessor, stop: &Receiver<()>) {
    loop {
        match stop.recv_timeout(JANITOR_INTERVAL) {
            Err(RecvTimeoutError::Timeout) => {
                processor.expire_sessions();
            }
            _ => return,
        }
    }
}
