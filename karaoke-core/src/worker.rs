//! Drives one track from source media to a cached result.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::cache::{safe_file_stem, CacheError, ResultCache};
use crate::codec::{AudioCodec, MediaSource};
use crate::config::ServiceConfig;
use crate::error::{KaraokeError, Result};
use crate::events::{EventHub, SessionEvent};
use crate::listener::{NoOpListener, PipelineEvent, PipelineListener};
use crate::pipeline::ChunkPipeline;
use crate::scheduler::{PredictJob, PredictiveRunner};
use crate::inflight::InFlightGuard;
use crate::session::{
    banded_progress, Adoption, FirstChunk, SessionRegistry, SessionStatus, StreamingSession,
    DECODE_BAND, FINALIZE_BAND, PROCESSING_BAND,
};

pub(crate) struct TrackProcessor {
    pub(crate) config: ServiceConfig,
    pub(crate) pipeline: ChunkPipeline,
    pub(crate) cache: Arc<ResultCache>,
    pub(crate) codec: Arc<dyn AudioCodec>,
    pub(crate) events: Arc<EventHub>,
    pub(crate) sessions: Arc<SessionRegistry>,
}

impl TrackProcessor {
    /// Single well-known path the progressive output of `track_id` is
    /// overwritten at.
    pub(crate) fn progressive_path(&self, track_id: &str) -> PathBuf {
        self.config.serving_dir.join(format!(
            "{}.progressive.{}",
            safe_file_stem(track_id),
            self.codec.extension()
        ))
    }

    /// Run `session` to a terminal state and give up `claim` in the same
    /// step. Failures are recorded on the session and broadcast; the error is
    /// also returned for logging.
    pub(crate) fn process_session(
        &self,
        session: &StreamingSession,
        source: &MediaSource,
        claim: InFlightGuard,
    ) -> Result<()> {
        let track_id = session.track_id().to_owned();
        let result = self.drive(session, source);
        if result.is_err() {
            remove_if_present(&self.progressive_path(&track_id));
        }
        let finished = claim.release_with(|| match &result {
            Ok(url) => session.complete(url),
            Err(e) => session.fail(&e.to_string()),
        });

        match (result, finished) {
            (Ok(url), Ok(())) => {
                self.notify(session, SessionEvent::Complete { track_id, url });
                Ok(())
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), finished) => {
                let error = e.to_string();
                log::warn!("session {track_id} failed: {error}");
                if finished.is_ok() {
                    self.notify(session, SessionEvent::Error { track_id, error });
                }
                Err(e)
            }
        }
    }

    /// Everything up to the final transition. Returns the final URL.
    fn drive(&self, session: &StreamingSession, source: &MediaSource) -> Result<String> {
        let track_id = session.track_id().to_owned();
        let started = Instant::now();

        session.transition(SessionStatus::Downloading, "downloading")?;
        self.publish_progress(session, DECODE_BAND.0, "downloading");
        let decoded = self.codec.decode(source, self.config.max_decode_seconds)?;
        log::info!(
            "decoded {track_id}: {:.1}s at {} Hz in {:.2}s",
            decoded.audio.duration_seconds(decoded.sample_rate),
            decoded.sample_rate,
            started.elapsed().as_secs_f64()
        );

        session.transition(SessionStatus::Processing, "processing")?;
        let progressive = self.progressive_path(&track_id);
        fs::create_dir_all(&self.config.serving_dir)?;
        remove_if_present(&progressive);
        self.publish_progress(session, DECODE_BAND.1, "processing");

        let plan = self.pipeline.plan(decoded.audio.len(), decoded.sample_rate);
        session.set_chunks(0, plan.len());

        let mut listener = SessionListener {
            processor: self,
            session,
            progressive: &progressive,
            sample_rate: decoded.sample_rate,
            started,
        };
        let instrumental = self
            .pipeline
            .run(&decoded.audio, decoded.sample_rate, &mut listener)?;

        self.publish_progress(session, FINALIZE_BAND.0, "finalizing");
        let bytes = self.codec.encode(&instrumental, decoded.sample_rate)?;
        self.store_final(&track_id, &bytes, &progressive)?;

        log::info!(
            "separated {track_id} in {:.2}s",
            started.elapsed().as_secs_f64()
        );
        Ok(self.config.final_url(&track_id))
    }

    /// Drop expired sessions along with any progressive file they left
    /// behind, which holds the final bytes when the cache refused them.
    pub(crate) fn expire_sessions(&self) -> usize {
        self.sessions.sweep_expired(|session| {
            remove_if_present(&self.progressive_path(session.track_id()));
        })
    }

    /// Insert the final bytes into the cache. If the cache refuses them the
    /// progressive file takes the final bytes and keeps serving the track.
    fn store_final(&self, track_id: &str, bytes: &[u8], progressive: &Path) -> Result<()> {
        let path = self.cache.entry_path(track_id, self.codec.extension());
        write_atomic(&path, bytes)?;
        match self.cache.put(track_id, &path) {
            Ok(_) => {
                remove_if_present(progressive);
                Ok(())
            }
            Err(CacheError::Oversized { .. }) => write_atomic(progressive, bytes),
            Err(e) => {
                log::warn!("failed to cache {track_id}: {e}");
                remove_if_present(&path);
                write_atomic(progressive, bytes)
            }
        }
    }

    /// One-shot separation without a session. Returns the encoded result.
    pub(crate) fn separate_once(&self, key: &str, source: &MediaSource) -> Result<Vec<u8>> {
        if let Some(path) = self.cache.get(key) {
            return Ok(fs::read(path)?);
        }
        let decoded = self.codec.decode(source, self.config.max_decode_seconds)?;
        let instrumental = self
            .pipeline
            .run(&decoded.audio, decoded.sample_rate, &mut NoOpListener)?;
        let bytes = self.codec.encode(&instrumental, decoded.sample_rate)?;

        let path = self.cache.entry_path(key, self.codec.extension());
        write_atomic(&path, &bytes)?;
        if let Err(e) = self.cache.put(key, &path) {
            log::warn!("result for {key} not cached: {e}");
        }
        Ok(bytes)
    }

    fn publish_progress(&self, session: &StreamingSession, progress: u8, stage: &str) {
        let progress = session.set_progress(progress, stage);
        self.notify(
            session,
            SessionEvent::Progress {
                track_id: session.track_id().to_owned(),
                progress,
                stage: stage.to_owned(),
            },
        );
    }

    fn notify(&self, session: &StreamingSession, event: SessionEvent) {
        if !session.is_predictive() {
            self.events.publish(event);
        }
    }
}

impl PredictiveRunner for TrackProcessor {
    fn is_cached(&self, track_id: &str) -> bool {
        self.cache.has(track_id)
    }

    fn run_predictive(&self, job: &PredictJob, claim: InFlightGuard) -> Result<()> {
        let adoption = self
            .sessions
            .adopt(claim, || self.cache.has(&job.track_id));
        let Adoption::Drive(session, claim) = adoption else {
            log::debug!("predictive job for {} has nothing to do", job.track_id);
            return Ok(());
        };
        self.process_session(&session, &MediaSource::Url(job.url.clone()), claim)
    }
}

struct SessionListener<'a> {
    processor: &'a TrackProcessor,
    session: &'a StreamingSession,
    progressive: &'a Path,
    sample_rate: u32,
    started: Instant,
}

impl PipelineListener for SessionListener<'_> {
    fn on_event(&mut self, event: PipelineEvent<'_>) -> Result<()> {
        match event {
            PipelineEvent::ChunkStarted { .. } => {}
            PipelineEvent::Replanned { total, .. } => {
                let snap = self.session.snapshot();
                self.session.set_chunks(snap.chunks_done, total);
            }
            PipelineEvent::ChunkDone {
                completed,
                total,
                prefix,
                ..
            } => {
                self.session.set_chunks(completed, total);
                if let Some(prefix) = prefix {
                    let bytes = self.processor.codec.encode(prefix, self.sample_rate)?;
                    write_atomic(self.progressive, &bytes)?;
                }

                let track_id = self.session.track_id().to_owned();
                let url = self.processor.config.progressive_url(&track_id);
                match self.session.mark_first_chunk(&url) {
                    FirstChunk::Announce => {
                        log::info!(
                            "first chunk of {track_id} ready after {:.2}s",
                            self.started.elapsed().as_secs_f64()
                        );
                        self.processor.notify(
                            self.session,
                            SessionEvent::FirstChunk {
                                track_id: track_id.clone(),
                                url,
                            },
                        );
                    }
                    // Announced by whoever promotes the session.
                    FirstChunk::Silent => log::debug!("first chunk of {track_id} held back"),
                    FirstChunk::Repeat => self.processor.notify(
                        self.session,
                        SessionEvent::ChunkUpdated {
                            track_id: track_id.clone(),
                            url,
                            chunk: completed,
                        },
                    ),
                }
                self.processor.publish_progress(
                    self.session,
                    banded_progress(PROCESSING_BAND, completed, total),
                    "processing",
                );
            }
        }
        Ok(())
    }

    fn wants_progressive(&self) -> bool {
        true
    }

    fn is_cancelled(&self) -> bool {
        self.session.is_cancelled()
    }
}

/// Replace `path` with `bytes` so readers only ever see a complete file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| KaraokeError::InvalidRequest(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, bytes)?;
    tmp.persist(path).map_err(|e| KaraokeError::Io(e.error))?;
    Ok(())
}

fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("failed to remove {}: {e}", path.display());
        }
    }
}
