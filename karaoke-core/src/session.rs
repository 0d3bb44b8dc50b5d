//! Per-track processing sessions and the registry that owns them.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::{KaraokeError, Result};
use crate::inflight::{InFlightGuard, InFlightSet};

/// Lifecycle of a streaming session.
///
/// ```text
///  Starting ──→ Downloading ──→ Processing ──→ Complete
///     │              │               │
///     └──────────────┴───────────────┴──────→ Error
/// ```
///
/// `Starting` is set synchronously before any background work is scheduled.
/// Terminal sessions stay registered for the retention period so late status
/// polls still get an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Downloading,
    Processing,
    Complete,
    Error,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 5] = [
        SessionStatus::Starting,
        SessionStatus::Downloading,
        SessionStatus::Processing,
        SessionStatus::Complete,
        SessionStatus::Error,
    ];

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Starting, Downloading)
                | (Downloading, Processing)
                | (Processing, Complete)
                | (Starting | Downloading | Processing, Error)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Complete | SessionStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Downloading => "downloading",
            SessionStatus::Processing => "processing",
            SessionStatus::Complete => "complete",
            SessionStatus::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress band `[start, end)` allotted to each phase, in percent.
pub const DECODE_BAND: (u8, u8) = (0, 10);
pub const PROCESSING_BAND: (u8, u8) = (10, 95);
pub const FINALIZE_BAND: (u8, u8) = (95, 100);

/// Rescale `done / total` into `band`.
pub fn banded_progress(band: (u8, u8), done: usize, total: usize) -> u8 {
    let (lo, hi) = band;
    if total == 0 {
        return lo;
    }
    let frac = done.min(total) as f64 / total as f64;
    lo + ((hi - lo) as f64 * frac).floor() as u8
}

#[derive(Debug, Clone)]
struct SessionState {
    status: SessionStatus,
    progress: u8,
    stage: String,
    first_chunk_url: Option<String>,
    url: Option<String>,
    error: Option<String>,
    chunks_done: usize,
    chunks_total: usize,
    finished_at: Option<Instant>,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub track_id: String,
    pub status: SessionStatus,
    pub progress: u8,
    pub stage: String,
    pub first_chunk_ready: bool,
    pub first_chunk_url: Option<String>,
    pub url: Option<String>,
    pub error: Option<String>,
    pub chunks_done: usize,
    pub chunks_total: usize,
    pub predictive: bool,
}

/// What [`StreamingSession::mark_first_chunk`] recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstChunk {
    /// First chunk of a foreground session; observers should hear about it.
    Announce,
    /// First chunk of a predictive session, kept quiet until promotion.
    Silent,
    Repeat,
}

/// A predictive session that just moved to the foreground.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    /// First-chunk URL recorded while nobody was listening.
    pub missed_first_chunk: Option<String>,
}

pub struct StreamingSession {
    track_id: String,
    created_at: Instant,
    state: RwLock<SessionState>,
    cancelled: AtomicBool,
    predictive: AtomicBool,
}

impl StreamingSession {
    pub fn new(track_id: impl Into<String>, predictive: bool) -> Self {
        Self {
            track_id: track_id.into(),
            created_at: Instant::now(),
            state: RwLock::new(SessionState {
                status: SessionStatus::Starting,
                progress: 0,
                stage: "starting".to_owned(),
                first_chunk_url: None,
                url: None,
                error: None,
                chunks_done: 0,
                chunks_total: 0,
                finished_at: None,
            }),
            cancelled: AtomicBool::new(false),
            predictive: AtomicBool::new(predictive),
        }
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn status(&self) -> SessionStatus {
        self.state.read().status
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&self, next: SessionStatus, stage: &str) -> Result<()> {
        let mut state = self.state.write();
        self.apply_transition(&mut state, next, stage)
    }

    fn apply_transition(
        &self,
        state: &mut SessionState,
        next: SessionStatus,
        stage: &str,
    ) -> Result<()> {
        if !state.status.can_transition_to(next) {
            return Err(KaraokeError::InvalidTransition {
                from: state.status,
                to: next,
            });
        }
        log::debug!("session {}: {} -> {next}", self.track_id, state.status);
        state.status = next;
        state.stage = stage.to_owned();
        if next.is_terminal() {
            state.finished_at = Some(Instant::now());
        }
        Ok(())
    }

    /// Raise progress to `progress`. Never lowers it. Returns the value now held.
    pub fn set_progress(&self, progress: u8, stage: &str) -> u8 {
        let mut state = self.state.write();
        state.progress = state.progress.max(progress.min(100));
        state.stage = stage.to_owned();
        state.progress
    }

    pub fn set_chunks(&self, done: usize, total: usize) {
        let mut state = self.state.write();
        state.chunks_done = done;
        state.chunks_total = total;
    }

    /// Record the first playable chunk. Checked under the state lock so a
    /// concurrent promotion sees either the URL or the foreground flag.
    pub fn mark_first_chunk(&self, url: &str) -> FirstChunk {
        let mut state = self.state.write();
        if state.first_chunk_url.is_some() {
            return FirstChunk::Repeat;
        }
        state.first_chunk_url = Some(url.to_owned());
        if self.is_predictive() {
            FirstChunk::Silent
        } else {
            FirstChunk::Announce
        }
    }

    pub fn complete(&self, url: &str) -> Result<()> {
        let mut state = self.state.write();
        self.apply_transition(&mut state, SessionStatus::Complete, "complete")?;
        state.progress = 100;
        state.url = Some(url.to_owned());
        Ok(())
    }

    pub fn fail(&self, message: &str) -> Result<()> {
        let mut state = self.state.write();
        self.apply_transition(&mut state, SessionStatus::Error, "error")?;
        state.error = Some(message.to_owned());
        Ok(())
    }

    /// Ask the worker to stop before its next chunk. Returns `false` if the
    /// session already finished.
    pub fn cancel(&self) -> bool {
        if self.status().is_terminal() {
            return false;
        }
        self.cancelled.store(true, Ordering::SeqCst);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Predictive sessions emit no notifications until a client asks for them.
    pub fn is_predictive(&self) -> bool {
        self.predictive.load(Ordering::SeqCst)
    }

    /// Start notifying for a predictive session. `None` if it was already in
    /// the foreground.
    pub fn promote_to_foreground(&self) -> Option<Promotion> {
        let state = self.state.write();
        if !self.predictive.swap(false, Ordering::SeqCst) {
            return None;
        }
        Some(Promotion {
            missed_first_chunk: state.first_chunk_url.clone(),
        })
    }

    pub fn error(&self) -> Option<String> {
        self.state.read().error.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.read();
        SessionSnapshot {
            track_id: self.track_id.clone(),
            status: state.status,
            progress: state.progress,
            stage: state.stage.clone(),
            first_chunk_ready: state.first_chunk_url.is_some(),
            first_chunk_url: state.first_chunk_url.clone(),
            url: state.url.clone(),
            error: state.error.clone(),
            chunks_done: state.chunks_done,
            chunks_total: state.chunks_total,
            predictive: self.is_predictive(),
        }
    }

    fn expired(&self, retention: Duration) -> bool {
        matches!(self.state.read().finished_at, Some(at) if at.elapsed() >= retention)
    }
}

/// Outcome of a foreground [`SessionRegistry::admit`].
pub enum Admission {
    /// A usable session already exists.
    Existing(Arc<StreamingSession>),
    /// A fresh session the caller must drive with the claim.
    Claimed(Arc<StreamingSession>, InFlightGuard),
    /// A fresh session handed to whoever holds the claim on the track.
    Handed(Arc<StreamingSession>),
}

/// Outcome of [`SessionRegistry::adopt`].
pub enum Adoption {
    Drive(Arc<StreamingSession>, InFlightGuard),
    /// Nothing to do. The claim has been released.
    Skip,
}

/// Owner of every live session, with time-boxed retention after a session
/// reaches a terminal state.
///
/// Sessions share one lock with the in-flight claims: a session is only
/// created or replaced together with the claim that will drive it, and a
/// driver releases its claim in the same step that finishes the session.
pub struct SessionRegistry {
    in_flight: InFlightSet,
    retention: Duration,
}

impl SessionRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            in_flight: InFlightSet::new(),
            retention,
        }
    }

    pub fn in_flight(&self) -> &InFlightSet {
        &self.in_flight
    }

    /// Foreground entry point. Reuses a live or finished session and replaces
    /// a failed one. A replacement takes the claim when it is free. When the
    /// claim is held, the holder is still running and will pick the new
    /// session up through [`SessionRegistry::adopt`], or fail it on release.
    pub fn admit(&self, track_id: &str) -> Admission {
        let mut ledger = self.in_flight.lock();
        if let Some(existing) = ledger.sessions.get(track_id) {
            if existing.status() != SessionStatus::Error {
                return Admission::Existing(Arc::clone(existing));
            }
        }
        let session = Arc::new(StreamingSession::new(track_id, false));
        ledger
            .sessions
            .insert(track_id.to_owned(), Arc::clone(&session));
        if ledger.try_claim(track_id) {
            drop(ledger);
            let claim = self.in_flight.guard(track_id);
            Admission::Claimed(session, claim)
        } else {
            Admission::Handed(session)
        }
    }

    /// Background entry point for a claim already taken. Adopts a session
    /// handed over while the claim was held, or registers a new predictive
    /// one unless a session exists or `done` reports the track finished.
    pub fn adopt(&self, claim: InFlightGuard, done: impl FnOnce() -> bool) -> Adoption {
        let mut ledger = self.in_flight.lock();
        let track_id = claim.track_id().to_owned();
        let existing = ledger.sessions.get(&track_id).cloned();
        match existing {
            Some(session) if session.status() == SessionStatus::Starting => {
                // Handed over, nobody else will start it.
                drop(ledger);
                return Adoption::Drive(session, claim);
            }
            Some(session) if session.status() != SessionStatus::Error => {
                claim.release_locked(&mut ledger);
                return Adoption::Skip;
            }
            _ => {}
        }
        if done() {
            claim.release_locked(&mut ledger);
            return Adoption::Skip;
        }
        let session = Arc::new(StreamingSession::new(&track_id, true));
        ledger.sessions.insert(track_id, Arc::clone(&session));
        drop(ledger);
        Adoption::Drive(session, claim)
    }

    pub fn get(&self, track_id: &str) -> Option<Arc<StreamingSession>> {
        self.in_flight.lock().sessions.get(track_id).cloned()
    }

    /// Drop terminal sessions older than the retention period, calling
    /// `on_expired` for each before it goes. Runs under the registry lock, so
    /// no replacement session can appear for the same track meanwhile.
    pub fn sweep_expired(&self, mut on_expired: impl FnMut(&StreamingSession)) -> usize {
        let mut ledger = self.in_flight.lock();
        let retention = self.retention;
        let before = ledger.sessions.len();
        ledger.sessions.retain(|_, s| {
            if s.expired(retention) {
                on_expired(&**s);
                false
            } else {
                true
            }
        });
        let removed = before - ledger.sessions.len();
        if removed > 0 {
            log::debug!("expired {removed} finished session(s)");
        }
        removed
    }

    /// Sessions not yet in a terminal state.
    pub fn active_count(&self) -> usize {
        self.in_flight
            .lock()
            .sessions
            .values()
            .filter(|s| !s.status().is_terminal())
            .count()
    }
}
