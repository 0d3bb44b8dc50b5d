use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::session::StreamingSession;

const ABANDONED: &str = "processing abandoned";

/// Live sessions and in-flight claims, kept under one lock so a claim and the
/// session it drives always change together.
#[derive(Default)]
pub(crate) struct Ledger {
    pub(crate) sessions: HashMap<String, Arc<StreamingSession>>,
    claims: HashSet<String>,
}

impl Ledger {
    pub(crate) fn try_claim(&mut self, track_id: &str) -> bool {
        self.claims.insert(track_id.to_owned())
    }

    /// Drop the claim on `track_id`. With `abandon`, a session still waiting
    /// for this holder is failed so the next request can replace it.
    fn release(&mut self, track_id: &str, abandon: bool) {
        self.claims.remove(track_id);
        if !abandon {
            return;
        }
        if let Some(session) = self.sessions.get(track_id) {
            if !session.status().is_terminal() && session.fail(ABANDONED).is_ok() {
                log::warn!("session {track_id}: claim dropped without finishing");
            }
        }
    }
}

/// Track ids currently being processed by a foreground session or the
/// predictive worker.
#[derive(Clone, Default)]
pub struct InFlightSet {
    ledger: Arc<Mutex<Ledger>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `track_id`. `None` if someone else holds it.
    pub fn try_claim(&self, track_id: &str) -> Option<InFlightGuard> {
        if !self.ledger.lock().try_claim(track_id) {
            return None;
        }
        Some(self.guard(track_id))
    }

    pub fn contains(&self, track_id: &str) -> bool {
        self.ledger.lock().claims.contains(track_id)
    }

    pub fn is_empty(&self) -> bool {
        self.ledger.lock().claims.is_empty()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock()
    }

    /// Guard for a claim already recorded in the ledger.
    pub(crate) fn guard(&self, track_id: &str) -> InFlightGuard {
        InFlightGuard {
            set: self.clone(),
            track_id: track_id.to_owned(),
            released: false,
        }
    }
}

/// Releases the claim on drop, including on error and unwind. A guard dropped
/// without [`InFlightGuard::release_with`] fails the session it was driving.
pub struct InFlightGuard {
    set: InFlightSet,
    track_id: String,
    released: bool,
}

impl InFlightGuard {
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Run `f` and give up the claim in the same critical section.
    pub(crate) fn release_with<T>(mut self, f: impl FnOnce() -> T) -> T {
        let mut ledger = self.set.ledger.lock();
        let out = f();
        ledger.release(&self.track_id, false);
        self.released = true;
        out
    }

    /// Give up the claim while the caller already holds the ledger lock.
    pub(crate) fn release_locked(mut self, ledger: &mut Ledger) {
        ledger.release(&self.track_id, false);
        self.released = true;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.released {
            self.set.ledger.lock().release(&self.track_id, true);
        }
    }
}
