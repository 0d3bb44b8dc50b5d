//! Speculative pre-processing of tracks the client expects to play next.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::inflight::{InFlightGuard, InFlightSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictJob {
    /// Lower runs sooner.
    pub priority: u32,
    pub track_id: String,
    pub url: String,
}

/// What the worker calls back into. Implemented by the service.
pub trait PredictiveRunner: Send + Sync {
    fn is_cached(&self, track_id: &str) -> bool;

    /// Run the full pipeline for `job` under `claim`, which the runner owns
    /// from here on.
    fn run_predictive(&self, job: &PredictJob, claim: InFlightGuard) -> Result<()>;
}

struct Queued {
    seq: u64,
    job: PredictJob,
}

impl Queued {
    fn key(&self) -> (u32, u64) {
        (self.job.priority, self.seq)
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // BinaryHeap is a max-heap; the smallest (priority, seq) must pop first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
    stopped: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Condvar,
}

/// Priority queue drained by a single background worker, one job at a time.
pub struct PredictiveScheduler {
    shared: Arc<Shared>,
    runner: Arc<dyn PredictiveRunner>,
    in_flight: InFlightSet,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PredictiveScheduler {
    pub fn start(runner: Arc<dyn PredictiveRunner>, in_flight: InFlightSet) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            wake: Condvar::new(),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            let runner = Arc::clone(&runner);
            let in_flight = in_flight.clone();
            thread::Builder::new()
                .name("karaoke-predictive".into())
                .spawn(move || worker_loop(&shared, runner.as_ref(), &in_flight))?
        };
        Ok(Self {
            shared,
            runner,
            in_flight,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue `job` unless its track is cached, in flight, or already queued.
    pub fn enqueue(&self, job: PredictJob) -> bool {
        if self.runner.is_cached(&job.track_id) {
            log::debug!("predict skip {}: cached", job.track_id);
            return false;
        }
        if self.in_flight.contains(&job.track_id) {
            log::debug!("predict skip {}: in flight", job.track_id);
            return false;
        }

        let mut state = self.shared.state.lock();
        if state.stopped || state.heap.iter().any(|q| q.job.track_id == job.track_id) {
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        log::info!("predict queued {} (priority {})", job.track_id, job.priority);
        state.heap.push(Queued { seq, job });
        drop(state);
        self.shared.wake.notify_one();
        true
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().heap.is_empty()
    }

    /// Stop the worker after its current job. Queued jobs are dropped.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            state.heap.clear();
        }
        self.shared.wake.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                log::error!("predictive worker panicked");
            }
        }
    }
}

impl Drop for PredictiveScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: &Shared, runner: &dyn PredictiveRunner, in_flight: &InFlightSet) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if state.stopped {
                    return;
                }
                if let Some(next) = state.heap.pop() {
                    break next.job;
                }
                shared.wake.wait(&mut state);
            }
        };

        let Some(claim) = in_flight.try_claim(&job.track_id) else {
            log::debug!("predict skip {}: claimed meanwhile", job.track_id);
            continue;
        };

        log::info!("predictive processing {}", job.track_id);
        match runner.run_predictive(&job, claim) {
            Ok(()) => log::info!("predictive done {}", job.track_id),
            Err(e) => log::warn!("predictive {} failed: {e}", job.track_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use crossbeam_channel::{Receiver, Sender};

    use super::*;
    use crate::error::KaraokeError;

    struct Recorder {
        cached: Mutex<HashSet<String>>,
        ran: Sender<String>,
        gate: Receiver<()>,
        fail: bool,
    }

    impl PredictiveRunner for Recorder {
        fn is_cached(&self, track_id: &str) -> bool {
            self.cached.lock().contains(track_id)
        }

        fn run_predictive(&self, job: &PredictJob, _claim: InFlightGuard) -> Result<()> {
            let _ = self.gate.recv_timeout(Duration::from_secs(5));
            let _ = self.ran.send(job.track_id.clone());
            if self.fail {
                return Err(KaraokeError::Decode("unreachable".into()));
            }
            Ok(())
        }
    }

    fn job(priority: u32, id: &str) -> PredictJob {
        PredictJob {
            priority,
            track_id: id.into(),
            url: format!("https://example.test/{id}"),
        }
    }

    type Fixture = (
        PredictiveScheduler,
        Arc<Recorder>,
        Receiver<String>,
        Sender<()>,
        InFlightSet,
    );

    fn scheduler(fail: bool) -> Fixture {
        let (ran_tx, ran_rx) = crossbeam_channel::unbounded();
        let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
        let runner = Arc::new(Recorder {
            cached: Mutex::new(HashSet::new()),
            ran: ran_tx,
            gate: gate_rx,
            fail,
        });
        let in_flight = InFlightSet::new();
        let s = PredictiveScheduler::start(runner.clone(), in_flight.clone()).unwrap();
        (s, runner, ran_rx, gate_tx, in_flight)
    }

    #[test]
    fn runs_by_priority_then_fifo() {
        let (s, _runner, ran, gate, _) = scheduler(false);
        // The first job blocks on the gate while the rest queue up.
        assert!(s.enqueue(job(5, "blocker")));
        std::thread::sleep(Duration::from_millis(50));
        assert!(s.enqueue(job(2, "b")));
        assert!(s.enqueue(job(1, "a")));
        assert!(s.enqueue(job(2, "c")));
        for _ in 0..4 {
            gate.send(()).unwrap();
        }
        let order: Vec<String> = (0..4)
            .map(|_| ran.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, vec!["blocker", "a", "b", "c"]);
    }

    #[test]
    fn cached_in_flight_and_queued_tracks_are_rejected() {
        let (s, runner, _ran, gate, in_flight) = scheduler(false);
        runner.cached.lock().insert("cached".into());
        assert!(!s.enqueue(job(0, "cached")));

        let _claim = in_flight.try_claim("busy").unwrap();
        assert!(!s.enqueue(job(0, "busy")));

        assert!(s.enqueue(job(0, "blocker")));
        std::thread::sleep(Duration::from_millis(50));
        assert!(s.enqueue(job(1, "x")));
        assert!(!s.enqueue(job(0, "x")));
        assert_eq!(s.len(), 1);
        drop(gate);
    }

    #[test]
    fn failed_job_releases_in_flight() {
        let (s, _runner, ran, gate, in_flight) = scheduler(true);
        assert!(s.enqueue(job(0, "t")));
        gate.send(()).unwrap();
        assert_eq!(ran.recv_timeout(Duration::from_secs(5)).unwrap(), "t");
        s.stop();
        assert!(!in_flight.contains("t"));
    }

    #[test]
    fn stop_wakes_idle_worker_promptly() {
        let (s, _runner, _ran, _gate, _) = scheduler(false);
        let started = std::time::Instant::now();
        s.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!s.enqueue(job(0, "late")));
    }
}
