//! Bounded set of exclusive separation-engine instances.

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::audio::StereoBuffer;
use crate::engine::{Device, EngineError, EngineLoader, SeparationEngine};
use crate::error::Result;
use crate::model::instrumental_mix;
use crate::policy::{QualityPolicy, QualitySettings};
use crate::SAMPLE_RATE;

/// Length of the synthetic benchmark signal.
const BENCHMARK_SECONDS: f64 = 3.0;

/// Weight of the newest live RTF sample in a slot's running estimate.
const RTF_SMOOTHING: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub instances: usize,
    /// Used until a benchmark or live chunk produces a measurement.
    pub baseline_rtf: f64,
    pub benchmark: bool,
}

struct Slot {
    engine: Box<dyn SeparationEngine>,
}

pub struct ModelInstancePool {
    loader: Arc<dyn EngineLoader>,
    policy: Arc<QualityPolicy>,
    slots: Vec<Mutex<Slot>>,
    /// Live RTF estimate per instance. Kept apart from the slots, which stay
    /// locked for the length of a chunk.
    rtf_samples: Mutex<Vec<Option<f64>>>,
    free: Mutex<VecDeque<usize>>,
    available: Condvar,
    baseline_rtf: f64,
}

impl ModelInstancePool {
    /// Load `options.instances` engines on the policy's device, then run the
    /// startup benchmark on instance 0.
    pub fn initialize(
        loader: Arc<dyn EngineLoader>,
        policy: Arc<QualityPolicy>,
        options: PoolOptions,
    ) -> Result<Self> {
        let count = options.instances.max(1);
        let mut pool = Self {
            loader,
            policy,
            slots: Vec::with_capacity(count),
            rtf_samples: Mutex::new(vec![None; count]),
            free: Mutex::new((0..count).collect()),
            available: Condvar::new(),
            baseline_rtf: options.baseline_rtf,
        };

        for i in 0..count {
            let engine = pool.load_current()?;
            log::info!(
                "loaded model instance {}/{count}: {} on {}",
                i + 1,
                engine.model_id(),
                engine.device()
            );
            pool.slots.push(Mutex::new(Slot { engine }));
        }

        if options.benchmark {
            pool.benchmark()?;
        }
        Ok(pool)
    }

    /// Block until an instance is free.
    pub fn acquire(&self) -> PooledInstance<'_> {
        let mut free = self.free.lock();
        let id = loop {
            if let Some(id) = free.pop_front() {
                break id;
            }
            self.available.wait(&mut free);
        };
        drop(free);
        PooledInstance {
            pool: self,
            id,
            slot: Some(self.slots[id].lock()),
        }
    }

    fn release(&self, id: usize) {
        self.free.lock().push_back(id);
        self.available.notify_one();
    }

    /// Separate one chunk and return its instrumental, exactly as long as the
    /// input.
    ///
    /// A device failure downgrades the global policy, moves this instance to
    /// the CPU and retries the chunk there once.
    pub fn separate_chunk(&self, chunk: &StereoBuffer, sample_rate: u32) -> Result<StereoBuffer> {
        let mut instance = self.acquire();
        instance.ensure_current()?;
        match instance.run(chunk, sample_rate) {
            Ok(out) => Ok(out),
            Err(e) if e.is_device() => {
                log::warn!("instance {} hit a device failure: {e}", instance.id());
                self.policy.report_device_failure(&e.to_string());
                instance.ensure_current()?;
                Ok(instance.run(chunk, sample_rate)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mean RTF over instances with a measurement, else the baseline.
    pub fn rtf(&self) -> f64 {
        let samples: Vec<f64> = self.rtf_samples.lock().iter().flatten().copied().collect();
        if samples.is_empty() {
            self.baseline_rtf
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        }
    }

    pub fn estimate_seconds(&self, audio_seconds: f64) -> f64 {
        self.rtf() * audio_seconds
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Instances not currently checked out.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn device(&self) -> Device {
        self.policy.snapshot().device
    }

    pub fn policy(&self) -> &Arc<QualityPolicy> {
        &self.policy
    }

    fn load_current(&self) -> Result<Box<dyn SeparationEngine>> {
        let settings = self.policy.snapshot();
        match self.loader.load(&settings.model_id, settings.device) {
            Ok(engine) => Ok(engine),
            Err(e) if e.is_device() => {
                self.policy.report_device_failure(&e.to_string());
                let settings = self.policy.snapshot();
                Ok(self.loader.load(&settings.model_id, settings.device)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn benchmark(&self) -> Result<()> {
        let signal = synthetic_signal(BENCHMARK_SECONDS);
        let mut instance = self.acquire();
        match instance.run(&signal, SAMPLE_RATE) {
            Ok(_) => {}
            Err(e) if e.is_device() => {
                log::warn!("benchmark hit a device failure: {e}");
                self.policy.report_device_failure(&e.to_string());
                drop(instance);
                self.reload_all()?;
                let mut instance = self.acquire();
                if let Err(e) = instance.run(&signal, SAMPLE_RATE) {
                    log::warn!("cpu benchmark failed, keeping baseline rtf: {e}");
                }
            }
            Err(e) => log::warn!("benchmark failed, keeping baseline rtf: {e}"),
        }
        log::info!("pool ready: {} instance(s), rtf {:.3}", self.len(), self.rtf());
        Ok(())
    }

    fn reload_all(&self) -> Result<()> {
        for _ in 0..self.len() {
            self.acquire().ensure_current()?;
        }
        Ok(())
    }
}

/// Exclusive handle on one instance; returned to the pool on drop.
pub struct PooledInstance<'a> {
    pool: &'a ModelInstancePool,
    id: usize,
    slot: Option<MutexGuard<'a, Slot>>,
}

impl PooledInstance<'_> {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn device(&self) -> Device {
        self.slot().engine.device()
    }

    pub fn model_id(&self) -> String {
        self.slot().engine.model_id().to_owned()
    }

    fn slot(&self) -> &Slot {
        match &self.slot {
            Some(guard) => &**guard,
            None => unreachable!("slot guard is only taken on drop"),
        }
    }

    fn slot_mut(&mut self) -> &mut Slot {
        match &mut self.slot {
            Some(guard) => &mut **guard,
            None => unreachable!("slot guard is only taken on drop"),
        }
    }

    /// Reload this instance if the policy now names another device or model.
    fn ensure_current(&mut self) -> Result<()> {
        let settings: Arc<QualitySettings> = self.pool.policy.snapshot();
        let slot = self.slot();
        if slot.engine.device() == settings.device && slot.engine.model_id() == settings.model_id {
            return Ok(());
        }
        log::info!(
            "moving instance {} to {} on {}",
            self.id,
            settings.model_id,
            settings.device
        );
        let engine = self.pool.load_current()?;
        self.slot_mut().engine = engine;
        self.pool.rtf_samples.lock()[self.id] = None;
        Ok(())
    }

    fn run(
        &mut self,
        chunk: &StereoBuffer,
        sample_rate: u32,
    ) -> std::result::Result<StereoBuffer, EngineError> {
        let started = Instant::now();
        let stems = self.slot_mut().engine.separate(chunk, sample_rate)?;
        let audio_seconds = chunk.duration_seconds(sample_rate);
        if audio_seconds > 0.0 {
            let sample = started.elapsed().as_secs_f64() / audio_seconds;
            let mut samples = self.pool.rtf_samples.lock();
            let rtf = &mut samples[self.id];
            *rtf = Some(match *rtf {
                Some(prev) => prev * (1.0 - RTF_SMOOTHING) + sample * RTF_SMOOTHING,
                None => sample,
            });
        }
        Ok(instrumental_mix(&stems, chunk.len()))
    }
}

impl Drop for PooledInstance<'_> {
    fn drop(&mut self) {
        // Unlock the slot before advertising it as free.
        self.slot.take();
        self.pool.release(self.id);
    }
}

fn synthetic_signal(seconds: f64) -> StereoBuffer {
    let n = (seconds * SAMPLE_RATE as f64) as usize;
    let sr = SAMPLE_RATE as f32;
    let left = (0..n)
        .map(|i| 0.5 * (2.0 * PI * 440.0 * i as f32 / sr).sin())
        .collect();
    let right = (0..n)
        .map(|i| 0.3 * (2.0 * PI * 554.37 * i as f32 / sr).sin())
        .collect();
    StereoBuffer::new(left, right)
}
