//! In-process fakes for the separation engine and the transcoder.
#![allow(dead_code)]

use std::f32::consts::PI;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use karaoke_core::codec::{AudioCodec, DecodedAudio, MediaSource};
use karaoke_core::engine::{Device, EngineError, EngineLoader, SeparationEngine};
use karaoke_core::events::SessionEvent;
use karaoke_core::hardware::{HardwareFacts, HardwareProfile};
use karaoke_core::model::{Stem, StemId};
use karaoke_core::{KaraokeError, KaraokeService, Result, ServiceConfig, StereoBuffer};
use parking_lot::Mutex;

pub const TEST_RATE: u32 = 8000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn make_stereo_signal(seconds: f64, sample_rate: u32) -> StereoBuffer {
    let n = (seconds * sample_rate as f64).round() as usize;
    let sr = sample_rate as f32;
    let left = (0..n)
        .map(|i| 0.5 * (2.0 * PI * 220.0 * i as f32 / sr).sin())
        .collect();
    let right = (0..n)
        .map(|i| 0.3 * (2.0 * PI * 330.0 * i as f32 / sr).sin())
        .collect();
    StereoBuffer::new(left, right)
}

/// Shared counters and failure injection for [`FakeLoader`] engines.
#[derive(Default)]
pub struct EngineStats {
    pub loads: Mutex<Vec<Device>>,
    pub calls: Mutex<Vec<Device>>,
    /// Fail the n-th call (1-based) with a CUDA error if it runs on a GPU.
    pub fail_gpu_on_call: Mutex<Option<usize>>,
    pub delay: Mutex<Duration>,
}

impl EngineStats {
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

/// Returns the input as the `other` stem and a loud `vocals` stem, so a
/// correct instrumental mix equals the input.
pub struct FakeEngine {
    device: Device,
    model_id: String,
    stats: Arc<EngineStats>,
}

impl SeparationEngine for FakeEngine {
    fn device(&self) -> Device {
        self.device
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn separate(
        &mut self,
        waveform: &StereoBuffer,
        _sample_rate: u32,
    ) -> std::result::Result<Vec<Stem>, EngineError> {
        let delay = *self.stats.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let call = {
            let mut calls = self.stats.calls.lock();
            calls.push(self.device);
            calls.len()
        };
        if self.device.is_gpu() && *self.stats.fail_gpu_on_call.lock() == Some(call) {
            return Err(EngineError::classify(
                "RuntimeError: CUDA error: no kernel image is available for execution on the device",
                self.device,
            ));
        }
        Ok(vec![
            Stem {
                id: StemId::Other,
                audio: waveform.clone(),
            },
            Stem {
                id: StemId::Vocals,
                audio: StereoBuffer::new(vec![1.0; waveform.len()], vec![1.0; waveform.len()]),
            },
        ])
    }
}

pub struct FakeLoader {
    pub stats: Arc<EngineStats>,
}

impl EngineLoader for FakeLoader {
    fn load(
        &self,
        model_id: &str,
        device: Device,
    ) -> std::result::Result<Box<dyn SeparationEngine>, EngineError> {
        self.stats.loads.lock().push(device);
        Ok(Box::new(FakeEngine {
            device,
            model_id: model_id.to_owned(),
            stats: Arc::clone(&self.stats),
        }))
    }
}

/// `fake://{seconds}` decodes to a synthetic signal, `fake://fail` fails,
/// raw bytes are interleaved little-endian f32. Encoding produces the same
/// raw format.
#[derive(Default)]
pub struct FakeCodec {
    pub decodes: AtomicUsize,
    pub encodes: AtomicUsize,
}

impl AudioCodec for FakeCodec {
    fn decode(
        &self,
        source: &MediaSource,
        _max_duration_seconds: Option<f64>,
    ) -> Result<DecodedAudio> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        let audio = match source {
            MediaSource::Url(url) => {
                let spec = url.strip_prefix("fake://").unwrap_or(url);
                let seconds: f64 = spec
                    .parse()
                    .map_err(|_| KaraokeError::Decode(format!("cannot open {url}")))?;
                make_stereo_signal(seconds, TEST_RATE)
            }
            MediaSource::Bytes { data, .. } => decode_raw(data),
        };
        Ok(DecodedAudio {
            audio,
            sample_rate: TEST_RATE,
        })
    }

    fn encode(&self, audio: &StereoBuffer, _sample_rate: u32) -> Result<Vec<u8>> {
        self.encodes.fetch_add(1, Ordering::SeqCst);
        Ok(encode_raw(audio))
    }

    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }

    fn extension(&self) -> &'static str {
        "raw"
    }
}

pub fn encode_raw(audio: &StereoBuffer) -> Vec<u8> {
    audio
        .to_interleaved()
        .iter()
        .flat_map(|s| s.to_le_bytes())
        .collect()
}

pub fn decode_raw(bytes: &[u8]) -> StereoBuffer {
    let samples: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    StereoBuffer::from_interleaved(&samples, 2)
}

pub fn test_config(root: &Path) -> ServiceConfig {
    ServiceConfig {
        chunk_seconds: Some(10.0),
        overlap_seconds: 0.5,
        fallback_chunk_seconds: 10.0,
        benchmark: false,
        wait_poll_ms: 10,
        wait_timeout_secs: 20,
        session_retention_secs: 600,
        ..ServiceConfig::with_root(root)
    }
}

pub fn cpu_profile() -> HardwareProfile {
    HardwareProfile::from_facts(HardwareFacts::cpu_only(8192, 4))
}

pub fn cuda_profile() -> HardwareProfile {
    HardwareProfile::from_facts(HardwareFacts {
        device: Device::Cuda,
        gpu_name: Some("Fake GPU".into()),
        vram_mb: Some(4096),
        ram_mb: 16384,
        cpu_cores: 8,
    })
}

pub struct Harness {
    pub service: KaraokeService,
    pub stats: Arc<EngineStats>,
    pub codec: Arc<FakeCodec>,
    pub dir: tempfile::TempDir,
}

pub fn harness(profile: HardwareProfile, tweak: impl FnOnce(&mut ServiceConfig)) -> Harness {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);
    let stats = Arc::new(EngineStats::default());
    let codec = Arc::new(FakeCodec::default());
    let service = KaraokeService::new(
        config,
        profile,
        Arc::new(FakeLoader {
            stats: Arc::clone(&stats),
        }),
        codec.clone(),
    )
    .unwrap();
    Harness {
        service,
        stats,
        codec,
        dir,
    }
}

/// Collect events for `track_id` until it completes or fails.
pub fn events_until_done(rx: &Receiver<SessionEvent>, track_id: &str) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    loop {
        let event = rx
            .recv_timeout(Duration::from_secs(20))
            .expect("timed out waiting for session events");
        if event.track_id() != track_id {
            continue;
        }
        let done = matches!(
            event,
            SessionEvent::Complete { .. } | SessionEvent::Error { .. }
        );
        out.push(event);
        if done {
            return out;
        }
    }
}
