//! Hardware facts and the processing defaults derived from them.
//!
//! Probing itself lives outside the core (the server binary implements
//! [`HardwareDetector`] on top of system APIs); this module only turns the
//! facts into a [`HardwareProfile`] once at startup.

use serde::Serialize;

use crate::engine::Device;
use crate::model::metadata::{HTDEMUCS_FT_ID, HTDEMUCS_ID};

/// VRAM needed to run the fine-tuned model and a second instance.
const LARGE_GPU_VRAM_MB: u64 = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardwareFacts {
    pub device: Device,
    pub gpu_name: Option<String>,
    pub vram_mb: Option<u64>,
    pub ram_mb: u64,
    pub cpu_cores: usize,
}

impl HardwareFacts {
    pub fn cpu_only(ram_mb: u64, cpu_cores: usize) -> Self {
        Self {
            device: Device::Cpu,
            gpu_name: None,
            vram_mb: None,
            ram_mb,
            cpu_cores,
        }
    }
}

pub trait HardwareDetector: Send + Sync {
    fn detect(&self) -> HardwareFacts;
}

/// Returns fixed facts. Used for forced devices and in tests.
pub struct StaticDetector(pub HardwareFacts);

impl HardwareDetector for StaticDetector {
    fn detect(&self) -> HardwareFacts {
        self.0.clone()
    }
}

/// Named quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityMode {
    Ultra,
    High,
    Fast,
}

impl QualityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityMode::Ultra => "ultra",
            QualityMode::High => "high",
            QualityMode::Fast => "fast",
        }
    }
}

/// Process-wide startup profile. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardwareProfile {
    pub facts: HardwareFacts,
    pub mode: QualityMode,
    pub model_id: &'static str,
    pub chunk_seconds: f64,
    pub instances: usize,
    /// Estimated processing-time / audio-time before any benchmark.
    pub estimated_rtf: f64,
}

impl HardwareProfile {
    pub fn from_facts(facts: HardwareFacts) -> Self {
        let (mode, model_id, chunk_seconds, instances, estimated_rtf) = match facts.device {
            Device::Cuda if facts.vram_mb.unwrap_or(0) >= LARGE_GPU_VRAM_MB => {
                (QualityMode::Ultra, HTDEMUCS_FT_ID, 10.0, 2, 0.2)
            }
            Device::Cuda => (QualityMode::High, HTDEMUCS_ID, 10.0, 1, 0.15),
            Device::Metal => (QualityMode::High, HTDEMUCS_ID, 8.0, 1, 0.35),
            Device::Cpu => {
                let instances = (facts.cpu_cores / 4).clamp(1, 2);
                (QualityMode::Fast, HTDEMUCS_ID, 5.0, instances, 1.5)
            }
        };
        Self {
            facts,
            mode,
            model_id,
            chunk_seconds,
            instances,
            estimated_rtf,
        }
    }

    pub fn detect(detector: &dyn HardwareDetector) -> Self {
        let profile = Self::from_facts(detector.detect());
        log::info!(
            "hardware: {} ({}), {} MB RAM, {} cores -> mode={} model={} chunk={}s instances={}",
            profile.facts.device,
            profile.facts.gpu_name.as_deref().unwrap_or("no gpu"),
            profile.facts.ram_mb,
            profile.facts.cpu_cores,
            profile.mode.as_str(),
            profile.model_id,
            profile.chunk_seconds,
            profile.instances,
        );
        profile
    }

    pub fn device(&self) -> Device {
        self.facts.device
    }
}
