//! Seam to the external separation engine.
//!
//! The engine maps a stereo waveform to isolated stems. It is expensive, may be
//! bound to a GPU, and occasionally fails with a hardware-specific error that
//! the pool answers by falling back to the CPU.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::StereoBuffer;
use crate::model::Stem;

pub mod command;

/// Compute device a model instance is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cuda,
    Metal,
    Cpu,
}

impl Device {
    /// Name understood by the separation tool's `--device` flag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::Metal => "mps",
            Device::Cpu => "cpu",
        }
    }

    pub fn is_gpu(&self) -> bool {
        !matches!(self, Device::Cpu)
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Some(Device::Cuda),
            "mps" | "metal" => Some(Device::Metal),
            "cpu" => Some(Device::Cpu),
            _ => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Hardware/runtime fault; retried once on the CPU.
    #[error("{0}")]
    Device(String),
    /// Any other failure; never retried.
    #[error("{0}")]
    Failed(String),
}

impl EngineError {
    /// Classify a raw failure message from an engine running on `device`.
    ///
    /// Only GPU-bound instances can raise a device failure.
    pub fn classify(message: impl Into<String>, device: Device) -> Self {
        let message = message.into();
        if device.is_gpu() && is_device_failure(&message) {
            EngineError::Device(message)
        } else {
            EngineError::Failed(message)
        }
    }

    pub fn is_device(&self) -> bool {
        matches!(self, EngineError::Device(_))
    }
}

/// Lowercased substrings that identify a GPU runtime fault.
pub const DEVICE_FAILURE_SIGNATURES: &[&str] = &[
    "cuda",
    "no kernel image",
    "cudnn",
    "cublas",
    "mps backend",
    "metal",
    "device-side assert",
    "out of memory",
];

pub fn is_device_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    DEVICE_FAILURE_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

/// A loaded model instance. At most one `separate` call runs on an instance at a time.
pub trait SeparationEngine: Send {
    fn device(&self) -> Device;

    fn model_id(&self) -> &str;

    fn separate(
        &mut self,
        waveform: &StereoBuffer,
        sample_rate: u32,
    ) -> Result<Vec<Stem>, EngineError>;
}

/// Loads model instances onto a device.
pub trait EngineLoader: Send + Sync {
    fn load(&self, model_id: &str, device: Device)
        -> Result<Box<dyn SeparationEngine>, EngineError>;
}
