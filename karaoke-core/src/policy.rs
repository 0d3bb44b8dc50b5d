//! Process-wide quality settings with a one-shot GPU fallback.
//!
//! Consumers read an immutable [`QualitySettings`] snapshot by value. The only
//! mutation is [`QualityPolicy::report_device_failure`], which swaps in a
//! downgraded snapshot exactly once no matter how many threads report.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::engine::Device;
use crate::hardware::{HardwareProfile, QualityMode};
use crate::model::metadata::{HTDEMUCS_FT_ID, HTDEMUCS_ID};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualitySettings {
    /// Bumped on every swap so readers can notice a change mid-run.
    pub version: u64,
    pub mode: QualityMode,
    pub model_id: String,
    pub chunk_seconds: f64,
    pub device: Device,
    pub gpu_failed: bool,
    pub failure_reason: Option<String>,
}

impl QualitySettings {
    fn downgraded(&self, reason: &str, fallback_chunk_seconds: f64) -> Self {
        // The fine-tuned bag is four models; far too slow for the CPU.
        let model_id = if self.model_id == HTDEMUCS_FT_ID {
            HTDEMUCS_ID.to_owned()
        } else {
            self.model_id.clone()
        };
        Self {
            version: self.version + 1,
            mode: QualityMode::Fast,
            model_id,
            chunk_seconds: fallback_chunk_seconds,
            device: Device::Cpu,
            gpu_failed: true,
            failure_reason: Some(reason.to_owned()),
        }
    }
}

pub struct QualityPolicy {
    current: ArcSwap<QualitySettings>,
    fallback_chunk_seconds: f64,
}

impl QualityPolicy {
    pub fn from_profile(
        profile: &HardwareProfile,
        model_override: Option<&str>,
        chunk_override: Option<f64>,
        fallback_chunk_seconds: f64,
    ) -> Self {
        let settings = QualitySettings {
            version: 0,
            mode: profile.mode,
            model_id: model_override.unwrap_or(profile.model_id).to_owned(),
            chunk_seconds: chunk_override.unwrap_or(profile.chunk_seconds),
            device: profile.device(),
            gpu_failed: false,
            failure_reason: None,
        };
        Self {
            current: ArcSwap::from_pointee(settings),
            fallback_chunk_seconds,
        }
    }

    pub fn snapshot(&self) -> Arc<QualitySettings> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    pub fn gpu_failed(&self) -> bool {
        self.current.load().gpu_failed
    }

    /// Downgrade to the CPU after a GPU runtime fault.
    ///
    /// Returns `true` for the single caller whose report was applied. Later
    /// reports, and reports while already on the CPU, change nothing.
    pub fn report_device_failure(&self, reason: &str) -> bool {
        let mut current = self.current.load_full();
        loop {
            if current.gpu_failed || !current.device.is_gpu() {
                return false;
            }
            let next = Arc::new(current.downgraded(reason, self.fallback_chunk_seconds));
            let previous = self.current.compare_and_swap(&current, next);
            if Arc::ptr_eq(&*previous, &current) {
                log::warn!(
                    "GPU failure on {}, falling back to cpu (chunk {}s): {reason}",
                    current.device,
                    self.fallback_chunk_seconds
                );
                return true;
            }
            current = arc_swap::Guard::into_inner(previous);
        }
    }
}
