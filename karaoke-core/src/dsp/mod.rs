pub mod chunk;

pub use chunk::{fade_weights, ChunkPlan, ChunkWindow, OverlapAdd};

/// Floor on the normalizing weight. Interior samples always carry weight one.
pub const WEIGHT_EPSILON: f32 = 1e-8;

/// Number of samples spanned by `seconds` at `sample_rate`.
pub fn secs_to_samples(seconds: f64, sample_rate: u32) -> usize {
    if seconds <= 0.0 {
        return 0;
    }
    (seconds * sample_rate as f64).round() as usize
}
