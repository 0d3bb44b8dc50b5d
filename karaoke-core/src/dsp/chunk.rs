use crate::audio::StereoBuffer;

use super::{secs_to_samples, WEIGHT_EPSILON};

/// One window `[start, end)` of the source track.
///
/// Every window except the last spans the full chunk length. The last one may
/// be shorter; it is zero-padded before separation and trimmed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWindow {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub is_first: bool,
    pub is_last: bool,
}

impl ChunkWindow {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Ordered windows covering `[0, total)`, where consecutive windows overlap by
/// exactly `overlap` samples.
///
/// ```text
///   |<------ chunk ------>|
///   [=========0=========]
///                   [=========1=========]
///                   |ovl|           [======2======]
///   |<---- hop ---->|
/// ```
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    total: usize,
    chunk: usize,
    overlap: usize,
    windows: Vec<ChunkWindow>,
}

impl ChunkPlan {
    pub fn new(total: usize, sample_rate: u32, chunk_seconds: f64, overlap_seconds: f64) -> Self {
        Self::from_samples(
            total,
            secs_to_samples(chunk_seconds, sample_rate),
            secs_to_samples(overlap_seconds, sample_rate),
        )
    }

    pub fn from_samples(total: usize, chunk: usize, overlap: usize) -> Self {
        Self::starting_at(total, chunk, overlap, 0, 0)
    }

    /// Plan the windows that remain from `start`, numbering them from
    /// `first_index`. Used to re-plan the rest of a track after the chunk
    /// length changes mid-run.
    pub fn starting_at(
        total: usize,
        chunk: usize,
        overlap: usize,
        start: usize,
        first_index: usize,
    ) -> Self {
        let chunk = chunk.max(1);
        let overlap = overlap.min(chunk - 1);

        let mut windows = Vec::new();
        let mut start = start.min(total);
        let mut index = first_index;
        loop {
            let end = (start + chunk).min(total);
            let is_last = end >= total;
            windows.push(ChunkWindow {
                index,
                start,
                end,
                is_first: index == 0,
                is_last,
            });
            if is_last {
                break;
            }
            start = end - overlap;
            index += 1;
        }

        Self {
            total,
            chunk,
            overlap,
            windows,
        }
    }

    /// `ceil((total - overlap) / hop)`, at least one.
    pub fn expected_count(total: usize, chunk: usize, overlap: usize) -> usize {
        let chunk = chunk.max(1);
        let overlap = overlap.min(chunk - 1);
        let hop = chunk - overlap;
        if total <= overlap {
            return 1;
        }
        (total - overlap).div_ceil(hop).max(1)
    }

    pub fn windows(&self) -> &[ChunkWindow] {
        &self.windows
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn chunk_samples(&self) -> usize {
        self.chunk
    }

    pub fn overlap_samples(&self) -> usize {
        self.overlap
    }
}

/// Per-sample crossfade weight for a window of `len` samples.
///
/// The leading `min(overlap, len)` samples ramp up unless this is the first
/// window, the trailing ones ramp down unless it is the last. Ramps are
/// `(j + 1) / (fade + 1)`, so the weights of two neighbours sum to one across
/// their shared region and never reach zero.
pub fn fade_weights(len: usize, overlap: usize, is_first: bool, is_last: bool) -> Vec<f32> {
    let mut weights = vec![1.0f32; len];
    let fade = overlap.min(len);
    if fade == 0 {
        return weights;
    }
    let denom = (fade + 1) as f32;
    if !is_first {
        for (j, w) in weights.iter_mut().take(fade).enumerate() {
            *w *= (j + 1) as f32 / denom;
        }
    }
    if !is_last {
        let offset = len - fade;
        for (j, w) in weights[offset..].iter_mut().enumerate() {
            *w *= (fade - j) as f32 / denom;
        }
    }
    weights
}

/// Weighted overlap-add accumulator for a whole track.
pub struct OverlapAdd {
    output: StereoBuffer,
    weights: Vec<f32>,
    overlap: usize,
}

impl OverlapAdd {
    pub fn new(total: usize, overlap: usize) -> Self {
        Self {
            output: StereoBuffer::silent(total),
            weights: vec![0.0; total],
            overlap,
        }
    }

    /// Add a processed window at its absolute offset. `processed` may be
    /// longer than the window (padding); the excess is ignored.
    pub fn accumulate(&mut self, window: &ChunkWindow, processed: &StereoBuffer) {
        let end = window.end.min(self.weights.len());
        let len = end.saturating_sub(window.start).min(processed.len());
        let curve = fade_weights(len, self.overlap, window.is_first, window.is_last);
        for (j, w) in curve.iter().enumerate() {
            let at = window.start + j;
            self.output.left[at] += processed.left[j] * w;
            self.output.right[at] += processed.right[j] * w;
            self.weights[at] += w;
        }
    }

    /// Normalized estimate of `[0, end)`.
    pub fn normalized_prefix(&self, end: usize) -> StereoBuffer {
        let end = end.min(self.weights.len());
        let mut left = Vec::with_capacity(end);
        let mut right = Vec::with_capacity(end);
        for i in 0..end {
            let w = self.weights[i].max(WEIGHT_EPSILON);
            left.push(self.output.left[i] / w);
            right.push(self.output.right[i] / w);
        }
        StereoBuffer { left, right }
    }

    pub fn weight_sum(&self) -> &[f32] {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn finish(self) -> StereoBuffer {
        self.normalized_prefix(self.weights.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 1000;

    #[test]
    fn sixty_seconds_in_ten_second_chunks_is_seven_windows() {
        let plan = ChunkPlan::new(60 * SR as usize, SR, 10.0, 0.5);
        assert_eq!(plan.len(), 7);
        assert_eq!(ChunkPlan::expected_count(60_000, 10_000, 500), 7);

        let w = plan.windows();
        assert_eq!((w[0].start, w[0].end), (0, 10_000));
        assert_eq!((w[1].start, w[1].end), (9_500, 19_500));
        assert_eq!((w[6].start, w[6].end), (57_000, 60_000));
        assert!(w[0].is_first && !w[0].is_last);
        assert!(w[6].is_last && !w[6].is_first);
    }

    #[test]
    fn consecutive_windows_overlap_exactly() {
        let plan = ChunkPlan::from_samples(12_345, 1_000, 100);
        for pair in plan.windows().windows(2) {
            assert_eq!(pair[0].end - pair[1].start, 100);
        }
        assert_eq!(plan.windows().last().unwrap().end, 12_345);
        assert_eq!(
            plan.len(),
            ChunkPlan::expected_count(12_345, 1_000, 100)
        );
    }

    #[test]
    fn short_track_is_a_single_window() {
        let plan = ChunkPlan::from_samples(300, 1_000, 500);
        assert_eq!(plan.len(), 1);
        let w = plan.windows()[0];
        assert!(w.is_first && w.is_last);
        assert_eq!(w.len(), 300);
    }

    #[test]
    fn overlap_is_clamped_below_chunk_length() {
        let plan = ChunkPlan::from_samples(50, 10, 40);
        assert_eq!(plan.overlap_samples(), 9);
        assert_eq!(plan.len(), ChunkPlan::expected_count(50, 10, 40));
    }

    #[test]
    fn single_window_has_unit_weight() {
        assert!(fade_weights(64, 16, true, true).iter().all(|&w| w == 1.0));
    }

    #[test]
    fn fade_is_clamped_to_window_length() {
        let w = fade_weights(3, 10, false, true);
        assert_eq!(w.len(), 3);
        assert!(w.iter().all(|&x| x > 0.0 && x < 1.0));
    }

    #[test]
    fn neighbouring_ramps_sum_to_one() {
        let overlap = 8;
        let out = fade_weights(32, overlap, true, false);
        let inc = fade_weights(32, overlap, false, true);
        for j in 0..overlap {
            let sum = out[32 - overlap + j] + inc[j];
            assert!((sum - 1.0).abs() < 1e-6, "j={j} sum={sum}");
        }
    }

    #[test]
    fn constant_signal_reconstructs_exactly() {
        let total = 5_000;
        let plan = ChunkPlan::from_samples(total, 1_200, 150);
        let mut ola = OverlapAdd::new(total, plan.overlap_samples());
        for w in plan.windows() {
            let chunk = StereoBuffer::new(
                vec![0.5; plan.chunk_samples()],
                vec![-0.5; plan.chunk_samples()],
            );
            ola.accumulate(w, &chunk);
        }
        assert!(ola.weight_sum().iter().all(|&w| w > 0.0));
        let out = ola.finish();
        assert_eq!(out.len(), total);
        assert!(out.left.iter().all(|&s| (s - 0.5).abs() < 1e-5));
        assert!(out.right.iter().all(|&s| (s + 0.5).abs() < 1e-5));
    }

    #[test]
    fn replanning_continues_from_next_window_start() {
        let head = ChunkPlan::from_samples(10_000, 2_000, 200);
        let first = head.windows()[0];
        let rest = ChunkPlan::starting_at(10_000, 1_000, 200, first.end - 200, 1);
        let w = rest.windows();
        assert_eq!(w[0].start, 1_800);
        assert_eq!(w[0].index, 1);
        assert!(!w[0].is_first);
        assert_eq!(w.last().unwrap().end, 10_000);
    }
}
