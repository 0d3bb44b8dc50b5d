use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::audio::StereoBuffer;
use crate::dsp::{secs_to_samples, ChunkPlan, ChunkWindow, OverlapAdd};
use crate::error::{KaraokeError, Result};
use crate::listener::{PipelineEvent, PipelineListener};
use crate::pool::ModelInstancePool;

/// Windowed separation of a whole track through the instance pool.
///
/// Pipeline:
/// 1. Plan overlapping windows from the current chunk duration
/// 2. For each window: pad, separate on a pooled instance, trim
/// 3. Crossfade into the overlap-add accumulator
/// 4. Report the normalized prefix `[0, end)` to the listener
/// 5. If the quality policy changed, re-plan the remaining windows
pub struct ChunkPipeline {
    pool: Arc<ModelInstancePool>,
    overlap_seconds: f64,
}

impl ChunkPipeline {
    pub fn new(pool: Arc<ModelInstancePool>, overlap_seconds: f64) -> Self {
        Self {
            pool,
            overlap_seconds,
        }
    }

    pub fn pool(&self) -> &Arc<ModelInstancePool> {
        &self.pool
    }

    /// Windows a track of `total` samples would be split into right now.
    pub fn plan(&self, total: usize, sample_rate: u32) -> ChunkPlan {
        let settings = self.pool.policy().snapshot();
        ChunkPlan::new(total, sample_rate, settings.chunk_seconds, self.overlap_seconds)
    }

    /// Process `audio` and return the reconstructed instrumental, exactly as
    /// long as the input.
    pub fn run(
        &self,
        audio: &StereoBuffer,
        sample_rate: u32,
        listener: &mut dyn PipelineListener,
    ) -> Result<StereoBuffer> {
        if audio.is_empty() {
            return Err(KaraokeError::Decode("no audio samples to process".into()));
        }
        let policy = self.pool.policy();
        let total = audio.len();

        let mut version = policy.version();
        let plan = self.plan(total, sample_rate);
        let overlap = plan.overlap_samples();
        let mut chunk_len = plan.chunk_samples();
        let mut windows: VecDeque<ChunkWindow> = plan.windows().iter().copied().collect();
        let mut total_chunks = plan.len();
        let mut ola = OverlapAdd::new(total, overlap);
        let mut completed = 0;
        let started = Instant::now();

        log::debug!(
            "processing {:.1}s in {total_chunks} chunk(s) of {chunk_len} samples",
            audio.duration_seconds(sample_rate)
        );

        while let Some(window) = windows.pop_front() {
            if listener.is_cancelled() {
                log::info!("cancelled before chunk {}/{total_chunks}", window.index + 1);
                return Err(KaraokeError::Cancelled);
            }
            listener.on_event(PipelineEvent::ChunkStarted {
                window,
                total: total_chunks,
            })?;

            let input = audio
                .slice(window.start..window.end)
                .padded_to(chunk_len);
            let mut processed = self.pool.separate_chunk(&input, sample_rate)?;
            processed.truncate(window.len());
            ola.accumulate(&window, &processed);
            completed += 1;

            // A fallback during this chunk needs the rest re-planned before
            // the listener sees the new total.
            let settings = policy.snapshot();
            if settings.version != version && !window.is_last {
                version = settings.version;
                chunk_len = secs_to_samples(settings.chunk_seconds, sample_rate).max(overlap + 1);
                let rest = ChunkPlan::starting_at(
                    total,
                    chunk_len,
                    overlap,
                    window.end - overlap,
                    window.index + 1,
                );
                windows = rest.windows().iter().copied().collect();
                total_chunks = completed + windows.len();
                log::info!(
                    "re-planned remaining audio into {} chunk(s) of {}s",
                    windows.len(),
                    settings.chunk_seconds
                );
                listener.on_event(PipelineEvent::Replanned {
                    from_index: window.index + 1,
                    chunk_seconds: settings.chunk_seconds,
                    total: total_chunks,
                })?;
            }

            let prefix = listener
                .wants_progressive()
                .then(|| ola.normalized_prefix(window.end));
            listener.on_event(PipelineEvent::ChunkDone {
                window,
                completed,
                total: total_chunks,
                prefix: prefix.as_ref(),
            })?;
        }

        log::debug!(
            "{completed} chunk(s) done in {:.2}s",
            started.elapsed().as_secs_f64()
        );
        Ok(ola.finish())
    }
}
