//! Listener for observing the chunk pipeline.
//!
//! The pipeline reports each window it starts and finishes. Listeners that
//! want progressive output ask for it, so the normalized prefix is only built
//! when someone will use it.

use crate::audio::StereoBuffer;
use crate::dsp::ChunkWindow;
use crate::error::Result;

/// Events emitted while a track is processed.
#[derive(Debug)]
pub enum PipelineEvent<'a> {
    /// A window was handed to the pool.
    ChunkStarted { window: ChunkWindow, total: usize },

    /// A window was accumulated. `prefix` is the normalized estimate of
    /// `[0, window.end)` when the listener asked for progressive output.
    ChunkDone {
        window: ChunkWindow,
        completed: usize,
        total: usize,
        prefix: Option<&'a StereoBuffer>,
    },

    /// The remaining windows were re-planned after the quality policy changed.
    Replanned {
        from_index: usize,
        chunk_seconds: f64,
        total: usize,
    },
}

/// Trait for observing the pipeline. Returning an error aborts the run.
pub trait PipelineListener {
    fn on_event(&mut self, event: PipelineEvent<'_>) -> Result<()>;

    /// Return `true` to receive the running prefix in `ChunkDone`.
    fn wants_progressive(&self) -> bool {
        false
    }

    /// Checked between windows, never during one.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// No-op listener.
pub struct NoOpListener;

impl PipelineListener for NoOpListener {
    #[inline(always)]
    fn on_event(&mut self, _event: PipelineEvent<'_>) -> Result<()> {
        Ok(())
    }
}
