//! Streaming vocal removal.
//!
//! A track is decoded to 44.1 kHz stereo PCM, split into overlapping windows,
//! each window is run through a pooled separation engine, and the instrumental
//! result is crossfaded back together. After every window the best estimate of
//! the track so far is published, so a listener can start playback long before
//! the whole track has been processed.

pub mod audio;
pub mod cache;
pub mod codec;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod events;
pub mod hardware;
pub mod inflight;
pub mod listener;
pub mod model;
pub mod pipeline;
pub mod policy;
pub mod pool;
pub mod process;
pub mod scheduler;
pub mod service;
pub mod session;

mod worker;

pub use audio::StereoBuffer;
pub use config::ServiceConfig;
pub use error::{KaraokeError, Result};
pub use service::KaraokeService;

/// Sample rate every decoded track is normalized to.
pub const SAMPLE_RATE: u32 = 44100;

pub(crate) const AUDIO_CHANNELS: u16 = 2;
