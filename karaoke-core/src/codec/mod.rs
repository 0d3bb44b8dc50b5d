//! Seam to the external transcoder: arbitrary media in, canonical PCM out,
//! and PCM back to a compressed serving format.

use crate::audio::StereoBuffer;
use crate::error::Result;

pub mod ffmpeg;

/// Where the source media comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    /// Anything the transcoder can open directly (http(s), file paths).
    Url(String),
    /// Raw container bytes, with the content type if the client sent one.
    Bytes {
        data: Vec<u8>,
        content_type: Option<String>,
    },
}

impl MediaSource {
    /// Short description for logs; never includes payload bytes.
    pub fn describe(&self) -> String {
        match self {
            MediaSource::Url(url) => {
                let shown: String = url.chars().take(60).collect();
                if shown.len() < url.len() {
                    format!("{shown}...")
                } else {
                    shown
                }
            }
            MediaSource::Bytes { data, content_type } => format!(
                "{} bytes ({})",
                data.len(),
                content_type.as_deref().unwrap_or("unknown type")
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub audio: StereoBuffer,
    pub sample_rate: u32,
}

pub trait AudioCodec: Send + Sync {
    /// Decode to stereo PCM, keeping at most `max_duration_seconds` if given.
    fn decode(&self, source: &MediaSource, max_duration_seconds: Option<f64>)
        -> Result<DecodedAudio>;

    /// Encode PCM to the serving format.
    fn encode(&self, audio: &StereoBuffer, sample_rate: u32) -> Result<Vec<u8>>;

    /// MIME type of what `encode` produces.
    fn content_type(&self) -> &'static str {
        "audio/mpeg"
    }

    /// File extension of what `encode` produces.
    fn extension(&self) -> &'static str {
        "mp3"
    }
}
