use crate::audio::StereoBuffer;

/// Stem identifiers for source separation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StemId {
    Drums,
    Bass,
    Other,
    Vocals,
    Guitar,
    Piano,
}

impl StemId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StemId::Drums => "drums",
            StemId::Bass => "bass",
            StemId::Other => "other",
            StemId::Vocals => "vocals",
            StemId::Guitar => "guitar",
            StemId::Piano => "piano",
        }
    }
}

/// One isolated source returned by the separation engine.
#[derive(Debug, Clone)]
pub struct Stem {
    pub id: StemId,
    pub audio: StereoBuffer,
}

/// Metadata for a separation model variant.
#[derive(Debug)]
pub struct ModelInfo {
    pub id: &'static str,
    pub stems: &'static [StemId],
}

use StemId::*;

pub const HTDEMUCS: ModelInfo = ModelInfo {
    id: HTDEMUCS_ID,
    stems: &[Drums, Bass, Other, Vocals],
};

pub const HTDEMUCS_6S: ModelInfo = ModelInfo {
    id: HTDEMUCS_6S_ID,
    stems: &[Drums, Bass, Other, Vocals, Guitar, Piano],
};

pub const HTDEMUCS_FT: ModelInfo = ModelInfo {
    id: HTDEMUCS_FT_ID,
    stems: &[Drums, Bass, Other, Vocals],
};

pub const ALL_MODELS: &[&ModelInfo] = &[&HTDEMUCS, &HTDEMUCS_6S, &HTDEMUCS_FT];

pub fn find_model(id: &str) -> Option<&'static ModelInfo> {
    ALL_MODELS.iter().find(|m| m.id == id).copied()
}

pub const HTDEMUCS_ID: &str = "htdemucs";
pub const HTDEMUCS_6S_ID: &str = "htdemucs_6s";
pub const HTDEMUCS_FT_ID: &str = "htdemucs_ft";
