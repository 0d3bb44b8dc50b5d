pub mod metadata;

pub use metadata::{find_model, ModelInfo, Stem, StemId, ALL_MODELS};

use crate::audio::StereoBuffer;

/// Sum every non-vocal stem into an instrumental of exactly `n_samples`.
///
/// Stems shorter than `n_samples` contribute silence past their end; longer
/// stems are cut.
pub fn instrumental_mix(stems: &[Stem], n_samples: usize) -> StereoBuffer {
    let mut out = StereoBuffer::silent(n_samples);
    for stem in stems.iter().filter(|s| s.id != StemId::Vocals) {
        out.mix_in(&stem.audio);
    }
    out
}
