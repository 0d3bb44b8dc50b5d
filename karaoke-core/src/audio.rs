use std::ops::Range;
use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::error::{KaraokeError, Result};
use crate::AUDIO_CHANNELS;

/// Planar stereo PCM. Both channels always have the same length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StereoBuffer {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

impl StereoBuffer {
    /// Build from two channels, truncating the longer one if they differ.
    pub fn new(mut left: Vec<f32>, mut right: Vec<f32>) -> Self {
        let n = left.len().min(right.len());
        left.truncate(n);
        right.truncate(n);
        Self { left, right }
    }

    pub fn silent(n_samples: usize) -> Self {
        Self {
            left: vec![0.0; n_samples],
            right: vec![0.0; n_samples],
        }
    }

    /// De-interleave frames. Mono is duplicated, channels beyond two are dropped.
    pub fn from_interleaved(samples: &[f32], channels: usize) -> Self {
        let channels = channels.max(1);
        let frames = samples.len() / channels;
        let mut left = Vec::with_capacity(frames);
        let mut right = Vec::with_capacity(frames);
        for frame in samples.chunks_exact(channels) {
            left.push(frame[0]);
            right.push(if channels == 1 { frame[0] } else { frame[1] });
        }
        Self { left, right }
    }

    pub fn to_interleaved(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.len() * 2);
        for (l, r) in self.left.iter().zip(&self.right) {
            out.push(*l);
            out.push(*r);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    pub fn duration_seconds(&self, sample_rate: u32) -> f64 {
        self.len() as f64 / sample_rate.max(1) as f64
    }

    /// Copy out `range`, clamped to the buffer bounds.
    pub fn slice(&self, range: Range<usize>) -> Self {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        Self {
            left: self.left[start..end].to_vec(),
            right: self.right[start..end].to_vec(),
        }
    }

    /// Zero-pad to at least `n_samples`.
    pub fn padded_to(mut self, n_samples: usize) -> Self {
        if self.len() < n_samples {
            self.left.resize(n_samples, 0.0);
            self.right.resize(n_samples, 0.0);
        }
        self
    }

    pub fn truncate(&mut self, n_samples: usize) {
        self.left.truncate(n_samples);
        self.right.truncate(n_samples);
    }

    /// Add `other` into `self` sample-wise over the shorter of the two lengths.
    pub fn mix_in(&mut self, other: &StereoBuffer) {
        for (dst, src) in self.left.iter_mut().zip(&other.left) {
            *dst += src;
        }
        for (dst, src) in self.right.iter_mut().zip(&other.right) {
            *dst += src;
        }
    }
}

/// Read a WAV file as stereo, returning (audio, sample_rate).
///
/// Mono files are duplicated to stereo; integer formats are scaled to [-1, 1].
pub fn read_wav(path: &Path) -> Result<(StereoBuffer, u32)> {
    let reader = WavReader::open(path).map_err(|e| wav_error(path, e))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<hound::Result<Vec<f32>>>()
            .map_err(|e| wav_error(path, e))?,
        SampleFormat::Int => {
            let max_val = (1u64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .collect::<hound::Result<Vec<i32>>>()
                .map_err(|e| wav_error(path, e))?
                .iter()
                .map(|&s| s as f32 / max_val)
                .collect()
        }
    };

    Ok((
        StereoBuffer::from_interleaved(&samples, spec.channels as usize),
        spec.sample_rate,
    ))
}

/// Write a stereo f32 WAV file.
pub fn write_wav(path: &Path, audio: &StereoBuffer, sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: AUDIO_CHANNELS,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };

    let mut writer = WavWriter::create(path, spec).map_err(|e| wav_error(path, e))?;
    for (l, r) in audio.left.iter().zip(&audio.right) {
        writer.write_sample(*l).map_err(|e| wav_error(path, e))?;
        writer.write_sample(*r).map_err(|e| wav_error(path, e))?;
    }
    writer.finalize().map_err(|e| wav_error(path, e))?;
    Ok(())
}

fn wav_error(path: &Path, e: hound::Error) -> KaraokeError {
    match e {
        hound::Error::IoError(io) => KaraokeError::Io(io),
        other => KaraokeError::Decode(format!("{}: {other}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_is_duplicated_and_extra_channels_dropped() {
        let mono = StereoBuffer::from_interleaved(&[0.1, 0.2], 1);
        assert_eq!(mono.left, vec![0.1, 0.2]);
        assert_eq!(mono.right, vec![0.1, 0.2]);

        let surround = StereoBuffer::from_interleaved(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3);
        assert_eq!(surround.left, vec![1.0, 4.0]);
        assert_eq!(surround.right, vec![2.0, 5.0]);
    }

    #[test]
    fn slice_clamps_and_pad_extends() {
        let buf = StereoBuffer::new(vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]);
        let tail = buf.slice(2..10);
        assert_eq!(tail.left, vec![3.0]);
        let padded = tail.padded_to(3);
        assert_eq!(padded.left, vec![3.0, 0.0, 0.0]);
        assert_eq!(padded.right, vec![6.0, 0.0, 0.0]);
    }

    #[test]
    fn wav_roundtrip_preserves_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wav");
        let buf = StereoBuffer::new(vec![0.25, -0.5, 0.75], vec![-0.25, 0.5, 0.0]);
        write_wav(&path, &buf, 44100).unwrap();
        let (read, sr) = read_wav(&path).unwrap();
        assert_eq!(sr, 44100);
        assert_eq!(read, buf);
    }
}
