use std::path::PathBuf;
use std::time::Duration;

use crate::audio::{read_wav, write_wav, StereoBuffer};
use crate::error::{KaraokeError, Result};
use crate::process::run_command;
use crate::SAMPLE_RATE;

use super::{AudioCodec, DecodedAudio, MediaSource};

/// `ffmpeg`-backed codec. Decodes to 44.1 kHz stereo WAV, encodes to MP3.
pub struct FfmpegCodec {
    program: String,
    work_dir: PathBuf,
    decode_timeout: Duration,
    encode_timeout: Duration,
    bitrate: String,
}

impl FfmpegCodec {
    pub fn new(program: impl Into<String>, work_dir: PathBuf, decode_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            work_dir,
            decode_timeout,
            encode_timeout: Duration::from_secs(120),
            bitrate: "192k".to_owned(),
        }
    }

    pub fn with_bitrate(mut self, bitrate: impl Into<String>) -> Self {
        self.bitrate = bitrate.into();
        self
    }

    fn scratch(&self, prefix: &str) -> Result<tempfile::TempDir> {
        std::fs::create_dir_all(&self.work_dir)?;
        Ok(tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.work_dir)?)
    }
}

impl AudioCodec for FfmpegCodec {
    fn decode(
        &self,
        source: &MediaSource,
        max_duration_seconds: Option<f64>,
    ) -> Result<DecodedAudio> {
        let scratch = self.scratch("decode-")?;
        let output = scratch.path().join("decoded.wav");

        let input = match source {
            MediaSource::Url(url) => url.clone(),
            MediaSource::Bytes { data, content_type } => {
                if data.is_empty() {
                    return Err(KaraokeError::Decode("no audio provided".into()));
                }
                let ext = extension_for_content_type(content_type.as_deref());
                let path = scratch.path().join(format!("input.{ext}"));
                std::fs::write(&path, data)?;
                path.to_string_lossy().into_owned()
            }
        };

        let mut args = vec!["-y".to_owned(), "-i".to_owned(), input];
        if let Some(secs) = max_duration_seconds {
            args.push("-t".to_owned());
            args.push(format!("{secs:.3}"));
        }
        args.extend(
            [
                "-ar",
                &SAMPLE_RATE.to_string(),
                "-ac",
                "2",
                "-f",
                "wav",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(output.to_string_lossy().into_owned());

        run_command(&self.program, &args, Some(self.decode_timeout)).map_err(|e| {
            log::warn!("ffmpeg decode of {} failed: {e}", source.describe());
            KaraokeError::Decode(format!("failed to convert audio: {e}"))
        })?;

        let (audio, sample_rate) = read_wav(&output)?;
        if audio.is_empty() {
            return Err(KaraokeError::Decode(format!(
                "no audio samples decoded from {}",
                source.describe()
            )));
        }
        Ok(DecodedAudio { audio, sample_rate })
    }

    fn encode(&self, audio: &StereoBuffer, sample_rate: u32) -> Result<Vec<u8>> {
        let scratch = self.scratch("encode-")?;
        let wav = scratch.path().join("pcm.wav");
        let mp3 = scratch.path().join("out.mp3");
        write_wav(&wav, audio, sample_rate)?;

        let args: Vec<String> = [
            "-y",
            "-i",
            &wav.to_string_lossy(),
            "-codec:a",
            "libmp3lame",
            "-b:a",
            &self.bitrate,
            &mp3.to_string_lossy(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        run_command(&self.program, &args, Some(self.encode_timeout)).map_err(|e| {
            log::error!("ffmpeg encode failed: {e}");
            KaraokeError::Encode(e.to_string())
        })?;
        Ok(std::fs::read(&mp3)?)
    }
}

/// Input file extension for a client-supplied content type, so the
/// transcoder's probe gets a useful hint.
pub fn extension_for_content_type(content_type: Option<&str>) -> &'static str {
    let mime = content_type
        .and_then(|c| c.split(';').next())
        .map(|c| c.trim().to_ascii_lowercase());
    match mime.as_deref() {
        Some("audio/webm") | Some("video/webm") => "webm",
        Some("audio/mp4") | Some("audio/x-m4a") => "m4a",
        Some("video/mp4") => "mp4",
        Some("audio/mpeg") | Some("audio/mp3") => "mp3",
        Some("audio/ogg") => "ogg",
        Some("audio/wav") | Some("audio/x-wav") | Some("audio/wave") => "wav",
        Some("audio/flac") => "flac",
        _ => "audio",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_map_to_extensions() {
        assert_eq!(extension_for_content_type(Some("audio/webm")), "webm");
        assert_eq!(
            extension_for_content_type(Some("audio/mp4; codecs=mp4a.40.2")),
            "m4a"
        );
        assert_eq!(extension_for_content_type(Some("VIDEO/MP4")), "mp4");
        assert_eq!(extension_for_content_type(None), "audio");
    }

    #[test]
    fn empty_payload_is_a_decode_failure() {
        let dir = tempfile::tempdir().unwrap();
        let codec = FfmpegCodec::new("ffmpeg", dir.path().to_path_buf(), Duration::from_secs(1));
        let err = codec
            .decode(
                &MediaSource::Bytes {
                    data: Vec::new(),
                    content_type: None,
                },
                None,
            )
            .unwrap_err();
        assert_eq!(err.code(), "KARAOKE-DECODE");
    }
}
