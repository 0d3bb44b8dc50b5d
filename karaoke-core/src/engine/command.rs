use std::path::PathBuf;
use std::time::Duration;

use crate::audio::{read_wav, write_wav, StereoBuffer};
use crate::model::{find_model, ModelInfo, Stem};
use crate::process::run_command;

use super::{Device, EngineError, EngineLoader, SeparationEngine};

/// Runs separation through a `demucs`-compatible command-line tool.
///
/// For every chunk the waveform is written to a scratch WAV, the tool is
/// invoked as
///
/// ```text
/// {program} -n {model} -d {device} -o {out} --filename {stem}.{ext} {input}.wav
/// ```
///
/// and the per-stem WAVs are read back from `{out}/{model}/`.
pub struct CommandEngineLoader {
    program: String,
    work_dir: PathBuf,
    timeout: Option<Duration>,
}

impl CommandEngineLoader {
    pub fn new(program: impl Into<String>, work_dir: PathBuf, timeout: Option<Duration>) -> Self {
        Self {
            program: program.into(),
            work_dir,
            timeout,
        }
    }
}

impl EngineLoader for CommandEngineLoader {
    fn load(
        &self,
        model_id: &str,
        device: Device,
    ) -> Result<Box<dyn SeparationEngine>, EngineError> {
        let model = find_model(model_id)
            .ok_or_else(|| EngineError::Failed(format!("unknown model: {model_id}")))?;
        std::fs::create_dir_all(&self.work_dir)
            .map_err(|e| EngineError::Failed(format!("failed to create work dir: {e}")))?;
        Ok(Box::new(CommandEngine {
            program: self.program.clone(),
            model,
            device,
            work_dir: self.work_dir.clone(),
            timeout: self.timeout,
        }))
    }
}

pub struct CommandEngine {
    program: String,
    model: &'static ModelInfo,
    device: Device,
    work_dir: PathBuf,
    timeout: Option<Duration>,
}

impl SeparationEngine for CommandEngine {
    fn device(&self) -> Device {
        self.device
    }

    fn model_id(&self) -> &str {
        self.model.id
    }

    fn separate(
        &mut self,
        waveform: &StereoBuffer,
        sample_rate: u32,
    ) -> Result<Vec<Stem>, EngineError> {
        let scratch = tempfile::Builder::new()
            .prefix("separate-")
            .tempdir_in(&self.work_dir)
            .map_err(failed)?;
        let input = scratch.path().join("chunk.wav");
        let out_dir = scratch.path().join("out");
        write_wav(&input, waveform, sample_rate).map_err(failed)?;

        let args = vec![
            "-n".to_owned(),
            self.model.id.to_owned(),
            "-d".to_owned(),
            self.device.as_str().to_owned(),
            "-o".to_owned(),
            out_dir.to_string_lossy().into_owned(),
            "--filename".to_owned(),
            "{stem}.{ext}".to_owned(),
            input.to_string_lossy().into_owned(),
        ];

        run_command(&self.program, &args, self.timeout)
            .map_err(|e| EngineError::classify(e.to_string(), self.device))?;

        let stem_dir = out_dir.join(self.model.id);
        let mut stems = Vec::with_capacity(self.model.stems.len());
        for id in self.model.stems {
            let path = stem_dir.join(format!("{}.wav", id.as_str()));
            let (audio, _) = read_wav(&path).map_err(failed)?;
            stems.push(Stem { id: *id, audio });
        }
        Ok(stems)
    }
}

fn failed(e: impl std::fmt::Display) -> EngineError {
    EngineError::Failed(e.to_string())
}
