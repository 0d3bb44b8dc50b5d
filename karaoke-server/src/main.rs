mod hardware;
mod http;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use karaoke_core::codec::ffmpeg::FfmpegCodec;
use karaoke_core::engine::command::CommandEngineLoader;
use karaoke_core::engine::Device;
use karaoke_core::hardware::HardwareProfile;
use karaoke_core::model::metadata::find_model;
use karaoke_core::{KaraokeService, ServiceConfig};

use crate::hardware::SystemDetector;

#[derive(Parser)]
#[command(
    name = "karaoke-server",
    about = "Stream instrumental versions of tracks as they separate"
)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    #[arg(short, long, env = "PORT", default_value_t = 8000)]
    port: u16,

    /// JSON file with service settings; flags below override it
    #[arg(short, long, env = "KARAOKE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for finished results and the cache index
    #[arg(long, env = "KARAOKE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Directory for progressive output
    #[arg(long, env = "KARAOKE_SERVING_DIR")]
    serving_dir: Option<PathBuf>,

    /// Scratch directory for transcoder and separator temporaries
    #[arg(long, env = "KARAOKE_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Result cache capacity in megabytes
    #[arg(long, env = "KARAOKE_CACHE_MB")]
    cache_mb: Option<u64>,

    /// Model variant (default: chosen from the detected hardware)
    #[arg(short, long, env = "DEMUCS_MODEL",
          value_parser = ["htdemucs", "htdemucs_6s", "htdemucs_ft"])]
    model: Option<String>,

    /// Skip probing and run on this device
    #[arg(short, long, env = "DEMUCS_DEVICE", value_parser = ["cuda", "mps", "cpu"])]
    device: Option<String>,

    /// Seconds of audio per chunk
    #[arg(long, env = "KARAOKE_CHUNK_SECONDS")]
    chunk_seconds: Option<f64>,

    /// Seconds shared by neighbouring chunks
    #[arg(long, env = "KARAOKE_OVERLAP_SECONDS")]
    overlap_seconds: Option<f64>,

    /// Number of model instances to keep loaded
    #[arg(long, env = "KARAOKE_INSTANCES")]
    instances: Option<usize>,

    /// Process at most this many seconds of each track
    #[arg(long, env = "KARAOKE_MAX_SECONDS")]
    max_seconds: Option<f64>,

    /// Most predictive jobs accepted per request
    #[arg(long, env = "KARAOKE_MAX_PREDICT")]
    max_predict: Option<usize>,

    /// Prefix for every URL handed to clients
    #[arg(long, env = "KARAOKE_PUBLIC_URL")]
    public_url: Option<String>,

    #[arg(long, env = "FFMPEG_PATH")]
    ffmpeg: Option<String>,

    /// Separation command
    #[arg(long, env = "DEMUCS_COMMAND")]
    separator: Option<String>,

    /// Kill a separator run after this many seconds
    #[arg(long, env = "DEMUCS_TIMEOUT_SECS")]
    separator_timeout: Option<u64>,

    /// MP3 bitrate, e.g. 192k
    #[arg(long, env = "KARAOKE_BITRATE")]
    bitrate: Option<String>,

    /// Skip the startup benchmark
    #[arg(long)]
    no_benchmark: bool,
}

impl Cli {
    fn service_config(&self) -> Result<ServiceConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("invalid config {}", path.display()))?
            }
            None => ServiceConfig::default(),
        };

        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        if let Some(dir) = &self.serving_dir {
            config.serving_dir = dir.clone();
        }
        if let Some(dir) = &self.work_dir {
            config.work_dir = dir.clone();
        }
        if let Some(mb) = self.cache_mb {
            config.cache_capacity_bytes = mb * 1024 * 1024;
        }
        if let Some(model) = &self.model {
            if find_model(model).is_none() {
                bail!("unknown model: {model}");
            }
            config.model = Some(model.clone());
        }
        if let Some(name) = &self.device {
            let device =
                Device::parse(name).with_context(|| format!("unknown device: {name}"))?;
            config.force_device = Some(device);
        }
        if self.chunk_seconds.is_some() {
            config.chunk_seconds = self.chunk_seconds;
        }
        if let Some(overlap) = self.overlap_seconds {
            config.overlap_seconds = overlap;
        }
        if self.instances.is_some() {
            config.model_instances = self.instances;
        }
        if self.max_seconds.is_some() {
            config.max_decode_seconds = self.max_seconds;
        }
        if let Some(max) = self.max_predict {
            config.max_predict_jobs = max;
        }
        if let Some(prefix) = &self.public_url {
            config.url_prefix = prefix.trim_end_matches('/').to_owned();
        }
        if let Some(program) = &self.ffmpeg {
            config.ffmpeg_program = program.clone();
        }
        if let Some(program) = &self.separator {
            config.separator_program = program.clone();
        }
        if let Some(bitrate) = &self.bitrate {
            config.mp3_bitrate = bitrate.clone();
        }
        if self.no_benchmark {
            config.benchmark = false;
        }

        if let Some(chunk) = config.chunk_seconds {
            if chunk <= config.overlap_seconds {
                bail!(
                    "chunk ({chunk}s) must be longer than the overlap ({}s)",
                    config.overlap_seconds
                );
            }
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    // 1. Settings
    let config = cli.service_config()?;
    let addr = SocketAddr::new(cli.host, cli.port);

    // 2. Hardware
    let detector = SystemDetector::new(config.force_device);
    let profile = HardwareProfile::detect(&detector);

    // 3. Collaborators
    let loader = CommandEngineLoader::new(
        config.separator_program.clone(),
        config.work_dir.clone(),
        cli.separator_timeout.map(Duration::from_secs),
    );
    let codec = FfmpegCodec::new(
        config.ffmpeg_program.clone(),
        config.work_dir.clone(),
        config.decode_timeout(),
    )
    .with_bitrate(config.mp3_bitrate.clone());

    // 4. Service: loads the models and benchmarks, so keep it off the reactor
    let service = tokio::task::spawn_blocking(move || {
        KaraokeService::new(config, profile, Arc::new(loader), Arc::new(codec))
    })
    .await
    .context("service startup panicked")?
    .context("failed to start the service")?;
    let service = Arc::new(service);

    // 5. Serve
    http::serve(addr, Arc::clone(&service)).await?;

    let stopping = Arc::clone(&service);
    tokio::task::spawn_blocking(move || stopping.shutdown())
        .await
        .context("shutdown panicked")?;
    Ok(())
}
