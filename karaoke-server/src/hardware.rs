use karaoke_core::engine::Device;
use karaoke_core::hardware::{HardwareDetector, HardwareFacts};
use nvml_wrapper::Nvml;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Probes the host with sysinfo for memory and cores, and NVML for a CUDA
/// device. Apple Silicon is reported as Metal with shared memory.
pub struct SystemDetector {
    force: Option<Device>,
}

impl SystemDetector {
    pub fn new(force: Option<Device>) -> Self {
        Self { force }
    }
}

impl HardwareDetector for SystemDetector {
    fn detect(&self) -> HardwareFacts {
        let sys = System::new_with_specifics(
            RefreshKind::new()
                .with_memory(MemoryRefreshKind::everything())
                .with_cpu(CpuRefreshKind::new()),
        );
        let ram_mb = sys.total_memory() / BYTES_PER_MB;
        let cpu_cores = sys.cpus().len().max(1);
        let cpu = HardwareFacts::cpu_only(ram_mb, cpu_cores);

        match self.force {
            Some(Device::Cpu) => cpu,
            Some(Device::Cuda) => {
                let (gpu_name, vram_mb) = probe_cuda().unwrap_or((None, None));
                HardwareFacts {
                    device: Device::Cuda,
                    gpu_name,
                    vram_mb,
                    ..cpu
                }
            }
            Some(Device::Metal) => metal_facts(cpu),
            None => {
                if let Some((gpu_name, vram_mb)) = probe_cuda() {
                    return HardwareFacts {
                        device: Device::Cuda,
                        gpu_name,
                        vram_mb,
                        ..cpu
                    };
                }
                if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
                    return metal_facts(cpu);
                }
                cpu
            }
        }
    }
}

fn metal_facts(cpu: HardwareFacts) -> HardwareFacts {
    HardwareFacts {
        device: Device::Metal,
        gpu_name: Some("Apple Silicon".to_owned()),
        vram_mb: None,
        ..cpu
    }
}

/// Name and total memory of the first NVIDIA device, if the driver loads.
fn probe_cuda() -> Option<(Option<String>, Option<u64>)> {
    let nvml = match Nvml::init() {
        Ok(nvml) => nvml,
        Err(e) => {
            log::debug!("NVML unavailable: {e}");
            return None;
        }
    };
    let device = match nvml.device_by_index(0) {
        Ok(device) => device,
        Err(e) => {
            log::debug!("no CUDA device: {e}");
            return None;
        }
    };
    let name = device.name().ok();
    let vram_mb = device.memory_info().ok().map(|m| m.total / BYTES_PER_MB);
    Some((name, vram_mb))
}
