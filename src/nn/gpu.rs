use std::process::Command;

use sysinfo::System;

/// Columns asked from nvidia-smi, in the order [`GpuStats::parse`] reads them
const QUERY: &str = "--query-gpu=name,memory.used,memory.total,utilization.gpu";

/// Load of the first NVIDIA GPU. Readings nvidia-smi reports as `[N/A]` are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuStats {
    pub name: String,
    pub memory_used_mb: Option<u64>,
    pub memory_total_mb: Option<u64>,
    pub utilization_percent: Option<f32>,
}

impl GpuStats {
    /// First GPU row of `nvidia-smi --format=csv,noheader,nounits` output.
    fn parse(csv: &str) -> Option<Self> {
        let line = csv.lines().map(str::trim).find(|l| !l.is_empty())?;
        let mut fields = line.split(',').map(str::trim);
        let name = fields.next().filter(|n| !n.is_empty())?.to_string();
        let memory_used_mb = fields.next()?.parse().ok();
        let memory_total_mb = fields.next()?.parse().ok();
        let utilization_percent = fields.next()?.parse().ok();
        Some(Self {
            name,
            memory_used_mb,
            memory_total_mb,
            utilization_percent,
        })
    }

    fn describe(&self) -> String {
        let mb = |v: Option<u64>| v.map_or_else(|| "?".to_string(), |v| v.to_string());
        let util = self
            .utilization_percent
            .map_or_else(|| "?".to_string(), |u| format!("{u:.0}"));
        format!(
            "[{}] vram {}/{} MB | util {}%",
            self.name,
            mb(self.memory_used_mb),
            mb(self.memory_total_mb),
            util
        )
    }
}

/// Query nvidia-smi; `None` when it is missing, fails, or lists no GPU.
pub fn probe_gpu() -> Option<GpuStats> {
    let output = Command::new("nvidia-smi")
        .args([QUERY, "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    GpuStats::parse(&String::from_utf8_lossy(&output.stdout))
}

/// Host and device load after an epoch
#[derive(Debug, Clone, Default)]
pub struct ComputeStats {
    pub backend_name: String,
    pub cpu_usage_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub epoch_duration_ms: u64,
    pub samples_per_sec: f64,
    pub total_params: usize,
    pub gpu: Option<GpuStats>,
}

impl ComputeStats {
    pub fn log(&self) {
        tracing::info!(
            "[{}] cpu {:.1}% | mem {}/{} MB | epoch {} ms | {:.1} samples/s | {} params",
            self.backend_name,
            self.cpu_usage_percent,
            self.memory_used_mb,
            self.memory_total_mb,
            self.epoch_duration_ms,
            self.samples_per_sec,
            self.total_params
        );
        if let Some(gpu) = &self.gpu {
            tracing::info!("{}", gpu.describe());
        }
    }
}

/// Samples CPU, memory and (when training on the GPU) nvidia-smi stats.
pub struct ComputeMonitor {
    sys: System,
    backend_name: String,
    using_gpu: bool,
    total_memory_mb: u64,
}

impl ComputeMonitor {
    pub fn new(backend_name: &str, using_gpu: bool) -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        let total_memory_mb = sys.total_memory() / (1024 * 1024);
        Self {
            sys,
            backend_name: backend_name.to_string(),
            using_gpu,
            total_memory_mb,
        }
    }

    pub fn snapshot(&mut self, epoch_ms: u64, samples: usize, total_params: usize) -> ComputeStats {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let samples_per_sec = if epoch_ms > 0 {
            samples as f64 / (epoch_ms as f64 / 1000.0)
        } else {
            0.0
        };

        ComputeStats {
            backend_name: self.backend_name.clone(),
            cpu_usage_percent: self.sys.global_cpu_usage(),
            memory_used_mb: self.sys.used_memory() / (1024 * 1024),
            memory_total_mb: self.total_memory_mb,
            epoch_duration_ms: epoch_ms,
            samples_per_sec,
            total_params,
            gpu: if self.using_gpu { probe_gpu() } else { None },
        }
    }
}
