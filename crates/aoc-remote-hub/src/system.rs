use async_trait::async_trait;
use std::{path::PathBuf, time::Duration};
use tracing::debug;

/// Point-in-time utilization, in percent. `None` means the reading failed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemSample {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
}

#[async_trait]
pub trait SystemSampler: Send + Sync {
    async fn sample(&self) -> SystemSample;

    fn tool_available(&self, tool: &str) -> bool;
}

/// Linux sampler backed by procfs and the filesystem holding the data directory.
pub struct ProcSampler {
    disk_path: PathBuf,
    cpu_interval: Duration,
}

impl ProcSampler {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk_path: disk_path.into(),
            cpu_interval: Duration::from_millis(200),
        }
    }

    async fn cpu_percent(&self) -> Option<f64> {
        let first = read_cpu_times().await?;
        tokio::time::sleep(self.cpu_interval).await;
        let second = read_cpu_times().await?;
        cpu_usage(first, second)
    }

    async fn memory_percent(&self) -> Option<f64> {
        let raw = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
        memory_usage(&raw)
    }

    async fn disk_percent(&self) -> Option<f64> {
        let path = self.disk_path.clone();
        tokio::task::spawn_blocking(move || {
            let target = existing_ancestor(&path)?;
            let total = fs2::total_space(&target).ok()?;
            let available = fs2::available_space(&target).ok()?;
            disk_usage(total, available)
        })
        .await
        .ok()
        .flatten()
    }
}

#[async_trait]
impl SystemSampler for ProcSampler {
    async fn sample(&self) -> SystemSample {
        let (cpu_percent, memory_percent, disk_percent) =
            tokio::join!(self.cpu_percent(), self.memory_percent(), self.disk_percent());
        let sample = SystemSample {
            cpu_percent,
            memory_percent,
            disk_percent,
        };
        debug!(event = "system_sampled", cpu = ?sample.cpu_percent, memory = ?sample.memory_percent, disk = ?sample.disk_percent);
        sample
    }

    fn tool_available(&self, tool: &str) -> bool {
        which::which(tool).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

async fn read_cpu_times() -> Option<CpuTimes> {
    let raw = tokio::fs::read_to_string("/proc/stat").await.ok()?;
    parse_cpu_times(&raw)
}

fn parse_cpu_times(raw: &str) -> Option<CpuTimes> {
    let line = raw.lines().find(|line| line.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|value| value.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total = fields.iter().take(8).sum();
    Some(CpuTimes { idle, total })
}

fn cpu_usage(first: CpuTimes, second: CpuTimes) -> Option<f64> {
    let total = second.total.checked_sub(first.total)?;
    let idle = second.idle.checked_sub(first.idle)?;
    if total == 0 {
        return Some(0.0);
    }
    Some((total.saturating_sub(idle)) as f64 * 100.0 / total as f64)
}

fn memory_usage(raw: &str) -> Option<f64> {
    let field = |name: &str| -> Option<u64> {
        raw.lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|value| value.parse().ok())
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(available) as f64 * 100.0 / total as f64)
}

fn disk_usage(total: u64, available: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(available) as f64 * 100.0 / total as f64)
}

fn existing_ancestor(path: &std::path::Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|candidate| candidate.exists())
        .map(PathBuf::from)
}
