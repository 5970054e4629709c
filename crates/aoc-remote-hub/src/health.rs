use crate::system::SystemSampler;
use aoc_remote_core::protocol::{HealthCheck, HealthReport, HealthStatus};
use std::sync::Arc;

pub const WARNING_PERCENT: f64 = 80.0;
pub const CRITICAL_PERCENT: f64 = 95.0;

pub struct HealthChecker {
    sampler: Arc<dyn SystemSampler>,
    engine_tool: String,
}

impl HealthChecker {
    pub fn new(sampler: Arc<dyn SystemSampler>, engine_tool: impl Into<String>) -> Self {
        Self {
            sampler,
            engine_tool: engine_tool.into(),
        }
    }

    pub async fn check(&self, uptime_secs: u64) -> HealthReport {
        let sample = self.sampler.sample().await;
        let checks = vec![
            classify_usage("cpu", sample.cpu_percent),
            classify_usage("memory", sample.memory_percent),
            classify_usage("disk", sample.disk_percent),
            self.engine_check(),
        ];
        HealthReport::from_checks(uptime_secs, checks)
    }

    fn engine_check(&self) -> HealthCheck {
        let available = self.sampler.tool_available(&self.engine_tool);
        HealthCheck {
            name: "engine".to_string(),
            status: if available {
                HealthStatus::Healthy
            } else {
                HealthStatus::Critical
            },
            value: None,
            message: if available {
                format!("{} available", self.engine_tool)
            } else {
                format!("{} not found", self.engine_tool)
            },
        }
    }
}

pub fn classify_usage(name: &str, percent: Option<f64>) -> HealthCheck {
    let Some(value) = percent else {
        return HealthCheck {
            name: name.to_string(),
            status: HealthStatus::Error,
            value: None,
            message: format!("{name} reading unavailable"),
        };
    };
    let status = if value >= CRITICAL_PERCENT {
        HealthStatus::Critical
    } else if value >= WARNING_PERCENT {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    };
    HealthCheck {
        name: name.to_string(),
        status,
        value: Some(value),
        message: format!("{name} usage {value:.1}%"),
    }
}
