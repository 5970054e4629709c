use crate::config::HubConfig;
use crate::metrics::HubMetrics;
use aoc_remote_core::protocol::ErrorCode;
use axum::http::StatusCode;
use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct AdmissionPolicy {
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
    pub rate_limit_per_ip: usize,
    pub rate_window: Duration,
    pub allowed_origins: Vec<String>,
}

impl AdmissionPolicy {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            max_connections_per_ip: config.max_connections_per_ip,
            rate_limit_per_ip: config.rate_limit_per_ip,
            rate_window: config.rate_window,
            allowed_origins: config.allowed_origins.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("connection limit reached ({max})")]
    ConnectionLimit { max: usize },
    #[error("too many connections from {ip} ({max})")]
    IpConnectionLimit { ip: IpAddr, max: usize },
    #[error("connection rate exceeded for {ip}")]
    RateLimited { ip: IpAddr },
    #[error("origin not allowed: {origin}")]
    OriginRejected { origin: String },
}

impl AdmissionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AdmissionError::ConnectionLimit { .. } => ErrorCode::ConnectionLimit,
            AdmissionError::IpConnectionLimit { .. } => ErrorCode::IpConnectionLimit,
            AdmissionError::RateLimited { .. } => ErrorCode::RateLimited,
            AdmissionError::OriginRejected { .. } => ErrorCode::OriginRejected,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AdmissionError::ConnectionLimit { .. } | AdmissionError::IpConnectionLimit { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AdmissionError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AdmissionError::OriginRejected { .. } => StatusCode::FORBIDDEN,
        }
    }
}

#[derive(Default)]
struct AdmissionInner {
    active: usize,
    per_ip: HashMap<IpAddr, usize>,
    attempts: HashMap<IpAddr, VecDeque<Instant>>,
}

pub struct AdmissionControl {
    policy: AdmissionPolicy,
    metrics: Arc<HubMetrics>,
    inner: Mutex<AdmissionInner>,
}

impl AdmissionControl {
    pub fn new(policy: AdmissionPolicy, metrics: Arc<HubMetrics>) -> Self {
        Self {
            policy,
            metrics,
            inner: Mutex::new(AdmissionInner::default()),
        }
    }

    /// Checks the origin allow-list. An absent Origin header is accepted.
    pub fn check_origin(&self, origin: Option<&str>) -> Result<(), AdmissionError> {
        let Some(origin) = origin else {
            return Ok(());
        };
        if self.policy.allowed_origins.is_empty() {
            return Ok(());
        }
        let normalized = origin.trim().trim_end_matches('/');
        if self
            .policy
            .allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(normalized))
        {
            return Ok(());
        }
        Err(AdmissionError::OriginRejected {
            origin: origin.to_string(),
        })
    }

    /// Reserves a connection slot for `ip`. The slot is held until the permit drops.
    pub fn admit(
        self: &Arc<Self>,
        ip: IpAddr,
        origin: Option<&str>,
    ) -> Result<AdmissionPermit, AdmissionError> {
        let result = self.check_origin(origin).and_then(|_| self.reserve(ip));
        match result {
            Ok(()) => {
                self.metrics.connection_opened();
                debug!(event = "connection_admitted", ip = %ip);
                Ok(AdmissionPermit {
                    control: self.clone(),
                    ip,
                    released: AtomicBool::new(false),
                })
            }
            Err(err) => {
                self.metrics.connection_rejected();
                warn!(event = "connection_rejected", ip = %ip, code = %err.code(), reason = %err);
                Err(err)
            }
        }
    }

    fn reserve(&self, ip: IpAddr) -> Result<(), AdmissionError> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if inner.active >= self.policy.max_connections {
            return Err(AdmissionError::ConnectionLimit {
                max: self.policy.max_connections,
            });
        }
        if inner.per_ip.get(&ip).copied().unwrap_or(0) >= self.policy.max_connections_per_ip {
            return Err(AdmissionError::IpConnectionLimit {
                ip,
                max: self.policy.max_connections_per_ip,
            });
        }

        let now = Instant::now();
        let window = self.policy.rate_window;
        let attempts = inner.attempts.entry(ip).or_default();
        while let Some(front) = attempts.front() {
            if now.duration_since(*front) >= window {
                attempts.pop_front();
            } else {
                break;
            }
        }
        if attempts.len() >= self.policy.rate_limit_per_ip {
            return Err(AdmissionError::RateLimited { ip });
        }
        attempts.push_back(now);

        inner.active += 1;
        *inner.per_ip.entry(ip).or_insert(0) += 1;
        Ok(())
    }

    fn release(&self, ip: IpAddr) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.active = inner.active.saturating_sub(1);
        let remove = match inner.per_ip.get_mut(&ip) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if remove {
            inner.per_ip.remove(&ip);
        }
        let window = self.policy.rate_window;
        inner
            .attempts
            .retain(|_, attempts| attempts.back().is_some_and(|last| last.elapsed() < window));
        drop(inner);
        self.metrics.connection_closed();
    }

    pub fn active(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .active
    }

    pub fn active_for(&self, ip: IpAddr) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .per_ip
            .get(&ip)
            .copied()
            .unwrap_or(0)
    }
}

/// A held connection slot. Releasing is idempotent and also happens on drop.
pub struct AdmissionPermit {
    control: Arc<AdmissionControl>,
    ip: IpAddr,
    released: AtomicBool,
}

impl AdmissionPermit {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.control.release(self.ip);
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.release();
    }
}
