use aoc_remote_core::protocol::{ConnectionStats, ExecutionStats, MessageStats};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

const DURATION_WINDOW: usize = 1000;

/// Process-wide counters. Written by the gateway and handlers, read by status and health.
#[derive(Default)]
pub struct HubMetrics {
    connections_active: AtomicU64,
    connections_total: AtomicU64,
    connections_rejected: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    executions_total: AtomicU64,
    executions_active: AtomicU64,
    executions_failed: AtomicU64,
    durations: Mutex<VecDeque<(Instant, Duration)>>,
}

impl HubMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_active.fetch_add(1, Ordering::SeqCst);
        self.connections_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .connections_active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| {
                value.checked_sub(1)
            });
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_sent(&self, count: u64) {
        self.messages_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn execution_started(&self) {
        self.executions_total.fetch_add(1, Ordering::SeqCst);
        self.executions_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn execution_finished(&self, elapsed: Duration, failed: bool) {
        let _ = self
            .executions_active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| {
                value.checked_sub(1)
            });
        if failed {
            self.executions_failed.fetch_add(1, Ordering::SeqCst);
        }
        let mut durations = self
            .durations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if durations.len() >= DURATION_WINDOW {
            durations.pop_front();
        }
        durations.push_back((Instant::now(), elapsed));
    }

    pub fn active_connections(&self) -> u64 {
        self.connections_active.load(Ordering::SeqCst)
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        ConnectionStats {
            active: self.connections_active.load(Ordering::SeqCst),
            total: self.connections_total.load(Ordering::SeqCst),
            rejected: self.connections_rejected.load(Ordering::Relaxed),
        }
    }

    pub fn message_stats(&self) -> MessageStats {
        MessageStats {
            received: self.messages_received.load(Ordering::Relaxed),
            sent: self.messages_sent.load(Ordering::Relaxed),
        }
    }

    pub fn execution_stats(&self) -> ExecutionStats {
        let durations = self
            .durations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut millis: Vec<u64> = durations
            .iter()
            .map(|(_, elapsed)| elapsed.as_millis() as u64)
            .collect();
        millis.sort_unstable();
        let per_minute = throughput_per_minute(&durations);
        ExecutionStats {
            total: self.executions_total.load(Ordering::SeqCst),
            active: self.executions_active.load(Ordering::SeqCst),
            failed: self.executions_failed.load(Ordering::SeqCst),
            p50_ms: percentile(&millis, 50.0),
            p95_ms: percentile(&millis, 95.0),
            p99_ms: percentile(&millis, 99.0),
            per_minute,
        }
    }
}

/// Nearest-rank percentile over an ascending slice.
fn percentile(sorted: &[u64], pct: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    sorted[index]
}

fn throughput_per_minute(window: &VecDeque<(Instant, Duration)>) -> f64 {
    let Some((oldest, _)) = window.front() else {
        return 0.0;
    };
    let span = oldest.elapsed().as_secs_f64().max(60.0);
    window.len() as f64 * 60.0 / span
}
