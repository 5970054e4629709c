use crate::admission::{AdmissionControl, AdmissionPolicy};
use crate::broadcaster::Broadcaster;
use crate::config::HubConfig;
use crate::engine::ExecutionEngine;
use crate::health::HealthChecker;
use crate::metrics::HubMetrics;
use crate::registry::ProjectRegistry;
use crate::system::SystemSampler;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::{watch, Notify};

/// Counts in-flight work so shutdown can wait for it to unwind.
#[derive(Default)]
pub struct WorkTracker {
    active: AtomicUsize,
    idle: Notify,
}

impl WorkTracker {
    pub fn start(self: &Arc<Self>) -> WorkGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        WorkGuard {
            tracker: self.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct WorkGuard {
    tracker: Arc<WorkTracker>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

pub struct HubState {
    pub config: HubConfig,
    pub metrics: Arc<HubMetrics>,
    pub admission: Arc<AdmissionControl>,
    pub registry: Arc<ProjectRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub engine: Arc<dyn ExecutionEngine>,
    pub health: HealthChecker,
    pub work: Arc<WorkTracker>,
    started: Instant,
    shutdown: watch::Sender<bool>,
}

impl HubState {
    pub fn new(
        config: HubConfig,
        registry: Arc<ProjectRegistry>,
        engine: Arc<dyn ExecutionEngine>,
        sampler: Arc<dyn SystemSampler>,
    ) -> Arc<Self> {
        let metrics = Arc::new(HubMetrics::new());
        let admission = Arc::new(AdmissionControl::new(
            AdmissionPolicy::from_config(&config),
            metrics.clone(),
        ));
        let broadcaster = Arc::new(Broadcaster::new(
            registry.clone(),
            metrics.clone(),
            config.write_timeout,
            config.broadcast_timeout,
        ));
        let health = HealthChecker::new(sampler, engine.tool().to_string());
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            metrics,
            admission,
            registry,
            broadcaster,
            engine,
            health,
            work: Arc::new(WorkTracker::default()),
            started: Instant::now(),
            shutdown,
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Waits until every connection has closed and in-flight executions have
    /// finished, or until `grace` elapses. Returns whether the hub drained.
    pub async fn drain(&self, grace: Duration) -> bool {
        let drained = async {
            while self.admission.active() > 0 {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            self.work.wait_idle().await;
        };
        tokio::time::timeout(grace, drained).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracker_wakes_waiters_when_idle() {
        let tracker = Arc::new(WorkTracker::default());
        let first = tracker.start();
        let second = tracker.start();
        assert_eq!(tracker.active(), 2);

        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait_idle().await }
        });
        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(second);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woke")
            .expect("join");
    }
}
