//! Drain-aware graceful shutdown.
//!
//! Requests are counted in and out; once draining starts new requests are refused and
//! [`ShutdownCoordinator::shutdown`] waits, bounded, for the in-flight ones to finish.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::ShutdownError;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownConfig {
    /// Upper bound on waiting for in-flight requests.
    pub timeout: Duration,
    /// Grace period before draining starts, e.g. for a load balancer to notice.
    pub drain_delay: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            drain_delay: Duration::ZERO,
        }
    }
}

type DrainingHook = Box<dyn Fn() + Send + Sync>;
type CompleteHook = Box<dyn Fn(Option<&ShutdownError>) + Send + Sync>;

#[derive(Default)]
pub struct ShutdownCoordinator {
    in_flight: AtomicUsize,
    draining: AtomicBool,
    completed: AtomicBool,
    done: CancellationToken,
    on_draining: Mutex<Option<DrainingHook>>,
    on_complete: Mutex<Option<CompleteHook>>,
}

/// Counts one request as in flight until dropped.
#[must_use = "the request is completed as soon as the guard is dropped"]
pub struct RequestGuard {
    coordinator: Arc<ShutdownCoordinator>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.coordinator.complete_request();
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_draining<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_draining.lock() = Some(Box::new(hook));
    }

    pub fn on_complete<F>(&self, hook: F)
    where
        F: Fn(Option<&ShutdownError>) + Send + Sync + 'static,
    {
        *self.on_complete.lock() = Some(Box::new(hook));
    }

    /// Counts a new request in. Returns `false` once draining has started; the caller
    /// must then refuse the request without starting it.
    pub fn track_request(&self) -> bool {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.draining.load(Ordering::SeqCst) {
            self.complete_request();
            return false;
        }
        true
    }

    pub fn complete_request(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1));
    }

    pub fn begin_request(self: &Arc<Self>) -> Option<RequestGuard> {
        self.track_request().then(|| RequestGuard {
            coordinator: Arc::clone(self),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolves once a shutdown has finished, cleanly or not.
    pub async fn done(&self) {
        self.done.cancelled().await;
    }

    /// Drains in-flight requests.
    ///
    /// Waits out `drain_delay` (returning [`ShutdownError::Cancelled`] if `scope` ends
    /// first), refuses new requests, then polls until nothing is in flight or
    /// `timeout` passes. Calling it again is harmless.
    pub async fn shutdown(&self, scope: &CancellationToken, config: &ShutdownConfig) -> Result<(), ShutdownError> {
        if !config.drain_delay.is_zero() {
            tokio::select! {
                _ = scope.cancelled() => return Err(ShutdownError::Cancelled),
                _ = time::sleep(config.drain_delay) => {}
            }
        }

        if !self.draining.swap(true, Ordering::SeqCst) {
            info!(in_flight = self.in_flight(), "draining in-flight requests");
            if let Some(hook) = self.on_draining.lock().as_ref() {
                hook();
            }
        }

        let deadline = Instant::now() + config.timeout;
        let mut interval = time::interval(POLL_INTERVAL);
        let result = loop {
            interval.tick().await;
            let in_flight = self.in_flight();
            if in_flight == 0 {
                break Ok(());
            }
            if Instant::now() >= deadline {
                break Err(ShutdownError::Timeout {
                    timeout: config.timeout,
                    in_flight,
                });
            }
        };

        if !self.completed.swap(true, Ordering::SeqCst) {
            match &result {
                Ok(()) => info!("shutdown drained cleanly"),
                Err(err) => warn!(error = %err, "shutdown finished with requests still running"),
            }
            if let Some(hook) = self.on_complete.lock().as_ref() {
                hook(result.as_ref().err());
            }
            self.done.cancel();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(timeout_ms: u64) -> ShutdownConfig {
        ShutdownConfig {
            timeout: Duration::from_millis(timeout_ms),
            drain_delay: Duration::ZERO,
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ShutdownConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.drain_delay, Duration::ZERO);
    }

    #[test]
    fn complete_never_underflows() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.complete_request();
        assert_eq!(coordinator.in_flight(), 0);
        assert!(coordinator.track_request());
        assert_eq!(coordinator.in_flight(), 1);
    }

    #[tokio::test]
    async fn idle_shutdown_completes_immediately() {
        let coordinator = ShutdownCoordinator::new();
        coordinator
            .shutdown(&CancellationToken::new(), &config(100))
            .await
            .expect("clean drain");
        assert!(coordinator.is_draining());
        assert!(coordinator.is_done());
    }

    #[tokio::test]
    async fn tracking_after_draining_is_refused() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        coordinator
            .shutdown(&CancellationToken::new(), &config(100))
            .await
            .expect("clean drain");

        assert!(!coordinator.track_request());
        assert!(coordinator.begin_request().is_none());
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_in_flight_requests() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let guard = coordinator.begin_request().expect("accepting");

        let release = tokio::spawn(async move {
            time::sleep(Duration::from_millis(200)).await;
            drop(guard);
        });

        coordinator
            .shutdown(&CancellationToken::new(), &config(5_000))
            .await
            .expect("drained");
        assert_eq!(coordinator.in_flight(), 0);
        release.await.expect("task");
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_stuck_requests() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let _stuck = coordinator.begin_request().expect("accepting");

        let err = coordinator
            .shutdown(&CancellationToken::new(), &config(100))
            .await
            .expect_err("timeout");
        assert!(matches!(err, ShutdownError::Timeout { in_flight: 1, .. }));
        assert!(coordinator.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_drain_delay_skips_draining() {
        let coordinator = ShutdownCoordinator::new();
        let scope = CancellationToken::new();
        let config = ShutdownConfig {
            timeout: Duration::from_secs(1),
            drain_delay: Duration::from_secs(10),
        };

        let canceller = {
            let scope = scope.clone();
            tokio::spawn(async move {
                time::sleep(Duration::from_secs(1)).await;
                scope.cancel();
            })
        };

        let err = coordinator.shutdown(&scope, &config).await.expect_err("cancelled");
        assert!(matches!(err, ShutdownError::Cancelled));
        assert!(!coordinator.is_draining());
        assert!(!coordinator.is_done());
        canceller.await.expect("task");
    }

    #[tokio::test]
    async fn hooks_fire_once_across_repeated_shutdowns() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let draining = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        coordinator.on_draining({
            let draining = Arc::clone(&draining);
            move || {
                draining.fetch_add(1, Ordering::SeqCst);
            }
        });
        coordinator.on_complete({
            let completed = Arc::clone(&completed);
            move |err| {
                assert!(err.is_none());
                completed.fetch_add(1, Ordering::SeqCst);
            }
        });

        let scope = CancellationToken::new();
        let runs: Vec<_> = (0..4)
            .map(|_| {
                let (coordinator, scope) = (Arc::clone(&coordinator), scope.clone());
                tokio::spawn(async move { coordinator.shutdown(&scope, &config(100)).await })
            })
            .collect();
        for run in runs {
            run.await.expect("task").expect("clean drain");
        }

        assert_eq!(draining.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        coordinator.done().await;
    }
}
