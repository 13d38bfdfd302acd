//! Refresh watchdog for detecting stuck nodes
//!
//! Low-overhead monitoring using atomic timestamps instead of locks.
//! Each executor worker owns a [`WatchdogHandle`] and stores the start time of
//! the refresh it is running; the watchdog thread periodically scans those
//! timestamps and reports refreshes running longer than the threshold.

use crate::config::WatchdogConfig;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Timestamp in milliseconds since UNIX_EPOCH
#[inline(always)]
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Per-worker tracking state
struct WorkerState {
    /// When the current refresh started (ms since epoch), or 0 if idle
    started: AtomicU64,
    /// Already reported the current refresh
    has_warned: AtomicBool,
    worker_name: String,
    node_name: Mutex<String>,
}

impl WorkerState {
    fn node_name(&self) -> String {
        self.node_name.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Handle to one worker's watchdog state
#[derive(Clone)]
pub struct WatchdogHandle {
    state: Arc<WorkerState>,
}

impl WatchdogHandle {
    /// Mark the start of a refresh of `node_name`
    pub fn start_refresh(&self, node_name: &str) {
        {
            let mut current = self.state.node_name.lock().unwrap_or_else(PoisonError::into_inner);
            current.clear();
            current.push_str(node_name);
        }
        self.state.has_warned.store(false, Ordering::Relaxed);
        self.state.started.store(now_millis(), Ordering::Release);
    }

    /// Mark the end of the current refresh
    pub fn finish_refresh(&self) {
        let started = self.state.started.swap(0, Ordering::AcqRel);
        if self.state.has_warned.swap(false, Ordering::Relaxed) {
            info!(
                "Refresh of [{}] on {} finished after {:.1}s",
                self.state.node_name(),
                self.state.worker_name,
                now_millis().saturating_sub(started) as f64 / 1000.0
            );
        }
    }

    /// Track a refresh for the lifetime of the returned guard
    pub fn track<'a>(&'a self, node_name: &str) -> RefreshGuard<'a> {
        RefreshGuard::new(self, node_name)
    }
}

/// Shared watchdog state
#[derive(Clone)]
pub struct Watchdog {
    workers: Arc<Mutex<Vec<Weak<WorkerState>>>>,
    running: Arc<AtomicBool>,
    threshold_ms: u64,
    poll_interval: Duration,
}

impl Watchdog {
    pub fn new(threshold: Duration, poll_interval: Duration) -> Self {
        Self {
            workers: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(true)),
            threshold_ms: threshold.as_millis() as u64,
            poll_interval,
        }
    }

    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self::new(config.threshold(), config.poll_interval())
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_millis(self.threshold_ms)
    }

    /// Register a worker for monitoring
    pub fn register_worker(&self, worker_name: &str) -> WatchdogHandle {
        let state = Arc::new(WorkerState {
            started: AtomicU64::new(0),
            has_warned: AtomicBool::new(false),
            worker_name: worker_name.to_string(),
            node_name: Mutex::new(String::new()),
        });

        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&state));

        WatchdogHandle { state }
    }

    /// Report refreshes over the threshold. Returns how many are over it.
    pub fn check_for_slow_refreshes(&self) -> usize {
        let now = now_millis();
        let mut slow = 0;

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.retain(|weak| {
            let Some(state) = weak.upgrade() else {
                return false;
            };
            let started = state.started.load(Ordering::Acquire);
            if started > 0 {
                let elapsed_ms = now.saturating_sub(started);
                if elapsed_ms > self.threshold_ms {
                    slow += 1;
                    // Only warn once per refresh
                    if !state.has_warned.swap(true, Ordering::Relaxed) {
                        warn!(
                            "Refresh of [{}] on {} running for {:.1}s",
                            state.node_name(),
                            state.worker_name,
                            elapsed_ms as f64 / 1000.0
                        );
                    }
                }
            }
            true
        });
        slow
    }

    /// Start the monitoring thread
    pub fn start_monitoring_thread(&self) -> JoinHandle<()> {
        let watchdog = self.clone();
        debug!(
            "Watchdog polling every {:?}, threshold {}ms",
            self.poll_interval, self.threshold_ms
        );
        std::thread::spawn(move || {
            while watchdog.running.load(Ordering::Relaxed) {
                std::thread::park_timeout(watchdog.poll_interval);
                if !watchdog.running.load(Ordering::Relaxed) {
                    break;
                }
                watchdog.check_for_slow_refreshes();
            }
        })
    }

    /// Stop the monitoring thread at its next wakeup
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::from_config(&WatchdogConfig::default())
    }
}

/// RAII guard marking a refresh in progress
pub struct RefreshGuard<'a> {
    handle: &'a WatchdogHandle,
}

impl<'a> RefreshGuard<'a> {
    pub fn new(handle: &'a WatchdogHandle, node_name: &str) -> Self {
        handle.start_refresh(node_name);
        Self { handle }
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.handle.finish_refresh();
    }
}
