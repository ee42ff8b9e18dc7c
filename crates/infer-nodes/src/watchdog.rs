//! Stall detection for the worker stages.
//!
//! Workers beat their component on every processed output; a
//! background thread trips the watchdog state and stops the pipeline
//! when a component goes quiet for too long.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::error;

pub(crate) const WATCHDOG_POLL_INTERVAL_MS: u64 = 500;
pub(crate) const WATCHDOG_STALE_THRESHOLD_MS: u64 = 1_500;
pub(crate) const WATCHDOG_STARTUP_GRACE_MS: u64 = 5_000;

#[derive(Copy, Clone, Debug)]
pub enum HealthComponent {
    Detection,
    Feature,
}

impl HealthComponent {
    pub fn label(self) -> &'static str {
        match self {
            HealthComponent::Detection => "detection",
            HealthComponent::Feature => "feature",
        }
    }
}

/// Last-heartbeat timestamps of the pipeline stages, in unix millis.
pub struct PipelineHealth {
    detection: AtomicU64,
    feature: AtomicU64,
}

impl PipelineHealth {
    /// Seeds every component with a startup grace deadline so slow
    /// model loading does not trip the watchdog.
    pub fn new() -> Self {
        let now = current_millis();
        let grace_deadline = now.saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            detection: AtomicU64::new(grace_deadline),
            feature: AtomicU64::new(grace_deadline),
        }
    }

    pub fn beat(&self, component: HealthComponent) {
        let now = current_millis();
        match component {
            HealthComponent::Detection => self.detection.store(now, Ordering::Relaxed),
            HealthComponent::Feature => self.feature.store(now, Ordering::Relaxed),
        }
    }

    pub fn stale_component(&self, now: u64) -> Option<HealthComponent> {
        if now.saturating_sub(self.detection.load(Ordering::Relaxed)) > WATCHDOG_STALE_THRESHOLD_MS
        {
            return Some(HealthComponent::Detection);
        }
        if now.saturating_sub(self.feature.load(Ordering::Relaxed)) > WATCHDOG_STALE_THRESHOLD_MS {
            return Some(HealthComponent::Feature);
        }
        None
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Why and whether the watchdog fired.
pub struct WatchdogState {
    triggered: AtomicBool,
    reason: Mutex<Option<HealthComponent>>,
}

impl WatchdogState {
    pub fn new() -> Self {
        Self {
            triggered: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    pub fn arm(&self, component: HealthComponent) {
        if let Ok(mut guard) = self.reason.lock() {
            *guard = Some(component);
        }
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<HealthComponent> {
        match self.reason.lock() {
            Ok(guard) => *guard,
            Err(_) => None,
        }
    }
}

impl Default for WatchdogState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn spawn_watchdog(
    health: Arc<PipelineHealth>,
    running: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    state: Arc<WatchdogState>,
) -> std::thread::JoinHandle<()> {
    thread::Builder::new()
        .name("infer-watchdog".into())
        .spawn(move || {
            while running.load(Ordering::Relaxed) && !shutdown.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS));
                let now = current_millis();
                if let Some(component) = health.stale_component(now) {
                    error!(
                        "Watchdog detected stalled {} stage; requesting pipeline restart",
                        component.label()
                    );
                    state.arm(component);
                    running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        })
        .expect("failed to spawn watchdog thread")
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
