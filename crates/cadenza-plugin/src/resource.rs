//! Per-plugin resource sampling and limit enforcement.
//!
//! A [`ResourceMonitor`] periodically asks its [`ResourceSampler`] for the
//! current usage, compares it against [`ResourceLimits`] and reacts according
//! to the configured [`EnforceMode`]. A limit of zero disables that dimension.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::info::duration_ms;
use crate::plugin::Plugin;

/// Violations kept per monitor. Older entries are dropped first.
pub const MAX_VIOLATIONS: usize = 128;

// ─── Limits ─────────────────────────────────────────────────────────

/// What to do when a limit is breached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforceMode {
    /// Log and carry on.
    Warn,
    /// Record the violation. Throttling is left to the caller.
    #[default]
    Limit,
    /// Flag the plugin for a forced stop.
    Kill,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_mb: u64,
    pub max_cpu_percent: f64,
    pub max_tasks: u64,
    pub max_file_handles: u64,
    pub max_connections: u64,
    #[serde(with = "duration_ms")]
    pub execution_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub startup_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,
    pub enabled: bool,
    pub enforce_mode: EnforceMode,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 256,
            max_cpu_percent: 50.0,
            max_tasks: 1000,
            max_file_handles: 100,
            max_connections: 50,
            execution_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            startup_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
            enabled: true,
            enforce_mode: EnforceMode::Limit,
        }
    }
}

impl ResourceLimits {
    /// CPU is the only signed-looking field; clamp it so limits stay non-negative.
    pub fn normalized(mut self) -> Self {
        if !self.max_cpu_percent.is_finite() || self.max_cpu_percent < 0.0 {
            self.max_cpu_percent = 0.0;
        }
        self
    }
}

// ─── Usage ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_mb: u64,
    pub cpu_percent: f64,
    pub tasks: u64,
    pub file_handles: u64,
    pub connections: u64,
    pub last_updated: DateTime<Utc>,
}

impl Default for ResourceUsage {
    fn default() -> Self {
        Self {
            memory_mb: 0,
            cpu_percent: 0.0,
            tasks: 0,
            file_handles: 0,
            connections: 0,
            last_updated: Utc::now(),
        }
    }
}

/// One breached dimension.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitViolation {
    pub resource: &'static str,
    pub observed: f64,
    pub limit: f64,
    pub at: DateTime<Utc>,
}

/// Compares `usage` to `limits`. Zero limits are ignored.
pub fn check_limits(usage: &ResourceUsage, limits: &ResourceLimits) -> Vec<LimitViolation> {
    let dims: [(&'static str, f64, f64); 5] = [
        ("memory_mb", usage.memory_mb as f64, limits.max_memory_mb as f64),
        ("cpu_percent", usage.cpu_percent, limits.max_cpu_percent),
        ("tasks", usage.tasks as f64, limits.max_tasks as f64),
        ("file_handles", usage.file_handles as f64, limits.max_file_handles as f64),
        ("connections", usage.connections as f64, limits.max_connections as f64),
    ];
    let now = Utc::now();
    dims.into_iter()
        .filter(|(_, observed, limit)| *limit > 0.0 && observed > limit)
        .map(|(resource, observed, limit)| LimitViolation {
            resource,
            observed,
            limit,
            at: now,
        })
        .collect()
}

// ─── Samplers ───────────────────────────────────────────────────────

#[async_trait]
pub trait ResourceSampler: Send + Sync + 'static {
    async fn sample(&self) -> ResourceUsage;
}

/// Samples a plugin through the metrics it reports about itself.
pub struct PluginSampler {
    plugin_id: String,
    plugin: Arc<dyn Plugin>,
    timeout: Duration,
}

impl PluginSampler {
    pub fn new(plugin_id: impl Into<String>, plugin: Arc<dyn Plugin>, timeout: Duration) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            plugin,
            timeout,
        }
    }
}

#[async_trait]
impl ResourceSampler for PluginSampler {
    async fn sample(&self) -> ResourceUsage {
        let plugin = Arc::clone(&self.plugin);
        let reported = crate::call::guarded(&self.plugin_id, "metrics", self.timeout, async move {
            plugin.metrics().await
        })
        .await;

        match reported {
            Ok(Some(m)) => ResourceUsage {
                memory_mb: m.memory_mb(),
                cpu_percent: m.cpu_usage,
                tasks: m.active_tasks,
                file_handles: m.open_files,
                connections: m.open_connections,
                last_updated: Utc::now(),
            },
            Ok(None) => ResourceUsage::default(),
            Err(e) => {
                tracing::debug!(plugin_id = %self.plugin_id, error = %e, "resource sample failed");
                ResourceUsage::default()
            }
        }
    }
}

// ─── Monitor ────────────────────────────────────────────────────────

pub struct ResourceMonitor {
    plugin_id: String,
    sampler: Arc<dyn ResourceSampler>,
    interval: Duration,
    limits: RwLock<ResourceLimits>,
    usage: RwLock<ResourceUsage>,
    violations: Mutex<VecDeque<LimitViolation>>,
    healthy: AtomicBool,
    kill_requested: AtomicBool,
    kill_tx: Option<mpsc::UnboundedSender<String>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("plugin_id", &self.plugin_id)
            .field("interval", &self.interval)
            .field("limits", &self.limits())
            .finish()
    }
}

impl ResourceMonitor {
    pub fn new(
        plugin_id: impl Into<String>,
        limits: ResourceLimits,
        sampler: Arc<dyn ResourceSampler>,
        interval: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            plugin_id: plugin_id.into(),
            sampler,
            interval,
            limits: RwLock::new(limits.normalized()),
            usage: RwLock::new(ResourceUsage::default()),
            violations: Mutex::new(VecDeque::new()),
            healthy: AtomicBool::new(true),
            kill_requested: AtomicBool::new(false),
            kill_tx: None,
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Plugin ids are sent here when a limit is breached in [`EnforceMode::Kill`].
    pub fn with_kill_channel(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.kill_tx = Some(tx);
        self
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Takes one sample and applies the enforce mode. Returns the breaches found.
    pub async fn sample_now(&self) -> Vec<LimitViolation> {
        let usage = self.sampler.sample().await;
        let limits = self.limits();
        let breaches = check_limits(&usage, &limits);

        *self.usage.write().unwrap_or_else(|e| e.into_inner()) = usage;
        self.healthy.store(breaches.is_empty(), Ordering::SeqCst);

        if breaches.is_empty() {
            return breaches;
        }

        match limits.enforce_mode {
            EnforceMode::Warn => {
                for v in &breaches {
                    tracing::warn!(
                        plugin_id = %self.plugin_id,
                        resource = v.resource,
                        observed = v.observed,
                        limit = v.limit,
                        "resource limit exceeded"
                    );
                }
            }
            EnforceMode::Limit => self.record(&breaches),
            EnforceMode::Kill => {
                self.record(&breaches);
                if !self.kill_requested.swap(true, Ordering::SeqCst) {
                    tracing::error!(
                        plugin_id = %self.plugin_id,
                        breaches = breaches.len(),
                        "resource limits exceeded, requesting forced stop"
                    );
                    if let Some(tx) = &self.kill_tx {
                        let _ = tx.send(self.plugin_id.clone());
                    }
                }
            }
        }
        breaches
    }

    fn record(&self, breaches: &[LimitViolation]) {
        let mut violations = self.violations.lock().unwrap_or_else(|e| e.into_inner());
        violations.extend(breaches.iter().cloned());
        let excess = violations.len().saturating_sub(MAX_VIOLATIONS);
        violations.drain(..excess);
    }

    /// Starts the periodic sampling task. Idempotent.
    ///
    /// A fresh start re-arms kill enforcement.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.kill_requested.store(false, Ordering::SeqCst);
        self.healthy.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(false);
        let mut shutdown_rx = self.shutdown.subscribe();
        let monitor = Arc::clone(self);

        *slot = Some(tokio::spawn(async move {
            tracing::debug!(plugin_id = %monitor.plugin_id, "resource monitor started");
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.sample_now().await;
                    }
                    res = shutdown_rx.changed() => {
                        if res.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(plugin_id = %monitor.plugin_id, "resource monitor stopped");
        }));
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Snapshot of the last sample.
    pub fn metrics(&self) -> ResourceUsage {
        self.usage.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Swaps limits in place. The next sample uses them.
    pub fn update_limits(&self, limits: ResourceLimits) {
        *self.limits.write().unwrap_or_else(|e| e.into_inner()) = limits.normalized();
        self.kill_requested.store(false, Ordering::SeqCst);
    }

    /// The most recent violations, oldest first. At most [`MAX_VIOLATIONS`].
    pub fn violations(&self) -> Vec<LimitViolation> {
        self.violations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn kill_requested(&self) -> bool {
        self.kill_requested.load(Ordering::SeqCst)
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
