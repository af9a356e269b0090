//! Periodic collection of plugin-reported metrics.
//!
//! Each sweep snapshots every enrolled plugin's state together with the
//! metrics it reports, then rolls them up into process-wide totals. A plugin
//! that reports nothing, or fails to, contributes a zeroed snapshot.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::call::guarded;
use crate::info::PluginMetrics;
use crate::managed::ManagedPlugin;
use crate::state::PluginState;

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub plugin_id: String,
    pub state: PluginState,
    pub metrics: PluginMetrics,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorTotals {
    pub plugins: usize,
    pub running: usize,
    pub errored: usize,
    pub memory_bytes: u64,
    pub cpu_percent: f64,
    pub requests: u64,
    pub errors: u64,
    pub collected_at: Option<DateTime<Utc>>,
}

pub struct PluginMonitor {
    interval: Duration,
    timeout: Duration,
    plugins: RwLock<HashMap<String, Arc<ManagedPlugin>>>,
    snapshots: RwLock<HashMap<String, MetricsSnapshot>>,
    totals: RwLock<MonitorTotals>,
}

impl std::fmt::Debug for PluginMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginMonitor")
            .field("interval", &self.interval)
            .field("totals", &self.totals())
            .finish()
    }
}

impl PluginMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            plugins: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            totals: RwLock::new(MonitorTotals::default()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn add(&self, plugin: Arc<ManagedPlugin>) {
        self.plugins
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(plugin.id.clone(), plugin);
    }

    pub fn remove(&self, plugin_id: &str) -> bool {
        self.snapshots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(plugin_id);
        self.plugins
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(plugin_id)
            .is_some()
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.plugins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(plugin_id)
    }

    pub fn snapshot(&self, plugin_id: &str) -> Option<MetricsSnapshot> {
        self.snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(plugin_id)
            .cloned()
    }

    pub fn totals(&self) -> MonitorTotals {
        self.totals.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn sample(&self, plugin: &ManagedPlugin) -> MetricsSnapshot {
        let instance = Arc::clone(&plugin.plugin);
        let metrics = match guarded(&plugin.id, "metrics", self.timeout, async move {
            instance.metrics().await
        })
        .await
        {
            Ok(Some(m)) => m,
            Ok(None) => PluginMetrics::zeroed(),
            Err(e) => {
                debug!(plugin_id = %plugin.id, error = %e, "metrics unavailable, using zeroed snapshot");
                PluginMetrics::zeroed()
            }
        };
        MetricsSnapshot {
            plugin_id: plugin.id.clone(),
            state: plugin.state(),
            metrics,
            taken_at: Utc::now(),
        }
    }

    /// Samples every enrolled plugin and recomputes the totals.
    pub async fn collect(&self) -> MonitorTotals {
        let plugins: Vec<Arc<ManagedPlugin>> = self
            .plugins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let mut totals = MonitorTotals {
            plugins: plugins.len(),
            collected_at: Some(Utc::now()),
            ..Default::default()
        };
        let mut fresh = HashMap::with_capacity(plugins.len());
        for plugin in &plugins {
            let snap = self.sample(plugin).await;
            match snap.state {
                PluginState::Running => totals.running += 1,
                PluginState::Error => totals.errored += 1,
                _ => {}
            }
            totals.memory_bytes += snap.metrics.memory_usage;
            totals.cpu_percent += snap.metrics.cpu_usage;
            totals.requests += snap.metrics.request_count;
            totals.errors += snap.metrics.error_count;
            fresh.insert(snap.plugin_id.clone(), snap);
        }

        {
            let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
            // Plugins removed mid-sweep must not reappear.
            let enrolled = self.plugins.read().unwrap_or_else(|e| e.into_inner());
            fresh.retain(|id, _| enrolled.contains_key(id));
            *snapshots = fresh;
        }
        *self.totals.write().unwrap_or_else(|e| e.into_inner()) = totals.clone();
        totals
    }
}

/// Runs [`PluginMonitor::collect`] every interval until `shutdown_rx` flips.
pub fn spawn_metrics_monitor(
    monitor: Arc<PluginMonitor>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_ms = monitor.interval().as_millis() as u64, "metrics monitor started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(monitor.interval()) => {
                    let totals = monitor.collect().await;
                    debug!(
                        plugins = totals.plugins,
                        running = totals.running,
                        memory_bytes = totals.memory_bytes,
                        requests = totals.requests,
                        errors = totals.errors,
                        "metrics monitor: sweep complete"
                    );
                }
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info!("metrics monitor: shutting down");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PluginContext;
    use crate::error::PluginError;
    use crate::events::EventBus;
    use crate::info::{LoaderKind, PluginInfo};
    use crate::plugin::Plugin;
    use crate::security::SecurityManager;
    use crate::services::InMemoryServiceRegistry;
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct Reporting(Option<PluginMetrics>);

    #[async_trait]
    impl Plugin for Reporting {
        fn info(&self) -> PluginInfo {
            PluginInfo::new("reporting", "0.1.0")
        }
        async fn initialize(&self, _ctx: Arc<PluginContext>) -> Result<(), PluginError> {
            Ok(())
        }
        async fn start(&self) -> Result<(), PluginError> {
            Ok(())
        }
        async fn stop(&self) -> Result<(), PluginError> {
            Ok(())
        }
        async fn metrics(&self) -> Result<Option<PluginMetrics>, PluginError> {
            Ok(self.0.clone())
        }
    }

    fn managed(id: &str, metrics: Option<PluginMetrics>) -> Arc<ManagedPlugin> {
        let ctx = PluginContext::new(
            id,
            id,
            Arc::new(EventBus::new()),
            Arc::new(InMemoryServiceRegistry::new()),
            Arc::new(SecurityManager::default()),
        );
        Arc::new(ManagedPlugin::new(
            id.to_string(),
            PathBuf::from(id),
            LoaderKind::Dynamic,
            PluginInfo::new(id, "0.1.0"),
            Arc::new(Reporting(metrics)),
            Arc::new(ctx),
            None,
            HashMap::new(),
        ))
    }

    #[tokio::test]
    async fn test_missing_metrics_are_zeroed() {
        let monitor = PluginMonitor::new(Duration::from_secs(10), Duration::from_secs(1));
        monitor.add(managed("silent", None));
        let totals = monitor.collect().await;
        assert_eq!(totals.plugins, 1);
        assert_eq!(totals.memory_bytes, 0);
        let snap = monitor.snapshot("silent").unwrap();
        assert_eq!(snap.metrics.request_count, 0);
        assert_eq!(snap.state, PluginState::Loaded);
    }

    #[tokio::test]
    async fn test_totals_aggregate_reported_metrics() {
        let monitor = PluginMonitor::new(Duration::from_secs(10), Duration::from_secs(1));
        for (id, requests) in [("a", 10), ("b", 5)] {
            monitor.add(managed(
                id,
                Some(PluginMetrics {
                    memory_usage: 1024,
                    request_count: requests,
                    error_count: 1,
                    ..PluginMetrics::zeroed()
                }),
            ));
        }
        let totals = monitor.collect().await;
        assert_eq!(totals.requests, 15);
        assert_eq!(totals.errors, 2);
        assert_eq!(totals.memory_bytes, 2048);
        assert_eq!(monitor.totals(), totals);
    }

    #[tokio::test]
    async fn test_remove_drops_snapshot() {
        let monitor = PluginMonitor::new(Duration::from_secs(10), Duration::from_secs(1));
        monitor.add(managed("a", None));
        monitor.collect().await;
        assert!(monitor.remove("a"));
        assert!(monitor.snapshot("a").is_none());
        assert!(!monitor.contains("a"));
        assert_eq!(monitor.collect().await.plugins, 0);
    }
}
