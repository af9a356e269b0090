//! Periodic liveness checks.
//!
//! The checker calls [`Plugin::health_check`] on every enrolled plugin,
//! guarded like any other plugin call, and keeps the latest verdict.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::call::guarded;
use crate::plugin::Plugin;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSweep {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

pub struct HealthChecker {
    interval: Duration,
    timeout: Duration,
    targets: RwLock<HashMap<String, Arc<dyn Plugin>>>,
    status: RwLock<HashMap<String, HealthStatus>>,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("interval", &self.interval)
            .field("targets", &self.len())
            .finish()
    }
}

impl HealthChecker {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            targets: RwLock::new(HashMap::new()),
            status: RwLock::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn register(&self, plugin_id: &str, plugin: Arc<dyn Plugin>) {
        self.targets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(plugin_id.to_string(), plugin);
    }

    /// Stops checking `plugin_id` and forgets its last status.
    pub fn unregister(&self, plugin_id: &str) -> bool {
        self.status
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(plugin_id);
        self.targets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(plugin_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.targets.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self, plugin_id: &str) -> Option<HealthStatus> {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(plugin_id)
            .cloned()
    }

    /// Checks one plugin now. `None` if it is not enrolled.
    pub async fn check(&self, plugin_id: &str) -> Option<HealthStatus> {
        let plugin = self
            .targets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(plugin_id)
            .cloned()?;

        let outcome = guarded(plugin_id, "health_check", self.timeout, async move {
            plugin.health_check().await
        })
        .await;

        let mut statuses = self.status.write().unwrap_or_else(|e| e.into_inner());
        let previous_failures = statuses
            .get(plugin_id)
            .map_or(0, |s| s.consecutive_failures);
        let status = match outcome {
            Ok(()) => HealthStatus {
                healthy: true,
                last_check: Utc::now(),
                last_error: None,
                consecutive_failures: 0,
            },
            Err(e) => {
                warn!(plugin_id, error = %e, "plugin health check failed");
                HealthStatus {
                    healthy: false,
                    last_check: Utc::now(),
                    last_error: Some(e.to_string()),
                    consecutive_failures: previous_failures + 1,
                }
            }
        };
        statuses.insert(plugin_id.to_string(), status.clone());
        Some(status)
    }

    pub async fn check_all(&self) -> HealthSweep {
        let ids: Vec<String> = self
            .targets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();

        let mut sweep = HealthSweep::default();
        for id in ids {
            if let Some(status) = self.check(&id).await {
                sweep.checked += 1;
                if status.healthy {
                    sweep.healthy += 1;
                } else {
                    sweep.unhealthy += 1;
                }
            }
        }
        sweep
    }
}

/// Runs [`HealthChecker::check_all`] every interval until `shutdown_rx` flips.
pub fn spawn_health_checker(
    checker: Arc<HealthChecker>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_ms = checker.interval().as_millis() as u64, "health checker started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(checker.interval()) => {
                    let sweep = checker.check_all().await;
                    debug!(
                        checked = sweep.checked,
                        healthy = sweep.healthy,
                        unhealthy = sweep.unhealthy,
                        "health checker: sweep complete"
                    );
                }
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info!("health checker: shutting down");
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
    use crate::info::PluginInfo;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Flaky {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl Plugin for Flaky {
        fn info(&self) -> PluginInfo {
            PluginInfo::new("flaky", "0.1.0")
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
        async fn health_check(&self) -> Result<(), PluginError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(PluginError::Reported("stream stalled".into()))
            }
        }
    }

    #[tokio::test]
    async fn test_check_tracks_consecutive_failures() {
        let checker = HealthChecker::new(Duration::from_secs(30), Duration::from_secs(1));
        let plugin = Arc::new(Flaky {
            healthy: AtomicBool::new(false),
        });
        checker.register("flaky", plugin.clone());

        checker.check("flaky").await.unwrap();
        let status = checker.check("flaky").await.unwrap();
        assert!(!status.healthy);
        assert_eq!(status.consecutive_failures, 2);
        assert!(status.last_error.unwrap().contains("stream stalled"));

        plugin.healthy.store(true, Ordering::SeqCst);
        let status = checker.check("flaky").await.unwrap();
        assert!(status.healthy);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_check_all_and_unregister() {
        let checker = HealthChecker::new(Duration::from_secs(30), Duration::from_secs(1));
        checker.register("a", Arc::new(Flaky { healthy: AtomicBool::new(true) }));
        checker.register("b", Arc::new(Flaky { healthy: AtomicBool::new(false) }));

        let sweep = checker.check_all().await;
        assert_eq!(sweep, HealthSweep { checked: 2, healthy: 1, unhealthy: 1 });

        assert!(checker.unregister("b"));
        assert!(checker.status("b").is_none());
        assert!(checker.check("b").await.is_none());
        assert_eq!(checker.len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_checker_stops_on_shutdown() {
        let checker = Arc::new(HealthChecker::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
        ));
        checker.register("a", Arc::new(Flaky { healthy: AtomicBool::new(true) }));
        let (tx, rx) = watch::channel(false);
        let handle = spawn_health_checker(Arc::clone(&checker), rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(checker.status("a").is_some());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
