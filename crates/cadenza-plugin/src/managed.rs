//! The orchestrator's record for one loaded plugin.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::circuit::CircuitBreaker;
use crate::context::PluginContext;
use crate::error::PluginError;
use crate::hooks::HookSet;
use crate::info::{LoaderKind, PluginInfo, PluginPriority};
use crate::plugin::Plugin;
use crate::state::{is_valid_transition, PluginState};

/// Mutable part of a [`ManagedPlugin`]. Guarded by a std lock that is never
/// held across an await.
#[derive(Debug)]
pub(crate) struct PluginRecord {
    pub state: PluginState,
    pub load_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub dependencies: Vec<String>,
    pub priority: PluginPriority,
    pub group: Option<String>,
    pub retry_count: u32,
    pub failure_count: u32,
    pub circuit_open: bool,
    pub last_error: Option<String>,
    pub hooks: HookSet,
    pub metadata: HashMap<String, String>,
}

pub struct ManagedPlugin {
    pub(crate) id: String,
    pub(crate) path: PathBuf,
    pub(crate) kind: LoaderKind,
    pub(crate) info: PluginInfo,
    pub(crate) plugin: Arc<dyn Plugin>,
    pub(crate) context: Arc<PluginContext>,
    pub(crate) breaker: Option<CircuitBreaker>,
    /// Serialises start/stop/unload on this plugin.
    pub(crate) lifecycle: tokio::sync::Mutex<()>,
    record: RwLock<PluginRecord>,
}

impl std::fmt::Debug for ManagedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedPlugin")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl ManagedPlugin {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        path: PathBuf,
        kind: LoaderKind,
        info: PluginInfo,
        plugin: Arc<dyn Plugin>,
        context: Arc<PluginContext>,
        breaker: Option<CircuitBreaker>,
        metadata: HashMap<String, String>,
    ) -> Self {
        let mut dependencies = plugin.dependencies();
        for dep in &info.dependencies {
            if !dependencies.contains(dep) {
                dependencies.push(dep.clone());
            }
        }
        let record = PluginRecord {
            state: PluginState::Loaded,
            load_time: Utc::now(),
            start_time: None,
            stop_time: None,
            dependencies,
            priority: info.priority,
            group: None,
            retry_count: 0,
            failure_count: 0,
            circuit_open: false,
            last_error: None,
            hooks: HookSet::new(),
            metadata,
        };
        Self {
            id,
            path,
            kind,
            info,
            plugin,
            context,
            breaker,
            lifecycle: tokio::sync::Mutex::new(()),
            record: RwLock::new(record),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    pub fn kind(&self) -> LoaderKind {
        self.kind
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, PluginRecord> {
        self.record.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, PluginRecord> {
        self.record.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> PluginState {
        self.read().state
    }

    pub fn priority(&self) -> PluginPriority {
        self.read().priority
    }

    /// Moves to `to`, checking the transition table unless `force` is set.
    /// Returns the previous state.
    pub(crate) fn transition(&self, to: PluginState, force: bool) -> Result<PluginState, PluginError> {
        let mut record = self.write();
        let from = record.state;
        if !force && !is_valid_transition(from, to) {
            return Err(PluginError::InvalidTransition {
                plugin: self.id.clone(),
                from,
                to,
            });
        }
        if force && !is_valid_transition(from, to) && from != to {
            tracing::warn!(plugin_id = %self.id, %from, %to, "forcing state transition");
        }
        record.state = to;
        Ok(from)
    }

    /// Marks the plugin failed and remembers why.
    pub(crate) fn fail(&self, error: &PluginError) {
        let mut record = self.write();
        record.state = PluginState::Error;
        record.failure_count += 1;
        record.last_error = Some(error.to_string());
    }

    /// Whether `reference` is this plugin's id or name.
    pub fn answers_to(&self, reference: &str) -> bool {
        self.info.answers_to(&self.id, reference)
    }

    /// Whether this plugin declares `other` as a dependency.
    pub fn depends_on(&self, other: &ManagedPlugin) -> bool {
        self.read().dependencies.iter().any(|d| other.answers_to(d))
    }

    /// `name(id)` as used in dependency error messages.
    pub fn label(&self) -> String {
        format!("{}({})", self.info.name, self.id)
    }

    pub fn snapshot(&self) -> PluginSnapshot {
        let r = self.read();
        PluginSnapshot {
            id: self.id.clone(),
            path: self.path.clone(),
            kind: self.kind,
            info: self.info.clone(),
            state: r.state,
            load_time: r.load_time,
            start_time: r.start_time,
            stop_time: r.stop_time,
            dependencies: r.dependencies.clone(),
            priority: r.priority,
            group: r.group.clone(),
            retry_count: r.retry_count,
            failure_count: r.failure_count,
            circuit_open: r.circuit_open,
            last_error: r.last_error.clone(),
            hooks: r.hooks.names().into_iter().map(String::from).collect(),
            metadata: r.metadata.clone(),
        }
    }
}

/// Point-in-time copy of a managed plugin, safe to hand out.
#[derive(Debug, Clone, Serialize)]
pub struct PluginSnapshot {
    pub id: String,
    pub path: PathBuf,
    pub kind: LoaderKind,
    pub info: PluginInfo,
    pub state: PluginState,
    pub load_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub dependencies: Vec<String>,
    pub priority: PluginPriority,
    pub group: Option<String>,
    pub retry_count: u32,
    pub failure_count: u32,
    pub circuit_open: bool,
    pub last_error: Option<String>,
    pub hooks: Vec<String>,
    pub metadata: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::security::SecurityManager;
    use crate::services::InMemoryServiceRegistry;
    use async_trait::async_trait;

    struct Stub(PluginInfo);

    #[async_trait]
    impl Plugin for Stub {
        fn info(&self) -> PluginInfo {
            self.0.clone()
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
    }

    fn managed(id: &str, info: PluginInfo) -> ManagedPlugin {
        let ctx = PluginContext::new(
            id,
            info.name.clone(),
            Arc::new(EventBus::new()),
            Arc::new(InMemoryServiceRegistry::new()),
            Arc::new(SecurityManager::default()),
        );
        ManagedPlugin::new(
            id.to_string(),
            PathBuf::from(format!("/plugins/{id}.so")),
            LoaderKind::Dynamic,
            info.clone(),
            Arc::new(Stub(info)),
            Arc::new(ctx),
            None,
            HashMap::new(),
        )
    }

    #[test]
    fn test_starts_loaded() {
        let mp = managed("dec", PluginInfo::new("decoder", "1.0.0"));
        assert_eq!(mp.state(), PluginState::Loaded);
        assert_eq!(mp.label(), "decoder(dec)");
    }

    #[test]
    fn test_transition_checks_table() {
        let mp = managed("dec", PluginInfo::new("decoder", "1.0.0"));
        let err = mp.transition(PluginState::Stopped, false).unwrap_err();
        assert!(matches!(err, PluginError::InvalidTransition { .. }));
        assert_eq!(mp.state(), PluginState::Loaded);

        assert_eq!(
            mp.transition(PluginState::Running, false).unwrap(),
            PluginState::Loaded
        );
        mp.transition(PluginState::Unloaded, true).unwrap();
        assert_eq!(mp.state(), PluginState::Unloaded);
    }

    #[test]
    fn test_depends_on_by_name_or_id() {
        let decoder = managed("dec", PluginInfo::new("decoder", "1.0.0"));
        let by_name = managed(
            "sp",
            PluginInfo::new("spotify", "1.0.0").with_dependencies(["decoder"]),
        );
        let by_id = managed("r", PluginInfo::new("radio", "1.0.0").with_dependencies(["dec"]));
        let unrelated = managed("lf", PluginInfo::new("local-files", "1.0.0"));
        assert!(by_name.depends_on(&decoder));
        assert!(by_id.depends_on(&decoder));
        assert!(!unrelated.depends_on(&decoder));
    }

    #[test]
    fn test_fail_records_error() {
        let mp = managed("dec", PluginInfo::new("decoder", "1.0.0"));
        mp.fail(&PluginError::Reported("bad codec".into()));
        let snap = mp.snapshot();
        assert_eq!(snap.state, PluginState::Error);
        assert_eq!(snap.failure_count, 1);
        assert_eq!(
            snap.last_error.as_deref(),
            Some("plugin reported an error: bad codec")
        );
    }
}
