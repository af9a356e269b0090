//! The plugin lifecycle orchestrator.
//!
//! The `Orchestrator` owns every loaded plugin and drives it through
//! load, start, stop and unload. It validates artifacts, resolves
//! dependencies, retries failing plugin calls, announces every transition on
//! the event bus and runs the staged cleanup when a plugin goes away.
//!
//! Locking: the plugin table sits behind one `tokio::sync::RwLock` that is
//! only held for lookups and mutations, never across a plugin call. Each
//! plugin additionally has a lifecycle mutex serialising its own operations.
//! Locks are always taken in the order lifecycle → table → record.

mod cleanup;
mod groups;
mod queues;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::call::guarded;
use crate::circuit::CircuitBreaker;
use crate::config::OrchestratorConfig;
use crate::context::PluginContext;
use crate::error::{CallFailure, PluginError, Result};
use crate::events::{
    Event, EventBus, EventHandler, LifecyclePayload, TOPIC_LOADED, TOPIC_RECOVERY_COMPLETED,
    TOPIC_RECOVERY_STARTED, TOPIC_STARTED, TOPIC_STOPPED, TOPIC_UNLOADED, TOPIC_UNLOADING,
};
use crate::health::{spawn_health_checker, HealthChecker, HealthStatus};
use crate::hooks::{Hook, HookContext, HookPoint, HookSet};
use crate::info::{LoaderKind, PluginInfo, PluginPriority};
use crate::loader::LoaderTable;
use crate::managed::{ManagedPlugin, PluginSnapshot};
use crate::manifest::PluginManifest;
use crate::monitor::{spawn_metrics_monitor, MonitorTotals, PluginMonitor};
use crate::options::{attempts, ProgressReporter, StartOptions, StopOptions, UnloadOptions, UnloadProgress};
use crate::plugin::Plugin;
use crate::resource::{PluginSampler, ResourceMonitor};
use crate::security::{SecurityConfig, SecurityManager};
use crate::services::{
    context_service_name, plugin_service_name, InMemoryServiceRegistry, Service, ServiceRegistry,
};
use crate::state::PluginState;

use cleanup::CleanupScope;
use queues::{StartRequest, StopRequest};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Metadata key substrings scrubbed during unload.
const SENSITIVE_KEYS: &[&str] = &["password", "token", "key", "secret", "credential"];

// ─── Tables ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct Tables {
    plugins: HashMap<String, Arc<ManagedPlugin>>,
    /// Artifact paths with a load in flight. Counted against `max_plugins`.
    loading: HashSet<PathBuf>,
    /// Group name → member ids.
    groups: HashMap<String, Vec<String>>,
    /// Capability → ids of plugins declaring it.
    capabilities: HashMap<String, HashSet<String>>,
}

impl Tables {
    fn holds_path(&self, path: &Path) -> bool {
        self.loading.contains(path) || self.plugins.values().any(|p| p.path == path)
    }

    fn resolve(&self, reference: &str, except: &str) -> Option<&Arc<ManagedPlugin>> {
        self.plugins
            .values()
            .find(|p| p.id != except && p.answers_to(reference))
    }
}

// ─── Orchestrator ───────────────────────────────────────────────────────

/// Central plugin manager.
///
/// Create it with [`Orchestrator::new`] from inside a tokio runtime; it
/// spawns its queue consumers and monitors straight away.
pub struct Orchestrator {
    config: OrchestratorConfig,
    loaders: LoaderTable,
    bus: Arc<EventBus>,
    services: Arc<dyn ServiceRegistry>,
    /// Validates artifacts before a loader sees them.
    security: SecurityManager,
    table: RwLock<Tables>,
    health: Arc<HealthChecker>,
    monitor: Arc<PluginMonitor>,
    /// Resource monitors in kill mode report here.
    kill_tx: mpsc::UnboundedSender<String>,
    start_tx: mpsc::Sender<StartRequest>,
    stop_tx: mpsc::Sender<StopRequest>,
    shutdown_tx: watch::Sender<bool>,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("loaders", &self.loaders)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, loaders: LoaderTable) -> Arc<Self> {
        Self::with_service_registry(config, loaders, Arc::new(InMemoryServiceRegistry::new()))
    }

    /// Like [`new`](Self::new) but publishes started plugins into `services`.
    pub fn with_service_registry(
        config: OrchestratorConfig,
        loaders: LoaderTable,
        services: Arc<dyn ServiceRegistry>,
    ) -> Arc<Self> {
        let capacity = config.queue_capacity.max(1);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let (start_tx, start_rx) = mpsc::channel(capacity);
        let (stop_tx, stop_rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let health = Arc::new(HealthChecker::new(
            config.health_check_interval,
            config.cleanup_timeout,
        ));
        let monitor = Arc::new(PluginMonitor::new(
            config.metrics_interval,
            config.cleanup_timeout,
        ));

        let this = Arc::new(Self {
            security: SecurityManager::new(config.security.clone()),
            config,
            loaders,
            bus: Arc::new(EventBus::new()),
            services,
            table: RwLock::new(Tables::default()),
            health,
            monitor,
            kill_tx,
            start_tx,
            stop_tx,
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&this);
        let mut tasks = vec![
            queues::spawn_start_consumer(weak.clone(), start_rx, shutdown_rx.clone()),
            queues::spawn_stop_consumer(weak.clone(), stop_rx, shutdown_rx.clone()),
            queues::spawn_kill_consumer(weak, kill_rx, shutdown_rx.clone()),
        ];
        if this.config.enable_monitoring {
            tasks.push(spawn_health_checker(Arc::clone(&this.health), shutdown_rx.clone()));
            tasks.push(spawn_metrics_monitor(Arc::clone(&this.monitor), shutdown_rx));
        }
        *this.tasks.lock().unwrap_or_else(|e| e.into_inner()) = tasks;

        info!(
            max_plugins = this.config.max_plugins,
            loaders = ?this.loaders.registered(),
            monitoring = this.config.enable_monitoring,
            "plugin orchestrator started"
        );
        this
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn services(&self) -> &Arc<dyn ServiceRegistry> {
        &self.services
    }

    /// Replaces the artifact validation policy.
    pub fn update_security_config(&self, config: SecurityConfig) {
        self.security.update_config(config);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(PluginError::ShuttingDown);
        }
        Ok(())
    }

    async fn lookup(&self, id: &str) -> Result<Arc<ManagedPlugin>> {
        self.table
            .read()
            .await
            .plugins
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    /// Other registered plugins that declare `target` as a dependency.
    async fn dependents_of(&self, target: &ManagedPlugin, running_only: bool) -> Vec<Arc<ManagedPlugin>> {
        self.table
            .read()
            .await
            .plugins
            .values()
            .filter(|p| p.id != target.id && p.depends_on(target))
            .filter(|p| !running_only || p.state() == PluginState::Running)
            .cloned()
            .collect()
    }

    fn payload(&self, mp: &ManagedPlugin) -> LifecyclePayload {
        LifecyclePayload {
            plugin_id: mp.id.clone(),
            plugin_path: mp.path.display().to_string(),
            plugin_type: mp.kind.as_str().to_string(),
            plugin_state: mp.state().as_str().to_string(),
            plugin_name: mp.info.name.clone(),
            plugin_version: mp.info.version.clone(),
            timestamp: Utc::now(),
            extra: serde_json::Map::new(),
        }
    }

    fn emit(&self, topic: &str, payload: LifecyclePayload) {
        match serde_json::to_value(&payload) {
            Ok(value) => {
                let delivered = self.bus.publish(topic, value);
                debug!(topic, plugin_id = %payload.plugin_id, delivered, "lifecycle event published");
            }
            Err(e) => warn!(topic, error = %e, "failed to encode lifecycle event"),
        }
    }

    // ─── Load ───────────────────────────────────────────────────────────

    /// Loads the artifact at `path` with the loader registered for `kind`.
    ///
    /// Returns the new plugin's id: the id the plugin declares, or a
    /// generated `{kind}_{path}_{nanos}` one.
    pub async fn load(&self, path: impl AsRef<Path>, kind: LoaderKind) -> Result<String> {
        self.ensure_open()?;
        let path = path.as_ref().to_path_buf();
        if path.as_os_str().is_empty() {
            return Err(PluginError::InvalidInput("plugin path must not be empty".into()));
        }

        {
            let mut table = self.table.write().await;
            if table.holds_path(&path) {
                return Err(PluginError::AlreadyLoaded(path.display().to_string()));
            }
            if table.plugins.len() + table.loading.len() >= self.config.max_plugins {
                return Err(PluginError::MaxPluginsReached(self.config.max_plugins));
            }
            table.loading.insert(path.clone());
        }

        let prepared = self.prepare(&path, kind).await;
        let mut table = self.table.write().await;
        table.loading.remove(&path);
        let mp = prepared?;

        if table.plugins.contains_key(&mp.id) {
            return Err(PluginError::IdConflict(mp.id.clone()));
        }
        for capability in &mp.info.capabilities {
            table
                .capabilities
                .entry(capability.clone())
                .or_default()
                .insert(mp.id.clone());
        }
        table.plugins.insert(mp.id.clone(), Arc::clone(&mp));
        drop(table);

        self.health.register(&mp.id, Arc::clone(&mp.plugin));
        self.monitor.add(Arc::clone(&mp));
        self.emit(TOPIC_LOADED, self.payload(&mp));

        info!(
            plugin_id = %mp.id,
            name = %mp.info.name,
            version = %mp.info.version,
            kind = %kind,
            "plugin loaded"
        );
        Ok(mp.id.clone())
    }

    /// Everything in a load that runs without the table lock.
    async fn prepare(&self, path: &Path, kind: LoaderKind) -> Result<Arc<ManagedPlugin>> {
        let manifest = if self.config.enable_security {
            self.security.validate_artifact(path)?
        } else {
            None
        };
        if let Some(declared) = manifest.as_ref().and_then(|m| m.plugin.kind) {
            if declared != kind {
                return Err(PluginError::Validation(format!(
                    "manifest declares a {declared} plugin, but it was loaded as {kind}"
                )));
            }
        }

        let loader = self.loaders.get(kind)?;
        loader.validate_plugin(path)?;

        let plugin = match tokio::time::timeout(self.config.load_timeout, loader.load_plugin(path)).await {
            Ok(loaded) => loaded?,
            Err(_) => return Err(PluginError::LoadTimeout(self.config.load_timeout)),
        };

        let mut info = plugin.info();
        if info.name.trim().is_empty() {
            return Err(PluginError::InvalidMetadata("plugin name is empty".into()));
        }
        if let Some(m) = &manifest {
            merge_declared(&mut info.dependencies, &m.plugin.dependencies);
            merge_declared(&mut info.capabilities, &m.plugin.capabilities);
        }

        let id = match info.id.as_deref().filter(|s| !s.is_empty()) {
            Some(declared) => declared.to_string(),
            None => generate_id(kind, path),
        };

        let mut capabilities = plugin.capabilities();
        merge_declared(&mut capabilities, &info.capabilities);
        info.capabilities = capabilities;
        let mut metadata = info.metadata.clone();
        metadata.insert("loader_type".into(), kind.as_str().into());
        metadata.insert("capabilities".into(), info.capabilities.join(","));
        metadata.insert("load_timestamp".into(), Utc::now().to_rfc3339());

        let context = self.build_context(&id, &info, &plugin, manifest.as_ref());
        let breaker = self
            .config
            .enable_circuit_breaker
            .then(|| CircuitBreaker::new(id.clone(), self.config.circuit.clone()));

        Ok(Arc::new(ManagedPlugin::new(
            id,
            path.to_path_buf(),
            kind,
            info,
            plugin,
            Arc::new(context),
            breaker,
            metadata,
        )))
    }

    fn build_context(
        &self,
        id: &str,
        info: &PluginInfo,
        plugin: &Arc<dyn Plugin>,
        manifest: Option<&PluginManifest>,
    ) -> PluginContext {
        let grant = SecurityConfig {
            permissions: self.config.security.effective_for(manifest),
            ..Default::default()
        };
        let mut context = PluginContext::new(
            id,
            info.name.clone(),
            Arc::clone(&self.bus),
            Arc::clone(&self.services),
            Arc::new(SecurityManager::new(grant)),
        )
        .with_temp_root(&self.config.temp_root);

        if self.config.resource_limits.enabled {
            let sampler = PluginSampler::new(id, Arc::clone(plugin), self.config.cleanup_timeout);
            let monitor = ResourceMonitor::new(
                id,
                self.config.resource_limits.clone(),
                Arc::new(sampler),
                self.config.resource_sample_interval,
            )
            .with_kill_channel(self.kill_tx.clone());
            context = context.with_resources(Arc::new(monitor));
        }
        context
    }

    // ─── Start ──────────────────────────────────────────────────────────

    pub async fn start(&self, id: &str) -> Result<()> {
        self.start_with_options(id, StartOptions::default()).await
    }

    pub async fn start_with_options(&self, id: &str, options: StartOptions) -> Result<()> {
        self.ensure_open()?;
        let mp = self.lookup(id).await?;
        let _guard = mp.lifecycle.lock().await;
        self.start_locked(&mp, &options).await
    }

    async fn start_locked(&self, mp: &Arc<ManagedPlugin>, options: &StartOptions) -> Result<()> {
        let state = mp.state();
        if state == PluginState::Unloaded {
            return Err(PluginError::NotFound(mp.id.clone()));
        }
        if !options.force_start {
            if !state.can_start() {
                return Err(PluginError::InvalidState {
                    plugin: mp.id.clone(),
                    state,
                    operation: "start",
                });
            }
            self.check_dependencies_running(mp).await?;
        }

        let hooks = mp.read().hooks.merged(&options.hooks);
        hooks.run(HookPoint::PreStart, &hook_ctx(mp, HookPoint::PreStart, 0, None))?;

        let timeout = options.timeout.unwrap_or(self.config.start_timeout);
        let delay = options.retry_delay.unwrap_or(self.config.retry_delay);
        let max = attempts(options.retry_count);
        let mut last = None;

        for attempt in 1..=max {
            self.admit(mp)?;
            let plugin = Arc::clone(&mp.plugin);
            let ctx = Arc::clone(&mp.context);
            let outcome = guarded(&mp.id, "start", timeout, async move {
                plugin.initialize(ctx).await?;
                plugin.start().await
            })
            .await;

            match outcome {
                Ok(()) => {
                    self.on_started(mp, &hooks);
                    return Ok(());
                }
                Err(e) => {
                    self.attempt_failed(mp, &hooks, "start", attempt, max, &e);
                    last = Some(e);
                    if attempt < max {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(exhausted(mp, "start", max, last))
    }

    async fn check_dependencies_running(&self, mp: &ManagedPlugin) -> Result<()> {
        let dependencies = mp.read().dependencies.clone();
        let table = self.table.read().await;
        for dep in &dependencies {
            let Some(found) = table.resolve(dep, &mp.id) else {
                return Err(PluginError::DependencyNotFound(dep.clone()));
            };
            let state = found.state();
            if state != PluginState::Running {
                return Err(PluginError::DependencyNotRunning {
                    name: dep.clone(),
                    state,
                });
            }
        }
        Ok(())
    }

    /// Fails fast when the plugin's circuit breaker is open.
    fn admit(&self, mp: &ManagedPlugin) -> Result<()> {
        let Some(breaker) = &mp.breaker else {
            return Ok(());
        };
        let allowed = breaker.allow_request();
        mp.write().circuit_open = !allowed;
        if allowed {
            Ok(())
        } else {
            Err(PluginError::CircuitOpen(mp.id.clone()))
        }
    }

    fn attempt_failed(
        &self,
        mp: &ManagedPlugin,
        hooks: &HookSet,
        operation: &'static str,
        attempt: u32,
        max: u32,
        e: &PluginError,
    ) {
        warn!(plugin_id = %mp.id, operation, attempt, max, error = %e, "plugin operation attempt failed");
        mp.fail(e);
        if attempt > 1 {
            mp.write().retry_count += 1;
        }
        if let Some(breaker) = &mp.breaker {
            breaker.record_failure();
        }
        hooks.run_logged(HookPoint::OnError, &hook_ctx(mp, HookPoint::OnError, attempt, Some(e)));
    }

    fn on_started(&self, mp: &ManagedPlugin, hooks: &HookSet) {
        {
            let mut record = mp.write();
            record.state = PluginState::Running;
            record.start_time = Some(Utc::now());
            record.last_error = None;
            record.circuit_open = false;
        }
        if let Some(breaker) = &mp.breaker {
            breaker.record_success();
        }
        self.register_services(mp);
        if let Some(monitor) = mp.context.resources() {
            monitor.start();
        }
        self.emit(TOPIC_STARTED, self.payload(mp).with("success", true));
        hooks.run_logged(HookPoint::PostStart, &hook_ctx(mp, HookPoint::PostStart, 0, None));
        info!(plugin_id = %mp.id, name = %mp.info.name, "plugin started");
    }

    fn register_services(&self, mp: &ManagedPlugin) {
        let instance: Service = Arc::new(Arc::clone(&mp.plugin));
        let context: Service = mp.context.clone();
        for (name, service) in [
            (plugin_service_name(&mp.info.name), instance),
            (context_service_name(&mp.info.name), context),
        ] {
            if self.services.has_service(&name) {
                let _ = self.services.unregister_service(&name);
            }
            if let Err(e) = self.services.register_service(&name, service) {
                warn!(plugin_id = %mp.id, service = %name, error = %e, "failed to register plugin service");
            }
        }
    }

    fn unregister_services(&self, mp: &ManagedPlugin) {
        for name in [
            plugin_service_name(&mp.info.name),
            context_service_name(&mp.info.name),
        ] {
            if let Err(e) = self.services.unregister_service(&name) {
                debug!(plugin_id = %mp.id, service = %name, error = %e, "service was not registered");
            }
        }
    }

    // ─── Stop ───────────────────────────────────────────────────────────

    pub async fn stop(&self, id: &str) -> Result<()> {
        self.stop_with_options(id, StopOptions::default()).await
    }

    pub async fn stop_with_options(&self, id: &str, options: StopOptions) -> Result<()> {
        self.ensure_open()?;
        let mp = self.lookup(id).await?;
        let _guard = mp.lifecycle.lock().await;
        self.stop_locked(&mp, &options).await
    }

    /// Stops `mp`. The caller holds its lifecycle lock.
    async fn stop_locked(&self, mp: &Arc<ManagedPlugin>, options: &StopOptions) -> Result<()> {
        let state = mp.state();
        if state == PluginState::Unloaded {
            return Err(PluginError::NotFound(mp.id.clone()));
        }
        if !state.can_stop() {
            return Err(PluginError::InvalidState {
                plugin: mp.id.clone(),
                state,
                operation: "stop",
            });
        }
        if !options.force_stop && !self.dependents_of(mp, true).await.is_empty() {
            return Err(PluginError::DependentsRunning(mp.id.clone()));
        }

        let hooks = mp.read().hooks.merged(&options.hooks);
        hooks.run(HookPoint::PreStop, &hook_ctx(mp, HookPoint::PreStop, 0, None))?;
        mp.transition(PluginState::Stopping, options.force_stop)?;

        let timeout = options.timeout.unwrap_or(self.config.stop_timeout);
        let delay = options.retry_delay.unwrap_or(self.config.retry_delay);
        let max = attempts(options.retry_count);
        let mut last = None;

        for attempt in 1..=max {
            let plugin = Arc::clone(&mp.plugin);
            match guarded(&mp.id, "stop", timeout, async move { plugin.stop().await }).await {
                Ok(()) => {
                    last = None;
                    break;
                }
                Err(e) if options.force_stop => {
                    warn!(plugin_id = %mp.id, error = %e, "plugin stop failed, continuing because stop is forced");
                    last = None;
                    break;
                }
                Err(e) => {
                    self.attempt_failed(mp, &hooks, "stop", attempt, max, &e);
                    last = Some(e);
                    if attempt < max {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        if last.is_some() {
            return Err(exhausted(mp, "stop", max, last));
        }

        self.unregister_services(mp);
        if !options.skip_cleanup {
            if let Err(e) = self.cleanup_resources(mp, options.force_stop, CleanupScope::Stop).await {
                warn!(plugin_id = %mp.id, error = %e, "cleanup after stop failed, plugin is stopped anyway");
            }
        }

        let runtime_ms = {
            let mut record = mp.write();
            let now = Utc::now();
            record.state = PluginState::Stopped;
            record.stop_time = Some(now);
            record
                .start_time
                .map_or(0, |started| (now - started).num_milliseconds().max(0))
        };
        if let Some(breaker) = &mp.breaker {
            breaker.record_success();
        }

        self.emit(
            TOPIC_STOPPED,
            self.payload(mp)
                .with("runtime_ms", runtime_ms)
                .with("forced", options.force_stop),
        );
        hooks.run_logged(HookPoint::PostStop, &hook_ctx(mp, HookPoint::PostStop, 0, None));
        info!(plugin_id = %mp.id, runtime_ms, "plugin stopped");
        Ok(())
    }

    // ─── Unload ─────────────────────────────────────────────────────────

    pub async fn unload(&self, id: &str) -> Result<()> {
        self.unload_with_options(id, UnloadOptions::default()).await
    }

    /// Unloads a plugin.
    ///
    /// When every attempt fails the plugin is still removed and the error is
    /// [`PluginError::UnloadRecovered`]; check [`PluginError::plugin_removed`].
    pub async fn unload_with_options(&self, id: &str, options: UnloadOptions) -> Result<()> {
        self.ensure_open()?;
        let mut visited = HashSet::new();
        self.unload_tree(id, &options, &ProgressReporter::silent(), &mut visited)
            .await
    }

    /// Same as [`unload_with_options`](Self::unload_with_options), reporting
    /// each stage to `progress`. Fractions never decrease.
    pub async fn unload_with_progress<F>(
        &self,
        id: &str,
        options: UnloadOptions,
        progress: F,
    ) -> Result<()>
    where
        F: Fn(UnloadProgress) + Send + Sync,
    {
        self.ensure_open()?;
        let sink: &(dyn Fn(UnloadProgress) + Send + Sync) = &progress;
        let reporter = ProgressReporter::new(id, Some(sink));
        let mut visited = HashSet::new();
        self.unload_tree(id, &options, &reporter, &mut visited).await
    }

    /// Unloads `id`, first unloading its dependents when cascading.
    /// The target's lifecycle lock is not held while dependents go.
    fn unload_tree<'a>(
        &'a self,
        id: &'a str,
        options: &'a UnloadOptions,
        progress: &'a ProgressReporter<'a>,
        visited: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mp = self.lookup(id).await?;
            if !visited.insert(mp.id.clone()) {
                return Ok(());
            }

            if options.cascade_unload {
                let mut dependents = self.dependents_of(&mp, false).await;
                dependents.sort_by(|a, b| b.priority().cmp(&a.priority()));
                let ids: Vec<String> = dependents.iter().map(|d| d.id.clone()).collect();
                if !ids.is_empty() {
                    info!(plugin_id = %mp.id, dependents = ?ids, "cascading unload to dependents");
                }
                for dep in ids {
                    if visited.contains(&dep) {
                        continue;
                    }
                    let silent = ProgressReporter::silent();
                    match self.unload_tree(&dep, options, &silent, visited).await {
                        Ok(()) | Err(PluginError::NotFound(_)) => {}
                        Err(e) if e.plugin_removed() => {
                            warn!(plugin_id = %dep, error = %e, "dependent removed by unload recovery");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            self.unload_one(&mp, options, progress).await
        })
    }

    async fn unload_one(
        &self,
        mp: &Arc<ManagedPlugin>,
        options: &UnloadOptions,
        progress: &ProgressReporter<'_>,
    ) -> Result<()> {
        let force = options.force_unload;
        progress.report("validation", 0.1, "validating plugin state");
        let _guard = mp.lifecycle.lock().await;

        let state = mp.state();
        if state == PluginState::Unloaded {
            return Err(PluginError::NotFound(mp.id.clone()));
        }
        if !force && !state.can_unload() {
            return Err(PluginError::InvalidState {
                plugin: mp.id.clone(),
                state,
                operation: "unload",
            });
        }

        progress.report("dependency_check", 0.2, "checking dependents");
        let dependents = self.dependents_of(mp, false).await;
        if !dependents.is_empty() {
            let blockers: Vec<String> = dependents.iter().map(|d| d.label()).collect();
            if !force {
                return Err(PluginError::RequiredBy {
                    plugin: mp.id.clone(),
                    blockers,
                });
            }
            warn!(plugin_id = %mp.id, blockers = ?blockers, "force unloading a plugin other plugins depend on");
        }
        let dependent_ids: Vec<String> = dependents.iter().map(|d| d.id.clone()).collect();

        progress.report("pre_hooks", 0.3, "running pre-unload hooks");
        let hooks = mp.read().hooks.merged(&options.hooks);
        hooks.run(HookPoint::PreUnload, &hook_ctx(mp, HookPoint::PreUnload, 0, None))?;

        let delay = options.retry_delay.unwrap_or(self.config.retry_delay);
        let max = attempts(options.retry_count);
        let mut last = None;

        for attempt in 1..=max {
            progress.report("unloading", 0.4, format!("unload attempt {attempt}/{max}"));
            match self
                .unload_attempt(mp, options, &hooks, &dependent_ids, progress)
                .await
            {
                Ok(()) => {
                    progress.report("post_hooks", 0.95, "running post-unload hooks");
                    hooks.run_logged(
                        HookPoint::PostUnload,
                        &hook_ctx(mp, HookPoint::PostUnload, attempt, None),
                    );
                    progress.report("completed", 1.0, "plugin unloaded");
                    info!(plugin_id = %mp.id, attempt, "plugin unloaded");
                    return Ok(());
                }
                Err(e) => {
                    warn!(plugin_id = %mp.id, attempt, max, error = %e, "unload attempt failed");
                    mp.fail(&e);
                    if attempt > 1 {
                        mp.write().retry_count += 1;
                    }
                    hooks.run_logged(
                        HookPoint::OnError,
                        &hook_ctx(mp, HookPoint::OnError, attempt, Some(&e)),
                    );
                    last = Some(e);
                    if attempt < max {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let cause = exhausted(mp, "unload", max, last);
        let recovered = self.recover(mp, cause).await;
        progress.report("recovered", 1.0, "plugin removed by recovery");
        Err(recovered)
    }

    /// One pass over the unload sequence. The caller holds the lifecycle lock.
    async fn unload_attempt(
        &self,
        mp: &Arc<ManagedPlugin>,
        options: &UnloadOptions,
        hooks: &HookSet,
        dependent_ids: &[String],
        progress: &ProgressReporter<'_>,
    ) -> Result<()> {
        let force = options.force_unload;

        if mp.state().can_stop() {
            progress.report("stopping", 0.5, "stopping running plugin");
            let stop = StopOptions {
                timeout: options.timeout,
                force_stop: force,
                retry_count: 1,
                retry_delay: options.retry_delay,
                hooks: HookSet::new(),
                skip_cleanup: true,
            };
            self.stop_locked(mp, &stop).await?;
        }

        progress.report("state_transition", 0.55, "entering unloading state");
        mp.transition(PluginState::Unloading, force)?;
        self.emit(
            TOPIC_UNLOADING,
            self.payload(mp)
                .with("forced", force)
                .with("dependent_plugin_ids", dependent_ids.to_vec()),
        );

        progress.report("cleanup_monitoring", 0.6, "detaching monitors");
        self.detach_monitoring(mp);

        progress.report("plugin_cleanup", 0.65, "running plugin cleanup");
        let plugin = Arc::clone(&mp.plugin);
        let timeout = options.timeout.unwrap_or(self.config.cleanup_timeout);
        if let Err(e) = guarded(&mp.id, "cleanup", timeout, async move { plugin.cleanup().await }).await {
            if !force {
                return Err(e);
            }
            warn!(plugin_id = %mp.id, error = %e, "plugin cleanup failed, continuing because unload is forced");
        }

        progress.report("service_cleanup", 0.7, "unregistering services");
        self.unregister_services(mp);

        let mut loader_released = false;
        if !options.skip_cleanup {
            progress.report("resource_cleanup", 0.75, "releasing plugin resources");
            loader_released = self.cleanup_resources(mp, force, CleanupScope::Unload).await?;
            hooks.run_logged(HookPoint::OnCleanup, &hook_ctx(mp, HookPoint::OnCleanup, 0, None));
        }
        progress.report("security_cleanup", 0.78, "clearing security state");
        self.cleanup_security(mp, force).await?;

        progress.report("loader_cleanup", 0.8, "releasing loader handle");
        if !loader_released {
            self.release_loader(mp, force).await?;
        }

        progress.report("finalization", 0.9, "removing plugin");
        mp.transition(PluginState::Unloaded, force)?;
        self.remove_from_tables(mp).await;
        self.emit(
            TOPIC_UNLOADED,
            self.payload(mp)
                .with("success", true)
                .with("forced", force)
                .with("dependent_plugin_ids", dependent_ids.to_vec()),
        );
        Ok(())
    }

    fn detach_monitoring(&self, mp: &ManagedPlugin) {
        self.health.unregister(&mp.id);
        self.monitor.remove(&mp.id);
        if let Some(monitor) = mp.context.resources() {
            monitor.stop();
        }
    }

    async fn remove_from_tables(&self, mp: &ManagedPlugin) {
        let group = mp.write().group.take();
        let mut table = self.table.write().await;
        table.plugins.remove(&mp.id);
        if let Some(name) = group {
            if let Some(members) = table.groups.get_mut(&name) {
                members.retain(|m| m != &mp.id);
                if members.is_empty() {
                    table.groups.remove(&name);
                }
            }
        }
        table.capabilities.retain(|_, ids| {
            ids.remove(&mp.id);
            !ids.is_empty()
        });
    }

    /// Forces the plugin out after every unload attempt failed.
    async fn recover(&self, mp: &Arc<ManagedPlugin>, cause: PluginError) -> PluginError {
        error!(plugin_id = %mp.id, error = %cause, "unload failed, starting recovery");
        self.emit(
            TOPIC_RECOVERY_STARTED,
            self.payload(mp).with("error", cause.to_string()),
        );

        if mp.state().can_stop() {
            let stop = StopOptions {
                force_stop: true,
                retry_count: 1,
                skip_cleanup: true,
                ..Default::default()
            };
            if let Err(e) = self.stop_locked(mp, &stop).await {
                warn!(plugin_id = %mp.id, error = %e, "forced stop during recovery failed");
            }
        }
        mp.fail(&cause);

        self.detach_monitoring(mp);
        self.unregister_services(mp);
        let released = self
            .cleanup_resources(mp, true, CleanupScope::Unload)
            .await
            .unwrap_or(false);
        if let Err(e) = self.cleanup_security(mp, true).await {
            warn!(plugin_id = %mp.id, error = %e, "security cleanup during recovery failed");
        }
        if !released {
            if let Err(e) = self.release_loader(mp, true).await {
                warn!(plugin_id = %mp.id, error = %e, "loader release during recovery failed");
            }
        }

        self.remove_from_tables(mp).await;
        mp.write().state = PluginState::Unloaded;
        self.emit(
            TOPIC_RECOVERY_COMPLETED,
            self.payload(mp)
                .with("success", false)
                .with("error", cause.to_string()),
        );
        warn!(plugin_id = %mp.id, "plugin removed by unload recovery");

        PluginError::UnloadRecovered {
            plugin: mp.id.clone(),
            cause: Box::new(cause),
        }
    }

    // ─── Queries ────────────────────────────────────────────────────────

    pub async fn get_plugin(&self, id: &str) -> Result<PluginSnapshot> {
        Ok(self.lookup(id).await?.snapshot())
    }

    pub async fn list_plugins(&self) -> Vec<PluginSnapshot> {
        let mut all: Vec<PluginSnapshot> = self
            .table
            .read()
            .await
            .plugins
            .values()
            .map(|p| p.snapshot())
            .collect();
        all.sort_by(|a, b| a.load_time.cmp(&b.load_time).then_with(|| a.id.cmp(&b.id)));
        all
    }

    async fn ids_where(&self, pred: impl Fn(&ManagedPlugin) -> bool) -> Vec<String> {
        let mut ids: Vec<String> = self
            .table
            .read()
            .await
            .plugins
            .values()
            .filter(|p| pred(p))
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn plugins_by_state(&self, state: PluginState) -> Vec<String> {
        self.ids_where(|p| p.state() == state).await
    }

    pub async fn plugins_by_kind(&self, kind: LoaderKind) -> Vec<String> {
        self.ids_where(|p| p.kind == kind).await
    }

    pub async fn running_plugins(&self) -> Vec<String> {
        self.plugins_by_state(PluginState::Running).await
    }

    pub async fn stopped_plugins(&self) -> Vec<String> {
        self.plugins_by_state(PluginState::Stopped).await
    }

    pub async fn error_plugins(&self) -> Vec<String> {
        self.plugins_by_state(PluginState::Error).await
    }

    pub async fn plugin_info(&self, id: &str) -> Result<PluginInfo> {
        Ok(self.lookup(id).await?.info.clone())
    }

    pub async fn plugin_state(&self, id: &str) -> Result<PluginState> {
        Ok(self.lookup(id).await?.state())
    }

    pub async fn plugins_with_capability(&self, capability: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .table
            .read()
            .await
            .capabilities
            .get(capability)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Plugin count per state name, plus `"total"`.
    pub async fn statistics(&self) -> HashMap<String, usize> {
        let table = self.table.read().await;
        let mut stats: HashMap<String, usize> = PluginState::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for plugin in table.plugins.values() {
            *stats.entry(plugin.state().as_str().to_string()).or_default() += 1;
        }
        stats.insert("total".into(), table.plugins.len());
        stats
    }

    pub fn monitor_totals(&self) -> MonitorTotals {
        self.monitor.totals()
    }

    /// Runs one metrics sweep now instead of waiting for the monitor.
    pub async fn collect_metrics(&self) -> MonitorTotals {
        self.monitor.collect().await
    }

    pub fn health_status(&self, id: &str) -> Option<HealthStatus> {
        self.health.status(id)
    }

    /// Runs one health check now. `None` if the plugin is not monitored.
    pub async fn check_health(&self, id: &str) -> Option<HealthStatus> {
        self.health.check(id).await
    }

    // ─── Record management ──────────────────────────────────────────────

    pub async fn set_plugin_priority(&self, id: &str, priority: PluginPriority) -> Result<()> {
        self.lookup(id).await?.write().priority = priority;
        Ok(())
    }

    /// Attaches `hook` to the plugin. Runs before any per-call hooks.
    pub async fn add_plugin_hook(&self, id: &str, hook: Hook) -> Result<()> {
        self.lookup(id).await?.write().hooks.add(hook);
        Ok(())
    }

    pub async fn remove_plugin_hook(&self, id: &str, name: &str) -> Result<bool> {
        Ok(self.lookup(id).await?.write().hooks.remove(name).is_some())
    }

    /// Forwards events on `topic` to the plugin's `handle_event`. The
    /// subscription is dropped when the plugin unloads.
    pub async fn subscribe_plugin(&self, id: &str, topic: &str) -> Result<()> {
        let mp = self.lookup(id).await?;
        let forwarder: Arc<dyn EventHandler> = Arc::new(EventForwarder {
            plugin_id: mp.id.clone(),
            plugin: Arc::clone(&mp.plugin),
            timeout: self.config.cleanup_timeout,
        });
        mp.context.subscribe(topic, forwarder)
    }

    /// The context handed to the plugin on start.
    pub async fn plugin_context(&self, id: &str) -> Result<Arc<PluginContext>> {
        Ok(Arc::clone(&self.lookup(id).await?.context))
    }

    // ─── Shutdown ───────────────────────────────────────────────────────

    /// Stops and unloads every plugin, then signals background tasks.
    ///
    /// Plugin work is bounded by the configured shutdown timeout. Later
    /// operations fail with [`PluginError::ShuttingDown`].
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("plugin orchestrator shutting down");

        let drain = async {
            let mut running: Vec<Arc<ManagedPlugin>> = self
                .table
                .read()
                .await
                .plugins
                .values()
                .filter(|p| p.state().can_stop())
                .cloned()
                .collect();
            running.sort_by_key(|p| p.priority());
            for mp in running {
                let _guard = mp.lifecycle.lock().await;
                let options = StopOptions {
                    force_stop: true,
                    ..Default::default()
                };
                if let Err(e) = self.stop_locked(&mp, &options).await {
                    warn!(plugin_id = %mp.id, error = %e, "failed to stop plugin during shutdown");
                }
            }

            let ids: Vec<String> = self.table.read().await.plugins.keys().cloned().collect();
            let options = UnloadOptions::forced();
            let mut visited = HashSet::new();
            for id in ids {
                match self
                    .unload_tree(&id, &options, &ProgressReporter::silent(), &mut visited)
                    .await
                {
                    Ok(()) | Err(PluginError::NotFound(_)) => {}
                    Err(e) => warn!(plugin_id = %id, error = %e, "failed to unload plugin during shutdown"),
                }
            }
        };

        if tokio::time::timeout(self.config.shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!(
                timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                "shutdown timed out, abandoning remaining plugins"
            );
        }

        self.shutdown_tx.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                debug!("background task did not stop in time");
            }
        }
        info!("plugin orchestrator stopped");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────

struct EventForwarder {
    plugin_id: String,
    plugin: Arc<dyn Plugin>,
    timeout: Duration,
}

#[async_trait]
impl EventHandler for EventForwarder {
    async fn handle(&self, event: &Event) -> Result<()> {
        let plugin = Arc::clone(&self.plugin);
        let event = event.clone();
        guarded(&self.plugin_id, "handle_event", self.timeout, async move {
            plugin.handle_event(&event).await
        })
        .await
    }
}

fn hook_ctx<'a>(
    mp: &'a ManagedPlugin,
    point: HookPoint,
    attempt: u32,
    error: Option<&'a PluginError>,
) -> HookContext<'a> {
    HookContext {
        plugin_id: &mp.id,
        point,
        attempt,
        error,
    }
}

fn exhausted(mp: &ManagedPlugin, operation: &'static str, attempts: u32, last: Option<PluginError>) -> PluginError {
    let last = last.unwrap_or(PluginError::CallFailed {
        plugin: mp.id.clone(),
        operation,
        reason: CallFailure::Failed("no attempt was made".into()),
    });
    PluginError::RetriesExhausted {
        plugin: mp.id.clone(),
        operation,
        attempts,
        last: Box::new(last),
    }
}

fn generate_id(kind: LoaderKind, path: &Path) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{}_{}_{}", kind.as_str(), path.display(), nanos)
}

fn merge_declared(into: &mut Vec<String>, extra: &[String]) {
    for item in extra {
        if !into.contains(item) {
            into.push(item.clone());
        }
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|needle| key.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_keys_match_case_insensitively() {
        assert!(is_sensitive_key("api_TOKEN"));
        assert!(is_sensitive_key("spotify.client_secret"));
        assert!(is_sensitive_key("Credentials"));
        assert!(!is_sensitive_key("bitrate"));
    }

    #[test]
    fn test_generated_id_shape() {
        let id = generate_id(LoaderKind::Rpc, Path::new("/plugins/radio"));
        assert!(id.starts_with("rpc_/plugins/radio_"));
        assert!(id.rsplit('_').next().unwrap().parse::<i64>().is_ok());
    }

    #[test]
    fn test_merge_declared_keeps_order_and_skips_duplicates() {
        let mut deps = vec!["decoder".to_string()];
        merge_declared(&mut deps, &["decoder".to_string(), "network".to_string()]);
        assert_eq!(deps, vec!["decoder", "network"]);
    }

    #[test]
    fn test_exhausted_wraps_last_error() {
        let mp_err = PluginError::Reported("boom".into());
        let err = PluginError::RetriesExhausted {
            plugin: "p".into(),
            operation: "start",
            attempts: 3,
            last: Box::new(mp_err),
        };
        assert_eq!(
            err.to_string(),
            "failed to start plugin p after 3 attempts: plugin reported an error: boom"
        );
    }
}
