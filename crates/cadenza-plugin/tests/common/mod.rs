// Shared test utilities for integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cadenza_plugin::events::LIFECYCLE_TOPICS;
use cadenza_plugin::plugin::NetworkCleaner;
use cadenza_plugin::{
    handler_fn, EventBus, Loader, LoaderKind, OrchestratorConfig, Plugin, PluginContext,
    PluginError, PluginInfo,
};

// ─── Mock plugin ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct Calls {
    pub initialize: AtomicU32,
    pub start: AtomicU32,
    pub stop: AtomicU32,
    pub cleanup: AtomicU32,
    pub events: AtomicU32,
    pub network: AtomicU32,
}

pub struct MockPlugin {
    info: PluginInfo,
    pub calls: Calls,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub fail_cleanup: AtomicBool,
    pub fail_network: AtomicBool,
    pub panic_start: AtomicBool,
    pub start_delay: Mutex<Option<Duration>>,
    pub context: Mutex<Option<Arc<PluginContext>>>,
}

impl MockPlugin {
    pub fn new(info: PluginInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            calls: Calls::default(),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            fail_cleanup: AtomicBool::new(false),
            fail_network: AtomicBool::new(false),
            panic_start: AtomicBool::new(false),
            start_delay: Mutex::new(None),
            context: Mutex::new(None),
        })
    }

    pub fn named(name: &str) -> Arc<Self> {
        Self::new(PluginInfo::new(name, "1.0.0").with_id(name))
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn info(&self) -> PluginInfo {
        self.info.clone()
    }

    async fn initialize(&self, ctx: Arc<PluginContext>) -> Result<(), PluginError> {
        self.calls.initialize.fetch_add(1, Ordering::SeqCst);
        *self.context.lock().unwrap() = Some(ctx);
        Ok(())
    }

    async fn start(&self) -> Result<(), PluginError> {
        self.calls.start.fetch_add(1, Ordering::SeqCst);
        let delay = *self.start_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_start.load(Ordering::SeqCst) {
            panic!("decoder exploded");
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(PluginError::Reported("cannot open audio device".into()));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), PluginError> {
        self.calls.stop.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(PluginError::Reported("stream did not drain".into()));
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), PluginError> {
        self.calls.cleanup.fetch_add(1, Ordering::SeqCst);
        if self.fail_cleanup.load(Ordering::SeqCst) {
            return Err(PluginError::Reported("cache is locked".into()));
        }
        Ok(())
    }

    async fn handle_event(&self, _event: &cadenza_plugin::Event) -> Result<(), PluginError> {
        self.calls.events.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn as_network_cleaner(&self) -> Option<&dyn NetworkCleaner> {
        Some(self)
    }
}

#[async_trait]
impl NetworkCleaner for MockPlugin {
    async fn close_connections(&self) -> Result<(), PluginError> {
        self.calls.network.fetch_add(1, Ordering::SeqCst);
        if self.fail_network.load(Ordering::SeqCst) {
            return Err(PluginError::Reported("socket still in use".into()));
        }
        Ok(())
    }
}

// ─── Mock loader ────────────────────────────────────────────────────────

pub struct MockLoader {
    kind: LoaderKind,
    plugins: Mutex<HashMap<PathBuf, Arc<MockPlugin>>>,
    pub unloaded: Mutex<Vec<String>>,
    pub unload_calls: AtomicU32,
    pub fail_unload: AtomicBool,
    pub load_delay: Mutex<Option<Duration>>,
}

impl MockLoader {
    pub fn new(kind: LoaderKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            plugins: Mutex::new(HashMap::new()),
            unloaded: Mutex::new(Vec::new()),
            unload_calls: AtomicU32::new(0),
            fail_unload: AtomicBool::new(false),
            load_delay: Mutex::new(None),
        })
    }

    /// Makes `plugin` the result of loading `path`.
    pub fn provide(&self, path: &Path, plugin: Arc<MockPlugin>) {
        self.plugins
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), plugin);
    }

    pub fn unloaded(&self) -> Vec<String> {
        self.unloaded.lock().unwrap().clone()
    }
}

#[async_trait]
impl Loader for MockLoader {
    fn kind(&self) -> LoaderKind {
        self.kind
    }

    fn validate_plugin(&self, path: &Path) -> Result<(), PluginError> {
        if self.plugins.lock().unwrap().contains_key(path) {
            Ok(())
        } else {
            Err(PluginError::Validation(format!(
                "unknown artifact: {}",
                path.display()
            )))
        }
    }

    async fn load_plugin(&self, path: &Path) -> Result<Arc<dyn Plugin>, PluginError> {
        let delay = *self.load_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let plugin = self
            .plugins
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| PluginError::Load(format!("nothing at {}", path.display())))?;
        Ok(plugin as Arc<dyn Plugin>)
    }

    async fn unload_plugin(&self, plugin_id: &str) -> Result<(), PluginError> {
        self.unload_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_unload.load(Ordering::SeqCst) {
            return Err(PluginError::Reported("handle still referenced".into()));
        }
        self.unloaded.lock().unwrap().push(plugin_id.to_string());
        Ok(())
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────────

/// Config with short timeouts and no background monitors.
pub fn test_config(dir: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        start_timeout: Duration::from_millis(500),
        stop_timeout: Duration::from_millis(500),
        cleanup_timeout: Duration::from_millis(500),
        load_timeout: Duration::from_millis(500),
        retry_delay: Duration::from_millis(5),
        enable_monitoring: false,
        resource_sample_interval: Duration::from_secs(60),
        temp_root: dir.join("tmp"),
        ..OrchestratorConfig::default()
    }
}

/// Creates an empty artifact file so security validation finds it.
pub fn artifact(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(format!("{name}.so"));
    std::fs::write(&path, b"\x7fELF").unwrap();
    path
}

/// Records `(topic, plugin_id)` for every lifecycle event.
pub fn record_lifecycle(bus: &EventBus) -> Arc<Mutex<Vec<(String, String)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for topic in LIFECYCLE_TOPICS {
        let sink = Arc::clone(&seen);
        bus.subscribe(
            topic,
            handler_fn(move |event| {
                let id = event.payload["plugin_id"].as_str().unwrap_or_default().to_string();
                sink.lock().unwrap().push((event.topic.clone(), id));
                Ok(())
            }),
        );
    }
    seen
}

pub fn count(seen: &Mutex<Vec<(String, String)>>, topic: &str, id: &str) -> usize {
    seen.lock()
        .unwrap()
        .iter()
        .filter(|(t, i)| t == topic && i == id)
        .count()
}

/// Lets spawned event deliveries run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("cadenza_plugin=debug")
        .with_test_writer()
        .try_init();
}
