//! The façade a plugin sees of the host.
//!
//! Every capability goes through the plugin's own [`SecurityManager`] before
//! it reaches the bus, the service registry, the config map or the file
//! system. Once torn down, the context refuses all further calls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tempfile::TempDir;

use crate::error::PluginError;
use crate::events::{EventBus, EventHandler, TOPIC_BROADCAST};
use crate::resource::ResourceMonitor;
use crate::security::{Permission, SecurityManager};
use crate::services::{Service, ServiceRegistry};

pub struct PluginContext {
    plugin_id: String,
    plugin_name: String,
    bus: Arc<EventBus>,
    services: Arc<dyn ServiceRegistry>,
    security: Arc<SecurityManager>,
    resources: Option<Arc<ResourceMonitor>>,
    config: RwLock<HashMap<String, serde_json::Value>>,
    temp_root: PathBuf,
    temp_dir: Mutex<Option<TempDir>>,
    subscriptions: Mutex<Vec<(String, Arc<dyn EventHandler>)>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.plugin_id)
            .field("plugin_name", &self.plugin_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PluginContext {
    pub fn new(
        plugin_id: impl Into<String>,
        plugin_name: impl Into<String>,
        bus: Arc<EventBus>,
        services: Arc<dyn ServiceRegistry>,
        security: Arc<SecurityManager>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            plugin_name: plugin_name.into(),
            bus,
            services,
            security,
            resources: None,
            config: RwLock::new(HashMap::new()),
            temp_root: std::env::temp_dir().join("cadenza").join("plugins"),
            temp_dir: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_resources(mut self, monitor: Arc<ResourceMonitor>) -> Self {
        self.resources = Some(monitor);
        self
    }

    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = root.into();
        self
    }

    pub fn with_config(self, config: HashMap<String, serde_json::Value>) -> Self {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
        self
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    pub fn resources(&self) -> Option<&Arc<ResourceMonitor>> {
        self.resources.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn gate(&self, permission: Permission, action: &str) -> Result<(), PluginError> {
        if self.is_closed() {
            return Err(PluginError::ContextClosed(self.plugin_id.clone()));
        }
        self.security.require(permission, action)
    }

    // ── Messaging ────────────────────────────────────────────────────

    /// Publishes on `topic`. Returns the number of deliveries started.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<usize, PluginError> {
        self.gate(Permission::EventAccess, "publish")?;
        Ok(self.bus.publish(topic, payload))
    }

    /// Sends a message to the plugin named `target` on `plugin.<target>.message`.
    pub fn send_message(
        &self,
        target: &str,
        payload: serde_json::Value,
    ) -> Result<usize, PluginError> {
        self.gate(Permission::EventAccess, "send_message")?;
        let envelope = serde_json::json!({
            "from": self.plugin_id,
            "payload": payload,
        });
        Ok(self.bus.publish(&format!("plugin.{target}.message"), envelope))
    }

    pub fn broadcast(&self, payload: serde_json::Value) -> Result<usize, PluginError> {
        self.gate(Permission::EventAccess, "broadcast")?;
        Ok(self.bus.publish(TOPIC_BROADCAST, payload))
    }

    /// Subscribes and remembers the registration so it can be dropped on unload.
    pub fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> Result<(), PluginError> {
        self.gate(Permission::EventAccess, "subscribe")?;
        self.bus.subscribe(topic, Arc::clone(&handler));
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((topic.to_string(), handler));
        Ok(())
    }

    pub fn unsubscribe(&self, topic: &str, handler: &Arc<dyn EventHandler>) -> bool {
        let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        let Some(pos) = subs.iter().position(|(t, h)| {
            t == topic && std::ptr::eq(Arc::as_ptr(h) as *const (), Arc::as_ptr(handler) as *const ())
        }) else {
            return false;
        };
        subs.remove(pos);
        self.bus.unsubscribe(topic, handler)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Drops every subscription made through this context and everything on
    /// the plugin's own `plugin.<name>.` topics.
    pub fn unsubscribe_all(&self) -> usize {
        let subs: Vec<_> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let mut removed = subs
            .iter()
            .filter(|(topic, handler)| self.bus.unsubscribe(topic, handler))
            .count();
        removed += self
            .bus
            .remove_topics_with_prefix(&format!("plugin.{}.", self.plugin_name));
        removed
    }

    // ── Services ─────────────────────────────────────────────────────

    pub fn get_service(&self, name: &str) -> Result<Service, PluginError> {
        self.gate(Permission::ServiceAccess, "get_service")?;
        self.services.get_service(name)
    }

    // ── Config ───────────────────────────────────────────────────────

    pub fn config_value(&self, key: &str) -> Result<Option<serde_json::Value>, PluginError> {
        self.gate(Permission::ConfigAccess, "config_value")?;
        Ok(self
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    pub fn set_config_value(&self, key: &str, value: serde_json::Value) -> Result<(), PluginError> {
        self.gate(Permission::ConfigAccess, "set_config_value")?;
        self.config
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Drops config entries. Returns how many there were.
    pub fn clear_config(&self) -> usize {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        let n = config.len();
        config.clear();
        n
    }

    // ── Files ────────────────────────────────────────────────────────

    /// Per-plugin scratch directory, created on first use.
    pub fn temp_dir(&self) -> Result<PathBuf, PluginError> {
        self.gate(Permission::FileWrite, "temp_dir")?;
        let mut slot = self.temp_dir.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(dir) = slot.as_ref() {
            return Ok(dir.path().to_path_buf());
        }
        std::fs::create_dir_all(&self.temp_root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", self.plugin_name))
            .tempdir_in(&self.temp_root)?;
        let path = dir.path().to_path_buf();
        *slot = Some(dir);
        Ok(path)
    }

    pub fn cache_dir(&self) -> Result<PathBuf, PluginError> {
        self.gate(Permission::FileWrite, "cache_dir")?;
        let dir = self.cache_path();
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn cache_path(&self) -> PathBuf {
        self.temp_root.join("cache").join(&self.plugin_name)
    }

    /// Deletes the scratch and cache directories. Missing ones are fine.
    pub fn remove_files(&self) -> Result<(), PluginError> {
        let temp = self
            .temp_dir
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(dir) = temp {
            dir.close()?;
        }
        remove_dir_if_exists(&self.cache_path())
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Closes the context and stops its resource monitor.
    pub fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(monitor) = &self.resources {
            monitor.stop();
        }
        tracing::debug!(plugin_id = %self.plugin_id, "plugin context torn down");
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<(), PluginError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
