//! Plugin metadata and reported metrics.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery mechanism a plugin artifact is packaged behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoaderKind {
    /// Native shared library.
    Dynamic,
    /// Out-of-process plugin reached over RPC.
    Rpc,
    /// Sandboxed bytecode module.
    Wasm,
    /// Module that can be swapped without restarting the player.
    HotReload,
}

impl LoaderKind {
    pub const ALL: [LoaderKind; 4] = [
        LoaderKind::Dynamic,
        LoaderKind::Rpc,
        LoaderKind::Wasm,
        LoaderKind::HotReload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoaderKind::Dynamic => "dynamic",
            LoaderKind::Rpc => "rpc",
            LoaderKind::Wasm => "wasm",
            LoaderKind::HotReload => "hot_reload",
        }
    }
}

impl fmt::Display for LoaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordering hint for group and cascade operations. Higher runs first when
/// starting or unloading, last when stopping.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PluginPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Metadata a plugin reports about itself. Immutable once loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Declared id. When absent the orchestrator derives one.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub priority: PluginPriority,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl PluginInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: PluginPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Whether `reference` names this plugin, either by id or by name.
    pub fn answers_to(&self, id: &str, reference: &str) -> bool {
        id == reference || self.name == reference
    }
}

/// Metrics a plugin reports through [`crate::plugin::Plugin::metrics`].
///
/// Plugins that do not report metrics yield [`PluginMetrics::zeroed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetrics {
    #[serde(with = "duration_ms")]
    pub uptime: Duration,
    /// Resident memory in bytes.
    pub memory_usage: u64,
    pub cpu_usage: f64,
    pub active_tasks: u64,
    pub open_files: u64,
    pub open_connections: u64,
    pub request_count: u64,
    pub error_count: u64,
    pub success_rate: f64,
    #[serde(default)]
    pub custom: HashMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

impl PluginMetrics {
    pub fn zeroed() -> Self {
        Self {
            uptime: Duration::ZERO,
            memory_usage: 0,
            cpu_usage: 0.0,
            active_tasks: 0,
            open_files: 0,
            open_connections: 0,
            request_count: 0,
            error_count: 0,
            success_rate: 0.0,
            custom: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory_usage / (1024 * 1024)
    }
}

impl Default for PluginMetrics {
    fn default() -> Self {
        Self::zeroed()
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loader_kind_display() {
        assert_eq!(LoaderKind::Dynamic.to_string(), "dynamic");
        assert_eq!(LoaderKind::HotReload.to_string(), "hot_reload");
    }

    #[test]
    fn test_priority_ordering() {
        assert!(PluginPriority::Critical > PluginPriority::High);
        assert!(PluginPriority::High > PluginPriority::Normal);
        assert!(PluginPriority::Normal > PluginPriority::Low);
        assert_eq!(PluginPriority::default(), PluginPriority::Normal);
    }

    #[test]
    fn test_info_builder() {
        let info = PluginInfo::new("spotify", "1.2.0")
            .with_id("sp")
            .with_dependencies(["decoder"])
            .with_capabilities(["stream", "search"])
            .with_priority(PluginPriority::High);
        assert_eq!(info.id.as_deref(), Some("sp"));
        assert_eq!(info.dependencies, vec!["decoder"]);
        assert_eq!(info.capabilities.len(), 2);
        assert_eq!(info.priority, PluginPriority::High);
    }

    #[test]
    fn test_answers_to_id_or_name() {
        let info = PluginInfo::new("decoder", "0.1.0");
        assert!(info.answers_to("dec-1", "decoder"));
        assert!(info.answers_to("dec-1", "dec-1"));
        assert!(!info.answers_to("dec-1", "encoder"));
    }

    #[test]
    fn test_metrics_zeroed() {
        let m = PluginMetrics::zeroed();
        assert_eq!(m.memory_usage, 0);
        assert_eq!(m.request_count, 0);
        assert_eq!(m.uptime, Duration::ZERO);
    }

    #[test]
    fn test_metrics_memory_mb() {
        let m = PluginMetrics {
            memory_usage: 300 * 1024 * 1024,
            ..PluginMetrics::zeroed()
        };
        assert_eq!(m.memory_mb(), 300);
    }

    #[test]
    fn test_metrics_serialize_uptime_as_ms() {
        let m = PluginMetrics {
            uptime: Duration::from_secs(2),
            ..PluginMetrics::zeroed()
        };
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["uptime"], 2000);
    }
}
