//! Orchestrator configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit::CircuitConfig;
use crate::info::duration_ms;
use crate::resource::{EnforceMode, ResourceLimits};
use crate::security::{Permission, SecurityConfig};

/// Tunables for an [`crate::Orchestrator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on loaded plugins, counting loads still in flight.
    pub max_plugins: usize,
    #[serde(with = "duration_ms")]
    pub load_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub start_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub stop_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub cleanup_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
    #[serde(with = "duration_ms")]
    pub metrics_interval: Duration,
    #[serde(with = "duration_ms")]
    pub resource_sample_interval: Duration,
    /// Validate artifacts before any loader sees them.
    pub enable_security: bool,
    /// Path policy plus the permissions a plugin gets when it ships no manifest.
    pub security: SecurityConfig,
    pub resource_limits: ResourceLimits,
    /// Run the health checker and metrics monitor in the background.
    pub enable_monitoring: bool,
    pub enable_circuit_breaker: bool,
    pub circuit: CircuitConfig,
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    /// Capacity of each of the async start and stop queues.
    pub queue_capacity: usize,
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,
    /// Parent of every plugin's scratch and cache directories.
    pub temp_root: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_plugins: 100,
            load_timeout: Duration::from_secs(30),
            start_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(10),
            cleanup_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(10),
            resource_sample_interval: Duration::from_secs(5),
            enable_security: true,
            security: SecurityConfig::with_permissions([
                Permission::EventAccess,
                Permission::ServiceAccess,
                Permission::ConfigAccess,
                Permission::FileRead,
                Permission::FileWrite,
            ]),
            resource_limits: ResourceLimits::default(),
            enable_monitoring: true,
            enable_circuit_breaker: false,
            circuit: CircuitConfig::default(),
            retry_delay: Duration::from_secs(1),
            queue_capacity: 64,
            shutdown_timeout: Duration::from_secs(30),
            temp_root: std::env::temp_dir().join("cadenza").join("plugins"),
        }
    }
}

impl OrchestratorConfig {
    /// Build config from `CADENZA_PLUGIN_*` environment variables, falling
    /// back to [`Default`] for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut security = defaults.security.clone();
        if let Some(perms) = env_list("CADENZA_PLUGIN_PERMISSIONS") {
            security.permissions = perms.iter().filter_map(|p| parse_permission(p)).collect();
        }
        if let Some(paths) = env_list("CADENZA_PLUGIN_ALLOWED_PATHS") {
            security.allowed_paths = paths.into_iter().map(PathBuf::from).collect();
        }
        if let Some(paths) = env_list("CADENZA_PLUGIN_BLOCKED_PATHS") {
            security.blocked_paths = paths.into_iter().map(PathBuf::from).collect();
        }
        security.require_manifest = env_flag("CADENZA_PLUGIN_REQUIRE_MANIFEST", security.require_manifest);

        let mut resource_limits = defaults.resource_limits.clone();
        resource_limits.max_memory_mb = env_parse("CADENZA_PLUGIN_MAX_MEMORY_MB", resource_limits.max_memory_mb);
        resource_limits.max_cpu_percent = env_parse("CADENZA_PLUGIN_MAX_CPU_PERCENT", resource_limits.max_cpu_percent);
        resource_limits.enforce_mode = std::env::var("CADENZA_PLUGIN_ENFORCE_MODE")
            .ok()
            .and_then(|v| match v.to_ascii_lowercase().as_str() {
                "warn" => Some(EnforceMode::Warn),
                "limit" => Some(EnforceMode::Limit),
                "kill" => Some(EnforceMode::Kill),
                _ => None,
            })
            .unwrap_or(resource_limits.enforce_mode);
        resource_limits.enabled = env_flag("CADENZA_PLUGIN_RESOURCE_LIMITS", resource_limits.enabled);

        let mut circuit = defaults.circuit.clone();
        circuit.failure_threshold = env_parse("CADENZA_PLUGIN_CIRCUIT_THRESHOLD", circuit.failure_threshold);
        circuit.recovery_timeout = env_secs("CADENZA_PLUGIN_CIRCUIT_RECOVERY_SECS", circuit.recovery_timeout);

        Self {
            max_plugins: env_parse("CADENZA_PLUGIN_MAX_PLUGINS", defaults.max_plugins),
            load_timeout: env_secs("CADENZA_PLUGIN_LOAD_TIMEOUT_SECS", defaults.load_timeout),
            start_timeout: env_secs("CADENZA_PLUGIN_START_TIMEOUT_SECS", defaults.start_timeout),
            stop_timeout: env_secs("CADENZA_PLUGIN_STOP_TIMEOUT_SECS", defaults.stop_timeout),
            cleanup_timeout: env_secs("CADENZA_PLUGIN_CLEANUP_TIMEOUT_SECS", defaults.cleanup_timeout),
            health_check_interval: env_secs(
                "CADENZA_PLUGIN_HEALTH_INTERVAL_SECS",
                defaults.health_check_interval,
            ),
            metrics_interval: env_secs("CADENZA_PLUGIN_METRICS_INTERVAL_SECS", defaults.metrics_interval),
            resource_sample_interval: env_secs(
                "CADENZA_PLUGIN_RESOURCE_INTERVAL_SECS",
                defaults.resource_sample_interval,
            ),
            enable_security: env_flag("CADENZA_PLUGIN_SECURITY", defaults.enable_security),
            security,
            resource_limits,
            enable_monitoring: env_flag("CADENZA_PLUGIN_MONITORING", defaults.enable_monitoring),
            enable_circuit_breaker: env_flag("CADENZA_PLUGIN_CIRCUIT_BREAKER", defaults.enable_circuit_breaker),
            circuit,
            retry_delay: std::env::var("CADENZA_PLUGIN_RETRY_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            queue_capacity: env_parse("CADENZA_PLUGIN_QUEUE_CAPACITY", defaults.queue_capacity).max(1),
            shutdown_timeout: env_secs("CADENZA_PLUGIN_SHUTDOWN_TIMEOUT_SECS", defaults.shutdown_timeout),
            temp_root: std::env::var("CADENZA_PLUGIN_TEMP_ROOT")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_root),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) if v.eq_ignore_ascii_case("true") || v == "1" => true,
        Ok(v) if v.eq_ignore_ascii_case("false") || v == "0" => false,
        _ => default,
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    Some(
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
    )
}

fn parse_permission(token: &str) -> Option<Permission> {
    match serde_json::from_value(serde_json::Value::String(token.to_ascii_lowercase())) {
        Ok(p) => Some(p),
        Err(_) => {
            tracing::warn!(token, "ignoring unknown permission token");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env vars are process-wide; keep every env test in one function.
    #[test]
    fn test_from_env_overrides_and_falls_back() {
        std::env::set_var("CADENZA_PLUGIN_MAX_PLUGINS", "7");
        std::env::set_var("CADENZA_PLUGIN_START_TIMEOUT_SECS", "3");
        std::env::set_var("CADENZA_PLUGIN_CIRCUIT_BREAKER", "true");
        std::env::set_var("CADENZA_PLUGIN_ENFORCE_MODE", "KILL");
        std::env::set_var("CADENZA_PLUGIN_PERMISSIONS", "event_access, network_access,bogus");
        std::env::set_var("CADENZA_PLUGIN_LOAD_TIMEOUT_SECS", "not-a-number");

        let config = OrchestratorConfig::from_env();
        assert_eq!(config.max_plugins, 7);
        assert_eq!(config.start_timeout, Duration::from_secs(3));
        assert!(config.enable_circuit_breaker);
        assert_eq!(config.resource_limits.enforce_mode, EnforceMode::Kill);
        assert_eq!(config.load_timeout, Duration::from_secs(30));
        assert_eq!(config.security.permissions.len(), 2);
        assert!(config.security.permissions.contains(&Permission::NetworkAccess));

        for key in [
            "CADENZA_PLUGIN_MAX_PLUGINS",
            "CADENZA_PLUGIN_START_TIMEOUT_SECS",
            "CADENZA_PLUGIN_CIRCUIT_BREAKER",
            "CADENZA_PLUGIN_ENFORCE_MODE",
            "CADENZA_PLUGIN_PERMISSIONS",
            "CADENZA_PLUGIN_LOAD_TIMEOUT_SECS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_plugins, 100);
        assert_eq!(config.queue_capacity, 64);
        assert!(config.enable_security);
        assert!(!config.enable_circuit_breaker);
        assert_eq!(config.resource_limits.max_memory_mb, 256);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert!(config.temp_root.ends_with("cadenza/plugins"));
    }

    #[test]
    fn test_serializes_durations_as_millis() {
        let json = serde_json::to_value(OrchestratorConfig::default()).unwrap();
        assert_eq!(json["start_timeout"], 10_000);
        let back: OrchestratorConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, OrchestratorConfig::default());
    }
}
