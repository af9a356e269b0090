//! Permission gate for plugin capabilities.
//!
//! A [`SecurityManager`] holds the set of permissions a plugin was granted.
//! Every capability exposed through [`crate::context::PluginContext`] asks the
//! manager first. Sandboxing itself is the loader's job; this module only
//! decides yes or no.
//!
//! The orchestrator also owns one manager for artifact validation: it checks
//! where an artifact lives and whether its manifest asks for more than the
//! configured grant.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;
use crate::manifest::PluginManifest;

/// A capability token a plugin may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    FileRead,
    FileWrite,
    FileExecute,
    NetworkAccess,
    SystemCall,
    ProcessControl,
    EnvironmentAccess,
    ConfigAccess,
    DatabaseAccess,
    AudioAccess,
    UiAccess,
    PluginManagement,
    KernelAccess,
    EventAccess,
    ServiceAccess,
    /// Grants everything.
    All,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::FileRead => "file_read",
            Permission::FileWrite => "file_write",
            Permission::FileExecute => "file_execute",
            Permission::NetworkAccess => "network_access",
            Permission::SystemCall => "system_call",
            Permission::ProcessControl => "process_control",
            Permission::EnvironmentAccess => "environment_access",
            Permission::ConfigAccess => "config_access",
            Permission::DatabaseAccess => "database_access",
            Permission::AudioAccess => "audio_access",
            Permission::UiAccess => "ui_access",
            Permission::PluginManagement => "plugin_management",
            Permission::KernelAccess => "kernel_access",
            Permission::EventAccess => "event_access",
            Permission::ServiceAccess => "service_access",
            Permission::All => "all",
        };
        f.write_str(name)
    }
}

// ─── Configuration ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub permissions: HashSet<Permission>,
    /// When non-empty, artifacts must live under one of these directories.
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,
    #[serde(default)]
    pub blocked_paths: Vec<PathBuf>,
    /// Reject artifacts that ship without a `plugin.toml`.
    #[serde(default)]
    pub require_manifest: bool,
}

impl SecurityConfig {
    pub fn with_permissions<I: IntoIterator<Item = Permission>>(permissions: I) -> Self {
        Self {
            permissions: permissions.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Permissions a plugin ends up with: the manifest's request when it is
    /// fully covered by this grant, else the whole grant.
    pub fn effective_for(&self, manifest: Option<&PluginManifest>) -> HashSet<Permission> {
        match manifest {
            Some(m) if !m.permissions.requested.is_empty() => {
                m.permissions.requested.iter().copied().collect()
            }
            _ => self.permissions.clone(),
        }
    }

    fn grants(&self, permission: Permission) -> bool {
        self.permissions.contains(&Permission::All) || self.permissions.contains(&permission)
    }
}

// ─── Manager ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct SecurityManager {
    config: RwLock<SecurityConfig>,
}

impl SecurityManager {
    pub fn new(config: SecurityConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    pub fn check_permission(&self, permission: Permission) -> bool {
        self.read().grants(permission)
    }

    /// Like [`check_permission`](Self::check_permission) but as an error for `?`.
    pub fn require(&self, permission: Permission, action: &str) -> Result<(), PluginError> {
        if self.check_permission(permission) {
            Ok(())
        } else {
            Err(PluginError::PermissionDenied(format!(
                "{action} requires {permission}"
            )))
        }
    }

    /// Replaces the whole configuration in one step.
    pub fn update_config(&self, config: SecurityConfig) {
        *self.write() = config;
    }

    pub fn config(&self) -> SecurityConfig {
        self.read().clone()
    }

    pub fn permissions(&self) -> HashSet<Permission> {
        self.read().permissions.clone()
    }

    /// Drops every granted permission, keeping path policy intact.
    pub fn revoke_all(&self) -> usize {
        let mut config = self.write();
        let revoked = config.permissions.len();
        config.permissions.clear();
        revoked
    }

    /// Resets to an empty configuration.
    pub fn cleanup(&self) {
        *self.write() = SecurityConfig::default();
    }

    /// Checks an artifact before any loader sees it.
    ///
    /// Returns the manifest found beside the artifact, if any.
    pub fn validate_artifact(&self, path: &Path) -> Result<Option<PluginManifest>, PluginError> {
        let config = self.config();

        if !path.exists() {
            return Err(PluginError::SecurityValidation(format!(
                "artifact does not exist: {}",
                path.display()
            )));
        }
        let resolved = path.canonicalize()?;

        if let Some(blocked) = config
            .blocked_paths
            .iter()
            .find(|p| under(&resolved, p))
        {
            return Err(PluginError::SecurityValidation(format!(
                "artifact {} is under blocked path {}",
                path.display(),
                blocked.display()
            )));
        }

        if !config.allowed_paths.is_empty()
            && !config.allowed_paths.iter().any(|p| under(&resolved, p))
        {
            return Err(PluginError::SecurityValidation(format!(
                "artifact {} is outside the allowed plugin paths",
                path.display()
            )));
        }

        let manifest = PluginManifest::discover(path)?;
        match &manifest {
            None if config.require_manifest => {
                return Err(PluginError::SecurityValidation(format!(
                    "artifact {} has no plugin manifest",
                    path.display()
                )));
            }
            Some(m) => {
                let missing: Vec<String> = m
                    .permissions
                    .requested
                    .iter()
                    .filter(|p| !config.grants(**p))
                    .map(ToString::to_string)
                    .collect();
                if !missing.is_empty() {
                    return Err(PluginError::SecurityValidation(format!(
                        "plugin {} requests permissions that are not granted: {}",
                        m.plugin.name,
                        missing.join(", ")
                    )));
                }
            }
            None => {}
        }

        Ok(manifest)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SecurityConfig> {
        self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SecurityConfig> {
        self.config.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn under(path: &Path, root: &Path) -> bool {
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    path.starts_with(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Permission checks ─────────────────────────────────────────────

    #[test]
    fn test_exact_membership() {
        let mgr = SecurityManager::new(SecurityConfig::with_permissions([
            Permission::EventAccess,
            Permission::AudioAccess,
        ]));
        assert!(mgr.check_permission(Permission::EventAccess));
        assert!(mgr.check_permission(Permission::AudioAccess));
        assert!(!mgr.check_permission(Permission::NetworkAccess));
    }

    #[test]
    fn test_all_sentinel_grants_everything() {
        let mgr = SecurityManager::new(SecurityConfig::with_permissions([Permission::All]));
        assert!(mgr.check_permission(Permission::KernelAccess));
        assert!(mgr.check_permission(Permission::ProcessControl));
    }

    #[test]
    fn test_require_error_message() {
        let mgr = SecurityManager::default();
        let err = mgr.require(Permission::EventAccess, "send_message").unwrap_err();
        assert_eq!(
            err.to_string(),
            "permission denied: send_message requires event_access"
        );
    }

    #[test]
    fn test_update_config_replaces_set() {
        let mgr = SecurityManager::new(SecurityConfig::with_permissions([Permission::FileRead]));
        mgr.update_config(SecurityConfig::with_permissions([Permission::FileWrite]));
        assert!(!mgr.check_permission(Permission::FileRead));
        assert!(mgr.check_permission(Permission::FileWrite));
    }

    #[test]
    fn test_revoke_all_keeps_paths() {
        let mut cfg = SecurityConfig::with_permissions([Permission::All]);
        cfg.allowed_paths.push(PathBuf::from("/opt/plugins"));
        let mgr = SecurityManager::new(cfg);
        assert_eq!(mgr.revoke_all(), 1);
        assert!(!mgr.check_permission(Permission::EventAccess));
        assert_eq!(mgr.config().allowed_paths.len(), 1);

        mgr.cleanup();
        assert!(mgr.config().allowed_paths.is_empty());
    }

    // ── Artifact validation ───────────────────────────────────────────

    #[test]
    fn test_validate_missing_artifact() {
        let mgr = SecurityManager::default();
        let err = mgr
            .validate_artifact(Path::new("/nonexistent/radio.so"))
            .unwrap_err();
        assert!(matches!(err, PluginError::SecurityValidation(_)));
    }

    #[test]
    fn test_validate_allowed_paths() {
        let allowed = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let inside = allowed.path().join("a.so");
        let outside = elsewhere.path().join("b.so");
        std::fs::write(&inside, b"").unwrap();
        std::fs::write(&outside, b"").unwrap();

        let mgr = SecurityManager::new(SecurityConfig {
            allowed_paths: vec![allowed.path().to_path_buf()],
            ..Default::default()
        });
        assert!(mgr.validate_artifact(&inside).is_ok());
        let err = mgr.validate_artifact(&outside).unwrap_err();
        assert!(err.to_string().contains("outside the allowed plugin paths"));
    }

    #[test]
    fn test_validate_blocked_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("a.so");
        std::fs::write(&artifact, b"").unwrap();
        let mgr = SecurityManager::new(SecurityConfig {
            allowed_paths: vec![dir.path().to_path_buf()],
            blocked_paths: vec![dir.path().to_path_buf()],
            ..Default::default()
        });
        assert!(mgr
            .validate_artifact(&artifact)
            .unwrap_err()
            .to_string()
            .contains("blocked path"));
    }

    #[test]
    fn test_validate_manifest_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("radio.so");
        std::fs::write(&artifact, b"").unwrap();
        std::fs::write(
            dir.path().join("plugin.toml"),
            "[plugin]\nname = \"radio\"\nversion = \"1.0.0\"\n[permissions]\nrequested = [\"network_access\"]\n",
        )
        .unwrap();

        let strict = SecurityManager::new(SecurityConfig::with_permissions([Permission::EventAccess]));
        let err = strict.validate_artifact(&artifact).unwrap_err();
        assert!(err.to_string().contains("network_access"));

        let lenient = SecurityManager::new(SecurityConfig::with_permissions([
            Permission::NetworkAccess,
            Permission::EventAccess,
        ]));
        let manifest = lenient.validate_artifact(&artifact).unwrap().unwrap();
        let effective = lenient.config().effective_for(Some(&manifest));
        assert_eq!(effective, HashSet::from([Permission::NetworkAccess]));
    }

    #[test]
    fn test_require_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("radio.so");
        std::fs::write(&artifact, b"").unwrap();
        let mgr = SecurityManager::new(SecurityConfig {
            require_manifest: true,
            ..Default::default()
        });
        assert!(mgr
            .validate_artifact(&artifact)
            .unwrap_err()
            .to_string()
            .contains("no plugin manifest"));
    }
}
