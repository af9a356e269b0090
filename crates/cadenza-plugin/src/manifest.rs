//! Optional `plugin.toml` manifest shipped next to a plugin artifact.
//!
//! The manifest lets the security layer see what a plugin will ask for
//! before any loader touches the artifact: its name, version and the
//! permissions it expects to be granted.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::PluginError;
use crate::info::LoaderKind;
use crate::security::Permission;

/// File name looked up in the artifact's directory.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Manifest parsed from `plugin.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    pub plugin: ManifestMeta,
    #[serde(default)]
    pub permissions: ManifestPermissions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestMeta {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: Option<LoaderKind>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestPermissions {
    #[serde(default)]
    pub requested: Vec<Permission>,
}

// ─── Validation helpers ─────────────────────────────────────────────

/// Names are `^[a-z][a-z0-9_-]{1,63}$`.
fn validate_plugin_name(name: &str) -> Result<(), PluginError> {
    let len = name.len();
    if !(2..=64).contains(&len) {
        return Err(PluginError::InvalidManifest(format!(
            "plugin name must be 2-64 characters, got {len}"
        )));
    }

    let mut chars = name.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_lowercase() {
            return Err(PluginError::InvalidManifest(format!(
                "plugin name must start with a lowercase letter, got '{first}'"
            )));
        }
    }

    for ch in chars {
        if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && ch != '-' && ch != '_' {
            return Err(PluginError::InvalidManifest(format!(
                "plugin name contains invalid character '{ch}'"
            )));
        }
    }

    Ok(())
}

impl PluginManifest {
    pub fn parse(toml_str: &str) -> Result<Self, PluginError> {
        Ok(toml::from_str(toml_str)?)
    }

    pub fn validate(&self) -> Result<(), PluginError> {
        validate_plugin_name(&self.plugin.name)?;
        semver::Version::parse(&self.plugin.version).map_err(|_| {
            PluginError::InvalidManifest(format!(
                "plugin.version is not valid semver: '{}'",
                self.plugin.version
            ))
        })?;
        if self.plugin.dependencies.iter().any(|d| d.trim().is_empty()) {
            return Err(PluginError::InvalidManifest(
                "dependency names cannot be empty".into(),
            ));
        }
        if self.plugin.dependencies.contains(&self.plugin.name) {
            return Err(PluginError::InvalidManifest(format!(
                "plugin {} cannot depend on itself",
                self.plugin.name
            )));
        }
        Ok(())
    }

    pub fn parse_and_validate(toml_str: &str) -> Result<Self, PluginError> {
        let manifest = Self::parse(toml_str)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Path where the manifest for `artifact` would live.
    pub fn path_for(artifact: &Path) -> PathBuf {
        let dir = if artifact.is_dir() {
            artifact
        } else {
            artifact.parent().unwrap_or_else(|| Path::new("."))
        };
        dir.join(MANIFEST_FILE)
    }

    /// Reads and validates the manifest beside `artifact`, if there is one.
    pub fn discover(artifact: &Path) -> Result<Option<Self>, PluginError> {
        let path = Self::path_for(artifact);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        Self::parse_and_validate(&raw).map(Some)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
