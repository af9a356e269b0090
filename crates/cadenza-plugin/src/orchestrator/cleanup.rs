//! Staged resource and security cleanup run by stop and unload.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{is_sensitive_key, Orchestrator};
use crate::call::guarded;
use crate::error::{PluginError, Result};
use crate::managed::ManagedPlugin;
use crate::plugin::{invoke_capability, Capability};

/// How far a cleanup pass goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum CleanupScope {
    /// After a stop. The context stays usable so the plugin can start again,
    /// and the loader keeps its handle.
    Stop,
    /// The plugin is leaving for good.
    Unload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Context,
    Listeners,
    Files,
    Network,
    Memory,
    FileHandles,
    SystemResources,
    LoaderSpecific,
}

impl Stage {
    const ALL: [Stage; 8] = [
        Stage::Context,
        Stage::Listeners,
        Stage::Files,
        Stage::Network,
        Stage::Memory,
        Stage::FileHandles,
        Stage::SystemResources,
        Stage::LoaderSpecific,
    ];

    fn name(&self) -> &'static str {
        match self {
            Stage::Context => "context",
            Stage::Listeners => "event_listeners",
            Stage::Files => "temp_files",
            Stage::Network => "network",
            Stage::Memory => "memory",
            Stage::FileHandles => "file_handles",
            Stage::SystemResources => "system_resources",
            Stage::LoaderSpecific => "loader_specific",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SecurityStage {
    SensitiveData,
    SecurityContext,
    Permissions,
    Keys,
    Sandbox,
}

impl SecurityStage {
    const ALL: [SecurityStage; 5] = [
        SecurityStage::SensitiveData,
        SecurityStage::SecurityContext,
        SecurityStage::Permissions,
        SecurityStage::Keys,
        SecurityStage::Sandbox,
    ];

    fn name(&self) -> &'static str {
        match self {
            SecurityStage::SensitiveData => "sensitive_data",
            SecurityStage::SecurityContext => "security_context",
            SecurityStage::Permissions => "permissions",
            SecurityStage::Keys => "encryption_keys",
            SecurityStage::Sandbox => "sandbox",
        }
    }
}

/// Applies the forced/unforced failure policy to one stage result.
fn settle(plugin_id: &str, stage: &'static str, force: bool, outcome: Result<()>) -> Result<()> {
    match outcome {
        Ok(()) => Ok(()),
        Err(e) if force => {
            warn!(plugin_id, stage, error = %e, "cleanup stage failed, continuing because operation is forced");
            Ok(())
        }
        Err(e) => Err(PluginError::Cleanup {
            stage,
            reason: e.to_string(),
        }),
    }
}

impl Orchestrator {
    /// Runs the resource cleanup stages in order.
    ///
    /// Returns whether the loader already released the plugin, so unload
    /// does not release it twice.
    pub(super) async fn cleanup_resources(
        &self,
        mp: &Arc<ManagedPlugin>,
        force: bool,
        scope: CleanupScope,
    ) -> Result<bool> {
        let mut loader_released = false;
        for stage in Stage::ALL {
            let outcome = match (stage, scope) {
                (Stage::LoaderSpecific, CleanupScope::Stop) => continue,
                (Stage::LoaderSpecific, CleanupScope::Unload) => {
                    // Released at most once, even when a forced run ignores the failure.
                    loader_released = true;
                    self.release_loader(mp, false).await
                }
                _ => self.run_stage(mp, stage, scope).await,
            };
            settle(&mp.id, stage.name(), force, outcome)?;
        }
        debug!(plugin_id = %mp.id, ?scope, "resource cleanup finished");
        Ok(loader_released)
    }

    async fn run_stage(&self, mp: &Arc<ManagedPlugin>, stage: Stage, scope: CleanupScope) -> Result<()> {
        match stage {
            Stage::Context => {
                match scope {
                    CleanupScope::Unload => mp.context.teardown(),
                    CleanupScope::Stop => {
                        if let Some(monitor) = mp.context.resources() {
                            monitor.stop();
                        }
                    }
                }
                Ok(())
            }
            Stage::Listeners => {
                let removed = mp.context.unsubscribe_all();
                debug!(plugin_id = %mp.id, removed, "event listeners removed");
                Ok(())
            }
            Stage::Files => mp.context.remove_files(),
            Stage::Network => self.call_capability(mp, Capability::Network).await,
            Stage::Memory => {
                if scope == CleanupScope::Unload {
                    mp.context.clear_config();
                    let mut record = mp.write();
                    record.metadata.clear();
                    record.hooks.clear();
                }
                self.call_capability(mp, Capability::Memory).await
            }
            Stage::FileHandles => self.call_capability(mp, Capability::FileHandles).await,
            Stage::SystemResources => {
                self.call_capability(mp, Capability::SystemResources).await
            }
            Stage::LoaderSpecific => Ok(()),
        }
    }

    /// Runs the security cleanup stages in order.
    pub(super) async fn cleanup_security(&self, mp: &Arc<ManagedPlugin>, force: bool) -> Result<()> {
        for stage in SecurityStage::ALL {
            let outcome = match stage {
                SecurityStage::SensitiveData => {
                    let scrubbed = {
                        let mut record = mp.write();
                        let before = record.metadata.len();
                        record.metadata.retain(|key, _| !is_sensitive_key(key));
                        before - record.metadata.len()
                    };
                    if scrubbed > 0 {
                        debug!(plugin_id = %mp.id, scrubbed, "sensitive metadata removed");
                    }
                    self.call_capability(mp, Capability::SensitiveData).await
                }
                SecurityStage::SecurityContext => {
                    mp.context.security().cleanup();
                    Ok(())
                }
                SecurityStage::Permissions => {
                    let security = mp.context.security();
                    security.revoke_all();
                    if security.permissions().is_empty() {
                        Ok(())
                    } else {
                        Err(PluginError::PermissionDenied(
                            "permissions still granted after revocation".into(),
                        ))
                    }
                }
                SecurityStage::Keys => self.call_capability(mp, Capability::Keys).await,
                SecurityStage::Sandbox => self.call_capability(mp, Capability::Sandbox).await,
            };
            settle(&mp.id, stage.name(), force, outcome)?;
        }
        Ok(())
    }

    /// Calls an optional cleanup capability, guarded like any plugin call.
    async fn call_capability(&self, mp: &ManagedPlugin, capability: Capability) -> Result<()> {
        let plugin = Arc::clone(&mp.plugin);
        let invoked = guarded(&mp.id, capability.as_str(), self.config.cleanup_timeout, async move {
            invoke_capability(plugin.as_ref(), capability).await
        })
        .await?;
        if invoked {
            debug!(plugin_id = %mp.id, capability = capability.as_str(), "cleanup capability invoked");
        }
        Ok(())
    }

    /// Tells the plugin's loader to drop its handle.
    pub(super) async fn release_loader(&self, mp: &ManagedPlugin, force: bool) -> Result<()> {
        let loader = self.loaders.get(mp.kind)?;
        let id = mp.id.clone();
        let outcome = guarded(&mp.id, "unload_plugin", self.config.cleanup_timeout, async move {
            loader.unload_plugin(&id).await
        })
        .await;
        match outcome {
            Err(e) if force => {
                warn!(plugin_id = %mp.id, error = %e, "loader release failed, continuing because unload is forced");
                Ok(())
            }
            other => other,
        }
    }
}
