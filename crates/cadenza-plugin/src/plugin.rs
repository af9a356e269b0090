//! The contract every loaded plugin instance fulfils.
//!
//! Beyond the core lifecycle, a plugin may opt into extra cleanup
//! capabilities by implementing one of the small traits below and returning
//! itself from the matching `as_*` accessor. The orchestrator only calls a
//! capability the plugin has declared this way.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::PluginContext;
use crate::error::PluginError;
use crate::events::Event;
use crate::info::{PluginInfo, PluginMetrics};

#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn info(&self) -> PluginInfo;

    fn capabilities(&self) -> Vec<String> {
        self.info().capabilities
    }

    fn dependencies(&self) -> Vec<String> {
        self.info().dependencies
    }

    async fn initialize(&self, ctx: Arc<PluginContext>) -> Result<(), PluginError>;

    async fn start(&self) -> Result<(), PluginError>;

    async fn stop(&self) -> Result<(), PluginError>;

    async fn cleanup(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn health_check(&self) -> Result<(), PluginError> {
        Ok(())
    }

    /// `None` means the plugin does not report metrics.
    async fn metrics(&self) -> Result<Option<PluginMetrics>, PluginError> {
        Ok(None)
    }

    async fn handle_event(&self, _event: &Event) -> Result<(), PluginError> {
        Ok(())
    }

    fn as_network_cleaner(&self) -> Option<&dyn NetworkCleaner> {
        None
    }

    fn as_memory_cleaner(&self) -> Option<&dyn MemoryCleaner> {
        None
    }

    fn as_file_handle_closer(&self) -> Option<&dyn FileHandleCloser> {
        None
    }

    fn as_system_resource_cleaner(&self) -> Option<&dyn SystemResourceCleaner> {
        None
    }

    fn as_sensitive_data_cleaner(&self) -> Option<&dyn SensitiveDataCleaner> {
        None
    }

    fn as_key_eraser(&self) -> Option<&dyn KeyEraser> {
        None
    }

    fn as_sandbox_cleaner(&self) -> Option<&dyn SandboxCleaner> {
        None
    }
}

// ─── Optional cleanup capabilities ──────────────────────────────────

/// Closes sockets and RPC channels the plugin opened.
#[async_trait]
pub trait NetworkCleaner: Send + Sync {
    async fn close_connections(&self) -> Result<(), PluginError>;
}

/// Drops caches and large buffers.
#[async_trait]
pub trait MemoryCleaner: Send + Sync {
    async fn release_memory(&self) -> Result<(), PluginError>;
}

#[async_trait]
pub trait FileHandleCloser: Send + Sync {
    async fn close_files(&self) -> Result<(), PluginError>;
}

/// Releases OS-level resources such as child processes or audio devices.
#[async_trait]
pub trait SystemResourceCleaner: Send + Sync {
    async fn release_system_resources(&self) -> Result<(), PluginError>;
}

/// Wipes credentials and tokens held in memory.
#[async_trait]
pub trait SensitiveDataCleaner: Send + Sync {
    async fn scrub_sensitive_data(&self) -> Result<(), PluginError>;
}

#[async_trait]
pub trait KeyEraser: Send + Sync {
    async fn erase_keys(&self) -> Result<(), PluginError>;
}

#[async_trait]
pub trait SandboxCleaner: Send + Sync {
    async fn teardown_sandbox(&self) -> Result<(), PluginError>;
}

/// Plugin-side capabilities the orchestrator may call during cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Network,
    Memory,
    FileHandles,
    SystemResources,
    SensitiveData,
    Keys,
    Sandbox,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Network => "network",
            Capability::Memory => "memory",
            Capability::FileHandles => "file_handles",
            Capability::SystemResources => "system_resources",
            Capability::SensitiveData => "sensitive_data",
            Capability::Keys => "keys",
            Capability::Sandbox => "sandbox",
        }
    }
}

/// Invokes `capability` on `plugin` if it implements it.
///
/// Returns `Ok(false)` when the plugin does not offer the capability.
pub async fn invoke_capability(
    plugin: &dyn Plugin,
    capability: Capability,
) -> Result<bool, PluginError> {
    match capability {
        Capability::Network => match plugin.as_network_cleaner() {
            Some(c) => c.close_connections().await.map(|_| true),
            None => Ok(false),
        },
        Capability::Memory => match plugin.as_memory_cleaner() {
            Some(c) => c.release_memory().await.map(|_| true),
            None => Ok(false),
        },
        Capability::FileHandles => match plugin.as_file_handle_closer() {
            Some(c) => c.close_files().await.map(|_| true),
            None => Ok(false),
        },
        Capability::SystemResources => match plugin.as_system_resource_cleaner() {
            Some(c) => c.release_system_resources().await.map(|_| true),
            None => Ok(false),
        },
        Capability::SensitiveData => match plugin.as_sensitive_data_cleaner() {
            Some(c) => c.scrub_sensitive_data().await.map(|_| true),
            None => Ok(false),
        },
        Capability::Keys => match plugin.as_key_eraser() {
            Some(c) => c.erase_keys().await.map(|_| true),
            None => Ok(false),
        },
        Capability::Sandbox => match plugin.as_sandbox_cleaner() {
            Some(c) => c.teardown_sandbox().await.map(|_| true),
            None => Ok(false),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Bare;

    #[async_trait]
    impl Plugin for Bare {
        fn info(&self) -> PluginInfo {
            PluginInfo::new("bare", "0.1.0").with_dependencies(["decoder"])
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

    #[derive(Default)]
    struct Networked {
        closed: AtomicBool,
    }

    #[async_trait]
    impl NetworkCleaner for Networked {
        async fn close_connections(&self) -> Result<(), PluginError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl Plugin for Networked {
        fn info(&self) -> PluginInfo {
            PluginInfo::new("networked", "0.1.0")
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
        fn as_network_cleaner(&self) -> Option<&dyn NetworkCleaner> {
            Some(self)
        }
    }

    #[tokio::test]
    async fn test_defaults() {
        let p = Bare;
        assert_eq!(p.dependencies(), vec!["decoder"]);
        assert!(p.capabilities().is_empty());
        assert!(p.metrics().await.unwrap().is_none());
        assert!(p.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_capability_is_skipped() {
        let invoked = invoke_capability(&Bare, Capability::Network).await.unwrap();
        assert!(!invoked);
    }

    #[tokio::test]
    async fn test_declared_capability_is_invoked() {
        let p = Networked::default();
        assert!(invoke_capability(&p, Capability::Network).await.unwrap());
        assert!(p.closed.load(Ordering::SeqCst));
        assert!(!invoke_capability(&p, Capability::Keys).await.unwrap());
    }
}
