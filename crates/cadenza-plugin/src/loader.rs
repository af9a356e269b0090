//! Loader contract and the static kind→loader table.
//!
//! Concrete loaders (native library mapping, RPC process supervision,
//! bytecode sandboxes, hot reload) live outside this crate. The orchestrator
//! only needs to validate an artifact, turn it into a [`Plugin`] and later
//! release it.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PluginError;
use crate::info::LoaderKind;
use crate::plugin::Plugin;

#[async_trait]
pub trait Loader: Send + Sync + 'static {
    fn kind(&self) -> LoaderKind;

    /// Cheap pre-flight check of the artifact.
    fn validate_plugin(&self, path: &Path) -> Result<(), PluginError>;

    async fn load_plugin(&self, path: &Path) -> Result<Arc<dyn Plugin>, PluginError>;

    async fn unload_plugin(&self, plugin_id: &str) -> Result<(), PluginError>;
}

/// One slot per [`LoaderKind`]. Lookups are an exhaustive match, so adding
/// a kind without a slot fails to compile.
#[derive(Default, Clone)]
pub struct LoaderTable {
    dynamic: Option<Arc<dyn Loader>>,
    rpc: Option<Arc<dyn Loader>>,
    wasm: Option<Arc<dyn Loader>>,
    hot_reload: Option<Arc<dyn Loader>>,
}

impl std::fmt::Debug for LoaderTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderTable")
            .field("registered", &self.registered())
            .finish()
    }
}

impl LoaderTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_mut(&mut self, kind: LoaderKind) -> &mut Option<Arc<dyn Loader>> {
        match kind {
            LoaderKind::Dynamic => &mut self.dynamic,
            LoaderKind::Rpc => &mut self.rpc,
            LoaderKind::Wasm => &mut self.wasm,
            LoaderKind::HotReload => &mut self.hot_reload,
        }
    }

    /// Registers `loader` under the kind it reports. Replaces any previous one.
    pub fn register(&mut self, loader: Arc<dyn Loader>) -> Option<Arc<dyn Loader>> {
        let kind = loader.kind();
        self.slot_mut(kind).replace(loader)
    }

    pub fn with(mut self, loader: Arc<dyn Loader>) -> Self {
        self.register(loader);
        self
    }

    pub fn get(&self, kind: LoaderKind) -> Result<Arc<dyn Loader>, PluginError> {
        let slot = match kind {
            LoaderKind::Dynamic => &self.dynamic,
            LoaderKind::Rpc => &self.rpc,
            LoaderKind::Wasm => &self.wasm,
            LoaderKind::HotReload => &self.hot_reload,
        };
        slot.clone().ok_or(PluginError::LoaderUnavailable(kind))
    }

    pub fn registered(&self) -> Vec<LoaderKind> {
        LoaderKind::ALL
            .into_iter()
            .filter(|k| self.get(*k).is_ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullLoader(LoaderKind);

    #[async_trait]
    impl Loader for NullLoader {
        fn kind(&self) -> LoaderKind {
            self.0
        }
        fn validate_plugin(&self, _path: &Path) -> Result<(), PluginError> {
            Ok(())
        }
        async fn load_plugin(&self, path: &Path) -> Result<Arc<dyn Plugin>, PluginError> {
            Err(PluginError::Load(format!("nothing at {}", path.display())))
        }
        async fn unload_plugin(&self, _plugin_id: &str) -> Result<(), PluginError> {
            Ok(())
        }
    }

    #[test]
    fn test_empty_table_rejects_every_kind() {
        let table = LoaderTable::new();
        for kind in LoaderKind::ALL {
            assert!(matches!(
                table.get(kind),
                Err(PluginError::LoaderUnavailable(k)) if k == kind
            ));
        }
    }

    #[test]
    fn test_register_by_reported_kind() {
        let table = LoaderTable::new()
            .with(Arc::new(NullLoader(LoaderKind::Rpc)))
            .with(Arc::new(NullLoader(LoaderKind::Wasm)));
        assert_eq!(table.registered(), vec![LoaderKind::Rpc, LoaderKind::Wasm]);
        assert_eq!(table.get(LoaderKind::Rpc).unwrap().kind(), LoaderKind::Rpc);
        assert!(table.get(LoaderKind::Dynamic).is_err());
    }

    #[test]
    fn test_register_replaces() {
        let mut table = LoaderTable::new();
        assert!(table.register(Arc::new(NullLoader(LoaderKind::Dynamic))).is_none());
        assert!(table.register(Arc::new(NullLoader(LoaderKind::Dynamic))).is_some());
    }
}
