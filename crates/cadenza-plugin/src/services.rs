//! Service registry used to publish started plugins under well-known names.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::PluginError;

pub type Service = Arc<dyn Any + Send + Sync>;

/// Name a started plugin is published under.
pub fn plugin_service_name(plugin_name: &str) -> String {
    format!("plugin.{plugin_name}")
}

/// Name a started plugin's context is published under.
pub fn context_service_name(plugin_name: &str) -> String {
    format!("plugin.{plugin_name}.context")
}

pub trait ServiceRegistry: Send + Sync {
    fn register_service(&self, name: &str, service: Service) -> Result<(), PluginError>;
    fn get_service(&self, name: &str) -> Result<Service, PluginError>;
    fn unregister_service(&self, name: &str) -> Result<(), PluginError>;
    fn list_services(&self) -> Vec<String>;
    fn has_service(&self, name: &str) -> bool;
}

#[derive(Default)]
pub struct InMemoryServiceRegistry {
    services: RwLock<HashMap<String, Service>>,
}

impl InMemoryServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for InMemoryServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryServiceRegistry")
            .field("services", &self.list_services())
            .finish()
    }
}

impl ServiceRegistry for InMemoryServiceRegistry {
    fn register_service(&self, name: &str, service: Service) -> Result<(), PluginError> {
        if name.is_empty() {
            return Err(PluginError::Service("service name cannot be empty".into()));
        }
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        if services.contains_key(name) {
            return Err(PluginError::Service(format!(
                "service already registered: {name}"
            )));
        }
        services.insert(name.to_string(), service);
        Ok(())
    }

    fn get_service(&self, name: &str) -> Result<Service, PluginError> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::Service(format!("service not found: {name}")))
    }

    fn unregister_service(&self, name: &str) -> Result<(), PluginError> {
        self.services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| PluginError::Service(format!("service not found: {name}")))
    }

    fn list_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn has_service(&self, name: &str) -> bool {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_names() {
        assert_eq!(plugin_service_name("spotify"), "plugin.spotify");
        assert_eq!(context_service_name("spotify"), "plugin.spotify.context");
    }

    #[test]
    fn test_register_get_unregister() {
        let reg = InMemoryServiceRegistry::new();
        reg.register_service("plugin.radio", Arc::new(42u32)).unwrap();
        assert!(reg.has_service("plugin.radio"));

        let svc = reg.get_service("plugin.radio").unwrap();
        assert_eq!(svc.downcast_ref::<u32>(), Some(&42));

        reg.unregister_service("plugin.radio").unwrap();
        assert!(!reg.has_service("plugin.radio"));
        assert!(reg.unregister_service("plugin.radio").is_err());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let reg = InMemoryServiceRegistry::new();
        reg.register_service("a", Arc::new(())).unwrap();
        let err = reg.register_service("a", Arc::new(())).unwrap_err();
        assert_eq!(err.to_string(), "service error: service already registered: a");
    }

    #[test]
    fn test_list_sorted() {
        let reg = InMemoryServiceRegistry::new();
        reg.register_service("b", Arc::new(())).unwrap();
        reg.register_service("a", Arc::new(())).unwrap();
        assert_eq!(reg.list_services(), vec!["a", "b"]);
    }
}
