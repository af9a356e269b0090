//! Plugin groups and batch operations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use super::Orchestrator;
use crate::error::{CallFailure, PluginError, Result};
use crate::managed::ManagedPlugin;
use crate::options::{StartOptions, StopOptions, UnloadOptions};

impl Orchestrator {
    // ─── Membership ─────────────────────────────────────────────────────

    /// Puts the plugin in `group`, moving it out of any previous group.
    pub async fn add_plugin_to_group(&self, id: &str, group: &str) -> Result<()> {
        if group.trim().is_empty() {
            return Err(PluginError::InvalidInput("group name must not be empty".into()));
        }
        let mut table = self.table.write().await;
        let mp = table
            .plugins
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;

        let previous = mp.write().group.replace(group.to_string());
        if let Some(old) = previous.filter(|old| old != group) {
            if let Some(members) = table.groups.get_mut(&old) {
                members.retain(|m| m != id);
                if members.is_empty() {
                    table.groups.remove(&old);
                }
            }
        }
        let members = table.groups.entry(group.to_string()).or_default();
        if !members.iter().any(|m| m == id) {
            members.push(id.to_string());
        }
        Ok(())
    }

    /// Removes the plugin from `group`. A group left empty is deleted.
    pub async fn remove_plugin_from_group(&self, id: &str, group: &str) -> Result<()> {
        let mut table = self.table.write().await;
        let members = table
            .groups
            .get_mut(group)
            .ok_or_else(|| PluginError::GroupNotFound(group.to_string()))?;
        let before = members.len();
        members.retain(|m| m != id);
        if members.len() == before {
            return Err(PluginError::NotFound(id.to_string()));
        }
        if members.is_empty() {
            table.groups.remove(group);
        }
        if let Some(mp) = table.plugins.get(id) {
            let mut record = mp.write();
            if record.group.as_deref() == Some(group) {
                record.group = None;
            }
        }
        Ok(())
    }

    pub async fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table.read().await.groups.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn group_members(&self, group: &str) -> Result<Vec<String>> {
        self.table
            .read()
            .await
            .groups
            .get(group)
            .cloned()
            .ok_or_else(|| PluginError::GroupNotFound(group.to_string()))
    }

    /// Members of `group`, highest priority first.
    async fn members_by_priority(&self, group: &str) -> Result<Vec<Arc<ManagedPlugin>>> {
        let table = self.table.read().await;
        let ids = table
            .groups
            .get(group)
            .ok_or_else(|| PluginError::GroupNotFound(group.to_string()))?;
        let mut members: Vec<Arc<ManagedPlugin>> =
            ids.iter().filter_map(|id| table.plugins.get(id).cloned()).collect();
        members.sort_by(|a, b| b.priority().cmp(&a.priority()));
        Ok(members)
    }

    // ─── Group lifecycle ────────────────────────────────────────────────

    /// Starts members highest priority first. Stops at the first failure.
    pub async fn start_group(&self, group: &str) -> Result<()> {
        let members = self.members_by_priority(group).await?;
        info!(group, members = members.len(), "starting plugin group");
        for mp in members {
            self.start(&mp.id).await?;
        }
        Ok(())
    }

    /// Stops members lowest priority first. Stops at the first failure.
    pub async fn stop_group(&self, group: &str) -> Result<()> {
        let mut members = self.members_by_priority(group).await?;
        members.reverse();
        info!(group, members = members.len(), "stopping plugin group");
        for mp in members {
            self.stop(&mp.id).await?;
        }
        Ok(())
    }

    /// Unloads members highest priority first.
    ///
    /// Without `force_unload` the first failure ends the run. With it every
    /// member is attempted and the first failure is returned at the end.
    pub async fn unload_group(&self, group: &str, options: UnloadOptions) -> Result<()> {
        let members = self.members_by_priority(group).await?;
        info!(group, members = members.len(), "unloading plugin group");
        let mut first_error = None;
        for mp in members {
            match self.unload_with_options(&mp.id, options.clone()).await {
                Ok(()) | Err(PluginError::NotFound(_)) => {}
                Err(e) if options.force_unload => {
                    warn!(group, plugin_id = %mp.id, error = %e, "group member failed to unload");
                    first_error.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // ─── Batch ──────────────────────────────────────────────────────────

    pub async fn batch_start(
        self: &Arc<Self>,
        ids: &[String],
        options: StartOptions,
    ) -> HashMap<String, Result<()>> {
        self.batch(ids, "start", move |this, id| {
            let options = options.clone();
            async move { this.start_with_options(&id, options).await }
        })
        .await
    }

    pub async fn batch_stop(
        self: &Arc<Self>,
        ids: &[String],
        options: StopOptions,
    ) -> HashMap<String, Result<()>> {
        self.batch(ids, "stop", move |this, id| {
            let options = options.clone();
            async move { this.stop_with_options(&id, options).await }
        })
        .await
    }

    pub async fn batch_unload(
        self: &Arc<Self>,
        ids: &[String],
        options: UnloadOptions,
    ) -> HashMap<String, Result<()>> {
        self.batch(ids, "unload", move |this, id| {
            let options = options.clone();
            async move { this.unload_with_options(&id, options).await }
        })
        .await
    }

    /// Spawns one task per id and collects every outcome.
    async fn batch<F, Fut>(
        self: &Arc<Self>,
        ids: &[String],
        operation: &'static str,
        op: F,
    ) -> HashMap<String, Result<()>>
    where
        F: Fn(Arc<Self>, String) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handles: Vec<_> = ids
            .iter()
            .map(|id| (id.clone(), tokio::spawn(op(Arc::clone(self), id.clone()))))
            .collect();

        let mut results = HashMap::with_capacity(handles.len());
        for (id, handle) in handles {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(PluginError::CallFailed {
                    plugin: id.clone(),
                    operation,
                    reason: CallFailure::Panicked(join_err.to_string()),
                }),
            };
            results.insert(id, outcome);
        }
        results
    }
}
