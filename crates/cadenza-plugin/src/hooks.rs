//! Named lifecycle hooks.
//!
//! Hooks are kept as an ordered list of named records so callers can list
//! them and remove a single one without disturbing the rest.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::PluginError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    PreStart,
    PostStart,
    PreStop,
    PostStop,
    PreUnload,
    PostUnload,
    OnError,
    OnCleanup,
}

impl HookPoint {
    pub fn name(&self) -> &'static str {
        match self {
            HookPoint::PreStart => "pre_start",
            HookPoint::PostStart => "post_start",
            HookPoint::PreStop => "pre_stop",
            HookPoint::PostStop => "post_stop",
            HookPoint::PreUnload => "pre_unload",
            HookPoint::PostUnload => "post_unload",
            HookPoint::OnError => "on_error",
            HookPoint::OnCleanup => "on_cleanup",
        }
    }

    /// Pre hooks can veto the operation; the others are advisory.
    pub fn is_pre_hook(&self) -> bool {
        matches!(
            self,
            HookPoint::PreStart | HookPoint::PreStop | HookPoint::PreUnload
        )
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a hook gets to see.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub plugin_id: &'a str,
    pub point: HookPoint,
    /// 1-based attempt number inside a retry loop, 0 outside one.
    pub attempt: u32,
    pub error: Option<&'a PluginError>,
}

pub type HookFn = Arc<dyn Fn(&HookContext<'_>) -> Result<(), PluginError> + Send + Sync>;

#[derive(Clone)]
pub struct Hook {
    pub name: String,
    pub point: HookPoint,
    action: HookFn,
}

impl Hook {
    pub fn new<F>(name: impl Into<String>, point: HookPoint, action: F) -> Self
    where
        F: Fn(&HookContext<'_>) -> Result<(), PluginError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            point,
            action: Arc::new(action),
        }
    }

    fn call(&self, ctx: &HookContext<'_>) -> Result<(), PluginError> {
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.action)(ctx)));
        let reason = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "hook panicked".to_string(),
        };
        Err(PluginError::Hook {
            point: self.point.name(),
            hook: self.name.clone(),
            reason,
        })
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("name", &self.name)
            .field("point", &self.point)
            .finish()
    }
}

/// Ordered hook list. Names are unique within a set.
#[derive(Clone, Default, Debug)]
pub struct HookSet {
    hooks: Vec<Hook>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `hook`, replacing any hook with the same name in place.
    pub fn add(&mut self, hook: Hook) {
        match self.hooks.iter_mut().find(|h| h.name == hook.name) {
            Some(existing) => *existing = hook,
            None => self.hooks.push(hook),
        }
    }

    pub fn with(mut self, hook: Hook) -> Self {
        self.add(hook);
        self
    }

    /// Removes only the hook called `name`.
    pub fn remove(&mut self, name: &str) -> Option<Hook> {
        let pos = self.hooks.iter().position(|h| h.name == name)?;
        Some(self.hooks.remove(pos))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hooks.iter().any(|h| h.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.hooks.iter().map(|h| h.name.as_str()).collect()
    }

    pub fn at(&self, point: HookPoint) -> impl Iterator<Item = &Hook> {
        self.hooks.iter().filter(move |h| h.point == point)
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn clear(&mut self) {
        self.hooks.clear();
    }

    /// `self` followed by the hooks of `other` not already named here.
    pub fn merged(&self, other: &HookSet) -> HookSet {
        let mut out = self.clone();
        for hook in &other.hooks {
            if !out.contains(&hook.name) {
                out.hooks.push(hook.clone());
            }
        }
        out
    }

    /// Runs hooks at `point` in order, stopping at the first failure.
    pub fn run(&self, point: HookPoint, ctx: &HookContext<'_>) -> Result<(), PluginError> {
        for hook in self.at(point) {
            hook.call(ctx)?;
        }
        Ok(())
    }

    /// Runs every hook at `point` and logs failures instead of returning them.
    pub fn run_logged(&self, point: HookPoint, ctx: &HookContext<'_>) -> usize {
        let mut failures = 0;
        for hook in self.at(point) {
            if let Err(e) = hook.call(ctx) {
                failures += 1;
                tracing::warn!(plugin_id = %ctx.plugin_id, hook = %hook.name, error = %e, "hook failed");
            }
        }
        failures
    }
}
