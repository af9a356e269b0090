//! Orchestrator error types.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::info::LoaderKind;
use crate::state::PluginState;

/// Why a guarded plugin call did not succeed.
///
/// A timeout, a returned error and a panic are all reported through
/// [`PluginError::CallFailed`] so callers can treat them uniformly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    Failed(String),
    TimedOut(Duration),
    Panicked(String),
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFailure::Failed(msg) => f.write_str(msg),
            CallFailure::TimedOut(after) => write!(f, "timed out after {}ms", after.as_millis()),
            CallFailure::Panicked(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

/// Coarse classification used to decide whether an error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input or a limit was hit. Never retried.
    Configuration,
    /// Blocked by another plugin. Overridable with a force flag.
    Dependency,
    /// Timeouts and loader/plugin failures. Retried.
    Transient,
    /// Retries exhausted, or the plugin was removed by recovery.
    Terminal,
}

#[derive(Error, Debug)]
pub enum PluginError {
    /// Error raised by plugin code itself.
    #[error("plugin reported an error: {0}")]
    Reported(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("plugin already loaded from path: {0}")]
    AlreadyLoaded(String),

    #[error("maximum number of plugins ({0}) reached")]
    MaxPluginsReached(usize),

    #[error("plugin id already in use: {0}")]
    IdConflict(String),

    #[error("security validation failed: {0}")]
    SecurityValidation(String),

    #[error("no loader registered for plugin type: {0}")]
    LoaderUnavailable(LoaderKind),

    #[error("plugin validation failed: {0}")]
    Validation(String),

    #[error("plugin load failed: {0}")]
    Load(String),

    #[error("plugin load timeout after {}ms", .0.as_millis())]
    LoadTimeout(Duration),

    #[error("invalid plugin metadata: {0}")]
    InvalidMetadata(String),

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("cannot {operation} plugin {plugin} in state {state}")]
    InvalidState {
        plugin: String,
        state: PluginState,
        operation: &'static str,
    },

    #[error("invalid state transition for plugin {plugin}: {from} -> {to}")]
    InvalidTransition {
        plugin: String,
        from: PluginState,
        to: PluginState,
    },

    #[error("dependency not found: {0}")]
    DependencyNotFound(String),

    #[error("dependency not running: {name} (state: {state})")]
    DependencyNotRunning { name: String, state: PluginState },

    #[error("cannot stop plugin {0}: dependent plugins are still running")]
    DependentsRunning(String),

    #[error("cannot unload plugin {plugin}: it is required by {} other plugin(s): {}", .blockers.len(), .blockers.join(", "))]
    RequiredBy {
        plugin: String,
        blockers: Vec<String>,
    },

    #[error("{operation} failed for plugin {plugin}: {reason}")]
    CallFailed {
        plugin: String,
        operation: &'static str,
        reason: CallFailure,
    },

    #[error("{point} hook {hook} failed: {reason}")]
    Hook {
        point: &'static str,
        hook: String,
        reason: String,
    },

    #[error("failed to {operation} plugin {plugin} after {attempts} attempts: {last}")]
    RetriesExhausted {
        plugin: String,
        operation: &'static str,
        attempts: u32,
        last: Box<PluginError>,
    },

    #[error("plugin {plugin} unload failed but recovered: {cause}")]
    UnloadRecovered {
        plugin: String,
        cause: Box<PluginError>,
    },

    #[error("cleanup stage {stage} failed: {reason}")]
    Cleanup { stage: &'static str, reason: String },

    #[error("circuit breaker open for plugin {0}")]
    CircuitOpen(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0} queue is full")]
    QueueFull(&'static str),

    #[error("{0} queue is closed")]
    QueueClosed(&'static str),

    #[error("plugin group not found: {0}")]
    GroupNotFound(String),

    #[error("service error: {0}")]
    Service(String),

    #[error("plugin context for {0} has been torn down")]
    ContextClosed(String),

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("semver error: {0}")]
    Semver(#[from] semver::Error),
}

impl PluginError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PluginError::DependencyNotFound(_)
            | PluginError::DependencyNotRunning { .. }
            | PluginError::DependentsRunning(_)
            | PluginError::RequiredBy { .. } => ErrorClass::Dependency,
            PluginError::Reported(_)
            | PluginError::Load(_)
            | PluginError::LoadTimeout(_)
            | PluginError::CallFailed { .. }
            | PluginError::Hook { .. }
            | PluginError::Cleanup { .. }
            | PluginError::Service(_)
            | PluginError::Io(_) => ErrorClass::Transient,
            PluginError::RetriesExhausted { .. } | PluginError::UnloadRecovered { .. } => {
                ErrorClass::Terminal
            }
            _ => ErrorClass::Configuration,
        }
    }

    /// True when the plugin was removed from the orchestrator even though the
    /// operation reported an error. Callers must drop any handle they kept.
    pub fn plugin_removed(&self) -> bool {
        matches!(self, PluginError::UnloadRecovered { .. })
    }

    /// Whether the failure came from a plugin call exceeding its deadline,
    /// possibly wrapped in an aggregated retry error.
    pub fn is_timeout(&self) -> bool {
        match self {
            PluginError::CallFailed {
                reason: CallFailure::TimedOut(_),
                ..
            }
            | PluginError::LoadTimeout(_) => true,
            PluginError::RetriesExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;
