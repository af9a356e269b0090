//! Plugin lifecycle states and the legal transitions between them.
//!
//! Every mutation the orchestrator performs on a managed plugin is checked
//! against [`is_valid_transition`] first. The table is closed: any edge not
//! listed below is rejected unless the caller forces it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a managed plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Unknown,
    Loaded,
    Running,
    Stopping,
    Stopped,
    Unloading,
    Unloaded,
    Error,
    Paused,
    Cleaning,
    Corrupted,
}

impl PluginState {
    /// Every state, in declaration order.
    pub const ALL: [PluginState; 11] = [
        PluginState::Unknown,
        PluginState::Loaded,
        PluginState::Running,
        PluginState::Stopping,
        PluginState::Stopped,
        PluginState::Unloading,
        PluginState::Unloaded,
        PluginState::Error,
        PluginState::Paused,
        PluginState::Cleaning,
        PluginState::Corrupted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginState::Unknown => "unknown",
            PluginState::Loaded => "loaded",
            PluginState::Running => "running",
            PluginState::Stopping => "stopping",
            PluginState::Stopped => "stopped",
            PluginState::Unloading => "unloading",
            PluginState::Unloaded => "unloaded",
            PluginState::Error => "error",
            PluginState::Paused => "paused",
            PluginState::Cleaning => "cleaning",
            PluginState::Corrupted => "corrupted",
        }
    }

    /// States reachable from `self` in one step.
    pub fn successors(&self) -> &'static [PluginState] {
        use PluginState::*;
        match self {
            Unknown => &[Loaded, Error],
            Loaded => &[Running, Unloading, Error],
            Running => &[Stopping, Paused, Error],
            Stopping => &[Stopped, Error],
            Stopped => &[Running, Unloading, Error],
            Unloading => &[Unloaded, Cleaning, Error, Corrupted],
            Unloaded => &[Loaded, Error],
            Error => &[Cleaning, Corrupted, Unloading],
            Paused => &[Running, Stopping, Error],
            Cleaning => &[Unloaded, Error, Corrupted],
            Corrupted => &[Cleaning, Unloading],
        }
    }

    /// Whether an unload may begin from this state.
    pub fn can_unload(&self) -> bool {
        matches!(
            self,
            PluginState::Loaded | PluginState::Stopped | PluginState::Error | PluginState::Paused
        )
    }

    /// Whether a stop may begin from this state.
    pub fn can_stop(&self) -> bool {
        matches!(self, PluginState::Running | PluginState::Paused)
    }

    /// States that only exist while an operation is in flight.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            PluginState::Stopping | PluginState::Unloading | PluginState::Cleaning
        )
    }

    /// Whether a start may begin from this state without forcing.
    pub fn can_start(&self) -> bool {
        matches!(self, PluginState::Loaded | PluginState::Stopped)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns true when `from -> to` is an edge of the transition table.
pub fn is_valid_transition(from: PluginState, to: PluginState) -> bool {
    from.successors().contains(&to)
}
