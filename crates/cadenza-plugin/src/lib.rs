//! # cadenza-plugin
//!
//! Plugin lifecycle orchestration for the cadenza terminal music player.
//!
//! Playback sources, local libraries and audio processors ship as plugins
//! delivered through one of four loaders (native library, RPC process,
//! bytecode sandbox, hot-reloadable module). This crate loads, starts, stops
//! and unloads them while enforcing resource limits, permissions,
//! dependency ordering and failure recovery.
//!
//! ## Architecture
//!
//! - **Orchestrator**: owns the plugin table and drives every lifecycle operation
//! - **Loaders**: external implementations of [`Loader`], one per [`LoaderKind`]
//! - **Context**: the permission-gated view of the host a plugin receives
//! - **Event bus**: lifecycle announcements and plugin-to-plugin messaging
//! - **Monitors**: resource limits, liveness and metrics, each on its own task
//!
//! ```no_run
//! # async fn demo(loader: std::sync::Arc<dyn cadenza_plugin::Loader>) -> cadenza_plugin::Result<()> {
//! use cadenza_plugin::{LoaderKind, LoaderTable, Orchestrator, OrchestratorConfig};
//!
//! let orchestrator = Orchestrator::new(OrchestratorConfig::from_env(), LoaderTable::new().with(loader));
//! let id = orchestrator.load("/usr/lib/cadenza/plugins/radio.so", LoaderKind::Dynamic).await?;
//! orchestrator.start(&id).await?;
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod circuit;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod health;
pub mod hooks;
pub mod info;
pub mod loader;
pub mod managed;
pub mod manifest;
pub mod monitor;
pub mod options;
pub mod orchestrator;
pub mod plugin;
pub mod resource;
pub mod security;
pub mod services;
pub mod state;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState};
pub use config::OrchestratorConfig;
pub use context::PluginContext;
pub use error::{CallFailure, ErrorClass, PluginError, Result};
pub use events::{handler_fn, Event, EventBus, EventHandler};
pub use health::HealthStatus;
pub use hooks::{Hook, HookContext, HookPoint, HookSet};
pub use info::{LoaderKind, PluginInfo, PluginMetrics, PluginPriority};
pub use loader::{Loader, LoaderTable};
pub use managed::PluginSnapshot;
pub use manifest::PluginManifest;
pub use monitor::MonitorTotals;
pub use options::{StartOptions, StopOptions, UnloadOptions, UnloadProgress};
pub use orchestrator::Orchestrator;
pub use plugin::Plugin;
pub use resource::{EnforceMode, ResourceLimits, ResourceMonitor};
pub use security::{Permission, SecurityConfig, SecurityManager};
pub use services::{InMemoryServiceRegistry, ServiceRegistry};
pub use state::PluginState;
