//! Async start/stop queues and the kill-request consumer.
//!
//! Consumers hold a `Weak` handle so a dropped orchestrator is not kept
//! alive by its own background tasks.

use std::sync::Weak;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Orchestrator;
use crate::error::{PluginError, Result};
use crate::options::{StartOptions, StopOptions};

pub(crate) struct StartRequest {
    id: String,
    options: StartOptions,
    reply: oneshot::Sender<Result<()>>,
}

pub(crate) struct StopRequest {
    id: String,
    options: StopOptions,
    reply: oneshot::Sender<Result<()>>,
}

fn queue_error<T>(queue: &'static str, err: TrySendError<T>) -> PluginError {
    match err {
        TrySendError::Full(_) => PluginError::QueueFull(queue),
        TrySendError::Closed(_) => PluginError::QueueClosed(queue),
    }
}

impl Orchestrator {
    /// Queues a start. The receiver resolves once the start has run.
    pub fn start_async(&self, id: &str, options: StartOptions) -> Result<oneshot::Receiver<Result<()>>> {
        self.ensure_open()?;
        let (reply, rx) = oneshot::channel();
        self.start_tx
            .try_send(StartRequest {
                id: id.to_string(),
                options,
                reply,
            })
            .map_err(|e| queue_error("start", e))?;
        Ok(rx)
    }

    /// Queues a stop. The receiver resolves once the stop has run.
    pub fn stop_async(&self, id: &str, options: StopOptions) -> Result<oneshot::Receiver<Result<()>>> {
        self.ensure_open()?;
        let (reply, rx) = oneshot::channel();
        self.stop_tx
            .try_send(StopRequest {
                id: id.to_string(),
                options,
                reply,
            })
            .map_err(|e| queue_error("stop", e))?;
        Ok(rx)
    }
}

pub(super) fn spawn_start_consumer(
    orchestrator: Weak<Orchestrator>,
    mut rx: mpsc::Receiver<StartRequest>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                req = rx.recv() => {
                    let Some(req) = req else { break };
                    let Some(orch) = orchestrator.upgrade() else { break };
                    let result = orch.start_with_options(&req.id, req.options).await;
                    if req.reply.send(result).is_err() {
                        debug!(plugin_id = %req.id, "start requester went away");
                    }
                }
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("start queue consumer stopped");
    })
}

pub(super) fn spawn_stop_consumer(
    orchestrator: Weak<Orchestrator>,
    mut rx: mpsc::Receiver<StopRequest>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                req = rx.recv() => {
                    let Some(req) = req else { break };
                    let Some(orch) = orchestrator.upgrade() else { break };
                    let result = orch.stop_with_options(&req.id, req.options).await;
                    if req.reply.send(result).is_err() {
                        debug!(plugin_id = %req.id, "stop requester went away");
                    }
                }
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("stop queue consumer stopped");
    })
}

/// Force-stops plugins whose resource monitor asked for it.
pub(super) fn spawn_kill_consumer(
    orchestrator: Weak<Orchestrator>,
    mut rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                id = rx.recv() => {
                    let Some(id) = id else { break };
                    let Some(orch) = orchestrator.upgrade() else { break };
                    warn!(plugin_id = %id, "resource limits breached, force stopping plugin");
                    let options = StopOptions {
                        force_stop: true,
                        ..Default::default()
                    };
                    match orch.stop_with_options(&id, options).await {
                        Ok(()) => info!(plugin_id = %id, "plugin force stopped after limit breach"),
                        Err(e) => warn!(plugin_id = %id, error = %e, "failed to force stop plugin"),
                    }
                }
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("kill consumer stopped");
    })
}
