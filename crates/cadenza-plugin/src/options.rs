//! Per-call options for lifecycle operations.

use std::sync::Mutex;
use std::time::Duration;

use crate::hooks::HookSet;

/// Options for [`crate::Orchestrator::start_with_options`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Per-call deadline. Falls back to the configured start timeout.
    pub timeout: Option<Duration>,
    /// Skip the state and dependency checks.
    pub force_start: bool,
    /// Attempts before giving up. Zero means one.
    pub retry_count: u32,
    /// Pause between attempts. Falls back to the configured retry delay.
    pub retry_delay: Option<Duration>,
    pub hooks: HookSet,
}

#[derive(Debug, Clone, Default)]
pub struct StopOptions {
    pub timeout: Option<Duration>,
    /// Ignore running dependents and carry on past a failed `stop()`.
    pub force_stop: bool,
    pub retry_count: u32,
    pub retry_delay: Option<Duration>,
    pub hooks: HookSet,
    /// Leave resource cleanup to the caller. Set when unload stops a plugin.
    pub skip_cleanup: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UnloadOptions {
    pub timeout: Option<Duration>,
    /// Ignore state and dependents, and keep going past failed cleanup stages.
    pub force_unload: bool,
    pub retry_count: u32,
    pub retry_delay: Option<Duration>,
    pub hooks: HookSet,
    /// Skip the staged resource cleanup.
    pub skip_cleanup: bool,
    /// Unload every plugin that depends on this one first.
    pub cascade_unload: bool,
}

impl UnloadOptions {
    pub fn forced() -> Self {
        Self {
            force_unload: true,
            ..Default::default()
        }
    }

    pub fn cascade() -> Self {
        Self {
            force_unload: true,
            cascade_unload: true,
            ..Default::default()
        }
    }
}

pub(crate) fn attempts(retry_count: u32) -> u32 {
    retry_count.max(1)
}

// ─── Progress reporting ─────────────────────────────────────────────

/// One progress report emitted by [`crate::Orchestrator::unload_with_progress`].
#[derive(Debug, Clone, PartialEq)]
pub struct UnloadProgress {
    pub plugin_id: String,
    pub stage: &'static str,
    /// Always in `0.0..=1.0` and never lower than the previous report.
    pub fraction: f64,
    pub message: String,
}

/// Clamps reported fractions so they never go backwards, even when a retry
/// revisits an earlier stage.
pub(crate) struct ProgressReporter<'a> {
    plugin_id: String,
    sink: Option<&'a (dyn Fn(UnloadProgress) + Send + Sync)>,
    last: Mutex<f64>,
}

impl<'a> ProgressReporter<'a> {
    pub(crate) fn new(
        plugin_id: &str,
        sink: Option<&'a (dyn Fn(UnloadProgress) + Send + Sync)>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            sink,
            last: Mutex::new(0.0),
        }
    }

    pub(crate) fn silent() -> Self {
        Self::new("", None)
    }

    pub(crate) fn report(&self, stage: &'static str, fraction: f64, message: impl Into<String>) {
        let Some(sink) = self.sink else {
            return;
        };
        let fraction = {
            let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
            let clamped = fraction.clamp(0.0, 1.0).max(*last);
            *last = clamped;
            clamped
        };
        sink(UnloadProgress {
            plugin_id: self.plugin_id.clone(),
            stage,
            fraction,
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = UnloadOptions::default();
        assert!(!opts.force_unload);
        assert!(!opts.cascade_unload);
        assert!(opts.timeout.is_none());
        assert!(opts.hooks.is_empty());
    }

    #[test]
    fn test_zero_retry_count_means_one_attempt() {
        assert_eq!(attempts(0), 1);
        assert_eq!(attempts(1), 1);
        assert_eq!(attempts(4), 4);
    }

    #[test]
    fn test_cascade_implies_force() {
        let opts = UnloadOptions::cascade();
        assert!(opts.force_unload && opts.cascade_unload);
    }

    #[test]
    fn test_reporter_is_monotonic() {
        let seen = Mutex::new(Vec::new());
        {
            let sink = |p: UnloadProgress| seen.lock().unwrap().push((p.stage, p.fraction));
            let sink_ref: &(dyn Fn(UnloadProgress) + Send + Sync) = &sink;
            let reporter = ProgressReporter::new("radio", Some(sink_ref));
            reporter.report("validation", 0.1, "");
            reporter.report("finalization", 0.9, "");
            reporter.report("recovery", 0.8, "");
            reporter.report("completed", 1.0, "");
        }

        let seen = seen.into_inner().unwrap();
        let fractions: Vec<f64> = seen.iter().map(|(_, f)| *f).collect();
        assert_eq!(fractions, vec![0.1, 0.9, 0.9, 1.0]);
        assert_eq!(seen[2].0, "recovery");
    }
}
