//! Guarded execution of plugin callbacks.
//!
//! Plugin code is untrusted: it may hang, fail or panic. Each call runs on
//! its own tokio task raced against a deadline. The loser of the race is
//! abandoned, not cancelled, so a stuck plugin keeps its task until it
//! returns on its own.

use std::any::Any;
use std::future::Future;
use std::time::Duration;

use crate::error::{CallFailure, PluginError};

/// Runs `fut` on a fresh task and waits at most `timeout` for it.
///
/// Errors returned by the plugin, timeouts and panics all come back as
/// [`PluginError::CallFailed`].
pub async fn guarded<T, F>(
    plugin: &str,
    operation: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, PluginError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, PluginError>> + Send + 'static,
{
    let handle = tokio::spawn(fut);

    let reason = match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(value))) => return Ok(value),
        Ok(Ok(Err(PluginError::Reported(msg)))) => CallFailure::Failed(msg),
        Ok(Ok(Err(e))) => CallFailure::Failed(e.to_string()),
        Ok(Err(join_err)) if join_err.is_panic() => {
            CallFailure::Panicked(panic_message(join_err.into_panic()))
        }
        Ok(Err(join_err)) => CallFailure::Failed(join_err.to_string()),
        Err(_) => {
            tracing::warn!(
                plugin_id = %plugin,
                operation,
                timeout_ms = timeout.as_millis() as u64,
                "plugin call timed out, abandoning task"
            );
            CallFailure::TimedOut(timeout)
        }
    };

    Err(PluginError::CallFailed {
        plugin: plugin.to_string(),
        operation,
        reason,
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_success_passes_value_through() {
        let v = guarded("p", "start", Duration::from_secs(1), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn test_reported_error_keeps_message() {
        let err = guarded::<(), _>("radio", "start", Duration::from_secs(1), async {
            Err(PluginError::Reported("no network".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "start failed for plugin radio: no network");
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let exploding = true;
        let err = guarded::<(), _>("radio", "stop", Duration::from_secs(1), async move {
            if exploding {
                panic!("decoder exploded");
            }
            Ok(())
        })
        .await
        .unwrap_err();
        match err {
            PluginError::CallFailed {
                reason: CallFailure::Panicked(msg),
                ..
            } => assert_eq!(msg, "decoder exploded"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_same_variant_as_failure() {
        let timed_out = guarded::<(), _>("radio", "cleanup", Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(timed_out, PluginError::CallFailed { .. }));
        assert!(timed_out.is_timeout());
    }
}
