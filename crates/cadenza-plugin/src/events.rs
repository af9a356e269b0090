//! In-process topic bus.
//!
//! Publishing never waits on subscribers: each delivery runs on its own
//! task, and a handler that fails or panics only affects itself.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PluginError;

pub const TOPIC_LOADED: &str = "plugin.loaded";
pub const TOPIC_STARTED: &str = "plugin.started";
pub const TOPIC_STOPPED: &str = "plugin.stopped";
pub const TOPIC_UNLOADING: &str = "plugin.unloading";
pub const TOPIC_UNLOADED: &str = "plugin.unloaded";
pub const TOPIC_RECOVERY_STARTED: &str = "plugin.unload.recovery.started";
pub const TOPIC_RECOVERY_COMPLETED: &str = "plugin.unload.recovery.completed";
/// Fan-out topic reachable from any plugin context.
pub const TOPIC_BROADCAST: &str = "plugin.broadcast";

/// Topics the orchestrator publishes on its own.
pub const LIFECYCLE_TOPICS: &[&str] = &[
    TOPIC_LOADED,
    TOPIC_STARTED,
    TOPIC_STOPPED,
    TOPIC_UNLOADING,
    TOPIC_UNLOADED,
    TOPIC_RECOVERY_STARTED,
    TOPIC_RECOVERY_COMPLETED,
];

/// A published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn is_lifecycle(&self) -> bool {
        LIFECYCLE_TOPICS.contains(&self.topic.as_str())
    }
}

// ─── Lifecycle payload ──────────────────────────────────────────────

/// Fields every lifecycle event carries, plus operation-specific extras.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecyclePayload {
    pub plugin_id: String,
    pub plugin_path: String,
    pub plugin_type: String,
    pub plugin_state: String,
    pub plugin_name: String,
    pub plugin_version: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl LifecyclePayload {
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

// ─── Handlers ───────────────────────────────────────────────────────

#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: &Event) -> Result<(), PluginError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> Result<(), PluginError> + Send + Sync + 'static,
{
    async fn handle(&self, event: &Event) -> Result<(), PluginError> {
        (self.0)(event)
    }
}

/// Wraps a synchronous closure as a handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&Event) -> Result<(), PluginError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

// ─── Bus ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.topics())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one registration of `handler` on `topic`. The same handler may be
    /// registered several times and is then delivered to once per registration.
    pub fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.entry(topic.to_string()).or_default().push(handler);
        tracing::debug!(topic, "event handler subscribed");
    }

    /// Removes one registration of `handler` from `topic`.
    pub fn unsubscribe(&self, topic: &str, handler: &Arc<dyn EventHandler>) -> bool {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let Some(list) = subs.get_mut(topic) else {
            return false;
        };
        let Some(pos) = list.iter().position(|h| same_handler(h, handler)) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            subs.remove(topic);
        }
        true
    }

    /// Drops every handler on topics starting with `prefix`.
    pub fn remove_topics_with_prefix(&self, prefix: &str) -> usize {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let doomed: Vec<String> = subs
            .keys()
            .filter(|t| t.starts_with(prefix))
            .cloned()
            .collect();
        doomed
            .iter()
            .filter_map(|t| subs.remove(t))
            .map(|handlers| handlers.len())
            .sum()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map_or(0, Vec::len)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        topics.sort();
        topics
    }

    /// Dispatches `payload` to every current subscriber of `topic` and returns
    /// the number of deliveries started. Must be called inside a tokio runtime.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) -> usize {
        self.publish_event(Event::new(topic, payload))
    }

    pub fn publish_event(&self, event: Event) -> usize {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event.topic)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            tracing::trace!(topic = %event.topic, "no subscribers");
            return 0;
        }

        let event = Arc::new(event);
        for handler in &handlers {
            let handler = Arc::clone(handler);
            let event = Arc::clone(&event);
            tokio::spawn(async move {
                let delivery = {
                    let event = Arc::clone(&event);
                    tokio::spawn(async move { handler.handle(&event).await })
                };
                match delivery.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(topic = %event.topic, error = %e, "event handler failed");
                    }
                    Err(join_err) => {
                        tracing::error!(topic = %event.topic, error = %join_err, "event handler panicked");
                    }
                }
            });
        }
        handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn EventHandler> {
        handler_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    // ── Subscribe / unsubscribe ───────────────────────────────────────

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish("nobody.listens", serde_json::json!("a")), 0);
    }

    #[test]
    fn test_subscriber_count_after_n_subscribes_m_unsubscribes() {
        for (n, m) in [(3usize, 1usize), (2, 2), (1, 4), (0, 2)] {
            let bus = EventBus::new();
            let handler = counting_handler(Arc::new(AtomicUsize::new(0)));
            for _ in 0..n {
                bus.subscribe("t", Arc::clone(&handler));
            }
            for _ in 0..m {
                bus.unsubscribe("t", &handler);
            }
            assert_eq!(bus.subscriber_count("t"), n.saturating_sub(m), "n={n} m={m}");
        }
    }

    #[test]
    fn test_unsubscribe_only_matching_handler() {
        let bus = EventBus::new();
        let a = counting_handler(Arc::new(AtomicUsize::new(0)));
        let b = counting_handler(Arc::new(AtomicUsize::new(0)));
        bus.subscribe("t", Arc::clone(&a));
        bus.subscribe("t", Arc::clone(&b));
        assert!(bus.unsubscribe("t", &a));
        assert!(!bus.unsubscribe("t", &a));
        assert_eq!(bus.subscriber_count("t"), 1);
    }

    #[test]
    fn test_remove_topics_with_prefix() {
        let bus = EventBus::new();
        let h = counting_handler(Arc::new(AtomicUsize::new(0)));
        bus.subscribe("plugin.radio.tick", Arc::clone(&h));
        bus.subscribe("plugin.radio.track", Arc::clone(&h));
        bus.subscribe("plugin.spotify.tick", Arc::clone(&h));
        assert_eq!(bus.remove_topics_with_prefix("plugin.radio."), 2);
        assert_eq!(bus.topics(), vec!["plugin.spotify.tick".to_string()]);
    }

    // ── Delivery ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_publish_delivers_to_each_registration() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |event| {
            let _ = tx.send(event.payload.clone());
            Ok(())
        });
        bus.subscribe("track.changed", Arc::clone(&handler));
        bus.subscribe("track.changed", handler);

        assert_eq!(bus.publish("track.changed", serde_json::json!("a")), 2);
        for _ in 0..2 {
            let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, serde_json::json!("a"));
        }
    }

    #[tokio::test]
    async fn test_failing_and_panicking_handlers_are_isolated() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(
            "t",
            handler_fn(|_| Err(PluginError::Reported("handler broke".into()))),
        );
        bus.subscribe(
            "t",
            handler_fn(|event| {
                if event.topic == "t" {
                    panic!("handler panicked");
                }
                Ok(())
            }),
        );
        bus.subscribe(
            "t",
            handler_fn(move |_| {
                let _ = tx.send(());
                Ok(())
            }),
        );

        assert_eq!(bus.publish("t", serde_json::Value::Null), 3);
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_lifecycle_payload_flattens_extras() {
        let payload = LifecyclePayload {
            plugin_id: "sp".into(),
            plugin_path: "/p/sp.so".into(),
            plugin_type: "dynamic".into(),
            plugin_state: "running".into(),
            plugin_name: "spotify".into(),
            plugin_version: "1.0.0".into(),
            timestamp: Utc::now(),
            extra: Default::default(),
        }
        .with("success", true);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["plugin_id"], "sp");
        assert_eq!(json["success"], true);
    }

    #[test]
    fn test_is_lifecycle() {
        assert!(Event::new(TOPIC_UNLOADED, serde_json::Value::Null).is_lifecycle());
        assert!(!Event::new(TOPIC_BROADCAST, serde_json::Value::Null).is_lifecycle());
    }
}
