//! In-process publish/subscribe. Publication is commit-then-publish and
//! synchronous; each subscriber is isolated so a panic or error inside one
//! can never block publication or any other subscriber.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single field mutation carried alongside an event, mirroring
/// `taskflow_shared::domain::FieldChange` but decoupled so the bus has no
/// dependency on the domain crate's specific entity shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFieldChange {
    pub field: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub topic: String,
    pub subject_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    #[serde(default)]
    pub changes: Vec<EventFieldChange>,
}

pub type Subscriber = Box<dyn Fn(&Event) + Send + Sync>;

const WILDCARD: &str = "*";

/// Whether a concrete topic like `task.status.changed` matches a
/// subscription pattern like `task.*` or `*`.
fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == WILDCARD {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return topic == prefix || topic.starts_with(&format!("{prefix}."));
    }
    pattern == topic
}

/// Single-process pub/sub for `task.*` and `workflow.run.*` events.
#[derive(Default)]
pub struct EventBus {
    subscribers: DashMap<String, Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("patterns", &self.subscribers.len())
            .finish()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic pattern (`"*"`, `"task.*"`, or an exact topic).
    /// Delivery to all subscriptions happens in registration order within a
    /// single `publish` call.
    pub fn subscribe(&self, pattern: impl Into<String>, callback: Subscriber) {
        self.subscribers
            .entry(pattern.into())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Allocates the next event id and publishes. Must be called only after
    /// the corresponding store mutation has committed, so subscribers never
    /// observe an event ahead of the state it describes.
    pub fn publish(
        &self,
        topic: impl Into<String>,
        subject_id: impl Into<String>,
        payload: Value,
        changes: Vec<EventFieldChange>,
    ) -> Event {
        let event = Event {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            topic: topic.into(),
            subject_id: subject_id.into(),
            timestamp: Utc::now(),
            payload,
            changes,
        };
        for entry in self.subscribers.iter() {
            if !topic_matches(entry.key(), &event.topic) {
                continue;
            }
            for subscriber in entry.value() {
                let subscriber = Arc::clone(subscriber);
                let event_ref = &event;
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| subscriber(event_ref))) {
                    tracing::warn!(
                        topic = %event.topic,
                        subject_id = %event.subject_id,
                        ?panic,
                        "event bus subscriber panicked; isolated from publication"
                    );
                }
            }
        }
        event
    }
}
