//! Append-only per-task event history, with comment injection for manual
//! actor annotations.

use std::sync::Arc;

use uuid::Uuid;

use taskflow_shared::domain::{ActivityEntry, ActivityEventType, ActorType, FieldChange};
use taskflow_shared::errors::EngineResult;

use crate::store::StoreGateway;

#[derive(Debug)]
pub struct ActivityLog<S: StoreGateway> {
    store: Arc<S>,
}

impl<S: StoreGateway> ActivityLog<S> {
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        task_id: Uuid,
        event_type: ActivityEventType,
        actor_type: ActorType,
        actor_id: Option<String>,
        changes: Vec<FieldChange>,
    ) -> EngineResult<ActivityEntry> {
        let mut entry = ActivityEntry::new(task_id, event_type, actor_type, actor_id, chrono::Utc::now());
        entry.changes = changes;
        self.store.append_activity(entry.clone()).await?;
        Ok(entry)
    }

    /// Appends a free-form comment as its own activity entry, independent of
    /// any field mutation.
    pub async fn comment(
        &self,
        task_id: Uuid,
        actor_type: ActorType,
        actor_id: Option<String>,
        comment: impl Into<String>,
    ) -> EngineResult<ActivityEntry> {
        let entry = ActivityEntry::new(
            task_id,
            ActivityEventType::Commented,
            actor_type,
            actor_id,
            chrono::Utc::now(),
        )
        .with_comment(comment);
        self.store.append_activity(entry.clone()).await?;
        Ok(entry)
    }

    pub async fn history(&self, task_id: Uuid) -> EngineResult<Vec<ActivityEntry>> {
        self.store.list_activity(task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    #[tokio::test]
    async fn comment_appends_without_changes() {
        let log = ActivityLog::new(Arc::new(InMemoryStore::new()));
        let task_id = Uuid::now_v7();
        log.comment(task_id, ActorType::User, Some("alice".into()), "looks good")
            .await
            .unwrap();

        let history = log.history(task_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].comment.as_deref(), Some("looks good"));
    }

    #[tokio::test]
    async fn record_preserves_field_changes() {
        let log = ActivityLog::new(Arc::new(InMemoryStore::new()));
        let task_id = Uuid::now_v7();
        let changes = vec![FieldChange {
            field: "status".into(),
            old_value: Some(serde_json::json!("pending")),
            new_value: Some(serde_json::json!("in_progress")),
        }];
        log.record(
            task_id,
            ActivityEventType::StatusChanged,
            ActorType::System,
            None,
            changes,
        )
        .await
        .unwrap();

        let history = log.history(task_id).await.unwrap();
        assert_eq!(history[0].changes.len(), 1);
    }
}
