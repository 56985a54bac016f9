use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::StudioError;
use crate::runtime::types::{TaskId, TaskMutation, TaskRecord, TaskStatus};

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

impl StatusCounts {
    fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Processing => self.processing += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
        self.total += 1;
    }
}

/// Durable home of task records.
///
/// Every state change goes through [`TaskStore::apply`], which must run the
/// record's state machine atomically with respect to other writers of the
/// same task.
#[async_trait]
pub trait TaskStore: Send + Sync + std::fmt::Debug {
    async fn insert(&self, record: TaskRecord) -> Result<(), StudioError>;

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StudioError>;

    /// Apply `mutation` and return the updated record.
    async fn apply(
        &self,
        id: TaskId,
        mutation: TaskMutation,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, StudioError>;

    /// The user's tasks, newest first.
    async fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<TaskRecord>, StudioError>;

    /// Number of the user's tasks that are `Pending` or `Processing`.
    async fn count_active_for_user(&self, user_id: &str) -> Result<usize, StudioError>;

    async fn counts(&self) -> Result<StatusCounts, StudioError>;

    /// Delete terminal tasks that finished before `cutoff`. Returns how many.
    async fn remove_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StudioError>;
}

/// Process-local [`TaskStore`].
///
/// Uses a `tokio::sync::RwLock<HashMap>` so many readers can observe task
/// status concurrently while writers apply mutations one at a time.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskStore {
    inner: Arc<RwLock<HashMap<TaskId, TaskRecord>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<(), StudioError> {
        let mut guard = self.inner.write().await;
        if guard.contains_key(&record.id()) {
            return Err(StudioError::Store(format!(
                "duplicate task id {}",
                record.id()
            )));
        }
        guard.insert(record.id(), record);
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StudioError> {
        Ok(self.inner.read().await.get(&id).cloned())
    }

    async fn apply(
        &self,
        id: TaskId,
        mutation: TaskMutation,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, StudioError> {
        let mut guard = self.inner.write().await;
        let record = guard
            .get_mut(&id)
            .ok_or(StudioError::TaskNotFound { task_id: id })?;
        record.apply(mutation, now)?;
        Ok(record.clone())
    }

    async fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<TaskRecord>, StudioError> {
        let guard = self.inner.read().await;
        let mut tasks: Vec<TaskRecord> = guard
            .values()
            .filter(|r| r.user_id() == user_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn count_active_for_user(&self, user_id: &str) -> Result<usize, StudioError> {
        let guard = self.inner.read().await;
        Ok(guard
            .values()
            .filter(|r| r.user_id() == user_id && !r.status().is_terminal())
            .count())
    }

    async fn counts(&self) -> Result<StatusCounts, StudioError> {
        let guard = self.inner.read().await;
        let mut counts = StatusCounts::default();
        for record in guard.values() {
            counts.add(record.status());
        }
        Ok(counts)
    }

    async fn remove_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StudioError> {
        let mut guard = self.inner.write().await;
        let before = guard.len();
        guard.retain(|_, r| match r.completed_at() {
            Some(done) if r.status().is_terminal() => done >= cutoff,
            _ => true,
        });
        Ok(before - guard.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::params::TaskParameters;
    use crate::runtime::types::TaskKind;
    use chrono::Duration;
    use uuid::Uuid;

    fn record(user: &str, at: DateTime<Utc>) -> TaskRecord {
        TaskRecord::new(
            Uuid::new_v4(),
            user,
            "a lighthouse at dusk",
            TaskParameters::default_for(TaskKind::Text),
            at,
        )
    }

    #[tokio::test]
    async fn apply_reports_missing_and_invalid() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let missing = store.apply(Uuid::new_v4(), TaskMutation::Start, now).await;
        assert!(matches!(missing, Err(StudioError::TaskNotFound { .. })));

        let r = record("alice", now);
        let id = r.id();
        store.insert(r).await.unwrap();
        let err = store
            .apply(id, TaskMutation::Complete { result: serde_json::json!({}) }, now)
            .await
            .unwrap_err();
        assert!(matches!(err, StudioError::InvalidTransition { .. }));
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status(),
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn list_is_newest_first_and_limited() {
        let store = InMemoryTaskStore::new();
        let t0 = Utc::now();
        let mut ids = Vec::new();
        for i in 0..4 {
            let r = record("alice", t0 + Duration::seconds(i));
            ids.push(r.id());
            store.insert(r).await.unwrap();
        }
        store.insert(record("bob", t0)).await.unwrap();

        let listed = store.list_for_user("alice", 3).await.unwrap();
        let listed: Vec<_> = listed.iter().map(|r| r.id()).collect();
        assert_eq!(listed, vec![ids[3], ids[2], ids[1]]);
        assert_eq!(store.count_active_for_user("alice").await.unwrap(), 4);
        assert_eq!(store.counts().await.unwrap().total, 5);
    }

    #[tokio::test]
    async fn retention_only_removes_old_terminal_tasks() {
        let store = InMemoryTaskStore::new();
        let t0 = Utc::now();

        let old_done = record("alice", t0);
        let old_done_id = old_done.id();
        store.insert(old_done).await.unwrap();
        store.apply(old_done_id, TaskMutation::Withdraw, t0).await.unwrap();

        let old_pending = record("alice", t0);
        let old_pending_id = old_pending.id();
        store.insert(old_pending).await.unwrap();

        let fresh = record("alice", t0);
        let fresh_id = fresh.id();
        store.insert(fresh).await.unwrap();
        store
            .apply(fresh_id, TaskMutation::Withdraw, t0 + Duration::days(8))
            .await
            .unwrap();

        let removed = store
            .remove_terminal_before(t0 + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(old_done_id).await.unwrap().is_none());
        assert!(store.get(old_pending_id).await.unwrap().is_some());
        assert!(store.get(fresh_id).await.unwrap().is_some());
    }
}
