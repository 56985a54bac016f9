//! The seam between the scheduler and whatever actually generates content.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::clock::SharedClock;
use crate::runtime::storage::TaskStore;
use crate::runtime::types::{TaskId, TaskKind, TaskMutation, TaskRecord};

/// Why an execution attempt did not produce a result.
///
/// These never escape the scheduler; they become the task's error string.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("execution timed out after {0} s")]
    Timeout(u64),

    #[error("no executor available for {0} tasks")]
    Unsupported(TaskKind),

    #[error("artifact storage failed: {0}")]
    Storage(String),
}

/// Performs the work for a task and returns its result payload.
///
/// Implementations may be slow; the scheduler bounds concurrency, applies a
/// deadline and turns panics into task failures. Cancellation drops the
/// returned future at its next await point.
#[async_trait]
pub trait Executor: Send + Sync + std::fmt::Debug {
    async fn execute(
        &self,
        task: &TaskRecord,
        progress: &ProgressReporter,
    ) -> Result<serde_json::Value, ExecutionError>;
}

/// Progress channel handed to an [`Executor`].
///
/// Executors report 0-100; the value is mapped into the band between the
/// scheduler's own "dispatched" and "returned" checkpoints.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    store: Arc<dyn TaskStore>,
    clock: SharedClock,
}

impl ProgressReporter {
    pub const BAND_START: i32 = 30;
    pub const BAND_END: i32 = 90;

    pub fn new(task_id: TaskId, store: Arc<dyn TaskStore>, clock: SharedClock) -> Self {
        Self {
            task_id,
            store,
            clock,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Map an executor-local percentage onto overall task progress.
    pub fn scale(percent: u8) -> i32 {
        let percent = i32::from(percent.min(100));
        Self::BAND_START + (Self::BAND_END - Self::BAND_START) * percent / 100
    }

    /// Record executor progress. Rejected updates (e.g. after cancellation)
    /// are ignored.
    pub async fn report(&self, percent: u8) {
        let mutation = TaskMutation::Progress {
            progress: Self::scale(percent),
            status: None,
        };
        if let Err(err) = self
            .store
            .apply(self.task_id, mutation, self.clock.now())
            .await
        {
            debug!(task_id = %self.task_id, error = %err, "progress update ignored");
        }
    }
}

/// Where a stored artifact can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: String,
    pub task_id: TaskId,
    pub url: String,
    pub size: u64,
    /// Hex-encoded sha256 of the stored bytes.
    pub checksum: String,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ArtifactMetadata {
    pub filename: String,
    pub mime_type: String,
    pub user_id: String,
    pub task_id: TaskId,
    pub kind: TaskKind,
}

/// Persists generated output so a task result can reference it by URL.
#[async_trait]
pub trait ArtifactStore: Send + Sync + std::fmt::Debug {
    async fn store(&self, data: Bytes, metadata: ArtifactMetadata) -> Result<ArtifactRef, ExecutionError>;

    async fn get(&self, id: &str) -> Result<Option<ArtifactRef>, ExecutionError>;

    /// Everything stored for one task, oldest first.
    async fn task_artifacts(&self, task_id: TaskId) -> Result<Vec<ArtifactRef>, ExecutionError>;

    /// Returns `false` if nothing was stored under `id`.
    async fn delete(&self, id: &str) -> Result<bool, ExecutionError>;

    /// Delete every artifact created before `cutoff` and return how many
    /// were removed.
    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<usize, ExecutionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::runtime::params::TaskParameters;
    use crate::runtime::storage::InMemoryTaskStore;
    use crate::runtime::types::TaskStatus;
    use uuid::Uuid;

    #[test]
    fn scale_maps_into_band() {
        assert_eq!(ProgressReporter::scale(0), 30);
        assert_eq!(ProgressReporter::scale(50), 60);
        assert_eq!(ProgressReporter::scale(100), 90);
        assert_eq!(ProgressReporter::scale(200), 90);
    }

    #[tokio::test]
    async fn report_after_cancel_is_ignored() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let clock: SharedClock = Arc::new(SystemClock);
        let record = TaskRecord::new(
            Uuid::new_v4(),
            "u1",
            "a cat",
            TaskParameters::default_for(TaskKind::Image),
            clock.now(),
        );
        let id = record.id();
        store.insert(record).await.unwrap();
        store.apply(id, TaskMutation::Start, clock.now()).await.unwrap();

        let reporter = ProgressReporter::new(id, Arc::clone(&store), Arc::clone(&clock));
        reporter.report(50).await;
        assert_eq!(store.get(id).await.unwrap().unwrap().progress(), 60);

        store.apply(id, TaskMutation::Cancel, clock.now()).await.unwrap();
        reporter.report(100).await;
        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert_eq!(task.progress(), 60);
    }
}
