//! Public-facing facade for studio-core.
//!
//! The HTTP layer talks only to [`Studio`]; the scheduler, gate, ledger and
//! store stay behind it.
//!
//! # Quick-start
//!
//! ```rust,ignore
//! use studio_core::{ClientInfo, CreateTaskRequest, Role, Studio, TaskKind};
//!
//! let studio = Studio::builder(Arc::new(MyExecutor)).build();
//! studio.register_user("alice", Role::Standard);
//!
//! let task = studio
//!     .create_task(CreateTaskRequest {
//!         kind: TaskKind::Image,
//!         user_id: "alice".into(),
//!         prompt: "a cat".into(),
//!         parameters: serde_json::json!({"num_images": 2}),
//!         client: ClientInfo::local(),
//!     })
//!     .await?;
//!
//! let snapshot = studio.get_task(task.id()).await?;
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::admission::{AdmissionPipeline, AdmissionRequest};
use crate::clock::{SharedClock, SystemClock};
use crate::config::StudioConfig;
use crate::error::StudioError;
use crate::quota::{QuotaLedger, QuotaLimit, QuotaSnapshot, ResetClass, Role};
use crate::runtime::executor::{ArtifactRef, ArtifactStore, Executor};
use crate::runtime::scheduler::{QueueStatus, Scheduler};
use crate::runtime::storage::{InMemoryTaskStore, TaskStore};
use crate::runtime::types::{TaskId, TaskKind, TaskRecord};
use crate::security::{RequestContext, SecurityEvent, SecurityGate, SecurityStats, Verdict};

/// Default page size for [`Studio::list_user_tasks`].
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Where a request came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: Option<String>,
    /// Endpoint used for rate-limit rule selection. Defaults to
    /// `/v1/generate/{kind}`.
    pub endpoint: Option<String>,
}

impl ClientInfo {
    /// A loopback caller with no user agent.
    pub fn local() -> Self {
        Self {
            ip: "127.0.0.1".into(),
            ..Self::default()
        }
    }
}

/// What one retention pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed_tasks: usize,
    pub removed_artifacts: usize,
}

#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    pub kind: TaskKind,
    pub user_id: String,
    pub prompt: String,
    /// Raw kind-specific parameters; `null` means all defaults.
    pub parameters: Value,
    pub client: ClientInfo,
}

/// Builder for [`Studio`]. Everything but the executor has a default.
#[derive(Debug)]
pub struct StudioBuilder {
    executor: Arc<dyn Executor>,
    config: StudioConfig,
    store: Option<Arc<dyn TaskStore>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    clock: Option<SharedClock>,
}

impl StudioBuilder {
    pub fn config(mut self, config: StudioConfig) -> Self {
        self.config = config;
        self
    }

    /// Swap in another task store (defaults to [`InMemoryTaskStore`]).
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Artifact storage shared with the executor. Its files expire together
    /// with the tasks.
    pub fn artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn build(self) -> Studio {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));
        let gate = Arc::new(SecurityGate::new(&self.config.security, Arc::clone(&clock)));
        let quotas = Arc::new(QuotaLedger::new(self.config.quotas.clone(), Arc::clone(&clock)));
        let admission = AdmissionPipeline::new(Arc::clone(&gate), Arc::clone(&quotas), Arc::clone(&store));
        let scheduler = Scheduler::new(
            store,
            self.executor,
            Arc::clone(&clock),
            self.config.scheduler.clone(),
        );
        Studio {
            scheduler,
            admission,
            gate,
            quotas,
            artifacts: self.artifacts,
            clock,
        }
    }
}

/// The orchestration core behind one service instance.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct Studio {
    scheduler: Scheduler,
    admission: AdmissionPipeline,
    gate: Arc<SecurityGate>,
    quotas: Arc<QuotaLedger>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    clock: SharedClock,
}

impl Studio {
    pub fn builder(executor: Arc<dyn Executor>) -> StudioBuilder {
        StudioBuilder {
            executor,
            config: StudioConfig::default(),
            store: None,
            artifacts: None,
            clock: None,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn gate(&self) -> &SecurityGate {
        &self.gate
    }

    pub fn quotas(&self) -> &QuotaLedger {
        &self.quotas
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    // ── Tasks ────────────────────────────────────────────────────────────────

    /// Admit, persist and queue a new task.
    ///
    /// Every rejection happens before the task exists, and consumed quota is
    /// refunded if the task cannot be persisted.
    pub async fn create_task(&self, req: CreateTaskRequest) -> Result<TaskRecord, StudioError> {
        let endpoint = req
            .client
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("/v1/generate/{}", req.kind));
        let admitted = self
            .admission
            .admit(AdmissionRequest {
                kind: req.kind,
                prompt: &req.prompt,
                parameters: &req.parameters,
                ctx: RequestContext {
                    endpoint: &endpoint,
                    ip: &req.client.ip,
                    user_id: Some(&req.user_id),
                    user_agent: req.client.user_agent.as_deref(),
                },
            })
            .await?;

        let record = TaskRecord::new(
            Uuid::new_v4(),
            req.user_id,
            req.prompt,
            admitted.parameters.clone(),
            self.clock.now(),
        );
        match self.scheduler.create(record.clone()).await {
            Ok(_) => Ok(record),
            Err(err) => {
                self.admission.refund(&admitted);
                Err(err)
            }
        }
    }

    pub async fn get_task(&self, id: TaskId) -> Result<TaskRecord, StudioError> {
        self.scheduler
            .get(id)
            .await?
            .ok_or(StudioError::TaskNotFound { task_id: id })
    }

    /// Like [`Studio::get_task`], but only for the owning user.
    pub async fn get_user_task(&self, id: TaskId, user_id: &str) -> Result<TaskRecord, StudioError> {
        let task = self.get_task(id).await?;
        if task.user_id() != user_id {
            return Err(StudioError::Forbidden {
                user_id: user_id.to_owned(),
                task_id: id,
            });
        }
        Ok(task)
    }

    /// Cancel a task on behalf of its owner.
    ///
    /// Returns `Ok(false)` when the task is already terminal.
    pub async fn cancel_task(&self, id: TaskId, user_id: &str) -> Result<bool, StudioError> {
        self.get_user_task(id, user_id).await?;
        let cancelled = self.scheduler.cancel(id).await?;
        if cancelled {
            info!(task_id = %id, user_id, "task cancellation requested");
        }
        Ok(cancelled)
    }

    /// Stored outputs of a task, for its owner only. Empty without artifact
    /// storage.
    pub async fn task_artifacts(&self, id: TaskId, user_id: &str) -> Result<Vec<ArtifactRef>, StudioError> {
        self.get_user_task(id, user_id).await?;
        match &self.artifacts {
            Some(artifacts) => artifacts
                .task_artifacts(id)
                .await
                .map_err(|err| StudioError::Store(err.to_string())),
            None => Ok(Vec::new()),
        }
    }

    pub async fn get_queue_status(&self) -> Result<QueueStatus, StudioError> {
        self.scheduler.queue_status().await
    }

    /// The user's tasks, newest first. `limit` defaults to 50.
    pub async fn list_user_tasks(&self, user_id: &str, limit: Option<usize>) -> Result<Vec<TaskRecord>, StudioError> {
        self.scheduler
            .list_user_tasks(user_id, limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
            .await
    }

    // ── Users & quota ────────────────────────────────────────────────────────

    /// Returns `false` if the user already exists.
    pub fn register_user(&self, user_id: &str, role: Role) -> bool {
        self.quotas.register_user(user_id, role)
    }

    pub fn is_registered(&self, user_id: &str) -> bool {
        self.quotas.is_registered(user_id)
    }

    pub fn set_role(&self, user_id: &str, role: Role) -> Result<(), StudioError> {
        self.quotas.set_role(user_id, role)
    }

    pub fn set_limit(&self, user_id: &str, resource: &str, limit: QuotaLimit) -> Result<(), StudioError> {
        self.quotas.set_limit(user_id, resource, limit)
    }

    pub fn quota(&self, user_id: &str) -> Result<QuotaSnapshot, StudioError> {
        self.quotas
            .snapshot(user_id)
            .ok_or_else(|| StudioError::UnknownUser {
                user_id: user_id.to_owned(),
            })
    }

    pub fn reset_quotas(&self, class: ResetClass) -> usize {
        self.quotas.reset(class)
    }

    // ── Security ─────────────────────────────────────────────────────────────

    pub fn security_stats(&self) -> SecurityStats {
        self.gate.stats()
    }

    pub fn security_events(&self, limit: usize) -> Vec<SecurityEvent> {
        self.gate.events(limit)
    }

    pub fn record_failed_login(&self, identifier: &str, ip: &str) -> bool {
        self.gate.record_failed_login(identifier, ip)
    }

    pub fn validate_upload(
        &self,
        client: &ClientInfo,
        user_id: Option<&str>,
        filename: &str,
        content_type: &str,
        size: u64,
    ) -> Verdict {
        let ctx = RequestContext {
            endpoint: client.endpoint.as_deref().unwrap_or("/v1/upload"),
            ip: &client.ip,
            user_id,
            user_agent: client.user_agent.as_deref(),
        };
        self.gate.validate_upload(&ctx, filename, content_type, size)
    }

    pub fn block_ip(&self, ip: &str) {
        self.gate.block_ip(ip);
    }

    pub fn unblock_ip(&self, ip: &str) -> bool {
        self.gate.unblock_ip(ip)
    }

    pub fn unblock_user(&self, user_id: &str) -> bool {
        self.gate.unblock_user(user_id)
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    /// Remove terminal tasks and stored artifacts past the retention window.
    pub async fn cleanup_expired_tasks(&self) -> Result<CleanupReport, StudioError> {
        let cutoff = self.scheduler.retention_cutoff();
        let removed_tasks = self.scheduler.cleanup().await?;
        let removed_artifacts = match &self.artifacts {
            Some(artifacts) => artifacts
                .cleanup_before(cutoff)
                .await
                .map_err(|err| StudioError::Store(err.to_string()))?,
            None => 0,
        };
        if removed_artifacts > 0 {
            info!(removed_artifacts, %cutoff, "expired artifacts removed");
        }
        Ok(CleanupReport {
            removed_tasks,
            removed_artifacts,
        })
    }

    pub fn sweep_security(&self) -> usize {
        self.gate.sweep()
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
