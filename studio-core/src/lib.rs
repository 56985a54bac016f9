//! studio-core: admission control and bounded task scheduling for
//! creative-generation backends.
//!
//! The crate is organised leaves-first:
//!
//! - [`security`]: sliding-window rate limiting, input screening and the
//!   security gate that combines them.
//! - [`quota`]: per-user, per-resource consumption ledger.
//! - [`runtime`]: task model, task store and the bounded scheduler.
//! - [`admission`]: the pipeline deciding whether a request becomes a task.
//! - [`api`]: the [`Studio`] facade the HTTP layer talks to.

pub mod admission;
pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod quota;
pub mod runtime;
pub mod security;

pub use admission::{AdmissionPipeline, Admitted};
pub use api::{CleanupReport, ClientInfo, CreateTaskRequest, DEFAULT_HISTORY_LIMIT, Studio, StudioBuilder};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{SchedulerConfig, SecurityConfig, StudioConfig};
pub use error::StudioError;
pub use quota::{QuotaLedger, QuotaLimit, QuotaSnapshot, ResetClass, Role};
pub use runtime::executor::{
    ArtifactMetadata, ArtifactRef, ArtifactStore, ExecutionError, Executor, ProgressReporter,
};
pub use runtime::params::TaskParameters;
pub use runtime::scheduler::{QueueStatus, Scheduler};
pub use runtime::storage::{InMemoryTaskStore, StatusCounts, TaskStore};
pub use runtime::types::{TaskId, TaskKind, TaskRecord, TaskStatus};
pub use security::{
    RequestContext, SecurityAction, SecurityEvent, SecurityGate, SecurityStats, ThreatLevel, Verdict,
};
