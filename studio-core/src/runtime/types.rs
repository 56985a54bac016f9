use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

use crate::error::StudioError;
use crate::runtime::params::TaskParameters;

/// Unique identifier for a submitted task.
pub type TaskId = Uuid;

/// Closed set of generation work the gateway forwards.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum TaskKind {
    #[serde(alias = "video_generation")]
    #[strum(to_string = "video", serialize = "video_generation")]
    Video,
    #[serde(alias = "audio_generation")]
    #[strum(to_string = "audio", serialize = "audio_generation")]
    Audio,
    #[serde(alias = "image_generation")]
    #[strum(to_string = "image", serialize = "image_generation")]
    Image,
    #[serde(alias = "code_generation")]
    #[strum(to_string = "code", serialize = "code_generation")]
    Code,
    #[serde(alias = "text_generation")]
    #[strum(to_string = "text", serialize = "text_generation")]
    Text,
}

impl TaskKind {
    /// Static duration estimate reported to clients at creation time.
    pub fn estimated_duration_secs(self) -> u64 {
        match self {
            TaskKind::Video => 180,
            TaskKind::Audio => 60,
            TaskKind::Image => 30,
            TaskKind::Code => 15,
            TaskKind::Text => 10,
        }
    }

    /// Name of the per-kind quota resource this task consumes.
    pub fn quota_resource(self) -> &'static str {
        match self {
            TaskKind::Video => "video_generation",
            TaskKind::Audio => "audio_generation",
            TaskKind::Image => "image_generation",
            TaskKind::Code => "code_generation",
            TaskKind::Text => "text_generation",
        }
    }
}

/// Lifecycle status of a task.
///
/// `Pending -> Processing -> {Completed | Failed | Cancelled}`, plus
/// `Pending -> Cancelled`. Nothing leaves a terminal state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Status together with the data that only exists in that status.
///
/// Keeping the result inside `Completed` and the error inside `Failed` makes
/// "result iff completed, error iff failed" hold by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Processing,
    Completed { result: serde_json::Value },
    Failed { error: String },
    Cancelled,
}

impl TaskState {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskState::Pending => TaskStatus::Pending,
            TaskState::Processing => TaskStatus::Processing,
            TaskState::Completed { .. } => TaskStatus::Completed,
            TaskState::Failed { .. } => TaskStatus::Failed,
            TaskState::Cancelled => TaskStatus::Cancelled,
        }
    }
}

/// A state change requested against a stored task.
///
/// Mutations are plain data so that a persistent [`TaskStore`] can apply them
/// inside its own transaction.
///
/// [`TaskStore`]: crate::runtime::storage::TaskStore
#[derive(Debug, Clone, PartialEq)]
pub enum TaskMutation {
    /// `Pending -> Processing`; stamps `started_at`.
    Start,
    /// Progress checkpoint, optionally with a status change.
    ///
    /// Only `Processing` and `Cancelled` may be supplied as status; completion
    /// and failure must carry their payload through `Complete` / `Fail`.
    Progress {
        progress: i32,
        status: Option<TaskStatus>,
    },
    Complete { result: serde_json::Value },
    Fail { error: String },
    /// Cancellation before execution started (`Pending` only).
    Withdraw,
    /// Cancellation observed by the executing worker (`Processing` only).
    Cancel,
}

impl TaskMutation {
    fn target(&self, current: TaskStatus) -> TaskStatus {
        match self {
            TaskMutation::Start => TaskStatus::Processing,
            TaskMutation::Progress { status, .. } => status.unwrap_or(current),
            TaskMutation::Complete { .. } => TaskStatus::Completed,
            TaskMutation::Fail { .. } => TaskStatus::Failed,
            TaskMutation::Withdraw | TaskMutation::Cancel => TaskStatus::Cancelled,
        }
    }
}

/// The complete record for a single task.
///
/// Fields that participate in lifecycle invariants are private and only change
/// through [`TaskRecord::apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    id: TaskId,
    kind: TaskKind,
    user_id: String,
    prompt: String,
    parameters: TaskParameters,
    #[serde(flatten)]
    state: TaskState,
    progress: u8,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    estimated_duration_secs: u64,
}

impl TaskRecord {
    /// A fresh `Pending` record.
    pub fn new(
        id: TaskId,
        user_id: impl Into<String>,
        prompt: impl Into<String>,
        parameters: TaskParameters,
        now: DateTime<Utc>,
    ) -> Self {
        let kind = parameters.kind();
        Self {
            id,
            kind,
            user_id: user_id.into(),
            prompt: prompt.into(),
            parameters,
            state: TaskState::Pending,
            progress: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            estimated_duration_secs: kind.estimated_duration_secs(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn parameters(&self) -> &TaskParameters {
        &self.parameters
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn status(&self) -> TaskStatus {
        self.state.status()
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        match &self.state {
            TaskState::Completed { result } => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            TaskState::Failed { error } => Some(error),
            _ => None,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn estimated_duration_secs(&self) -> u64 {
        self.estimated_duration_secs
    }

    /// Apply `mutation` at time `now`, enforcing the lifecycle state machine.
    ///
    /// On error the record is left untouched.
    pub fn apply(&mut self, mutation: TaskMutation, now: DateTime<Utc>) -> Result<(), StudioError> {
        let current = self.status();
        let invalid = |to: TaskStatus| StudioError::InvalidTransition {
            task_id: self.id,
            from: current,
            to,
        };

        match mutation {
            TaskMutation::Start => {
                if current != TaskStatus::Pending {
                    return Err(invalid(TaskStatus::Processing));
                }
                self.begin(now);
            }
            TaskMutation::Progress { progress, status } => {
                if current.is_terminal() {
                    return Err(invalid(status.unwrap_or(current)));
                }
                match status {
                    None => {}
                    Some(TaskStatus::Processing) => {
                        if current == TaskStatus::Pending {
                            self.begin(now);
                        }
                    }
                    Some(TaskStatus::Cancelled) => {
                        self.finish(TaskState::Cancelled, now);
                        return Ok(());
                    }
                    Some(TaskStatus::Pending) if current == TaskStatus::Pending => {}
                    Some(other) => return Err(invalid(other)),
                }
                // Progress only moves while executing, and never backwards.
                if self.status() == TaskStatus::Processing {
                    let clamped = progress.clamp(0, 100) as u8;
                    self.progress = self.progress.max(clamped);
                }
            }
            TaskMutation::Complete { result } => {
                if current != TaskStatus::Processing {
                    return Err(invalid(TaskStatus::Completed));
                }
                self.progress = 100;
                self.finish(TaskState::Completed { result }, now);
            }
            TaskMutation::Fail { error } => {
                if current != TaskStatus::Processing {
                    return Err(invalid(TaskStatus::Failed));
                }
                self.finish(TaskState::Failed { error }, now);
            }
            TaskMutation::Withdraw => {
                if current != TaskStatus::Pending {
                    return Err(invalid(TaskStatus::Cancelled));
                }
                self.finish(TaskState::Cancelled, now);
            }
            TaskMutation::Cancel => {
                if current != TaskStatus::Processing {
                    return Err(invalid(TaskStatus::Cancelled));
                }
                self.finish(TaskState::Cancelled, now);
            }
        }
        self.updated_at = now;
        Ok(())
    }

    /// Whether `mutation` would be accepted in the current state.
    pub fn accepts(&self, mutation: &TaskMutation) -> bool {
        let current = self.status();
        let target = mutation.target(current);
        match mutation {
            TaskMutation::Start => current == TaskStatus::Pending,
            TaskMutation::Progress { .. } => {
                !current.is_terminal()
                    && matches!(
                        (current, target),
                        (_, TaskStatus::Processing)
                            | (_, TaskStatus::Cancelled)
                            | (TaskStatus::Pending, TaskStatus::Pending)
                    )
            }
            TaskMutation::Complete { .. } | TaskMutation::Fail { .. } | TaskMutation::Cancel => {
                current == TaskStatus::Processing
            }
            TaskMutation::Withdraw => current == TaskStatus::Pending,
        }
    }

    fn begin(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Processing;
        self.progress = 0;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    fn finish(&mut self, state: TaskState, now: DateTime<Utc>) {
        self.state = state;
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(now: DateTime<Utc>) -> TaskRecord {
        TaskRecord::new(
            Uuid::new_v4(),
            "u1",
            "a cat",
            TaskParameters::default_for(TaskKind::Image),
            now,
        )
    }

    #[test]
    fn kind_parses_short_and_long_names() {
        assert_eq!("image".parse::<TaskKind>().unwrap(), TaskKind::Image);
        assert_eq!(
            "video_generation".parse::<TaskKind>().unwrap(),
            TaskKind::Video
        );
        assert_eq!(TaskKind::Code.to_string(), "code");
        assert_eq!(TaskKind::Video.estimated_duration_secs(), 180);
    }

    #[test]
    fn happy_path_stamps_timestamps() {
        let t0 = Utc::now();
        let mut task = record(t0);
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(task.started_at().is_none());

        let t1 = t0 + chrono::Duration::seconds(1);
        task.apply(TaskMutation::Start, t1).unwrap();
        assert_eq!(task.started_at(), Some(t1));

        task.apply(
            TaskMutation::Progress {
                progress: 40,
                status: None,
            },
            t1,
        )
        .unwrap();
        assert_eq!(task.progress(), 40);

        let t2 = t1 + chrono::Duration::seconds(5);
        task.apply(
            TaskMutation::Complete {
                result: serde_json::json!({"url": "file://x.png"}),
            },
            t2,
        )
        .unwrap();
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.progress(), 100);
        assert_eq!(task.completed_at(), Some(t2));
        assert_eq!(task.result().unwrap()["url"], "file://x.png");
        assert!(task.error().is_none());
    }

    #[test]
    fn progress_is_clamped_and_monotonic() {
        let now = Utc::now();
        let mut task = record(now);
        task.apply(TaskMutation::Start, now).unwrap();
        for p in [30, 10, 250, -5] {
            task.apply(
                TaskMutation::Progress {
                    progress: p,
                    status: None,
                },
                now,
            )
            .unwrap();
        }
        assert_eq!(task.progress(), 100);
    }

    #[test]
    fn terminal_states_reject_everything() {
        let now = Utc::now();
        let mut task = record(now);
        task.apply(TaskMutation::Withdraw, now).unwrap();
        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert!(task.completed_at().is_some());

        let before = task.clone();
        for m in [
            TaskMutation::Start,
            TaskMutation::Withdraw,
            TaskMutation::Cancel,
            TaskMutation::Fail {
                error: "late".into(),
            },
            TaskMutation::Progress {
                progress: 10,
                status: None,
            },
        ] {
            assert!(!task.accepts(&m));
            let err = task.apply(m, now).unwrap_err();
            assert!(matches!(err, StudioError::InvalidTransition { .. }));
        }
        assert_eq!(task, before);
    }

    #[test]
    fn progress_cannot_complete_without_result() {
        let now = Utc::now();
        let mut task = record(now);
        task.apply(TaskMutation::Start, now).unwrap();
        let err = task
            .apply(
                TaskMutation::Progress {
                    progress: 100,
                    status: Some(TaskStatus::Completed),
                },
                now,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            StudioError::InvalidTransition {
                to: TaskStatus::Completed,
                ..
            }
        ));
    }

    #[test]
    fn serialized_record_carries_status_tag() {
        let now = Utc::now();
        let mut task = record(now);
        task.apply(TaskMutation::Start, now).unwrap();
        task.apply(
            TaskMutation::Fail {
                error: "backend exploded".into(),
            },
            now,
        )
        .unwrap();
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "backend exploded");
        assert_eq!(json["kind"], "image");
    }

    fn mutation_strategy() -> impl Strategy<Value = TaskMutation> {
        prop_oneof![
            Just(TaskMutation::Start),
            (-20i32..140).prop_map(|p| TaskMutation::Progress {
                progress: p,
                status: None
            }),
            Just(TaskMutation::Progress {
                progress: 5,
                status: Some(TaskStatus::Processing)
            }),
            Just(TaskMutation::Progress {
                progress: 5,
                status: Some(TaskStatus::Cancelled)
            }),
            Just(TaskMutation::Complete {
                result: serde_json::json!({"ok": true})
            }),
            Just(TaskMutation::Fail {
                error: "boom".into()
            }),
            Just(TaskMutation::Withdraw),
            Just(TaskMutation::Cancel),
        ]
    }

    proptest! {
        #[test]
        fn lifecycle_invariants_hold_for_any_sequence(
            mutations in proptest::collection::vec(mutation_strategy(), 0..24)
        ) {
            let now = Utc::now();
            let mut task = record(now);
            let mut last_progress = 0u8;
            for (i, m) in mutations.into_iter().enumerate() {
                let was_processing = task.status() == TaskStatus::Processing;
                let was_terminal = task.status().is_terminal();
                let expected_ok = task.accepts(&m);
                let at = now + chrono::Duration::seconds(i as i64);
                let ok = task.apply(m, at).is_ok();
                prop_assert_eq!(ok, expected_ok);
                if was_terminal {
                    prop_assert!(!ok);
                }

                let status = task.status();
                prop_assert_eq!(task.result().is_some(), status == TaskStatus::Completed);
                prop_assert_eq!(task.error().is_some(), status == TaskStatus::Failed);
                prop_assert_eq!(task.completed_at().is_some(), status.is_terminal());
                prop_assert!(task.progress() <= 100);
                if was_processing && status == TaskStatus::Processing {
                    prop_assert!(task.progress() >= last_progress);
                }
                last_progress = task.progress();
            }
        }
    }
}
