#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::Semaphore;
    use uuid::Uuid;

    use crate::clock::{ManualClock, SystemClock};
    use crate::config::SchedulerConfig;
    use crate::error::StudioError;
    use crate::runtime::executor::{ExecutionError, Executor, ProgressReporter};
    use crate::runtime::params::TaskParameters;
    use crate::runtime::scheduler::Scheduler;
    use crate::runtime::storage::{InMemoryTaskStore, TaskStore};
    use crate::runtime::types::{TaskId, TaskKind, TaskRecord, TaskStatus};

    /// Behaviour is chosen by the task prompt.
    #[derive(Debug)]
    struct ScriptedExecutor {
        running: AtomicUsize,
        peak: AtomicUsize,
        executed: AtomicUsize,
        /// `"gated"` tasks wait for a permit here before returning.
        gate: Semaphore,
    }

    impl Default for ScriptedExecutor {
        fn default() -> Self {
            Self {
                running: AtomicUsize::default(),
                peak: AtomicUsize::default(),
                executed: AtomicUsize::default(),
                gate: Semaphore::new(0),
            }
        }
    }

    impl ScriptedExecutor {
        fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn execute(
            &self,
            task: &TaskRecord,
            progress: &ProgressReporter,
        ) -> Result<serde_json::Value, ExecutionError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.executed.fetch_add(1, Ordering::SeqCst);

            let outcome = match task.prompt() {
                "fail" => Err(ExecutionError::Failed("model backend unavailable".into())),
                "panic" => panic!("backend exploded"),
                "hang" => std::future::pending().await,
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(json!({"late": true}))
                }
                "gated" => {
                    progress.report(50).await;
                    let _permit = self.gate.acquire().await.expect("gate open");
                    Ok(json!({"gated": true}))
                }
                "timed" => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!({"timed": true}))
                }
                other => Ok(json!({"url": format!("file:///tmp/{}.bin", other.len())})),
            };

            self.running.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    fn scheduler(max_concurrent: usize, executor: Arc<ScriptedExecutor>) -> (Scheduler, Arc<dyn TaskStore>) {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let config = SchedulerConfig {
            max_concurrent_tasks: max_concurrent,
            execution_timeout_secs: 1,
            idle_poll_interval_ms: 20,
            retention_days: 7,
        };
        let scheduler = Scheduler::new(Arc::clone(&store), executor, Arc::new(SystemClock), config);
        (scheduler, store)
    }

    fn record(prompt: &str) -> TaskRecord {
        TaskRecord::new(
            Uuid::new_v4(),
            "u1",
            prompt,
            TaskParameters::default_for(TaskKind::Text),
            Utc::now(),
        )
    }

    async fn wait_for(store: &Arc<dyn TaskStore>, id: TaskId, want: impl Fn(TaskStatus) -> bool) -> TaskRecord {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let task = store
                    .get(id)
                    .await
                    .expect("store readable")
                    .expect("task should exist");
                if want(task.status()) {
                    break task;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task should reach the expected state within 5 s")
    }

    async fn wait_terminal(store: &Arc<dyn TaskStore>, id: TaskId) -> TaskRecord {
        wait_for(store, id, TaskStatus::is_terminal).await
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn task_runs_through_checkpoints_to_completion() {
        let executor = Arc::new(ScriptedExecutor::default());
        let (scheduler, store) = scheduler(2, Arc::clone(&executor));

        let id = scheduler.create(record("a cat")).await.unwrap();
        let task = wait_terminal(&store, id).await;

        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.progress(), 100);
        assert!(task.started_at().is_some());
        assert!(task.completed_at().is_some());
        assert!(task.result().unwrap()["url"].is_string());
        assert!(task.error().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_never_exceeds_cap() {
        let executor = Arc::new(ScriptedExecutor::default());
        let (scheduler, store) = scheduler(2, Arc::clone(&executor));

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(scheduler.create(record("timed")).await.unwrap());
        }

        let observer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let mut peak = 0;
                for _ in 0..200 {
                    let counts = store.counts().await.unwrap();
                    peak = peak.max(counts.processing);
                    if counts.completed == 5 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                peak
            })
        };

        for id in &ids {
            let task = wait_terminal(&store, *id).await;
            assert_eq!(task.status(), TaskStatus::Completed);
        }
        let observed_peak = observer.await.unwrap();
        assert!(observed_peak <= 2, "observed {observed_peak} processing tasks");
        assert!(executor.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(executor.executed.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn tasks_are_dispatched_in_fifo_order() {
        let executor = Arc::new(ScriptedExecutor::default());
        let (scheduler, store) = scheduler(1, Arc::clone(&executor));

        let first = scheduler.create(record("gated")).await.unwrap();
        let second = scheduler.create(record("gated")).await.unwrap();
        wait_for(&store, first, |s| s == TaskStatus::Processing).await;
        assert_eq!(
            store.get(second).await.unwrap().unwrap().status(),
            TaskStatus::Pending
        );

        executor.release(2);
        let a = wait_terminal(&store, first).await;
        let b = wait_terminal(&store, second).await;
        assert!(a.started_at().unwrap() <= b.started_at().unwrap());
        assert!(a.completed_at().unwrap() <= b.started_at().unwrap());
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cancelled_pending_task_never_runs() {
        let executor = Arc::new(ScriptedExecutor::default());
        let (scheduler, store) = scheduler(1, Arc::clone(&executor));

        let blocker = scheduler.create(record("gated")).await.unwrap();
        let queued = scheduler.create(record("never")).await.unwrap();
        wait_for(&store, blocker, |s| s == TaskStatus::Processing).await;

        assert!(scheduler.cancel(queued).await.unwrap());
        assert!(!scheduler.cancel(queued).await.unwrap());

        executor.release(1);
        wait_terminal(&store, blocker).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let task = store.get(queued).await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert!(task.started_at().is_none());
        assert!(task.error().is_none());
        assert_eq!(executor.executed.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.queue_status().await.unwrap().queue_size, 0);
    }

    #[tokio::test]
    async fn running_task_is_cancelled_cooperatively() {
        let executor = Arc::new(ScriptedExecutor::default());
        let (scheduler, store) = scheduler(1, Arc::clone(&executor));

        let id = scheduler.create(record("hang")).await.unwrap();
        wait_for(&store, id, |s| s == TaskStatus::Processing).await;

        assert!(scheduler.cancel(id).await.unwrap());
        assert!(!scheduler.cancel(id).await.unwrap());

        let task = wait_terminal(&store, id).await;
        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert!(task.error().is_none());
        assert!(task.result().is_none());

        // The slot was released: the next task still runs.
        let next = scheduler.create(record("a dog")).await.unwrap();
        assert_eq!(
            wait_terminal(&store, next).await.status(),
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn cancel_unknown_or_finished_returns_false() {
        let executor = Arc::new(ScriptedExecutor::default());
        let (scheduler, store) = scheduler(1, executor);

        assert!(!scheduler.cancel(Uuid::new_v4()).await.unwrap());
        let id = scheduler.create(record("quick")).await.unwrap();
        wait_terminal(&store, id).await;
        assert!(!scheduler.cancel(id).await.unwrap());
    }

    // ── Failure isolation ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn executor_errors_panics_and_timeouts_fail_only_their_task() {
        let executor = Arc::new(ScriptedExecutor::default());
        let (scheduler, store) = scheduler(3, Arc::clone(&executor));

        let failed = scheduler.create(record("fail")).await.unwrap();
        let panicked = scheduler.create(record("panic")).await.unwrap();
        let timed_out = scheduler.create(record("slow")).await.unwrap();

        let task = wait_terminal(&store, failed).await;
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.error(), Some("model backend unavailable"));
        assert!(task.result().is_none());

        let task = wait_terminal(&store, panicked).await;
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task.error().unwrap().contains("backend exploded"));

        let task = wait_terminal(&store, timed_out).await;
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.error(), Some("execution timed out after 1 s"));

        let healthy = scheduler.create(record("still alive")).await.unwrap();
        assert_eq!(
            wait_terminal(&store, healthy).await.status(),
            TaskStatus::Completed
        );
    }

    // ── Loop lifecycle ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn dormant_loop_restarts_on_create() {
        let executor = Arc::new(ScriptedExecutor::default());
        let (scheduler, store) = scheduler(2, executor);

        let first = scheduler.create(record("one")).await.unwrap();
        wait_terminal(&store, first).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while scheduler.queue_status().await.unwrap().is_processing {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("loop should park when idle");

        let second = scheduler.create(record("two")).await.unwrap();
        assert_eq!(
            wait_terminal(&store, second).await.status(),
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn queue_status_reflects_table() {
        let executor = Arc::new(ScriptedExecutor::default());
        let (scheduler, store) = scheduler(1, Arc::clone(&executor));

        let running = scheduler.create(record("gated")).await.unwrap();
        let waiting = scheduler.create(record("gated")).await.unwrap();
        wait_for(&store, running, |s| s == TaskStatus::Processing).await;

        let status = scheduler.queue_status().await.unwrap();
        assert_eq!(status.queue_size, 1);
        assert_eq!(status.active, 1);
        assert_eq!(status.max_concurrent, 1);
        assert_eq!(status.pending, 1);
        assert_eq!(status.processing, 1);
        assert_eq!(status.total, 2);
        assert!(status.is_processing);

        // Executor progress lands inside the 30-90 band.
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.get(running).await.unwrap().unwrap().progress() != 60 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("executor progress should be recorded");

        executor.release(2);
        wait_terminal(&store, running).await;
        wait_terminal(&store, waiting).await;
        let status = scheduler.queue_status().await.unwrap();
        assert_eq!(status.completed, 2);
        assert_eq!(status.active, 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_tasks() {
        let executor = Arc::new(ScriptedExecutor::default());
        let (scheduler, _store) = scheduler(1, executor);
        scheduler.shutdown();
        let err = scheduler.create(record("late")).await.unwrap_err();
        assert!(matches!(err, StudioError::SchedulerShutdown));
    }

    #[tokio::test]
    async fn shutdown_clears_the_dispatch_flag() {
        let executor = Arc::new(ScriptedExecutor::default());
        let (scheduler, store) = scheduler(1, Arc::clone(&executor));

        let running = scheduler.create(record("gated")).await.unwrap();
        let queued = scheduler.create(record("gated")).await.unwrap();
        wait_for(&store, running, |s| s == TaskStatus::Processing).await;

        scheduler.shutdown();
        tokio::time::timeout(Duration::from_secs(2), async {
            while scheduler.queue_status().await.unwrap().is_processing {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("loop should stop once slots close");

        executor.release(1);
        assert_eq!(wait_terminal(&store, running).await.status(), TaskStatus::Completed);
        assert_eq!(
            store.get(queued).await.unwrap().unwrap().status(),
            TaskStatus::Pending
        );
    }

    // ── Worker transitions from outside ───────────────────────────────────────

    #[tokio::test]
    async fn update_progress_is_clamped_and_monotonic() {
        let executor = Arc::new(ScriptedExecutor::default());
        let (scheduler, store) = scheduler(1, Arc::clone(&executor));

        let id = scheduler.create(record("gated")).await.unwrap();
        wait_for(&store, id, |s| s == TaskStatus::Processing).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.get(id).await.unwrap().unwrap().progress() != 60 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("executor checkpoint recorded");

        for (reported, expected) in [(75, 75), (40, 75), (250, 100), (-5, 100)] {
            let task = scheduler.update_progress(id, reported, None).await.unwrap();
            assert_eq!(task.progress(), expected, "after reporting {reported}");
            assert_eq!(task.status(), TaskStatus::Processing);
        }

        executor.release(1);
        assert_eq!(wait_terminal(&store, id).await.status(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn external_complete_and_fail_free_the_worker_slot() {
        let executor = Arc::new(ScriptedExecutor::default());
        let (scheduler, store) = scheduler(1, Arc::clone(&executor));

        let first = scheduler.create(record("hang")).await.unwrap();
        wait_for(&store, first, |s| s == TaskStatus::Processing).await;
        let done = scheduler
            .complete(first, json!({"url": "file:///tmp/out.png"}))
            .await
            .unwrap();
        assert_eq!(done.status(), TaskStatus::Completed);
        assert_eq!(done.progress(), 100);
        assert_eq!(scheduler.queue_status().await.unwrap().active, 0);

        assert!(matches!(
            scheduler.update_progress(first, 50, None).await,
            Err(StudioError::InvalidTransition { .. })
        ));
        assert!(scheduler.fail(first, "too late").await.is_err());
        assert!(!scheduler.cancel(first).await.unwrap());

        let second = scheduler.create(record("hang")).await.unwrap();
        wait_for(&store, second, |s| s == TaskStatus::Processing).await;
        let failed = scheduler.fail(second, "operator aborted").await.unwrap();
        assert_eq!(failed.status(), TaskStatus::Failed);
        assert_eq!(failed.error(), Some("operator aborted"));

        // Both hung workers were stopped, so the single slot is free again.
        let third = scheduler.create(record("after")).await.unwrap();
        assert_eq!(wait_terminal(&store, third).await.status(), TaskStatus::Completed);
        assert_eq!(
            store.get(first).await.unwrap().unwrap().status(),
            TaskStatus::Completed
        );
    }

    // ── Retention ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cleanup_follows_the_scheduler_clock() {
        let executor = Arc::new(ScriptedExecutor::default());
        let clock = Arc::new(ManualClock::starting_now());
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let config = SchedulerConfig {
            max_concurrent_tasks: 1,
            execution_timeout_secs: 30,
            idle_poll_interval_ms: 20,
            retention_days: 7,
        };
        let scheduler = Scheduler::new(Arc::clone(&store), executor, clock.clone(), config);

        let quick = scheduler.create(record("quick")).await.unwrap();
        wait_terminal(&store, quick).await;
        let hung = scheduler.create(record("hang")).await.unwrap();
        wait_for(&store, hung, |s| s == TaskStatus::Processing).await;
        let queued = scheduler.create(record("queued")).await.unwrap();

        clock.advance(chrono::Duration::days(6));
        assert_eq!(scheduler.cleanup().await.unwrap(), 0);

        clock.advance(chrono::Duration::days(2));
        assert_eq!(scheduler.cleanup().await.unwrap(), 1);
        assert!(store.get(quick).await.unwrap().is_none());
        assert!(store.get(hung).await.unwrap().is_some());
        assert!(store.get(queued).await.unwrap().is_some());

        // Finished "now", so a day later it is well inside the window.
        scheduler.complete(hung, json!({})).await.unwrap();
        wait_terminal(&store, queued).await;
        clock.advance(chrono::Duration::days(1));
        assert_eq!(scheduler.cleanup().await.unwrap(), 0);
        assert_eq!(scheduler.queue_status().await.unwrap().total, 2);
    }
}
