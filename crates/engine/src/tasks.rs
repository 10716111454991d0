// ABOUTME: Tracker for long-running import and source-test jobs: ids, counters, capped detail log, progress.
// ABOUTME: Jobs run on spawned tokio tasks; a background reaper sweeps terminal tasks after the retention window.

//! Background task tracking.
//!
//! A job is created in `pending`, moves to `processing` once its items are
//! known, and ends in `completed` or `failed`. Items run with bounded
//! concurrency; each one bumps the counters exactly once. The tracker state
//! sits behind a `std::sync::Mutex` that is never held across an `.await`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Import,
    Test,
}

/// One line of a task's detail log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub ok: bool,
    pub message: String,
}

/// Result of processing one item, reported by the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReport {
    pub name: Option<String>,
    pub ok: bool,
    pub message: String,
}

impl ItemReport {
    pub fn success(name: Option<String>, message: impl Into<String>) -> Self {
        Self {
            name,
            ok: true,
            message: message.into(),
        }
    }

    pub fn failure(name: Option<String>, message: impl Into<String>) -> Self {
        Self {
            name,
            ok: false,
            message: message.into(),
        }
    }
}

/// Snapshot of a tracked task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportTask {
    pub id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub total: usize,
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
    pub progress: f64,
    pub log: Vec<TaskLogEntry>,
    /// Log entries dropped once the cap was reached.
    #[serde(default)]
    pub log_dropped: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ImportTask {
    fn new(id: String, kind: TaskKind) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            status: TaskStatus::Pending,
            total: 0,
            processed: 0,
            success: 0,
            failed: 0,
            progress: 0.0,
            log: Vec::new(),
            log_dropped: 0,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// processed/total; 1.0 for a finished task with nothing to do.
    pub fn compute_progress(&self) -> f64 {
        if self.total == 0 {
            return if self.status.is_terminal() { 1.0 } else { 0.0 };
        }
        self.processed as f64 / self.total as f64
    }
}

/// Tracks import and test jobs by id.
#[derive(Clone)]
pub struct ImportTaskTracker {
    tasks: Arc<Mutex<HashMap<String, ImportTask>>>,
    concurrency: usize,
    log_cap: usize,
    retention: Duration,
}

impl ImportTaskTracker {
    pub fn new(concurrency: usize, log_cap: usize, retention: Duration) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            concurrency: concurrency.max(1),
            log_cap,
            retention,
        }
    }

    /// Registers a task and starts it on a spawned tokio task; returns its id immediately.
    ///
    /// `load` yields the items to process; an error there fails the task.
    /// `run` processes one item and reports its outcome.
    pub fn submit<T, L, F, Fut>(&self, kind: TaskKind, load: L, run: F) -> String
    where
        T: Send + 'static,
        L: Future<Output = Result<Vec<T>, EngineError>> + Send + 'static,
        F: Fn(usize, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ItemReport> + Send + 'static,
    {
        let id = Uuid::new_v4().to_string();
        self.with_task_map(|tasks| {
            tasks.insert(id.clone(), ImportTask::new(id.clone(), kind));
        });
        info!(task = %id, ?kind, "task submitted");

        let tracker = self.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            tracker.run(task_id, load, run).await;
        });
        id
    }

    async fn run<T, L, F, Fut>(&self, id: String, load: L, run: F)
    where
        L: Future<Output = Result<Vec<T>, EngineError>>,
        F: Fn(usize, T) -> Fut,
        Fut: Future<Output = ItemReport>,
    {
        let items = match load.await {
            Ok(items) => items,
            Err(e) => {
                warn!(task = %id, error = %e, "task input rejected");
                self.update(&id, |task| {
                    task.error = Some(e.to_string());
                    finish(task);
                });
                return;
            }
        };

        let total = items.len();
        self.update(&id, |task| {
            task.total = total;
            task.status = TaskStatus::Processing;
        });

        let run = &run;
        stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| async move { (index, run(index, item).await) })
            .buffer_unordered(self.concurrency)
            .for_each(|(index, report)| {
                self.record(&id, index, report);
                futures::future::ready(())
            })
            .await;

        self.update(&id, finish);
        if let Some(task) = self.get(&id) {
            info!(
                task = %id,
                status = ?task.status,
                success = task.success,
                failed = task.failed,
                "task finished"
            );
        }
    }

    fn record(&self, id: &str, index: usize, report: ItemReport) {
        let cap = self.log_cap;
        self.update(id, |task| {
            task.processed += 1;
            if report.ok {
                task.success += 1;
            } else {
                task.failed += 1;
            }
            if task.log.len() < cap {
                task.log.push(TaskLogEntry {
                    index,
                    name: report.name,
                    ok: report.ok,
                    message: report.message,
                });
            } else {
                task.log_dropped += 1;
            }
        });
    }

    /// Snapshot of a task, with progress filled in.
    pub fn get(&self, id: &str) -> Option<ImportTask> {
        self.with_task_map(|tasks| tasks.get(id).cloned())
            .map(|mut task| {
                task.progress = task.compute_progress();
                task
            })
    }

    /// Progress of a task in `[0, 1]`, or `None` for an unknown id.
    pub fn progress(&self, id: &str) -> Option<f64> {
        self.get(id).map(|t| t.progress)
    }

    pub fn list(&self) -> Vec<ImportTask> {
        let mut tasks: Vec<ImportTask> = self.with_task_map(|tasks| tasks.values().cloned().collect());
        for task in &mut tasks {
            task.progress = task.compute_progress();
        }
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Waits until the task reaches a terminal state, polling every `interval`.
    pub async fn wait(&self, id: &str, interval: Duration) -> Option<ImportTask> {
        loop {
            let task = self.get(id)?;
            if task.status.is_terminal() {
                return Some(task);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Drops terminal tasks that finished more than the retention window before `now`.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        self.with_task_map(|tasks| {
            let before = tasks.len();
            tasks.retain(|_, task| match (task.status.is_terminal(), task.finished_at) {
                (true, Some(finished)) => now.signed_duration_since(finished) < retention,
                _ => true,
            });
            before - tasks.len()
        })
    }

    /// Spawns the periodic sweep; it stops when `shutdown` is notified.
    pub fn spawn_reaper(&self, interval: Duration, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            debug!(interval_secs = interval.as_secs(), "task reaper started");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        debug!("task reaper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = tracker.sweep(Utc::now());
                        if removed > 0 {
                            info!(removed, "reaped finished tasks");
                        }
                    }
                }
            }
        })
    }

    fn update(&self, id: &str, change: impl FnOnce(&mut ImportTask)) {
        self.with_task_map(|tasks| {
            if let Some(task) = tasks.get_mut(id) {
                change(task);
                task.updated_at = Utc::now();
            }
        });
    }

    fn with_task_map<R>(&self, f: impl FnOnce(&mut HashMap<String, ImportTask>) -> R) -> R {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut tasks)
    }
}

/// Moves a task to its terminal state: failed unless at least one item succeeded.
fn finish(task: &mut ImportTask) {
    task.status = if task.success == 0 {
        TaskStatus::Failed
    } else {
        TaskStatus::Completed
    };
    task.finished_at = Some(Utc::now());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Stage;

    fn tracker() -> ImportTaskTracker {
        ImportTaskTracker::new(4, 500, Duration::from_secs(24 * 60 * 60))
    }

    async fn finished(tracker: &ImportTaskTracker, id: &str) -> ImportTask {
        tokio::time::timeout(
            Duration::from_secs(5),
            tracker.wait(id, Duration::from_millis(5)),
        )
        .await
        .unwrap()
        .unwrap()
    }

    #[tokio::test]
    async fn mixed_items_complete() {
        let t = tracker();
        let id = t.submit(
            TaskKind::Import,
            async { Ok::<_, EngineError>(vec![1, 2, 3]) },
            |_, n: i32| async move {
                if n == 2 {
                    ItemReport::failure(None, "bad")
                } else {
                    ItemReport::success(Some(format!("item{n}")), "created")
                }
            },
        );
        assert!(Uuid::parse_str(&id).is_ok());

        let task = finished(&t, &id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!((task.total, task.processed, task.success, task.failed), (3, 3, 2, 1));
        assert_eq!(task.progress, 1.0);
        assert_eq!(task.log.len(), 3);
    }

    #[tokio::test]
    async fn all_failed_is_failed() {
        let t = tracker();
        let id = t.submit(
            TaskKind::Test,
            async { Ok::<_, EngineError>(vec!["a", "b"]) },
            |_, name: &'static str| async move { ItemReport::failure(Some(name.into()), "no results") },
        );
        let task = finished(&t, &id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.failed, 2);
    }

    #[tokio::test]
    async fn empty_and_unparseable_inputs_fail() {
        let t = tracker();
        let empty = t.submit(
            TaskKind::Import,
            async { Ok::<_, EngineError>(Vec::<u8>::new()) },
            |_, _| async { ItemReport::success(None, "") },
        );
        let task = finished(&t, &empty).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.progress, 1.0);

        let broken = t.submit(
            TaskKind::Import,
            async { Err::<Vec<u8>, _>(EngineError::parse(Stage::Import, "not JSON")) },
            |_, _| async { ItemReport::success(None, "") },
        );
        let task = finished(&t, &broken).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("not JSON"));
    }

    #[tokio::test]
    async fn log_is_capped() {
        let t = ImportTaskTracker::new(2, 3, Duration::from_secs(60));
        let id = t.submit(
            TaskKind::Import,
            async { Ok::<_, EngineError>((0..10).collect::<Vec<u32>>()) },
            |_, _| async { ItemReport::success(None, "ok") },
        );
        let task = finished(&t, &id).await;
        assert_eq!(task.log.len(), 3);
        assert_eq!(task.log_dropped, 7);
        assert_eq!(task.success, 10);
    }

    #[test]
    fn progress_rules() {
        let mut task = ImportTask::new("x".into(), TaskKind::Import);
        assert_eq!(task.compute_progress(), 0.0);
        task.total = 4;
        task.processed = 1;
        assert_eq!(task.compute_progress(), 0.25);
        task.total = 0;
        task.status = TaskStatus::Completed;
        assert_eq!(task.compute_progress(), 1.0);
    }

    #[tokio::test]
    async fn sweep_only_removes_old_terminal_tasks() {
        let t = ImportTaskTracker::new(1, 10, Duration::from_secs(60));
        let done = t.submit(
            TaskKind::Import,
            async { Ok::<_, EngineError>(vec![1]) },
            |_, _: i32| async { ItemReport::success(None, "ok") },
        );
        finished(&t, &done).await;
        let pending_id = "pending".to_string();
        t.with_task_map(|tasks| {
            tasks.insert(pending_id.clone(), ImportTask::new(pending_id.clone(), TaskKind::Import));
        });

        assert_eq!(t.sweep(Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(t.sweep(later), 1);
        assert!(t.get(&done).is_none());
        assert!(t.get("pending").is_some());
    }

    #[tokio::test]
    async fn reaper_stops_on_shutdown() {
        let t = tracker();
        let shutdown = Arc::new(Notify::new());
        let handle = t.spawn_reaper(Duration::from_millis(10), Arc::clone(&shutdown));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
