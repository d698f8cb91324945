//! Background task scheduler.
//!
//! The scheduler accepts task submissions, enqueues them into a set of
//! priority-partitioned [`crossbeam::queue::SegQueue`]s, and executes them on
//! a fixed pool of worker tasks.  It is the place for detached work that must
//! never run on the request path.
//!
//! # Priority model
//!
//! Four priority lanes are maintained.  Workers drain **Critical** before
//! **High**, **High** before **Normal**, and so on.  Within a lane tasks run
//! in submission order.
//!
//! # Task lifecycle
//!
//! ```text
//! Pending  -->  Running  -->  Completed
//!    |              \->  Failed  (retries exhausted)
//!    |              \->  Pending (retry, priority demoted one lane)
//!    \->  Cancelled
//! ```
//!
//! Only `Pending` tasks can be cancelled.  A running task is never preempted.
//!
//! # Retries
//!
//! A failing task is re-queued with its priority demoted by one lane (floored
//! at `Low`) until it has been retried `max_retries` times; the next failure
//! is terminal.  The same closure is invoked again on each attempt.
//!
//! # Delayed and recurring work
//!
//! [`TaskScheduler::schedule`] fires a single submission after a delay;
//! [`TaskScheduler::schedule_recurring`] submits a fresh task every interval.
//! Both return a handle id that [`TaskScheduler::cancel`] accepts until the
//! handle has fired (one-shot) or until it is cancelled (recurring).

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{KernelError, Result};
use crate::intent::{Intent, IntentRegistry};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Unique, time-ordered task identifier (UUID v7).
pub type TaskId = Uuid;

/// Identifier of a delayed or recurring schedule.
pub type ScheduleId = Uuid;

/// Priority level that determines the scheduling lane.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Must execute before anything else.
    Critical = 0,
    High = 1,
    /// Default priority for most work.
    #[default]
    Normal = 2,
    /// Background / best-effort.
    Low = 3,
}

impl TaskPriority {
    /// One lane lower, floored at `Low`.
    pub fn demoted(self) -> Self {
        match self {
            Self::Critical => Self::High,
            Self::High => Self::Normal,
            Self::Normal | Self::Low => Self::Low,
        }
    }

    fn lane(self) -> usize {
        self as usize
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in a lane (including between retries).
    Pending,
    Running,
    Completed,
    /// Failed after all retries.
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Outcome of one task attempt.
pub type TaskResult = std::result::Result<serde_json::Value, String>;

/// The async closure that the scheduler will execute.
///
/// `Fn` rather than `FnOnce` so that a failed task can be run again.
pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, TaskResult> + Send + Sync>;

/// Wrap an async closure as a [`TaskFn`].
pub fn task_fn<F, Fut>(f: F) -> TaskFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Metadata snapshot of a task visible to external callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    /// Error from the most recent failed attempt.
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Size of the worker pool.
    pub workers: usize,
    /// Default retry budget for submitted tasks.
    pub max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
        }
    }
}

/// Counters since the scheduler was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub created: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    /// Tasks running right now.
    pub active: u64,
    /// Tasks waiting in a lane right now.
    pub pending: u64,
    /// Live delayed and recurring schedules.
    pub scheduled: u64,
}

/// Internal representation of a task that lives on the queue.
struct QueuedTask {
    id: TaskId,
    work: TaskFn,
}

struct ScheduledEntry {
    name: String,
    recurring: bool,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
    active: AtomicU64,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Priority-aware task scheduler with a fixed worker pool.
///
/// Cheaply cloneable (`Arc`-backed) and safe to share across threads and
/// async tasks.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    intents: IntentRegistry,

    /// One lock-free queue per priority lane.
    queues: [SegQueue<QueuedTask>; 4],

    /// Authoritative task metadata.
    tasks: DashMap<TaskId, TaskInfo>,

    /// Delayed and recurring schedules that have not finished.
    scheduled: DashMap<ScheduleId, ScheduledEntry>,

    /// Wakes idle workers when new work arrives.
    notify: Notify,

    /// When `true` the scheduler will not accept new work.
    shutdown: AtomicBool,

    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
}

impl TaskScheduler {
    /// Create a scheduler **without** starting the worker pool.
    #[must_use]
    pub fn new(config: SchedulerConfig, intents: IntentRegistry) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                intents,
                queues: [
                    SegQueue::new(),
                    SegQueue::new(),
                    SegQueue::new(),
                    SegQueue::new(),
                ],
                tasks: DashMap::new(),
                scheduled: DashMap::new(),
                notify: Notify::new(),
                shutdown: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Spawn the worker pool onto the tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut workers = self
            .inner
            .workers
            .lock()
            .map_err(|_| KernelError::Internal("scheduler worker table poisoned".into()))?;
        if !workers.is_empty() {
            return Err(KernelError::SchedulerAlreadyStarted);
        }
        if self.is_shutdown() {
            return Err(KernelError::SchedulerShutdown);
        }

        let count = self.inner.config.workers.max(1);
        for worker in 0..count {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(async move {
                tracing::debug!(worker, "scheduler worker started");
                Self::worker_loop(&inner).await;
                tracing::debug!(worker, "scheduler worker stopped");
            }));
        }
        tracing::info!(workers = count, "task scheduler started");
        Ok(())
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    // -- Submission ---------------------------------------------------------

    /// Submit a task for immediate execution with the default retry budget.
    pub fn submit(
        &self,
        name: impl Into<String>,
        priority: TaskPriority,
        work: TaskFn,
    ) -> Result<TaskId> {
        self.submit_with_retries(name, priority, self.inner.config.max_retries, work)
    }

    /// Submit a task with an explicit retry budget.
    pub fn submit_with_retries(
        &self,
        name: impl Into<String>,
        priority: TaskPriority,
        max_retries: u32,
        work: TaskFn,
    ) -> Result<TaskId> {
        if self.is_shutdown() {
            return Err(KernelError::SchedulerShutdown);
        }

        let id = Uuid::now_v7();
        let name = name.into();
        self.inner.tasks.insert(
            id,
            TaskInfo {
                id,
                name: name.clone(),
                priority,
                status: TaskStatus::Pending,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                result: None,
                error: None,
                retry_count: 0,
                max_retries,
            },
        );
        self.inner.counters.created.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(task_id = %id, task_name = %name, ?priority, "task submitted");
        self.inner.enqueue(id, priority, work);
        Ok(id)
    }

    /// Submit a task whose priority comes from an intent's task-priority
    /// mapping.
    pub fn submit_with_intent(
        &self,
        name: impl Into<String>,
        intent: &Intent,
        work: TaskFn,
    ) -> Result<TaskId> {
        let config = self.inner.intents.resolve(intent)?;
        self.submit(name, config.task_priority, work)
    }

    /// Submit a synchronous closure; it runs on the blocking thread pool.
    pub fn submit_blocking<F>(
        &self,
        name: impl Into<String>,
        priority: TaskPriority,
        f: F,
    ) -> Result<TaskId>
    where
        F: Fn() -> TaskResult + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let work = task_fn(move || {
            let f = Arc::clone(&f);
            async move {
                match tokio::task::spawn_blocking(move || f()).await {
                    Ok(result) => result,
                    Err(err) => Err(format!("blocking task aborted: {err}")),
                }
            }
        });
        self.submit(name, priority, work)
    }

    /// Submit `work` once after `delay`.
    pub fn schedule(
        &self,
        name: impl Into<String>,
        priority: TaskPriority,
        delay: Duration,
        work: TaskFn,
    ) -> Result<ScheduleId> {
        if self.is_shutdown() {
            return Err(KernelError::SchedulerShutdown);
        }

        let schedule_id = Uuid::now_v7();
        let name = name.into();
        let scheduler = self.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.inner.scheduled.remove(&schedule_id);
            if let Err(err) = scheduler.submit(task_name.as_str(), priority, work) {
                tracing::warn!(%schedule_id, error = %err, "delayed task dropped");
            }
        });
        self.inner.scheduled.insert(
            schedule_id,
            ScheduledEntry {
                name,
                recurring: false,
                handle,
            },
        );
        tracing::debug!(%schedule_id, ?delay, "task scheduled");
        Ok(schedule_id)
    }

    /// Submit a fresh task every `interval` until cancelled or shut down.
    ///
    /// Each firing is an independent submission, so a slow or failing run
    /// never delays the next one.
    pub fn schedule_recurring(
        &self,
        name: impl Into<String>,
        priority: TaskPriority,
        interval: Duration,
        work: TaskFn,
    ) -> Result<ScheduleId> {
        if self.is_shutdown() {
            return Err(KernelError::SchedulerShutdown);
        }
        if interval.is_zero() {
            return Err(KernelError::InvalidConfig {
                key: "interval".into(),
                reason: "recurring interval must be non-zero".into(),
            });
        }

        let schedule_id = Uuid::now_v7();
        let name = name.into();
        let scheduler = self.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) =
                    scheduler.submit(task_name.as_str(), priority, Arc::clone(&work))
                {
                    tracing::debug!(%schedule_id, error = %err, "recurring schedule stopped");
                    break;
                }
            }
        });
        self.inner.scheduled.insert(
            schedule_id,
            ScheduledEntry {
                name,
                recurring: true,
                handle,
            },
        );
        tracing::info!(%schedule_id, ?interval, "recurring task scheduled");
        Ok(schedule_id)
    }

    // -- Control ------------------------------------------------------------

    /// Cancel a pending task or an unfired schedule.
    ///
    /// Returns `false` for running or finished tasks, fired one-shot
    /// schedules, and unknown ids.
    pub fn cancel(&self, id: Uuid) -> bool {
        if let Some(mut entry) = self.inner.tasks.get_mut(&id) {
            if entry.status != TaskStatus::Pending {
                return false;
            }
            entry.status = TaskStatus::Cancelled;
            entry.completed_at = Some(Utc::now());
            self.inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            tracing::info!(task_id = %id, "task cancelled");
            return true;
        }

        match self.inner.scheduled.remove(&id) {
            Some((_, entry)) if !entry.handle.is_finished() => {
                entry.handle.abort();
                tracing::info!(
                    schedule_id = %id,
                    name = %entry.name,
                    recurring = entry.recurring,
                    "schedule cancelled"
                );
                true
            }
            _ => false,
        }
    }

    /// Query the current state of a task.
    pub fn status(&self, task_id: TaskId) -> Result<TaskInfo> {
        self.inner
            .tasks
            .get(&task_id)
            .map(|entry| entry.clone())
            .ok_or(KernelError::TaskNotFound { task_id })
    }

    /// Return a snapshot of all known tasks keyed by their ID.
    pub fn all_tasks(&self) -> HashMap<TaskId, TaskInfo> {
        self.inner
            .tasks
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.inner.counters;
        SchedulerStats {
            created: c.created.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            active: c.active.load(Ordering::Relaxed),
            pending: self.inner.queues.iter().map(|q| q.len() as u64).sum(),
            scheduled: self.inner.scheduled.len() as u64,
        }
    }

    /// Stop accepting work, cancel unfired schedules, let queued and running
    /// tasks drain, then wait for the worker pool to exit.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("scheduler shutdown requested");

        let ids: Vec<ScheduleId> = self.inner.scheduled.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.inner.scheduled.remove(&id) {
                entry.handle.abort();
            }
        }

        self.inner.notify.notify_waiters();

        let workers = match self.inner.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in workers {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "scheduler worker ended abnormally");
            }
        }
        tracing::info!(stats = ?self.stats(), "task scheduler stopped");
    }

    // -- Worker -------------------------------------------------------------

    async fn worker_loop(inner: &SchedulerInner) {
        loop {
            // Register interest before looking at the queues so a push that
            // races with an empty check still wakes us.
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(queued) = inner.pop() {
                inner.run(queued).await;
                continue;
            }

            if inner.shutdown.load(Ordering::Acquire) {
                break;
            }
            notified.await;
        }
    }
}

impl SchedulerInner {
    fn enqueue(&self, id: TaskId, priority: TaskPriority, work: TaskFn) {
        self.queues[priority.lane()].push(QueuedTask { id, work });
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<QueuedTask> {
        self.queues.iter().find_map(SegQueue::pop)
    }

    async fn run(&self, queued: QueuedTask) {
        // Claim the task; anything that is no longer pending was cancelled.
        let claimed = match self.tasks.get_mut(&queued.id) {
            Some(mut entry) if entry.status == TaskStatus::Pending => {
                entry.status = TaskStatus::Running;
                entry.started_at = Some(Utc::now());
                Some((entry.name.clone(), entry.priority, entry.retry_count))
            }
            _ => None,
        };
        let Some((name, priority, attempt)) = claimed else {
            tracing::debug!(task_id = %queued.id, "skipping cancelled task");
            return;
        };

        tracing::debug!(task_id = %queued.id, task_name = %name, ?priority, attempt, "task running");
        self.counters.active.fetch_add(1, Ordering::Relaxed);
        let result = AssertUnwindSafe((queued.work)())
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err("task panicked".to_string()));
        self.counters.active.fetch_sub(1, Ordering::Relaxed);

        let Some(mut entry) = self.tasks.get_mut(&queued.id) else {
            return;
        };
        match result {
            Ok(value) => {
                entry.status = TaskStatus::Completed;
                entry.completed_at = Some(Utc::now());
                entry.result = Some(value);
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(task_id = %queued.id, "task completed");
            }
            Err(err) if entry.retry_count < entry.max_retries => {
                entry.retry_count += 1;
                entry.priority = entry.priority.demoted();
                entry.status = TaskStatus::Pending;
                entry.error = Some(err.clone());
                let priority = entry.priority;
                let retry = entry.retry_count;
                drop(entry);

                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    task_id = %queued.id,
                    error = %err,
                    retry,
                    ?priority,
                    "task failed, retrying"
                );
                self.enqueue(queued.id, priority, queued.work);
            }
            Err(err) => {
                entry.status = TaskStatus::Failed;
                entry.completed_at = Some(Utc::now());
                entry.error = Some(err.clone());
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    task_id = %queued.id,
                    task_name = %entry.name,
                    retries = entry.retry_count,
                    error = %err,
                    "task failed"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn scheduler(workers: usize) -> TaskScheduler {
        TaskScheduler::new(
            SchedulerConfig {
                workers,
                ..SchedulerConfig::default()
            },
            IntentRegistry::new(),
        )
    }

    async fn wait_terminal(scheduler: &TaskScheduler, id: TaskId) -> TaskInfo {
        for _ in 0..200 {
            let info = scheduler.status(id).expect("task should exist");
            if info.status.is_terminal() {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} did not finish");
    }

    #[test]
    fn demotion_floors_at_low() {
        assert_eq!(TaskPriority::Critical.demoted(), TaskPriority::High);
        assert_eq!(TaskPriority::High.demoted(), TaskPriority::Normal);
        assert_eq!(TaskPriority::Normal.demoted(), TaskPriority::Low);
        assert_eq!(TaskPriority::Low.demoted(), TaskPriority::Low);
    }

    #[test]
    fn default_priority_is_normal() {
        assert_eq!(TaskPriority::default(), TaskPriority::Normal);
        assert_eq!(Intent::default(), Intent::Standard);
    }

    #[tokio::test]
    async fn submit_and_complete() {
        let scheduler = scheduler(2);
        scheduler.start().expect("start");

        let id = scheduler
            .submit(
                "answer",
                TaskPriority::Normal,
                task_fn(|| async { Ok(serde_json::json!(42)) }),
            )
            .expect("submit should succeed");

        let info = wait_terminal(&scheduler, id).await;
        assert_eq!(info.status, TaskStatus::Completed);
        assert_eq!(info.result, Some(serde_json::json!(42)));
        assert!(info.started_at.is_some());

        scheduler.shutdown().await;
        assert_eq!(scheduler.stats().completed, 1);
    }

    #[tokio::test]
    async fn priority_ordering_and_fifo() {
        let scheduler = scheduler(1);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for (label, priority) in [
            ("low", TaskPriority::Low),
            ("normal-1", TaskPriority::Normal),
            ("critical", TaskPriority::Critical),
            ("normal-2", TaskPriority::Normal),
        ] {
            let o = Arc::clone(&order);
            scheduler
                .submit(
                    label,
                    priority,
                    task_fn(move || {
                        let o = Arc::clone(&o);
                        async move {
                            o.lock().unwrap().push(label);
                            Ok(serde_json::Value::Null)
                        }
                    }),
                )
                .expect("submit");
        }

        // Start after everything is queued so ordering is deterministic.
        scheduler.start().expect("start");
        scheduler.shutdown().await;

        let result = order.lock().unwrap().clone();
        assert_eq!(result, vec!["critical", "normal-1", "normal-2", "low"]);
    }

    #[tokio::test]
    async fn failing_task_is_retried_then_failed() {
        let scheduler = scheduler(1);
        scheduler.start().expect("start");

        let attempts = Arc::new(AtomicU32::new(0));
        let a = Arc::clone(&attempts);
        let id = scheduler
            .submit(
                "always-fails",
                TaskPriority::High,
                task_fn(move || {
                    let a = Arc::clone(&a);
                    async move {
                        let n = a.fetch_add(1, Ordering::SeqCst) + 1;
                        Err(format!("attempt {n} failed"))
                    }
                }),
            )
            .expect("submit");

        let info = wait_terminal(&scheduler, id).await;
        assert_eq!(info.status, TaskStatus::Failed);
        assert_eq!(info.retry_count, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(info.error.as_deref(), Some("attempt 4 failed"));
        // High -> Normal -> Low -> Low
        assert_eq!(info.priority, TaskPriority::Low);

        let stats = scheduler.stats();
        assert_eq!(stats.retried, 3);
        assert_eq!(stats.failed, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_task_does_not_kill_worker() {
        let scheduler = scheduler(1);
        scheduler.start().expect("start");

        let bad = scheduler
            .submit_with_retries(
                "panics",
                TaskPriority::Normal,
                0,
                task_fn(|| async {
                    if true {
                        panic!("boom");
                    }
                    Ok(serde_json::Value::Null)
                }),
            )
            .expect("submit");
        let good = scheduler
            .submit(
                "fine",
                TaskPriority::Low,
                task_fn(|| async { Ok(serde_json::Value::Bool(true)) }),
            )
            .expect("submit");

        assert_eq!(wait_terminal(&scheduler, bad).await.status, TaskStatus::Failed);
        assert_eq!(wait_terminal(&scheduler, good).await.status, TaskStatus::Completed);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_pending_only() {
        let scheduler = scheduler(1);
        let id = scheduler
            .submit(
                "cancel-me",
                TaskPriority::Normal,
                task_fn(|| async { Ok(serde_json::Value::Null) }),
            )
            .expect("submit");

        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        assert_eq!(scheduler.status(id).unwrap().status, TaskStatus::Cancelled);

        // The worker skips it.
        scheduler.start().expect("start");
        scheduler.shutdown().await;
        assert_eq!(scheduler.status(id).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(scheduler.stats().completed, 0);
    }

    #[tokio::test]
    async fn cancel_unknown_id_is_false() {
        let scheduler = scheduler(1);
        assert!(!scheduler.cancel(Uuid::now_v7()));
        assert!(matches!(
            scheduler.status(Uuid::now_v7()),
            Err(KernelError::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn delayed_schedule_can_be_cancelled_before_firing() {
        let scheduler = scheduler(1);
        scheduler.start().expect("start");

        let fired = Arc::new(AtomicU32::new(0));
        let f = Arc::clone(&fired);
        let handle = scheduler
            .schedule(
                "later",
                TaskPriority::Normal,
                Duration::from_millis(100),
                task_fn(move || {
                    let f = Arc::clone(&f);
                    async move {
                        f.fetch_add(1, Ordering::SeqCst);
                        Ok(serde_json::Value::Null)
                    }
                }),
            )
            .expect("schedule");

        assert!(scheduler.cancel(handle));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn delayed_schedule_fires_once() {
        let scheduler = scheduler(1);
        scheduler.start().expect("start");

        let fired = Arc::new(AtomicU32::new(0));
        let f = Arc::clone(&fired);
        let handle = scheduler
            .schedule(
                "soon",
                TaskPriority::Normal,
                Duration::from_millis(20),
                task_fn(move || {
                    let f = Arc::clone(&f);
                    async move {
                        f.fetch_add(1, Ordering::SeqCst);
                        Ok(serde_json::Value::Null)
                    }
                }),
            )
            .expect("schedule");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Already fired.
        assert!(!scheduler.cancel(handle));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn submit_with_intent_uses_intent_priority() {
        let scheduler = scheduler(1);
        let id = scheduler
            .submit_with_intent(
                "audit",
                &Intent::Critical,
                task_fn(|| async { Ok(serde_json::Value::Null) }),
            )
            .expect("submit");
        assert_eq!(scheduler.status(id).unwrap().priority, TaskPriority::High);

        let err = scheduler.submit_with_intent(
            "unknown",
            &Intent::custom("nope"),
            task_fn(|| async { Ok(serde_json::Value::Null) }),
        );
        assert!(matches!(err, Err(KernelError::IntentNotRegistered { .. })));
    }

    #[tokio::test]
    async fn blocking_work_runs_off_the_runtime() {
        let scheduler = scheduler(1);
        scheduler.start().expect("start");

        let id = scheduler
            .submit_blocking("checksum", TaskPriority::Normal, || {
                std::thread::sleep(Duration::from_millis(10));
                Ok(serde_json::json!({ "sum": (1..=10).sum::<u32>() }))
            })
            .expect("submit");

        let info = wait_terminal(&scheduler, id).await;
        assert_eq!(info.result, Some(serde_json::json!({ "sum": 55 })));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work_and_double_start() {
        let scheduler = scheduler(1);
        scheduler.start().expect("start");
        assert!(matches!(
            scheduler.start(),
            Err(KernelError::SchedulerAlreadyStarted)
        ));
        scheduler.shutdown().await;

        let result = scheduler.submit(
            "late-task",
            TaskPriority::Normal,
            task_fn(|| async { Ok(serde_json::Value::Null) }),
        );
        assert!(matches!(result, Err(KernelError::SchedulerShutdown)));
    }
}
