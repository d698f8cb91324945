//! Priority-aware admission queue.
//!
//! Every inbound request passes through [`AdmissionQueue`] before its handler
//! runs.  The queue decides whether to admit it (given the current
//! [`SystemStatus`], the request's [`PriorityLevel`] and its [`Intent`]) and
//! then runs admitted work under two budgets:
//!
//! * a per-priority concurrency ceiling (HIGH 10, MEDIUM 5, LOW 2 by default)
//! * a global ceiling shared by all buckets (`max_concurrent`, default 10)
//!
//! When a slot frees up the buckets are served strictly in priority order:
//! HIGH before MEDIUM before LOW, FIFO within a bucket.  LOW can starve under
//! sustained HIGH load; that is the intended behaviour.
//!
//! Rejection is not an error.  [`AdmissionQueue::submit`] returns
//! [`Admission::Rejected`] carrying a [`LoadShed`] that the framework
//! boundary turns into a 503 response.  The check itself is a constant-time
//! look at the bucket occupancy and the cached status; it never waits.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::ErrorBody;
use crate::intent::{Intent, IntentRegistry};
use crate::monitor::{StatusProvider, SystemStatus};
use crate::scheduler::TaskPriority;

// ---------------------------------------------------------------------------
// Priority levels
// ---------------------------------------------------------------------------

/// Admission priority of a request.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PriorityLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl PriorityLevel {
    /// Service order: highest first.
    pub const DESCENDING: [PriorityLevel; 3] = [Self::High, Self::Medium, Self::Low];

    fn index(self) -> usize {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }
}

impl From<TaskPriority> for PriorityLevel {
    fn from(priority: TaskPriority) -> Self {
        match priority {
            TaskPriority::Critical | TaskPriority::High => Self::High,
            TaskPriority::Normal => Self::Medium,
            TaskPriority::Low => Self::Low,
        }
    }
}

impl std::fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// One number per priority level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityLimits {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl PriorityLimits {
    pub fn get(&self, priority: PriorityLevel) -> usize {
        match priority {
            PriorityLevel::High => self.high,
            PriorityLevel::Medium => self.medium,
            PriorityLevel::Low => self.low,
        }
    }
}

/// Admission queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum queued + in-flight requests per bucket.
    pub queue_limits: PriorityLimits,
    /// Default in-flight ceiling per bucket.
    pub concurrency: PriorityLimits,
    /// Global in-flight ceiling across all buckets.
    pub max_concurrent: usize,
    /// How often the binary re-derives ceilings from host load.
    pub adjust_interval_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            queue_limits: PriorityLimits {
                high: 50,
                medium: 100,
                low: 200,
            },
            concurrency: PriorityLimits {
                high: 10,
                medium: 5,
                low: 2,
            },
            max_concurrent: 10,
            adjust_interval_ms: 5_000,
        }
    }
}

impl AdmissionConfig {
    pub fn adjust_interval(&self) -> Duration {
        Duration::from_millis(self.adjust_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why a request was shed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShedReason {
    /// The bucket already holds `limit` queued or in-flight requests.
    QueueFull { occupancy: usize, limit: usize },
    /// The current system status does not admit this priority/intent.
    Status,
}

/// A load-shedding decision, returned instead of running the work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("request shed under {status} status ({priority} priority)")]
pub struct LoadShed {
    pub status: SystemStatus,
    pub priority: PriorityLevel,
    pub intent: Option<String>,
    pub route: Option<String>,
    pub reason: ShedReason,
}

impl LoadShed {
    pub const STATUS_CODE: u16 = 503;

    fn new(
        status: SystemStatus,
        priority: PriorityLevel,
        intent: Option<String>,
        route: Option<&str>,
        reason: ShedReason,
    ) -> Self {
        Self {
            status,
            priority,
            intent,
            route: route.map(str::to_string),
            reason,
        }
    }

    /// Structured 503 body for the framework boundary.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            status_code: Self::STATUS_CODE,
            code: "LOAD_SHED".to_string(),
            message: "service is shedding load, retry later".to_string(),
            details: serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Result of submitting work to the queue.
#[must_use]
#[derive(Debug)]
pub enum Admission<T> {
    Admitted(T),
    Rejected(LoadShed),
}

impl<T> Admission<T> {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }

    pub fn into_result(self) -> Result<T, LoadShed> {
        match self {
            Self::Admitted(value) => Ok(value),
            Self::Rejected(shed) => Err(shed),
        }
    }
}

/// Per-item failure from [`AdmissionQueue::gather`].
#[derive(Debug, thiserror::Error)]
pub enum GatherError<E> {
    #[error("{0}")]
    Rejected(LoadShed),
    #[error("gathered work failed: {0}")]
    Failed(E),
}

// ---------------------------------------------------------------------------
// Route policies
// ---------------------------------------------------------------------------

/// Priority and intent attached to one route at setup time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutePolicy {
    pub priority: Option<PriorityLevel>,
    pub intent: Option<Intent>,
}

/// Route key (`"METHOD /path"`) to [`RoutePolicy`] table.
#[derive(Clone, Default)]
pub struct RouteTable {
    policies: Arc<DashMap<String, RoutePolicy>>,
    intents: IntentRegistry,
}

impl RouteTable {
    pub fn new(intents: IntentRegistry) -> Self {
        Self {
            policies: Arc::new(DashMap::new()),
            intents,
        }
    }

    pub fn register(&self, route: impl Into<String>, policy: RoutePolicy) {
        let route = route.into();
        tracing::debug!(%route, ?policy, "route policy registered");
        self.policies.insert(route, policy);
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Effective priority and intent for a route.
    ///
    /// An explicit priority wins; otherwise the intent's task priority is
    /// used; otherwise MEDIUM.
    pub fn resolve(&self, route: &str) -> (PriorityLevel, Option<Intent>) {
        let Some(policy) = self.policies.get(route).map(|p| p.value().clone()) else {
            return (PriorityLevel::Medium, None);
        };
        let priority = policy.priority.unwrap_or_else(|| {
            policy
                .intent
                .as_ref()
                .and_then(|intent| self.intents.resolve(intent).ok())
                .map(|config| PriorityLevel::from(config.task_priority))
                .unwrap_or_default()
        });
        (priority, policy.intent)
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketSnapshot {
    pub priority: PriorityLevel,
    pub queued: usize,
    pub in_flight: usize,
    pub ceiling: usize,
    pub queue_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionSnapshot {
    pub buckets: Vec<BucketSnapshot>,
    pub in_flight: usize,
    pub max_concurrent: usize,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// A request held in a bucket until a slot is granted.
#[derive(Debug)]
pub struct QueuedRequest {
    pub enqueued_at: Instant,
    pub priority: PriorityLevel,
    pub intent: Option<Intent>,
    pub route: Option<String>,
}

struct Waiter {
    id: u64,
    request: QueuedRequest,
    grant: oneshot::Sender<InFlight>,
}

struct Bucket {
    waiting: VecDeque<Waiter>,
    in_flight: usize,
    ceiling: usize,
}

impl Bucket {
    fn occupancy(&self) -> usize {
        self.waiting.len() + self.in_flight
    }
}

struct QueueState {
    buckets: [Bucket; 3],
    in_flight: usize,
    max_concurrent: usize,
    next_waiter: u64,
}

struct QueueInner {
    config: AdmissionConfig,
    state: Mutex<QueueState>,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Grant free slots to waiters, highest bucket first.
    fn pump(self: &Arc<Self>, state: &mut QueueState) {
        for priority in PriorityLevel::DESCENDING {
            loop {
                if state.in_flight >= state.max_concurrent {
                    return;
                }
                let bucket = &mut state.buckets[priority.index()];
                if bucket.in_flight >= bucket.ceiling {
                    break;
                }
                let Some(waiter) = bucket.waiting.pop_front() else {
                    break;
                };
                if waiter.grant.is_closed() {
                    continue;
                }

                bucket.in_flight += 1;
                state.in_flight += 1;
                let slot = InFlight {
                    inner: Arc::clone(self),
                    priority,
                    armed: true,
                };
                if let Err(mut slot) = waiter.grant.send(slot) {
                    // Receiver went away between the check and the send; undo
                    // here since we already hold the lock.
                    slot.armed = false;
                    state.buckets[priority.index()].in_flight -= 1;
                    state.in_flight -= 1;
                } else {
                    tracing::trace!(
                        %priority,
                        waited_ms = waiter.request.enqueued_at.elapsed().as_millis() as u64,
                        route = waiter.request.route.as_deref().unwrap_or(""),
                        "admission slot granted"
                    );
                }
            }
        }
    }

    /// Forget a waiter whose submitter went away before it was granted.
    fn withdraw(&self, priority: PriorityLevel, id: u64) {
        let mut state = self.lock();
        let waiting = &mut state.buckets[priority.index()].waiting;
        if let Some(position) = waiting.iter().position(|w| w.id == id) {
            waiting.remove(position);
            tracing::debug!(%priority, "queued request abandoned");
        }
    }

    fn release(self: &Arc<Self>, priority: PriorityLevel) {
        let mut state = self.lock();
        let bucket = &mut state.buckets[priority.index()];
        bucket.in_flight = bucket.in_flight.saturating_sub(1);
        state.in_flight = state.in_flight.saturating_sub(1);
        self.pump(&mut state);
    }
}

/// An occupied in-flight slot.  Dropping it frees the slot.
struct InFlight {
    inner: Arc<QueueInner>,
    priority: PriorityLevel,
    armed: bool,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.armed {
            self.inner.release(self.priority);
        }
    }
}

/// Removes a still-queued waiter when the submitting future is dropped.
struct Queued {
    inner: Arc<QueueInner>,
    priority: PriorityLevel,
    id: u64,
    armed: bool,
}

impl Drop for Queued {
    fn drop(&mut self) {
        if self.armed {
            self.inner.withdraw(self.priority, self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// AdmissionQueue
// ---------------------------------------------------------------------------

/// The admission queue.
///
/// Cheaply cloneable; clones share the same buckets.
#[derive(Clone)]
pub struct AdmissionQueue {
    inner: Arc<QueueInner>,
    status: Arc<dyn StatusProvider>,
    routes: RouteTable,
}

impl AdmissionQueue {
    pub fn new(config: AdmissionConfig, status: Arc<dyn StatusProvider>) -> Self {
        let bucket = |priority| Bucket {
            waiting: VecDeque::new(),
            in_flight: 0,
            ceiling: config.concurrency.get(priority).max(1),
        };
        let state = QueueState {
            buckets: [
                bucket(PriorityLevel::High),
                bucket(PriorityLevel::Medium),
                bucket(PriorityLevel::Low),
            ],
            in_flight: 0,
            max_concurrent: config.max_concurrent.max(1),
            next_waiter: 0,
        };
        Self {
            inner: Arc::new(QueueInner {
                config,
                state: Mutex::new(state),
            }),
            status,
            routes: RouteTable::default(),
        }
    }

    /// Attach a route policy table used by [`submit_route`](Self::submit_route).
    #[must_use]
    pub fn with_routes(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.inner.config
    }

    /// Current status as seen by this queue's provider.
    pub fn current_status(&self) -> SystemStatus {
        self.status.status()
    }

    // -- Admission decision -------------------------------------------------

    /// Whether a request with the given attributes would be admitted now.
    pub fn is_allowed(
        &self,
        status: SystemStatus,
        intent: Option<&Intent>,
        priority: PriorityLevel,
        route: Option<&str>,
    ) -> bool {
        let state = self.inner.lock();
        self.check(&state, status, intent, priority, route).is_ok()
    }

    fn check(
        &self,
        state: &QueueState,
        status: SystemStatus,
        intent: Option<&Intent>,
        priority: PriorityLevel,
        route: Option<&str>,
    ) -> Result<(), LoadShed> {
        let shed =
            |reason| LoadShed::new(status, priority, intent.map(Intent::name), route, reason);

        let occupancy = state.buckets[priority.index()].occupancy();
        let limit = self.inner.config.queue_limits.get(priority);
        if occupancy >= limit {
            return Err(shed(ShedReason::QueueFull { occupancy, limit }));
        }

        let critical = intent.is_some_and(Intent::is_critical);
        let admitted = match status {
            SystemStatus::Green => true,
            SystemStatus::Yellow => priority != PriorityLevel::Low || critical,
            SystemStatus::Red => priority == PriorityLevel::High || critical,
        };
        if admitted {
            Ok(())
        } else {
            Err(shed(ShedReason::Status))
        }
    }

    // -- Execution ----------------------------------------------------------

    /// Admit and run `work`, waiting for a slot if the budgets are full.
    ///
    /// The admission check and the bucket reservation happen atomically, so
    /// concurrent submitters can never overshoot a queue limit.
    pub async fn submit<F, T>(
        &self,
        work: F,
        priority: PriorityLevel,
        intent: Option<Intent>,
        route: Option<&str>,
    ) -> Admission<T>
    where
        F: Future<Output = T>,
    {
        let status = self.status.status();
        let intent_name = intent.as_ref().map(Intent::name);
        let (receiver, mut queued) = {
            let mut state = self.inner.lock();
            if let Err(shed) = self.check(&state, status, intent.as_ref(), priority, route) {
                drop(state);
                tracing::warn!(
                    %status,
                    %priority,
                    intent = shed.intent.as_deref().unwrap_or(""),
                    route = route.unwrap_or(""),
                    reason = ?shed.reason,
                    "request shed"
                );
                return Admission::Rejected(shed);
            }

            let id = state.next_waiter;
            state.next_waiter += 1;
            let (grant, receiver) = oneshot::channel();
            state.buckets[priority.index()].waiting.push_back(Waiter {
                id,
                request: QueuedRequest {
                    enqueued_at: Instant::now(),
                    priority,
                    intent,
                    route: route.map(str::to_string),
                },
                grant,
            });
            self.inner.pump(&mut state);
            let queued = Queued {
                inner: Arc::clone(&self.inner),
                priority,
                id,
                armed: true,
            };
            (receiver, queued)
        };

        let granted = receiver.await;
        // Granted or not, the waiter has left the bucket.
        queued.armed = false;
        let slot = match granted {
            Ok(slot) => slot,
            // The sender is only dropped by the pump after a grant or when
            // the queue itself goes away; either way there is nothing to run.
            Err(_) => {
                return Admission::Rejected(LoadShed::new(
                    status,
                    priority,
                    intent_name,
                    route,
                    ShedReason::Status,
                ));
            }
        };

        tracing::debug!(%priority, route = route.unwrap_or(""), "request admitted");
        let output = work.await;
        drop(slot);
        Admission::Admitted(output)
    }

    /// Run `work` under the policy registered for `route`.
    pub async fn submit_route<F, T>(&self, route: &str, work: F) -> Admission<T>
    where
        F: Future<Output = T>,
    {
        let (priority, intent) = self.routes.resolve(route);
        self.submit(work, priority, intent, Some(route)).await
    }

    /// Run a batch of futures with at most `concurrency` in flight at once.
    ///
    /// The output has the same order as `works`.  Each item is checked for
    /// admission as it starts; a shed item or a failing item is reported in
    /// its own slot and does not cancel the rest.
    pub async fn gather<F, T, E>(
        &self,
        works: Vec<F>,
        priority: PriorityLevel,
        concurrency: usize,
    ) -> Vec<Result<T, GatherError<E>>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let concurrency = concurrency.max(1);
        let status = self.status.status();
        tracing::debug!(items = works.len(), concurrency, %priority, "gather started");

        stream::iter(works.into_iter().map(|work| {
            let verdict = {
                let state = self.inner.lock();
                self.check(&state, status, None, priority, Some("gather"))
            };
            async move {
                match verdict {
                    Ok(()) => work.await.map_err(GatherError::Failed),
                    Err(shed) => Err(GatherError::Rejected(shed)),
                }
            }
        }))
        .buffered(concurrency)
        .collect()
        .await
    }

    // -- Tuning -------------------------------------------------------------

    /// Rescale the concurrency ceilings from resource usage fractions.
    ///
    /// Above 0.9 the ceilings drop to a quarter of their configured value,
    /// above 0.75 to half; otherwise they are restored.  Never below 1.
    pub fn adjust_concurrency_based_on_resources(&self, cpu: f64, mem: f64) {
        let load = cpu.max(mem);
        let factor = if load > 0.9 {
            0.25
        } else if load > 0.75 {
            0.5
        } else {
            1.0
        };
        let scale = |n: usize| ((n as f64 * factor).floor() as usize).max(1);

        let mut state = self.inner.lock();
        let config = &self.inner.config;
        for priority in PriorityLevel::DESCENDING {
            state.buckets[priority.index()].ceiling = scale(config.concurrency.get(priority));
        }
        let previous = state.max_concurrent;
        state.max_concurrent = scale(config.max_concurrent);
        if previous != state.max_concurrent {
            tracing::info!(
                load,
                from = previous,
                to = state.max_concurrent,
                "admission concurrency adjusted"
            );
        }
        // Raised ceilings may unblock waiters.
        self.inner.pump(&mut state);
    }

    /// Feed the status provider's load factor into the ceilings.
    pub fn auto_adjust(&self) {
        let load = self.status.load_factor();
        self.adjust_concurrency_based_on_resources(load, load);
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let state = self.inner.lock();
        let buckets = PriorityLevel::DESCENDING
            .into_iter()
            .map(|priority| {
                let bucket = &state.buckets[priority.index()];
                BucketSnapshot {
                    priority,
                    queued: bucket.waiting.len(),
                    in_flight: bucket.in_flight,
                    ceiling: bucket.ceiling,
                    queue_limit: self.inner.config.queue_limits.get(priority),
                }
            })
            .collect();
        AdmissionSnapshot {
            buckets,
            in_flight: state.in_flight,
            max_concurrent: state.max_concurrent,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::StaticStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue_with(status: SystemStatus) -> AdmissionQueue {
        AdmissionQueue::new(
            AdmissionConfig::default(),
            Arc::new(StaticStatus::new(status, 0.0)),
        )
    }

    #[test]
    fn green_admits_every_priority() {
        let queue = queue_with(SystemStatus::Green);
        for priority in PriorityLevel::DESCENDING {
            assert!(queue.is_allowed(SystemStatus::Green, None, priority, None));
        }
    }

    #[test]
    fn red_admits_only_high_or_critical() {
        let queue = queue_with(SystemStatus::Red);
        let red = SystemStatus::Red;
        assert!(queue.is_allowed(red, None, PriorityLevel::High, None));
        assert!(!queue.is_allowed(red, None, PriorityLevel::Medium, None));
        assert!(!queue.is_allowed(red, None, PriorityLevel::Low, None));
        assert!(!queue.is_allowed(red, Some(&Intent::Standard), PriorityLevel::Low, None));
        assert!(queue.is_allowed(red, Some(&Intent::Critical), PriorityLevel::Low, None));
    }

    #[test]
    fn yellow_sheds_low_unless_critical() {
        let queue = queue_with(SystemStatus::Yellow);
        let yellow = SystemStatus::Yellow;
        assert!(queue.is_allowed(yellow, None, PriorityLevel::Medium, None));
        assert!(!queue.is_allowed(yellow, None, PriorityLevel::Low, None));
        assert!(!queue.is_allowed(yellow, Some(&Intent::Ephemeral), PriorityLevel::Low, None));
        assert!(queue.is_allowed(yellow, Some(&Intent::Critical), PriorityLevel::Low, None));
    }

    #[test]
    fn default_priority_is_medium() {
        assert_eq!(PriorityLevel::default(), PriorityLevel::Medium);
        assert_eq!(RoutePolicy::default().priority, None);
    }

    #[test]
    fn shed_body_is_503() {
        let shed = LoadShed {
            status: SystemStatus::Red,
            priority: PriorityLevel::Low,
            intent: None,
            route: Some("GET /orders".into()),
            reason: ShedReason::Status,
        };
        let body = shed.to_body();
        assert_eq!(body.status_code, 503);
        assert_eq!(body.code, "LOAD_SHED");
        assert_eq!(body.details["route"], "GET /orders");
    }

    #[test]
    fn adjust_scales_inversely_and_floors_at_one() {
        let queue = queue_with(SystemStatus::Green);

        queue.adjust_concurrency_based_on_resources(0.95, 0.1);
        let snap = queue.snapshot();
        assert_eq!(snap.buckets[0].ceiling, 2);
        assert_eq!(snap.buckets[1].ceiling, 1);
        assert_eq!(snap.buckets[2].ceiling, 1);
        assert_eq!(snap.max_concurrent, 2);

        queue.adjust_concurrency_based_on_resources(0.8, 0.0);
        let snap = queue.snapshot();
        assert_eq!(snap.buckets[0].ceiling, 5);
        assert_eq!(snap.buckets[1].ceiling, 2);

        queue.adjust_concurrency_based_on_resources(0.1, 0.1);
        let snap = queue.snapshot();
        assert_eq!(snap.buckets[0].ceiling, 10);
        assert_eq!(snap.max_concurrent, 10);
    }

    #[test]
    fn auto_adjust_uses_provider_load() {
        let status = Arc::new(StaticStatus::new(SystemStatus::Red, 0.99));
        let queue = AdmissionQueue::new(AdmissionConfig::default(), status);
        queue.auto_adjust();
        assert_eq!(queue.snapshot().max_concurrent, 2);
    }

    #[test]
    fn route_table_resolution() {
        let table = RouteTable::new(IntentRegistry::new());
        table.register(
            "POST /payments",
            RoutePolicy {
                priority: None,
                intent: Some(Intent::Critical),
            },
        );
        table.register(
            "GET /feed",
            RoutePolicy {
                priority: Some(PriorityLevel::Low),
                intent: Some(Intent::Critical),
            },
        );

        assert_eq!(
            table.resolve("POST /payments"),
            (PriorityLevel::High, Some(Intent::Critical))
        );
        assert_eq!(table.resolve("GET /feed").0, PriorityLevel::Low);
        assert_eq!(table.resolve("GET /unknown"), (PriorityLevel::Medium, None));
    }

    #[tokio::test]
    async fn submit_runs_work_and_frees_slot() {
        let queue = queue_with(SystemStatus::Green);
        let out = queue
            .submit(async { 7 }, PriorityLevel::Medium, None, Some("GET /x"))
            .await;
        assert_eq!(out.into_result().unwrap(), 7);

        let snap = queue.snapshot();
        assert_eq!(snap.in_flight, 0);
        assert!(snap.buckets.iter().all(|b| b.queued == 0 && b.in_flight == 0));
    }

    #[tokio::test]
    async fn submit_sheds_under_red() {
        let queue = queue_with(SystemStatus::Red);
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let out = queue
            .submit(
                async move {
                    r.fetch_add(1, Ordering::SeqCst);
                },
                PriorityLevel::Low,
                None,
                None,
            )
            .await;
        assert!(!out.is_admitted());
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        let shed = queue
            .submit(async {}, PriorityLevel::Low, Some(Intent::Ephemeral), Some("GET /feed"))
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(shed.intent.as_deref(), Some("ephemeral"));
        assert_eq!(shed.route.as_deref(), Some("GET /feed"));
        assert_eq!(shed.reason, ShedReason::Status);
    }

    #[tokio::test]
    async fn gather_preserves_order_and_isolates_failures() {
        let queue = queue_with(SystemStatus::Green);
        let works: Vec<_> = (0..5u64)
            .map(|i| async move {
                // Later items finish first.
                tokio::time::sleep(Duration::from_millis(50 - i * 10)).await;
                if i == 2 { Err(format!("item {i} failed")) } else { Ok(i) }
            })
            .collect();

        let results = queue.gather(works, PriorityLevel::Medium, 5).await;
        assert_eq!(results.len(), 5);
        for (i, result) in results.iter().enumerate() {
            match result {
                Ok(v) => assert_eq!(*v, i as u64),
                Err(GatherError::Failed(msg)) => {
                    assert_eq!(i, 2);
                    assert_eq!(msg, "item 2 failed");
                }
                Err(GatherError::Rejected(_)) => panic!("unexpected shed"),
            }
        }
    }

    #[tokio::test]
    async fn abandoned_waiter_frees_its_queue_place() {
        let config = AdmissionConfig {
            queue_limits: PriorityLimits {
                high: 50,
                medium: 100,
                low: 2,
            },
            concurrency: PriorityLimits {
                high: 10,
                medium: 5,
                low: 1,
            },
            ..AdmissionConfig::default()
        };
        let queue = AdmissionQueue::new(
            config,
            Arc::new(StaticStatus::new(SystemStatus::Green, 0.0)),
        );

        let (release, hold) = oneshot::channel::<()>();
        let blocker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .submit(async { hold.await.ok() }, PriorityLevel::Low, None, None)
                    .await
            })
        };
        while queue.snapshot().buckets[2].in_flight == 0 {
            tokio::task::yield_now().await;
        }

        // A client that gives up while queued behind the blocker.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            queue.submit(async {}, PriorityLevel::Low, None, None),
        )
        .await;
        assert!(abandoned.is_err());

        let snapshot = queue.snapshot();
        let low = &snapshot.buckets[2];
        assert_eq!(low.queued, 0);
        assert_eq!(low.in_flight, 1);
        assert!(queue.is_allowed(SystemStatus::Green, None, PriorityLevel::Low, None));

        release.send(()).unwrap();
        assert!(blocker.await.unwrap().is_admitted());
        assert_eq!(queue.snapshot().in_flight, 0);
    }

    #[tokio::test]
    async fn gather_sheds_items_under_red() {
        let queue = queue_with(SystemStatus::Red);
        let works: Vec<_> = (0..2).map(|i| async move { Ok::<_, String>(i) }).collect();
        let results = queue.gather(works, PriorityLevel::Low, 2).await;
        assert!(
            results
                .iter()
                .all(|r| matches!(r, Err(GatherError::Rejected(_))))
        );
    }
}
