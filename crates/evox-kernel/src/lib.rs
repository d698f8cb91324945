//! EVOX kernel.
//!
//! Request admission and background execution for an EVOX service:
//!
//! - **[`intent`]** -- Data intent vocabulary ([`Intent`], [`IntentConfig`])
//!   and the registry of custom intents.
//! - **[`monitor`]** -- Host CPU/memory sampling folded into a cached
//!   GREEN / YELLOW / RED [`SystemStatus`], via `sysinfo`.
//! - **[`admission`]** -- Priority-bucketed admission queue with queue-length
//!   caps, per-bucket and global concurrency ceilings, ordered `gather`, and a
//!   route policy table.
//! - **[`scheduler`]** -- Lock-free priority task scheduler built on
//!   [`crossbeam::queue::SegQueue`] with a tokio worker pool, retry with
//!   priority demotion, and delayed/recurring schedules.
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod admission;
pub mod error;
pub mod intent;
pub mod monitor;
pub mod scheduler;

// Re-export the most commonly used types at the crate root for convenience.
pub use admission::{
    Admission, AdmissionConfig, AdmissionQueue, AdmissionSnapshot, GatherError, LoadShed,
    PriorityLevel, PriorityLimits, RoutePolicy, RouteTable, ShedReason,
};
pub use error::{ErrorBody, KernelError, Result};
pub use intent::{BackendKind, Consistency, Intent, IntentConfig, IntentRegistry};
pub use monitor::{
    MonitorConfig, StaticStatus, StatusProvider, SystemStatus, SystemStatusMonitor,
};
pub use scheduler::{
    ScheduleId, SchedulerConfig, SchedulerStats, TaskFn, TaskId, TaskInfo, TaskPriority,
    TaskResult, TaskScheduler, TaskStatus, task_fn,
};
