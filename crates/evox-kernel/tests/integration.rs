//! Integration tests for the evox-kernel crate.
//!
//! These tests exercise the admission queue, the task scheduler and the
//! intent vocabulary together, the way a service wires them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use evox_kernel::{
    Admission, AdmissionConfig, AdmissionQueue, GatherError, Intent, IntentConfig,
    IntentRegistry, PriorityLevel, PriorityLimits, RoutePolicy, RouteTable, SchedulerConfig,
    ShedReason, StaticStatus, SystemStatus, TaskPriority, TaskScheduler, TaskStatus, task_fn,
};
use futures::future::join_all;
use tokio::sync::Semaphore;

fn green() -> Arc<StaticStatus> {
    Arc::new(StaticStatus::green())
}

// ═══════════════════════════════════════════════════════════════════════
//  Admission queue
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn second_low_request_is_rejected_by_queue_limit() {
    let config = AdmissionConfig {
        queue_limits: PriorityLimits {
            high: 2,
            medium: 2,
            low: 1,
        },
        ..AdmissionConfig::default()
    };
    let queue = AdmissionQueue::new(config, green());
    let gate = Arc::new(Semaphore::new(0));

    let requests = [
        PriorityLevel::High,
        PriorityLevel::High,
        PriorityLevel::Medium,
        PriorityLevel::Medium,
        PriorityLevel::Low,
        PriorityLevel::Low,
    ];
    let submits = requests.iter().enumerate().map(|(i, &priority)| {
        let gate = Arc::clone(&gate);
        let queue = queue.clone();
        async move {
            queue
                .submit(
                    async move {
                        let _permit = gate.acquire().await;
                        i
                    },
                    priority,
                    None,
                    None,
                )
                .await
        }
    });

    let (outcomes, ()) = tokio::join!(join_all(submits), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.add_permits(requests.len());
    });

    for (i, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Admission::Admitted(index) => {
                assert_ne!(i, 5, "second LOW must be shed");
                assert_eq!(index, i);
            }
            Admission::Rejected(shed) => {
                assert_eq!(i, 5, "only the second LOW may be shed");
                assert_eq!(shed.priority, PriorityLevel::Low);
                assert_eq!(
                    shed.reason,
                    ShedReason::QueueFull {
                        occupancy: 1,
                        limit: 1
                    }
                );
            }
        }
    }
}

#[tokio::test]
async fn low_starves_while_high_work_is_waiting() {
    let config = AdmissionConfig {
        concurrency: PriorityLimits {
            high: 1,
            medium: 1,
            low: 1,
        },
        max_concurrent: 1,
        ..AdmissionConfig::default()
    };
    let queue = AdmissionQueue::new(config, green());
    let gate = Arc::new(Semaphore::new(0));
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let plan = [
        ("blocker", PriorityLevel::High),
        ("low", PriorityLevel::Low),
        ("high-1", PriorityLevel::High),
        ("high-2", PriorityLevel::High),
        ("high-3", PriorityLevel::High),
    ];
    let submits = plan.iter().map(|&(label, priority)| {
        let queue = queue.clone();
        let gate = Arc::clone(&gate);
        let order = Arc::clone(&order);
        async move {
            queue
                .submit(
                    async move {
                        order.lock().unwrap().push(label);
                        if label == "blocker" {
                            let _permit = gate.acquire().await;
                        }
                    },
                    priority,
                    None,
                    None,
                )
                .await
        }
    });

    let (outcomes, ()) = tokio::join!(join_all(submits), async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let snap = queue.snapshot();
        assert_eq!(snap.in_flight, 1);
        assert_eq!(snap.buckets[0].queued, 3);
        assert_eq!(snap.buckets[2].queued, 1);
        gate.add_permits(1);
    });

    assert!(outcomes.iter().all(Admission::is_admitted));
    assert_eq!(
        order.lock().unwrap().clone(),
        vec!["blocker", "high-1", "high-2", "high-3", "low"]
    );
    assert_eq!(queue.snapshot().in_flight, 0);
}

#[tokio::test]
async fn fifo_within_a_bucket() {
    let config = AdmissionConfig {
        max_concurrent: 1,
        ..AdmissionConfig::default()
    };
    let queue = AdmissionQueue::new(config, green());
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let submits = (0..5).map(|i| {
        let queue = queue.clone();
        let order = Arc::clone(&order);
        async move {
            queue
                .submit(
                    async move {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        order.lock().unwrap().push(i);
                    },
                    PriorityLevel::Medium,
                    None,
                    None,
                )
                .await
        }
    });
    join_all(submits).await;

    assert_eq!(order.lock().unwrap().clone(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gather_respects_concurrency_and_order() {
    let queue = AdmissionQueue::new(AdmissionConfig::default(), green());
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let works: Vec<_> = (0..10usize)
        .map(|i| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(((10 - i) * 3) as u64)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                if i % 4 == 3 {
                    Err(format!("item {i}"))
                } else {
                    Ok(i * 10)
                }
            }
        })
        .collect();

    let results = queue.gather(works, PriorityLevel::Medium, 3).await;

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(results.len(), 10);
    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(value) => assert_eq!(value, i * 10),
            Err(GatherError::Failed(msg)) => {
                assert_eq!(i % 4, 3);
                assert_eq!(msg, format!("item {i}"));
            }
            Err(GatherError::Rejected(shed)) => panic!("unexpected shed: {shed}"),
        }
    }
}

#[tokio::test]
async fn status_policy_applies_to_submissions() {
    let status = Arc::new(StaticStatus::new(SystemStatus::Red, 0.97));
    let queue = AdmissionQueue::new(AdmissionConfig::default(), status.clone());

    let low = queue.submit(async { 1 }, PriorityLevel::Low, None, None).await;
    let Admission::Rejected(shed) = low else {
        panic!("LOW must be shed under RED");
    };
    assert_eq!(shed.reason, ShedReason::Status);
    assert_eq!(shed.to_body().status_code, 503);

    let critical = queue
        .submit(async { 2 }, PriorityLevel::Low, Some(Intent::Critical), None)
        .await;
    assert_eq!(critical.into_result().unwrap(), 2);

    status.set(SystemStatus::Green, 0.1);
    assert!(
        queue
            .submit(async { 3 }, PriorityLevel::Low, None, None)
            .await
            .is_admitted()
    );
}

#[tokio::test]
async fn route_policies_drive_submissions() {
    let intents = IntentRegistry::new();
    let routes = RouteTable::new(intents.clone());
    routes.register(
        "GET /feed",
        RoutePolicy {
            priority: Some(PriorityLevel::Low),
            intent: None,
        },
    );
    routes.register(
        "POST /payments",
        RoutePolicy {
            priority: None,
            intent: Some(Intent::Critical),
        },
    );

    let status = Arc::new(StaticStatus::new(SystemStatus::Yellow, 0.85));
    let queue = AdmissionQueue::new(AdmissionConfig::default(), status).with_routes(routes);

    assert!(!queue.submit_route("GET /feed", async {}).await.is_admitted());
    assert!(queue.submit_route("POST /payments", async {}).await.is_admitted());
    assert!(queue.submit_route("GET /unlisted", async {}).await.is_admitted());
}

// ═══════════════════════════════════════════════════════════════════════
//  Task scheduler
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn recurring_task_survives_failures_until_cancelled() {
    let scheduler = TaskScheduler::new(
        SchedulerConfig {
            workers: 2,
            max_retries: 0,
        },
        IntentRegistry::new(),
    );
    scheduler.start().unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let handle = scheduler
        .schedule_recurring(
            "flaky-sweep",
            TaskPriority::Low,
            Duration::from_millis(20),
            task_fn(move || {
                let c = Arc::clone(&c);
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        Err("first run fails".to_string())
                    } else {
                        Ok(serde_json::json!(n))
                    }
                }
            }),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(calls.load(Ordering::SeqCst) >= 3);
    assert!(scheduler.stats().failed >= 1);

    assert!(scheduler.cancel(handle));
    tokio::time::sleep(Duration::from_millis(40)).await;
    let after_cancel = calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), after_cancel);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn retried_task_makes_four_attempts() {
    let scheduler = TaskScheduler::new(SchedulerConfig::default(), IntentRegistry::new());
    scheduler.start().unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let a = Arc::clone(&attempts);
    let id = scheduler
        .submit(
            "always-fails",
            TaskPriority::Critical,
            task_fn(move || {
                let a = Arc::clone(&a);
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err("backend unavailable".to_string())
                }
            }),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let info = scheduler.status(id).unwrap();
    assert_eq!(info.status, TaskStatus::Failed);
    assert_eq!(info.retry_count, 3);
    assert_eq!(info.max_retries, 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    // Critical -> High -> Normal -> Low
    assert_eq!(info.priority, TaskPriority::Low);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn custom_intent_priority_flows_into_scheduler() {
    let intents = IntentRegistry::new();
    intents.register(
        "nightly-report",
        IntentConfig {
            task_priority: TaskPriority::Low,
            ..IntentConfig::standard()
        },
    );
    let scheduler = TaskScheduler::new(SchedulerConfig::default(), intents);

    let id = scheduler
        .submit_with_intent(
            "report",
            &Intent::custom("nightly-report"),
            task_fn(|| async { Ok(serde_json::Value::Null) }),
        )
        .unwrap();
    assert_eq!(scheduler.status(id).unwrap().priority, TaskPriority::Low);
}

#[tokio::test]
async fn shutdown_drains_queued_work() {
    let scheduler = TaskScheduler::new(
        SchedulerConfig {
            workers: 2,
            ..SchedulerConfig::default()
        },
        IntentRegistry::new(),
    );
    let done = Arc::new(AtomicU32::new(0));

    let mut ids = Vec::new();
    for i in 0..8u32 {
        let d = Arc::clone(&done);
        ids.push(
            scheduler
                .submit(
                    format!("job-{i}"),
                    TaskPriority::Normal,
                    task_fn(move || {
                        let d = Arc::clone(&d);
                        async move {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            d.fetch_add(1, Ordering::SeqCst);
                            Ok(serde_json::json!(i))
                        }
                    }),
                )
                .unwrap(),
        );
    }
    let delayed = scheduler
        .schedule(
            "never",
            TaskPriority::Normal,
            Duration::from_secs(60),
            task_fn(|| async { Ok(serde_json::Value::Null) }),
        )
        .unwrap();

    scheduler.start().unwrap();
    scheduler.shutdown().await;

    assert_eq!(done.load(Ordering::SeqCst), 8);
    for id in ids {
        assert_eq!(scheduler.status(id).unwrap().status, TaskStatus::Completed);
    }
    assert!(!scheduler.cancel(delayed));
    assert_eq!(scheduler.stats().scheduled, 0);
}
