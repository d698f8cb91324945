//! Backend registry and health monitoring.
//!
//! [`DatabaseServiceManager`] owns the list of registered storage backends
//! and their health table.  Backends start out healthy; a periodic loop
//! probes each one (bounded by a timeout) and flips the stored flag.  Probe
//! failures are logged and recorded, never propagated.
//!
//! Each backend also has a [`CircuitBreaker`] fed by the gateway's call
//! outcomes.  An open breaker makes the backend count as unhealthy until
//! its recovery timeout passes, without waiting for the next sweep.
//!
//! Every change that can alter a routing decision (registration,
//! deregistration, health transition, breaker transition) bumps the
//! registry *epoch* and is published on the [`HealthBus`].  The router
//! compares epochs to decide when its decision cache is stale.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use evox_kernel::BackendKind;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::StorageBackend;
use crate::breaker::{CircuitBreaker, CircuitState};
use crate::events::{HealthBus, HealthChange, HealthEvent};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds between health sweeps.
    pub check_interval_secs: u64,
    /// Upper bound on a single probe.
    pub probe_timeout_ms: u64,
    /// Consecutive failed calls that open a backend's circuit.
    pub failure_threshold: u32,
    /// How long an open circuit stays open before a trial call.
    pub recovery_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            probe_timeout_ms: 5_000,
            failure_threshold: 3,
            recovery_timeout_ms: 30_000,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(1))
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    fn breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(self.failure_threshold, self.recovery_timeout())
    }
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A backend as held by the registry.
pub struct RegisteredBackend {
    pub name: String,
    pub kind: BackendKind,
    pub backend: Arc<dyn StorageBackend>,
}

/// Point-in-time view of one registered backend.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub kind: BackendKind,
    /// Outcome of the last probe.
    pub healthy: bool,
    pub circuit: CircuitState,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
struct HealthState {
    healthy: bool,
    last_check: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl HealthState {
    fn optimistic() -> Self {
        Self {
            healthy: true,
            last_check: None,
            last_error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct ManagerInner {
    config: HealthConfig,
    /// Registration order is the preference order among same-kind backends.
    services: RwLock<Vec<Arc<RegisteredBackend>>>,
    health: DashMap<String, HealthState>,
    breakers: DashMap<String, CircuitBreaker>,
    epoch: AtomicU64,
    bus: HealthBus,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Registry of storage backends with periodic health probing.
///
/// Cheaply cloneable; clones share the same registry and health table.
#[derive(Clone)]
pub struct DatabaseServiceManager {
    inner: Arc<ManagerInner>,
}

impl DatabaseServiceManager {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                services: RwLock::new(Vec::new()),
                health: DashMap::new(),
                breakers: DashMap::new(),
                epoch: AtomicU64::new(0),
                bus: HealthBus::default(),
                monitor: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.inner.config
    }

    /// Register a backend under `name`.
    ///
    /// Re-registering an existing name replaces the backend in place, keeping
    /// its position in the preference order.  The backend is considered
    /// healthy until the first probe says otherwise.
    pub fn register(&self, name: impl Into<String>, backend: Arc<dyn StorageBackend>, kind: BackendKind) {
        let name = name.into();
        let entry = Arc::new(RegisteredBackend {
            name: name.clone(),
            kind,
            backend,
        });
        {
            let mut services = self.write_services();
            match services.iter_mut().find(|s| s.name == name) {
                Some(slot) => *slot = entry,
                None => services.push(entry),
            }
        }
        self.inner.health.insert(name.clone(), HealthState::optimistic());
        self.inner.breakers.insert(name.clone(), self.inner.config.breaker());

        let epoch = self.bump_epoch();
        info!(backend = %name, %kind, epoch, "storage backend registered");
        self.publish(&name, kind, HealthChange::Registered, epoch);
    }

    /// Remove a backend.  Returns whether it was registered.
    pub fn deregister(&self, name: &str) -> bool {
        let removed = {
            let mut services = self.write_services();
            services
                .iter()
                .position(|s| s.name == name)
                .map(|idx| services.remove(idx))
        };
        let Some(removed) = removed else {
            return false;
        };
        self.inner.health.remove(name);
        self.inner.breakers.remove(name);

        let epoch = self.bump_epoch();
        info!(backend = %name, epoch, "storage backend deregistered");
        self.publish(name, removed.kind, HealthChange::Deregistered, epoch);
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredBackend>> {
        self.read_services().iter().find(|s| s.name == name).cloned()
    }

    /// Backends of one kind, in registration order, healthy or not.
    pub fn get_by_type(&self, kind: BackendKind) -> Vec<Arc<RegisteredBackend>> {
        self.read_services()
            .iter()
            .filter(|s| s.kind == kind)
            .cloned()
            .collect()
    }

    /// Healthy backends of every kind, in registration order.
    pub fn get_healthy(&self) -> Vec<Arc<RegisteredBackend>> {
        self.read_services()
            .iter()
            .filter(|s| self.is_healthy(&s.name))
            .cloned()
            .collect()
    }

    /// First healthy backend of `kind` (or of any kind when `None`).
    pub fn first_healthy(&self, kind: Option<BackendKind>) -> Option<Arc<RegisteredBackend>> {
        self.read_services()
            .iter()
            .filter(|s| kind.is_none_or(|k| s.kind == k))
            .find(|s| self.is_healthy(&s.name))
            .cloned()
    }

    /// Whether `name` may serve traffic: its last health check passed and its
    /// circuit is not open.
    pub fn is_healthy(&self, name: &str) -> bool {
        self.inner.health.get(name).is_some_and(|h| h.healthy)
            && self
                .inner
                .breakers
                .get(name)
                .is_none_or(|b| b.allows(Instant::now()))
    }

    pub fn circuit_state(&self, name: &str) -> Option<CircuitState> {
        self.inner.breakers.get(name).map(|b| b.state())
    }

    /// Feed one call outcome into `name`'s circuit breaker.
    ///
    /// `failed` should be true only for failures that say the backend is
    /// unreachable (timeouts, refused connections); a constraint violation
    /// is a working backend.
    pub fn record_call(&self, name: &str, failed: bool) {
        let transition = {
            let Some(mut breaker) = self.inner.breakers.get_mut(name) else {
                return;
            };
            if failed {
                breaker.on_failure(Instant::now())
            } else {
                breaker.on_success()
            }
        };
        if let Some(state) = transition {
            self.circuit_changed(name, state);
        }
    }

    /// Move open circuits whose recovery timeout has passed to half-open.
    ///
    /// Called by the router before it reads the epoch, so a half-open
    /// backend gets its trial call on the next routing decision.
    pub fn poll_circuits(&self) {
        let now = Instant::now();
        let moved: Vec<(String, CircuitState)> = self
            .inner
            .breakers
            .iter_mut()
            .filter_map(|mut entry| entry.poll(now).map(|state| (entry.key().clone(), state)))
            .collect();
        for (name, state) in moved {
            self.circuit_changed(&name, state);
        }
    }

    pub fn len(&self) -> usize {
        self.read_services().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current registry epoch.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<HealthEvent>> {
        self.inner.bus.subscribe()
    }

    pub fn snapshot(&self) -> Vec<ServiceInfo> {
        self.read_services()
            .iter()
            .map(|s| {
                let state = self
                    .inner
                    .health
                    .get(&s.name)
                    .map(|h| h.value().clone())
                    .unwrap_or_else(HealthState::optimistic);
                ServiceInfo {
                    name: s.name.clone(),
                    kind: s.kind,
                    healthy: state.healthy,
                    circuit: self.circuit_state(&s.name).unwrap_or(CircuitState::Closed),
                    last_check: state.last_check,
                    last_error: state.last_error,
                }
            })
            .collect()
    }

    /// Probe every backend once, concurrently, and record the outcome.
    ///
    /// Returns the number of backends whose health flag changed.
    pub async fn check_all(&self) -> usize {
        let services: Vec<_> = self.read_services().clone();
        let timeout = self.inner.config.probe_timeout();

        let probes = services.iter().map(|service| async move {
            let check = AssertUnwindSafe(async { service.backend.health_check().await }).catch_unwind();
            let outcome = match tokio::time::timeout(timeout, check).await {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(e))) => Err(e.to_string()),
                Ok(Err(_)) => Err("health check panicked".to_string()),
                Err(_) => Err(format!(
                    "health probe timed out after {} ms",
                    timeout.as_millis()
                )),
            };
            (service, outcome)
        });

        let mut changed = 0;
        for (service, outcome) in futures::future::join_all(probes).await {
            if self.record(service, outcome) {
                changed += 1;
            }
        }
        debug!(backends = services.len(), changed, "health sweep complete");
        changed
    }

    /// Start the periodic health loop.  Calling it again while the loop is
    /// running is a no-op.
    pub fn start_health_monitoring(&self) {
        let mut slot = match self.inner.monitor.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.check_interval();
        info!(interval_secs = interval.as_secs(), "health monitoring started");

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                DatabaseServiceManager { inner }.check_all().await;
            }
        }));
    }

    pub fn stop_health_monitoring(&self) {
        let handle = match self.inner.monitor.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
            info!("health monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        match self.inner.monitor.lock() {
            Ok(slot) => slot.as_ref().is_some_and(|h| !h.is_finished()),
            Err(_) => false,
        }
    }

    // -- internals ----------------------------------------------------------

    fn record(&self, service: &RegisteredBackend, outcome: Result<(), String>) -> bool {
        let now = Utc::now();
        // Deregistered while the probe was in flight.
        let Some(mut state) = self.inner.health.get_mut(&service.name) else {
            return false;
        };
        let was_healthy = state.healthy;
        state.last_check = Some(now);
        match &outcome {
            Ok(()) => {
                state.healthy = true;
                state.last_error = None;
            }
            Err(error) => {
                state.healthy = false;
                state.last_error = Some(error.clone());
            }
        }
        let is_healthy = state.healthy;
        drop(state);

        if was_healthy == is_healthy {
            return false;
        }

        let epoch = self.bump_epoch();
        let change = match outcome {
            Ok(()) => {
                info!(backend = %service.name, kind = %service.kind, epoch, "storage backend recovered");
                HealthChange::Recovered
            }
            Err(error) => {
                warn!(backend = %service.name, kind = %service.kind, epoch, %error, "storage backend unhealthy");
                HealthChange::Failed { error }
            }
        };
        self.publish(&service.name, service.kind, change, epoch);
        true
    }

    fn circuit_changed(&self, name: &str, state: CircuitState) {
        let Some(service) = self.get(name) else {
            return;
        };
        let epoch = self.bump_epoch();
        match state {
            CircuitState::Open => warn!(
                backend = %name,
                kind = %service.kind,
                epoch,
                threshold = self.inner.config.failure_threshold,
                "circuit opened"
            ),
            CircuitState::HalfOpen => info!(backend = %name, epoch, "circuit half-open, next call is a trial"),
            CircuitState::Closed => info!(backend = %name, epoch, "circuit closed"),
        }
        self.publish(name, service.kind, HealthChange::Circuit { state }, epoch);
    }

    fn bump_epoch(&self) -> u64 {
        self.inner.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn publish(&self, name: &str, kind: BackendKind, change: HealthChange, epoch: u64) {
        self.inner.bus.publish(HealthEvent {
            backend: name.to_string(),
            kind,
            change,
            epoch,
            timestamp: Utc::now(),
        });
    }

    fn read_services(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<RegisteredBackend>>> {
        match self.inner.services.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_services(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<RegisteredBackend>>> {
        match self.inner.services.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for DatabaseServiceManager {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
