//! System status monitor.
//!
//! Samples host CPU and memory utilisation and folds them into a three-level
//! [`SystemStatus`] plus a load factor in `[0, 1]`.  Samples are cached for a
//! short interval so that admission checks on the hot path never pay for a
//! fresh OS query.
//!
//! Monitoring must never block admission: when sampling is unavailable the
//! monitor reports [`SystemStatus::Green`] with a load factor of zero.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sysinfo::System;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Derived health of the host, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SystemStatus {
    Green,
    Yellow,
    Red,
}

impl std::fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Green => "GREEN",
            Self::Yellow => "YELLOW",
            Self::Red => "RED",
        };
        f.write_str(s)
    }
}

/// Anything that can report the current system status.
///
/// The admission queue only depends on this trait so that tests and embedders
/// can supply a fixed status.
pub trait StatusProvider: Send + Sync {
    fn status(&self) -> SystemStatus;

    /// `max(cpu, mem)` as a fraction in `[0, 1]`.
    fn load_factor(&self) -> f64;
}

/// Monitor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// How long a sample stays valid.
    pub cache_ttl_ms: u64,
    /// Percent at which the status becomes YELLOW.
    pub yellow_threshold: f64,
    /// Percent at which the status becomes RED.
    pub red_threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 1_000,
            yellow_threshold: 80.0,
            red_threshold: 95.0,
        }
    }
}

impl MonitorConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

/// Map utilisation percentages onto a status.
pub fn classify(cpu_pct: f64, mem_pct: f64, config: &MonitorConfig) -> SystemStatus {
    let peak = cpu_pct.max(mem_pct);
    if peak < config.yellow_threshold {
        SystemStatus::Green
    } else if peak < config.red_threshold {
        SystemStatus::Yellow
    } else {
        SystemStatus::Red
    }
}

/// One cached observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub status: SystemStatus,
}

impl Sample {
    const UNAVAILABLE: Sample = Sample {
        cpu_pct: 0.0,
        mem_pct: 0.0,
        status: SystemStatus::Green,
    };

    pub fn load_factor(&self) -> f64 {
        (self.cpu_pct.max(self.mem_pct) / 100.0).clamp(0.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// SystemStatusMonitor
// ---------------------------------------------------------------------------

struct MonitorState {
    system: System,
    last: Option<(Instant, Sample)>,
}

/// Host-backed [`StatusProvider`] built on `sysinfo`.
pub struct SystemStatusMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
}

impl SystemStatusMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MonitorState {
                system: System::new(),
                last: None,
            }),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Current (possibly cached) sample.
    pub fn sample(&self) -> Sample {
        let Ok(mut state) = self.state.lock() else {
            tracing::warn!("status monitor lock poisoned, reporting GREEN");
            return Sample::UNAVAILABLE;
        };

        if let Some((taken, sample)) = state.last {
            if taken.elapsed() < self.config.cache_ttl() {
                return sample;
            }
        }

        let sample = Self::take_sample(&mut state.system, &self.config);
        state.last = Some((Instant::now(), sample));
        tracing::trace!(
            cpu = sample.cpu_pct,
            mem = sample.mem_pct,
            status = %sample.status,
            "system sampled"
        );
        sample
    }

    fn take_sample(system: &mut System, config: &MonitorConfig) -> Sample {
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            return Sample::UNAVAILABLE;
        }

        let cpu_pct = f64::from(system.global_cpu_usage());
        let mem_pct = system.used_memory() as f64 / total as f64 * 100.0;
        if !cpu_pct.is_finite() || !mem_pct.is_finite() {
            return Sample::UNAVAILABLE;
        }

        Sample {
            cpu_pct,
            mem_pct,
            status: classify(cpu_pct, mem_pct, config),
        }
    }
}

impl Default for SystemStatusMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl StatusProvider for SystemStatusMonitor {
    fn status(&self) -> SystemStatus {
        self.sample().status
    }

    fn load_factor(&self) -> f64 {
        self.sample().load_factor()
    }
}

// ---------------------------------------------------------------------------
// StaticStatus
// ---------------------------------------------------------------------------

/// A settable status, for tests and for hosts that compute load elsewhere.
#[derive(Debug)]
pub struct StaticStatus {
    inner: Mutex<(SystemStatus, f64)>,
}

impl StaticStatus {
    pub fn new(status: SystemStatus, load_factor: f64) -> Self {
        Self {
            inner: Mutex::new((status, load_factor.clamp(0.0, 1.0))),
        }
    }

    pub fn green() -> Self {
        Self::new(SystemStatus::Green, 0.0)
    }

    pub fn set(&self, status: SystemStatus, load_factor: f64) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = (status, load_factor.clamp(0.0, 1.0));
        }
    }
}

impl StatusProvider for StaticStatus {
    fn status(&self) -> SystemStatus {
        self.inner
            .lock()
            .map(|g| g.0)
            .unwrap_or(SystemStatus::Green)
    }

    fn load_factor(&self) -> f64 {
        self.inner.lock().map(|g| g.1).unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
