//! Runtime configuration.
//!
//! The whole runtime is driven by one [`EvoxConfig`] snapshot loaded from a
//! TOML file at startup.  Every section is optional and falls back to the
//! component's defaults.
//!
//! ```toml
//! log_level = "info"
//! log_format = "json"
//! encryption_key_env = "EVOX_ENCRYPTION_KEY"
//!
//! [admission.queue_limits]
//! high = 50
//! medium = 100
//! low = 200
//!
//! [backends.primary]
//! kind = "sql"
//! driver = "sqlite"
//! path = "data/evox.db"
//!
//! [backends.cache]
//! kind = "key_value"
//! driver = "memory"
//!
//! [intents.billing]
//! consistency = "strong"
//! encrypt = true
//! task_priority = "high"
//!
//! [routes."POST /orders"]
//! priority = "high"
//!
//! [routes."POST /invoices"]
//! intent = "billing"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use evox_kernel::{
    AdmissionConfig, BackendKind, Intent, IntentConfig, MonitorConfig, RoutePolicy,
    SchedulerConfig,
};
use evox_store::{GatewayConfig, HealthConfig};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Driver {
    Memory,
    Sqlite,
}

/// One `[backends.<name>]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDecl {
    pub kind: BackendKind,
    pub driver: Driver,
    /// Database file for the `sqlite` driver.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvoxConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub log_format: LogFormat,
    /// Environment variable holding the base64 sealing key.
    pub encryption_key_env: Option<String>,
    pub monitor: MonitorConfig,
    pub admission: AdmissionConfig,
    pub scheduler: SchedulerConfig,
    pub health: HealthConfig,
    pub gateway: GatewayConfig,
    /// Kept in file order: backends register, and are tried, in the order
    /// they are declared.
    pub backends: IndexMap<String, BackendDecl>,
    pub intents: IndexMap<String, IntentConfig>,
    pub routes: IndexMap<String, RoutePolicy>,
}

impl Default for EvoxConfig {
    fn default() -> Self {
        let mut backends = IndexMap::new();
        backends.insert(
            "memory".to_string(),
            BackendDecl {
                kind: BackendKind::Memory,
                driver: Driver::Memory,
                path: None,
            },
        );
        Self {
            log_level: "info".into(),
            log_format: LogFormat::default(),
            encryption_key_env: None,
            monitor: MonitorConfig::default(),
            admission: AdmissionConfig::default(),
            scheduler: SchedulerConfig::default(),
            health: HealthConfig::default(),
            gateway: GatewayConfig::default(),
            backends,
            intents: IndexMap::new(),
            routes: IndexMap::new(),
        }
    }
}

impl EvoxConfig {
    /// Load from `path`, or return defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::parse(&text)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitor.yellow_threshold >= self.monitor.red_threshold {
            bail!(
                "monitor.yellow_threshold ({}) must be below monitor.red_threshold ({})",
                self.monitor.yellow_threshold,
                self.monitor.red_threshold
            );
        }
        if self.scheduler.workers == 0 {
            bail!("scheduler.workers must be at least 1");
        }
        if self.backends.is_empty() {
            bail!("at least one [backends.<name>] table is required");
        }
        for (name, decl) in &self.backends {
            if decl.driver == Driver::Sqlite && decl.path.is_none() {
                bail!("backend `{name}` uses the sqlite driver but has no path");
            }
        }
        for name in self.intents.keys() {
            let parsed: Intent = name.parse().unwrap_or_else(|never| match never {});
            if !matches!(parsed, Intent::Custom(_)) {
                bail!("intent `{name}` shadows a built-in intent");
            }
        }
        for (route, policy) in &self.routes {
            if route.split_once(' ').is_none_or(|(method, path)| {
                method.is_empty() || !path.starts_with('/')
            }) {
                bail!("route `{route}` must look like \"METHOD /path\"");
            }
            if let Some(Intent::Custom(name)) = &policy.intent {
                if !self.intents.contains_key(name) {
                    bail!("route `{route}` names undeclared intent `{name}`");
                }
            }
        }
        Ok(())
    }
}
