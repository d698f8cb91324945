//! Data intent vocabulary.
//!
//! An [`Intent`] is a declared requirement on a piece of data or an
//! operation.  Each intent resolves to exactly one [`IntentConfig`], the
//! bundle of policies (caching, consistency, encryption, audit, storage
//! preference, task priority) the rest of the system acts on.
//!
//! Built-in intents resolve to fixed configurations.  Custom intents must be
//! registered in an [`IntentRegistry`] before first use; resolving an unknown
//! custom name fails with [`KernelError::IntentNotRegistered`].
//!
//! ```rust
//! # use evox_kernel::intent::{Intent, IntentConfig, IntentRegistry, Consistency};
//! let registry = IntentRegistry::new();
//! registry.register("billing", IntentConfig {
//!     consistency: Consistency::Strong,
//!     audit_logging: true,
//!     ..IntentConfig::standard()
//! });
//!
//! let config = registry.resolve(&Intent::custom("billing")).unwrap();
//! assert!(config.audit_logging);
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::scheduler::TaskPriority;

// ---------------------------------------------------------------------------
// Backend kinds
// ---------------------------------------------------------------------------

/// The family of storage engine a backend belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Sql,
    KeyValue,
    NoSql,
    Columnar,
    Document,
    Memory,
    Generic,
}

impl BackendKind {
    /// All kinds, in declaration order.
    pub const ALL: [BackendKind; 7] = [
        Self::Sql,
        Self::KeyValue,
        Self::NoSql,
        Self::Columnar,
        Self::Document,
        Self::Memory,
        Self::Generic,
    ];

    /// The snake_case name used in configuration files and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sql => "sql",
            Self::KeyValue => "key_value",
            Self::NoSql => "nosql",
            Self::Columnar => "columnar",
            Self::Document => "document",
            Self::Memory => "memory",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sql" | "relational" => Ok(Self::Sql),
            "key_value" | "kv" | "cache" => Ok(Self::KeyValue),
            "nosql" => Ok(Self::NoSql),
            "columnar" | "analytics" => Ok(Self::Columnar),
            "document" => Ok(Self::Document),
            "memory" => Ok(Self::Memory),
            "generic" => Ok(Self::Generic),
            other => Err(KernelError::InvalidConfig {
                key: "backend kind".into(),
                reason: format!("unknown backend kind `{other}`"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

/// A declared data intent.
///
/// Serialized as its canonical name, so configuration files write
/// `intent = "billing"` or `intent = "sql_storage"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Intent {
    /// Transient data: aggressive caching, no consistency guarantees.
    Ephemeral,
    /// Balanced defaults.
    #[default]
    Standard,
    /// Must not be lost: strong consistency, encryption, audit.
    Critical,
    /// Pin the operation to one storage engine, with no fallback.
    Storage(BackendKind),
    /// A named intent registered at startup.
    Custom(String),
}

impl Intent {
    /// Shorthand for [`Intent::Custom`].
    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom(name.into())
    }

    /// Whether this is the built-in CRITICAL intent.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical)
    }

    /// Canonical name, used in logs and routing metadata.
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ephemeral => f.write_str("ephemeral"),
            Self::Standard => f.write_str("standard"),
            Self::Critical => f.write_str("critical"),
            Self::Storage(kind) => write!(f, "{kind}_storage"),
            Self::Custom(name) => f.write_str(name),
        }
    }
}

impl FromStr for Intent {
    type Err = std::convert::Infallible;

    /// Parse an intent name.  Built-in names are case-insensitive; the
    /// legacy aliases `lazy` and `sensitive` map to EPHEMERAL and CRITICAL.
    /// Anything unrecognised becomes a custom intent.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let intent = match lowered.as_str() {
            "ephemeral" | "lazy" => Self::Ephemeral,
            "standard" => Self::Standard,
            "critical" | "sensitive" => Self::Critical,
            other => match other
                .strip_suffix("_storage")
                .and_then(|kind| kind.parse::<BackendKind>().ok())
            {
                Some(kind) => Self::Storage(kind),
                None => Self::Custom(s.trim().to_string()),
            },
        };
        Ok(intent)
    }
}

impl Serialize for Intent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Intent {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(|never| match never {})
    }
}

// ---------------------------------------------------------------------------
// IntentConfig
// ---------------------------------------------------------------------------

/// Consistency level required by an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    None,
    Eventual,
    Strong,
}

/// The policy bundle an intent resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub consistency: Consistency,
    pub encrypt: bool,
    pub audit_logging: bool,
    pub replication_required: bool,
    /// Preferred storage engine; `None` lets the router decide.
    pub storage_engine: Option<BackendKind>,
    pub task_priority: TaskPriority,
}

impl IntentConfig {
    pub fn ephemeral() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl_secs: 5 * 60,
            consistency: Consistency::None,
            encrypt: false,
            audit_logging: false,
            replication_required: false,
            storage_engine: None,
            task_priority: TaskPriority::Low,
        }
    }

    pub fn standard() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl_secs: 60 * 60,
            consistency: Consistency::Eventual,
            encrypt: false,
            audit_logging: false,
            replication_required: false,
            storage_engine: None,
            task_priority: TaskPriority::Normal,
        }
    }

    pub fn critical() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl_secs: 30 * 60,
            consistency: Consistency::Strong,
            encrypt: true,
            audit_logging: true,
            replication_required: true,
            storage_engine: None,
            task_priority: TaskPriority::High,
        }
    }

    /// Cache lifetime for values written under this intent.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn strong_consistency(&self) -> bool {
        self.consistency == Consistency::Strong
    }
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self::standard()
    }
}

// ---------------------------------------------------------------------------
// IntentRegistry
// ---------------------------------------------------------------------------

/// Registry of custom intent configurations.
///
/// Cheaply cloneable (`Arc`-backed); clones share the same table.
#[derive(Clone, Default)]
pub struct IntentRegistry {
    custom: Arc<DashMap<String, IntentConfig>>,
}

impl IntentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a custom intent.
    pub fn register(&self, name: impl Into<String>, config: IntentConfig) {
        let name = name.into();
        tracing::info!(intent = %name, "custom intent registered");
        self.custom.insert(name, config);
    }

    /// Remove a custom intent.  Returns the removed configuration, if any.
    pub fn unregister(&self, name: &str) -> Option<IntentConfig> {
        self.custom.remove(name).map(|(_, config)| config)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.custom.contains_key(name)
    }

    /// Names of all registered custom intents, sorted.
    pub fn custom_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.custom.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Resolve an intent to its configuration.
    pub fn resolve(&self, intent: &Intent) -> Result<IntentConfig> {
        match intent {
            Intent::Ephemeral => Ok(IntentConfig::ephemeral()),
            Intent::Standard => Ok(IntentConfig::standard()),
            Intent::Critical => Ok(IntentConfig::critical()),
            Intent::Storage(kind) => Ok(IntentConfig {
                storage_engine: Some(*kind),
                ..IntentConfig::standard()
            }),
            Intent::Custom(name) => self
                .custom
                .get(name)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| KernelError::IntentNotRegistered { name: name.clone() }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
