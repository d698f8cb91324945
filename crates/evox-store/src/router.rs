//! Intent-based backend routing.
//!
//! [`IntentRouter`] maps a `(model, operation, intent)` triple to a healthy
//! backend.  The intent picks a [`RouteStrategy`] from a closed dispatch
//! table; intents with no dedicated rule (custom intents) fall back to an
//! operation-based strategy.  Each strategy is a preference chain over
//! backend kinds, walked against the manager's registry in registration
//! order:
//!
//! | Strategy    | Chain                                   |
//! |-------------|-----------------------------------------|
//! | `Critical`  | SQL, then any healthy backend           |
//! | `Standard`  | intent's engine (default NoSQL), then any |
//! | `Ephemeral` | key-value, memory, then any             |
//! | `Pinned(k)` | `k` only                                |
//! | `Read`, `Write`, `Generic` | `Critical` if strongly consistent, else `Standard` |
//!
//! The operation strategies only label the decision; they share one
//! placement chain so a read lands where the matching write went.
//!
//! Falling through to "any" yields a [`DegradedBackend`].  Decisions are
//! cached per triple and dropped whenever the registry epoch moves.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use evox_kernel::{BackendKind, Consistency, Intent, IntentConfig, IntentRegistry};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::{DegradedBackend, Model, Operation, StorageBackend};
use crate::error::{StoreError, StoreResult};
use crate::manager::DatabaseServiceManager;
use crate::seal::Sealer;

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Routing rule selected for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStrategy {
    Critical,
    Standard,
    Ephemeral,
    Pinned(BackendKind),
    Read,
    Write,
    Generic,
}

impl RouteStrategy {
    /// Dispatch table: intent rule first, then operation rule.
    pub fn select(intent: &Intent, operation: Operation) -> Self {
        match intent {
            Intent::Critical => Self::Critical,
            Intent::Standard => Self::Standard,
            Intent::Ephemeral => Self::Ephemeral,
            Intent::Storage(kind) => Self::Pinned(*kind),
            Intent::Custom(_) => match operation {
                Operation::Read => Self::Read,
                Operation::Create | Operation::Update | Operation::Delete => Self::Write,
                Operation::Query | Operation::Transaction => Self::Generic,
            },
        }
    }

    /// Preference chain for this strategy under `config`.
    fn chain(self, config: &IntentConfig) -> Vec<Candidate> {
        use Candidate::{Any, Kind};
        match self {
            Self::Critical => vec![Kind(BackendKind::Sql), Any],
            Self::Standard => vec![
                Kind(config.storage_engine.unwrap_or(BackendKind::NoSql)),
                Any,
            ],
            Self::Ephemeral => vec![Kind(BackendKind::KeyValue), Kind(BackendKind::Memory), Any],
            Self::Pinned(kind) => vec![Kind(kind)],
            Self::Read | Self::Write | Self::Generic if config.strong_consistency() => {
                Self::Critical.chain(config)
            }
            Self::Read | Self::Write | Self::Generic => Self::Standard.chain(config),
        }
    }
}

impl fmt::Display for RouteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => f.write_str("critical"),
            Self::Standard => f.write_str("standard"),
            Self::Ephemeral => f.write_str("ephemeral"),
            Self::Pinned(kind) => write!(f, "pinned:{kind}"),
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
            Self::Generic => f.write_str("generic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidate {
    Kind(BackendKind),
    Any,
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Durability {
    Low,
    Normal,
    High,
}

impl From<Consistency> for Durability {
    fn from(consistency: Consistency) -> Self {
        match consistency {
            Consistency::None => Self::Low,
            Consistency::Eventual => Self::Normal,
            Consistency::Strong => Self::High,
        }
    }
}

/// Annotations describing a routing decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteMetadata {
    pub intent: String,
    pub consistency: Consistency,
    pub durability: Durability,
    pub service_type: BackendKind,
    /// Served by a fallback backend outside the preferred kinds.
    pub degraded: bool,
    /// Cache lifetime for values under this intent, when caching is on.
    pub ttl_secs: Option<u64>,
}

/// A cached routing decision.
pub struct RouteDecision {
    pub backend_name: String,
    /// The backend to call; a [`DegradedBackend`] when `metadata.degraded`.
    pub backend: Arc<dyn StorageBackend>,
    /// Backend method serving the operation.
    pub method: &'static str,
    pub strategy: RouteStrategy,
    pub intent: Intent,
    pub config: IntentConfig,
    pub metadata: RouteMetadata,
    /// Registry epoch the decision was taken at.
    pub epoch: u64,
}

impl fmt::Debug for RouteDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteDecision")
            .field("backend_name", &self.backend_name)
            .field("method", &self.method)
            .field("strategy", &self.strategy)
            .field("intent", &self.intent)
            .field("metadata", &self.metadata)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// A record about to be written, addressed by its key.
#[derive(Debug, Clone)]
pub struct Payload<'a> {
    pub key: &'a str,
    pub value: Value,
}

/// Outcome of [`IntentRouter::route_named`].
#[derive(Debug, Clone)]
pub struct RoutingResult {
    pub decision: Arc<RouteDecision>,
    /// The payload as it should be written (sealed when the intent requires
    /// encryption and a key is configured).
    pub payload: Option<Value>,
    pub sealed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    model: String,
    operation: Operation,
    intent: Intent,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Selects a backend for each persistence operation.
pub struct IntentRouter {
    manager: DatabaseServiceManager,
    intents: IntentRegistry,
    sealer: Option<Arc<Sealer>>,
    allow_fallback: bool,
    cache: DashMap<RouteKey, Arc<RouteDecision>>,
    seen_epoch: AtomicU64,
}

impl IntentRouter {
    pub fn new(manager: DatabaseServiceManager, intents: IntentRegistry) -> Self {
        Self {
            seen_epoch: AtomicU64::new(manager.epoch()),
            manager,
            intents,
            sealer: None,
            allow_fallback: true,
            cache: DashMap::new(),
        }
    }

    #[must_use]
    pub fn with_sealer(mut self, sealer: Arc<Sealer>) -> Self {
        self.sealer = Some(sealer);
        self
    }

    /// When disabled, strategies never fall through to "any healthy backend".
    #[must_use]
    pub fn with_fallback(mut self, allow: bool) -> Self {
        self.allow_fallback = allow;
        self
    }

    pub fn manager(&self) -> &DatabaseServiceManager {
        &self.manager
    }

    pub fn intents(&self) -> &IntentRegistry {
        &self.intents
    }

    pub fn sealer(&self) -> Option<&Arc<Sealer>> {
        self.sealer.as_ref()
    }

    /// Route an operation on model `M`.
    pub fn route<M: Model>(
        &self,
        operation: Operation,
        intent: Option<&Intent>,
        data: Option<Payload<'_>>,
    ) -> StoreResult<RoutingResult> {
        self.route_named(M::NAME, M::declared_intent(), operation, intent, data)
    }

    /// Route an operation on the collection `model`.
    ///
    /// The effective intent is `intent`, else `declared`, else STANDARD.
    pub fn route_named(
        &self,
        model: &str,
        declared: Option<Intent>,
        operation: Operation,
        intent: Option<&Intent>,
        data: Option<Payload<'_>>,
    ) -> StoreResult<RoutingResult> {
        let intent = intent.cloned().or(declared).unwrap_or_default();
        let decision = self.decide(model, operation, intent)?;

        let (payload, sealed) = match data {
            Some(Payload { key, value }) => {
                let (value, sealed) = self.transform(model, key, value, &decision)?;
                (Some(value), sealed)
            }
            None => (None, false),
        };

        Ok(RoutingResult {
            decision,
            payload,
            sealed,
        })
    }

    /// Drop every cached decision.
    pub fn invalidate(&self) {
        self.cache.clear();
        debug!("route cache cleared");
    }

    /// Drop cached decisions for one model.
    pub fn invalidate_model(&self, model: &str) {
        self.cache.retain(|key, _| key.model != model);
        debug!(model, "route cache entries dropped");
    }

    pub fn cached_routes(&self) -> usize {
        self.cache.len()
    }

    // -- internals ----------------------------------------------------------

    fn decide(&self, model: &str, operation: Operation, intent: Intent) -> StoreResult<Arc<RouteDecision>> {
        self.manager.poll_circuits();
        let epoch = self.manager.epoch();
        if self.seen_epoch.swap(epoch, Ordering::AcqRel) != epoch {
            self.invalidate();
        }

        // Resolved on every call: custom intents can be unregistered or
        // replaced after a decision was cached.
        let config = self.intents.resolve(&intent)?;
        let key = RouteKey {
            model: model.to_string(),
            operation,
            intent,
        };
        if let Some(hit) = self.cache.get(&key) {
            if hit.epoch == epoch && hit.config == config {
                debug!(model, %operation, intent = %key.intent, backend = %hit.backend_name, "route cache hit");
                return Ok(Arc::clone(hit.value()));
            }
        }

        let strategy = RouteStrategy::select(&key.intent, operation);
        let chain = strategy.chain(&config);

        let mut chosen = None;
        for (position, candidate) in chain.iter().enumerate() {
            let found = match candidate {
                Candidate::Kind(kind) => self.manager.first_healthy(Some(*kind)),
                Candidate::Any if self.allow_fallback => self.manager.first_healthy(None),
                Candidate::Any => None,
            };
            if let Some(found) = found {
                chosen = Some((found, *candidate == Candidate::Any && position > 0));
                break;
            }
        }

        let Some((registered, degraded)) = chosen else {
            warn!(model, %operation, intent = %key.intent, %strategy, "no healthy backend");
            return Err(StoreError::NoHealthyBackend {
                model: model.to_string(),
                operation,
                intent: key.intent.name(),
            });
        };

        let backend: Arc<dyn StorageBackend> = if degraded {
            warn!(
                model,
                %operation,
                intent = %key.intent,
                backend = %registered.name,
                kind = %registered.kind,
                "preferred backends unhealthy, routing degraded"
            );
            Arc::new(DegradedBackend::new(
                Arc::clone(&registered.backend),
                key.intent.name(),
            ))
        } else {
            Arc::clone(&registered.backend)
        };

        let decision = Arc::new(RouteDecision {
            backend_name: registered.name.clone(),
            backend,
            method: operation.method(),
            strategy,
            metadata: RouteMetadata {
                intent: key.intent.name(),
                consistency: config.consistency,
                durability: config.consistency.into(),
                service_type: registered.kind,
                degraded,
                ttl_secs: config.cache_enabled.then_some(config.cache_ttl_secs),
            },
            intent: key.intent.clone(),
            config,
            epoch,
        });
        debug!(
            model,
            %operation,
            intent = %key.intent,
            %strategy,
            backend = %decision.backend_name,
            "route decided"
        );
        self.cache.insert(key, Arc::clone(&decision));
        Ok(decision)
    }

    fn transform(
        &self,
        model: &str,
        key: &str,
        value: Value,
        decision: &RouteDecision,
    ) -> StoreResult<(Value, bool)> {
        if !decision.config.encrypt {
            return Ok((value, false));
        }
        match &self.sealer {
            Some(sealer) => Ok((sealer.seal(model, key, &value)?, true)),
            None => {
                warn!(
                    model,
                    key,
                    intent = %decision.intent,
                    "intent requires encryption but no key is configured, storing plain"
                );
                Ok((value, false))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
