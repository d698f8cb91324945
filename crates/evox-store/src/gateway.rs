//! Persistence gateway.
//!
//! [`PersistenceGateway`] is the one entry point application code uses to
//! reach storage: `save`, `get`, `delete` and `query` on [`Model`] types.
//! Each call is routed by the [`IntentRouter`], bounded by a timeout, and
//! any backend failure is translated into [`StoreError::Backend`] with a
//! [`FailureKind`](crate::error::FailureKind) from the fixed vocabulary.
//!
//! Reads go through a [`RecordCache`] when the intent enables caching.
//! Entries are keyed by the backend that served them; writes and deletes
//! drop the key on every backend.  Each call outcome feeds the serving
//! backend's circuit breaker, so a backend that keeps timing out is taken
//! out of rotation before the next health sweep.  Intents with
//! `audit_logging` emit one event per operation on the `evox::audit`
//! target.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use evox_kernel::{Intent, IntentRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::backend::{Model, Operation, Query};
use crate::cache::RecordCache;
use crate::classify::{Classification, classify};
use crate::error::{FailureKind, StoreError, StoreResult};
use crate::manager::DatabaseServiceManager;
use crate::router::{IntentRouter, Payload, RouteDecision};
use crate::seal::Sealer;

/// Audit event target.
pub const AUDIT_TARGET: &str = "evox::audit";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Upper bound on a single backend call.
    pub operation_timeout_ms: u64,
    /// Maximum number of cached records.
    pub cache_capacity: u64,
    /// Let strategies fall through to any healthy backend.
    pub allow_degraded_fallback: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 5_000,
            cache_capacity: 10_000,
            allow_degraded_fallback: true,
        }
    }
}

impl GatewayConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms.max(1))
    }
}

/// Where a record ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stored {
    pub key: String,
    pub backend: String,
    pub degraded: bool,
    pub sealed: bool,
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

pub struct PersistenceGateway {
    router: IntentRouter,
    cache: RecordCache,
    config: GatewayConfig,
}

impl PersistenceGateway {
    pub fn new(manager: DatabaseServiceManager, intents: IntentRegistry, config: GatewayConfig) -> Self {
        let router =
            IntentRouter::new(manager, intents).with_fallback(config.allow_degraded_fallback);
        Self {
            router,
            cache: RecordCache::new(config.cache_capacity),
            config,
        }
    }

    /// Seal payloads of intents that require encryption.
    #[must_use]
    pub fn with_sealer(mut self, sealer: Arc<Sealer>) -> Self {
        self.router = self.router.with_sealer(sealer);
        self
    }

    pub fn router(&self) -> &IntentRouter {
        &self.router
    }

    pub fn manager(&self) -> &DatabaseServiceManager {
        self.router.manager()
    }

    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Insert or replace `record`.
    pub async fn save<M: Model>(&self, record: &M, intent: Option<&Intent>) -> StoreResult<Stored> {
        let key = record.key();
        let value = serde_json::to_value(record)?;
        let routed = self.router.route::<M>(
            Operation::Create,
            intent,
            Some(Payload { key: &key, value }),
        )?;
        let decision = &routed.decision;
        let payload = routed.payload.unwrap_or(Value::Null);

        self.call(
            decision,
            M::NAME,
            Operation::Create,
            decision.backend.write(M::NAME, &key, payload),
        )
        .await?;
        self.forget(M::NAME, &key).await;
        self.audit(decision, M::NAME, &key, Operation::Create);

        Ok(Stored {
            key,
            backend: decision.backend_name.clone(),
            degraded: decision.metadata.degraded,
            sealed: routed.sealed,
        })
    }

    pub async fn get<M: Model>(&self, key: &str, intent: Option<&Intent>) -> StoreResult<Option<M>> {
        let routed = self.router.route::<M>(Operation::Read, intent, None)?;
        let decision = &routed.decision;
        let caching = decision.config.cache_enabled;

        if caching {
            if let Some(cached) = self.cache.get(&decision.backend_name, M::NAME, key).await {
                self.audit(decision, M::NAME, key, Operation::Read);
                return Ok(Some(serde_json::from_value(cached)?));
            }
        }

        let found = self
            .call(
                decision,
                M::NAME,
                Operation::Read,
                decision.backend.read(M::NAME, key),
            )
            .await?;
        self.audit(decision, M::NAME, key, Operation::Read);

        let Some(stored) = found else {
            return Ok(None);
        };
        let value = self.open(M::NAME, key, stored)?;
        if caching {
            self.cache
                .insert(
                    &decision.backend_name,
                    M::NAME,
                    key,
                    value.clone(),
                    decision.config.cache_ttl(),
                )
                .await;
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    /// Remove a record.  Returns whether it existed.
    pub async fn delete<M: Model>(&self, key: &str, intent: Option<&Intent>) -> StoreResult<bool> {
        let routed = self.router.route::<M>(Operation::Delete, intent, None)?;
        let decision = &routed.decision;

        let existed = self
            .call(
                decision,
                M::NAME,
                Operation::Delete,
                decision.backend.delete(M::NAME, key),
            )
            .await?;
        self.forget(M::NAME, key).await;
        self.audit(decision, M::NAME, key, Operation::Delete);
        Ok(existed)
    }

    /// Start a query over `M`'s collection.
    pub fn query<M: Model>(&self, intent: Option<&Intent>) -> QueryBuilder<'_, M> {
        QueryBuilder {
            gateway: self,
            intent: intent.cloned(),
            query: Query::new(),
            _model: PhantomData,
        }
    }

    /// Stop background work and drop cached state.
    pub fn shutdown(&self) {
        self.manager().stop_health_monitoring();
        self.router.invalidate();
        self.cache.invalidate_all();
        info!("persistence gateway shut down");
    }

    // -- internals ----------------------------------------------------------

    async fn run_query<M: Model>(&self, intent: Option<&Intent>, query: Query) -> StoreResult<Vec<M>> {
        query.validate()?;
        let routed = self.router.route::<M>(Operation::Query, intent, None)?;
        let decision = &routed.decision;

        // Sealed documents cannot be filtered by the backend.
        let sealed = decision.config.encrypt && self.router.sealer().is_some();
        let pushed = if sealed { Query::new() } else { query.clone() };

        let rows = self
            .call(
                decision,
                M::NAME,
                Operation::Query,
                decision.backend.query(M::NAME, &pushed),
            )
            .await?;
        self.audit(decision, M::NAME, "*", Operation::Query);

        let rows = if sealed {
            let opened = rows
                .into_iter()
                .map(|row| match Sealer::sealed_key(&row).map(str::to_string) {
                    Some(key) => self.open(M::NAME, &key, row),
                    None => Ok(row),
                })
                .collect::<StoreResult<Vec<_>>>()?;
            query.apply(opened)
        } else {
            rows
        };

        rows.into_iter()
            .map(|row| serde_json::from_value(row).map_err(Into::into))
            .collect()
    }

    /// Drop cached copies of `model:key` from every backend.
    async fn forget(&self, model: &str, key: &str) {
        for service in self.manager().snapshot() {
            self.cache.invalidate(&service.name, model, key).await;
        }
    }

    fn open(&self, model: &str, key: &str, value: Value) -> StoreResult<Value> {
        if !Sealer::is_sealed(&value) {
            return Ok(value);
        }
        match self.router.sealer() {
            Some(sealer) => sealer.open(model, key, value),
            None => Err(StoreError::Crypto(format!(
                "record `{model}:{key}` is sealed but no key is configured"
            ))),
        }
    }

    /// Await a backend call under the operation timeout, report the outcome
    /// to the backend's circuit breaker and translate any failure.
    async fn call<T, F>(
        &self,
        decision: &RouteDecision,
        model: &str,
        operation: Operation,
        call: F,
    ) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let timeout = self.config.operation_timeout();
        let outcome = match tokio::time::timeout(timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(StoreError::Timeout {
                what: format!("{} on `{}`", decision.method, decision.backend_name),
                after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        };
        let outcome = outcome.map_err(|err| translate(err, decision, model, operation));
        let unreachable = matches!(
            outcome,
            Err(StoreError::Backend {
                kind: FailureKind::ConnectionTimeout,
                ..
            })
        );
        self.manager().record_call(&decision.backend_name, unreachable);
        outcome
    }

    fn audit(&self, decision: &RouteDecision, model: &str, key: &str, operation: Operation) {
        if decision.config.audit_logging {
            info!(
                target: AUDIT_TARGET,
                model,
                key,
                %operation,
                intent = %decision.intent,
                backend = %decision.backend_name,
                degraded = decision.metadata.degraded,
                "persistence operation"
            );
        }
    }
}

/// Map a raw backend error onto [`StoreError::Backend`].
fn translate(err: StoreError, decision: &RouteDecision, model: &str, operation: Operation) -> StoreError {
    if matches!(err, StoreError::Backend { .. } | StoreError::InvalidArgument(_)) {
        return err;
    }
    let Classification { kind, constraint } = classify(&err);
    warn!(
        model,
        %operation,
        intent = %decision.intent,
        backend = %decision.backend_name,
        failure = %kind,
        error = %err,
        "backend operation failed"
    );
    StoreError::Backend {
        kind,
        model: model.to_string(),
        operation,
        intent: decision.intent.name(),
        backend: decision.backend_name.clone(),
        constraint,
        message: err.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Query builder
// ---------------------------------------------------------------------------

/// Fluent query over one model's collection.
pub struct QueryBuilder<'g, M> {
    gateway: &'g PersistenceGateway,
    intent: Option<Intent>,
    query: Query,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> QueryBuilder<'_, M> {
    #[must_use]
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query = self.query.filter(field, value);
        self
    }

    #[must_use]
    pub fn limit(mut self, count: usize) -> Self {
        self.query = self.query.limit(count);
        self
    }

    #[must_use]
    pub fn offset(mut self, count: usize) -> Self {
        self.query = self.query.offset(count);
        self
    }

    pub async fn all(self) -> StoreResult<Vec<M>> {
        self.gateway.run_query(self.intent.as_ref(), self.query).await
    }

    pub async fn first(self) -> StoreResult<Option<M>> {
        let query = self.query.limit(1);
        let mut found = self.gateway.run_query::<M>(self.intent.as_ref(), query).await?;
        Ok(if found.is_empty() { None } else { Some(found.swap_remove(0)) })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use evox_kernel::BackendKind;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        body: String,
    }

    impl Model for Note {
        const NAME: &'static str = "Note";

        fn key(&self) -> String {
            self.id.clone()
        }
    }

    fn note(id: &str, body: &str) -> Note {
        Note {
            id: id.into(),
            body: body.into(),
        }
    }

    fn gateway() -> (PersistenceGateway, Arc<MemoryBackend>) {
        let manager = DatabaseServiceManager::default();
        let docs = Arc::new(MemoryBackend::new("docs", BackendKind::NoSql));
        manager.register("docs", docs.clone(), BackendKind::NoSql);
        let gateway = PersistenceGateway::new(manager, IntentRegistry::new(), GatewayConfig::default());
        (gateway, docs)
    }

    #[tokio::test]
    async fn save_get_delete() {
        let (gateway, docs) = gateway();
        let stored = gateway.save(&note("n1", "hello"), None).await.unwrap();
        assert_eq!(stored.backend, "docs");
        assert!(!stored.degraded);
        assert_eq!(docs.len("Note"), 1);

        let loaded: Option<Note> = gateway.get("n1", None).await.unwrap();
        assert_eq!(loaded, Some(note("n1", "hello")));

        assert!(gateway.delete::<Note>("n1", None).await.unwrap());
        assert_eq!(gateway.get::<Note>("n1", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reads_are_cached_and_writes_invalidate() {
        let (gateway, _) = gateway();
        gateway.save(&note("n1", "v1"), None).await.unwrap();
        gateway.get::<Note>("n1", None).await.unwrap();
        gateway.get::<Note>("n1", None).await.unwrap();
        assert_eq!(gateway.cache().stats().hits(), 1);

        gateway.save(&note("n1", "v2"), None).await.unwrap();
        let loaded = gateway.get::<Note>("n1", None).await.unwrap().unwrap();
        assert_eq!(loaded.body, "v2");
    }

    #[tokio::test]
    async fn cached_reads_stay_with_their_backend() {
        let manager = DatabaseServiceManager::default();
        let kv = Arc::new(MemoryBackend::new("kv", BackendKind::KeyValue));
        let docs = Arc::new(MemoryBackend::new("docs", BackendKind::NoSql));
        manager.register("kv", kv.clone(), BackendKind::KeyValue);
        manager.register("docs", docs.clone(), BackendKind::NoSql);
        let gateway = PersistenceGateway::new(manager, IntentRegistry::new(), GatewayConfig::default());
        let ephemeral = Some(&Intent::Ephemeral);

        let stored = gateway.save(&note("a", "cached"), ephemeral).await.unwrap();
        assert_eq!(stored.backend, "kv");
        assert!(gateway.get::<Note>("a", ephemeral).await.unwrap().is_some());

        // STANDARD routes to `docs`, which has never seen the record.
        assert_eq!(docs.len("Note"), 0);
        assert_eq!(gateway.get::<Note>("a", None).await.unwrap(), None);

        // A write through one backend drops cached copies on all of them.
        gateway.save(&note("a", "on docs"), None).await.unwrap();
        gateway.get::<Note>("a", None).await.unwrap();
        gateway.save(&note("a", "again"), ephemeral).await.unwrap();
        let kv_copy = gateway.get::<Note>("a", ephemeral).await.unwrap().unwrap();
        assert_eq!(kv_copy.body, "again");
        let docs_copy = gateway.get::<Note>("a", None).await.unwrap().unwrap();
        assert_eq!(docs_copy.body, "on docs");
    }

    #[tokio::test]
    async fn outage_is_translated() {
        let (gateway, docs) = gateway();
        docs.set_healthy(false);

        let err = gateway.save(&note("n1", "x"), None).await.unwrap_err();
        match err {
            StoreError::Backend {
                kind,
                model,
                operation,
                backend,
                ..
            } => {
                assert_eq!(kind, FailureKind::ConnectionTimeout);
                assert_eq!(model, "Note");
                assert_eq!(operation, Operation::Create);
                assert_eq!(backend, "docs");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn query_builder_filters() {
        let (gateway, _) = gateway();
        for (id, body) in [("a", "x"), ("b", "y"), ("c", "x")] {
            gateway.save(&note(id, body), None).await.unwrap();
        }

        let found = gateway.query::<Note>(None).filter("body", "x").all().await.unwrap();
        assert_eq!(found.len(), 2);

        let first = gateway.query::<Note>(None).filter("body", "y").first().await.unwrap();
        assert_eq!(first, Some(note("b", "y")));

        let err = gateway.query::<Note>(None).filter("bad field", 1).all().await;
        assert!(matches!(err, Err(StoreError::InvalidArgument(_))));
    }
}
