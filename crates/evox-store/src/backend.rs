//! Storage backend capability trait and supporting types.
//!
//! Every concrete store (in-memory, SQLite, or anything an embedder plugs in)
//! implements [`StorageBackend`].  Records are JSON documents addressed by a
//! collection (the model name) and a string key.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use evox_kernel::{BackendKind, Intent};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// The kind of persistence operation being routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    Query,
    Transaction,
}

impl Operation {
    /// Name of the backend method that serves this operation.
    pub fn method(self) -> &'static str {
        match self {
            Self::Create | Self::Update => "write",
            Self::Read | Self::Query => "read",
            Self::Delete => "delete",
            Self::Transaction => "execute_transaction",
        }
    }

    pub fn is_read(self) -> bool {
        matches!(self, Self::Read | Self::Query)
    }

    pub fn is_write(self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Delete)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Query => "query",
            Self::Transaction => "transaction",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Equality filters on top-level fields, with optional paging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub filters: Vec<(String, Value)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    #[must_use]
    pub fn limit(mut self, count: usize) -> Self {
        self.limit = Some(count);
        self
    }

    #[must_use]
    pub fn offset(mut self, count: usize) -> Self {
        self.offset = Some(count);
        self
    }

    /// Whether `record` satisfies every filter.
    pub fn matches(&self, record: &Value) -> bool {
        self.filters
            .iter()
            .all(|(field, expected)| record.get(field).unwrap_or(&Value::Null) == expected)
    }

    /// Filter and page an ordered sequence of records.
    pub fn apply<I>(&self, records: I) -> Vec<Value>
    where
        I: IntoIterator<Item = Value>,
    {
        records
            .into_iter()
            .filter(|record| self.matches(record))
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }

    /// Reject field names that are not plain identifiers.
    pub fn validate(&self) -> StoreResult<()> {
        for (field, _) in &self.filters {
            let valid = !field.is_empty()
                && field
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(StoreError::InvalidArgument(format!(
                    "filter field `{field}` must be a plain identifier"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// A persistable record type.
///
/// `NAME` is the collection the records live in and part of the routing
/// cache key.  A model may declare the intent its data carries; an explicit
/// intent passed to the gateway takes precedence.
pub trait Model: Serialize + DeserializeOwned + Send + Sync {
    const NAME: &'static str;

    fn key(&self) -> String;

    fn declared_intent() -> Option<Intent> {
        None
    }
}

// ---------------------------------------------------------------------------
// StorageBackend
// ---------------------------------------------------------------------------

/// Capability interface of a storage backend.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Logical name the backend was declared under.
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    async fn read(&self, collection: &str, key: &str) -> StoreResult<Option<Value>>;

    /// Insert or replace a record.
    async fn write(&self, collection: &str, key: &str, value: Value) -> StoreResult<()>;

    /// Remove a record.  Returns whether it existed.
    async fn delete(&self, collection: &str, key: &str) -> StoreResult<bool>;

    /// Records in key order, filtered and paged by `query`.
    async fn query(&self, collection: &str, query: &Query) -> StoreResult<Vec<Value>>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// DegradedBackend
// ---------------------------------------------------------------------------

/// A backend selected only because the preferred types were all unhealthy.
///
/// Forwards every call to the wrapped backend and logs a degraded-mode
/// warning naming the intent whose preference could not be honoured.
pub struct DegradedBackend {
    inner: Arc<dyn StorageBackend>,
    intent: String,
}

impl DegradedBackend {
    pub fn new(inner: Arc<dyn StorageBackend>, intent: impl Into<String>) -> Self {
        Self {
            inner,
            intent: intent.into(),
        }
    }

    pub fn inner(&self) -> &Arc<dyn StorageBackend> {
        &self.inner
    }

    fn signal(&self, method: &str, collection: &str) {
        tracing::warn!(
            backend = self.inner.name(),
            kind = %self.inner.kind(),
            intent = %self.intent,
            method,
            collection,
            "serving from fallback backend"
        );
    }
}

#[async_trait]
impl StorageBackend for DegradedBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn read(&self, collection: &str, key: &str) -> StoreResult<Option<Value>> {
        self.signal("read", collection);
        self.inner.read(collection, key).await
    }

    async fn write(&self, collection: &str, key: &str, value: Value) -> StoreResult<()> {
        self.signal("write", collection);
        self.inner.write(collection, key, value).await
    }

    async fn delete(&self, collection: &str, key: &str) -> StoreResult<bool> {
        self.signal("delete", collection);
        self.inner.delete(collection, key).await
    }

    async fn query(&self, collection: &str, query: &Query) -> StoreResult<Vec<Value>> {
        self.signal("query", collection);
        self.inner.query(collection, query).await
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.inner.health_check().await
    }
}
