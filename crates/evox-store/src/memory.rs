//! In-process storage backend.
//!
//! [`MemoryBackend`] keeps each collection in an ordered map inside a
//! [`DashMap`].  It can pose as any [`BackendKind`], which makes it the
//! default driver for key-value and cache-style declarations and the
//! workhorse of the routing tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use evox_kernel::BackendKind;
use serde_json::Value;

use crate::backend::{Query, StorageBackend};
use crate::error::{StoreError, StoreResult};

pub struct MemoryBackend {
    name: String,
    kind: BackendKind,
    collections: DashMap<String, BTreeMap<String, Value>>,
    healthy: AtomicBool,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            name: name.into(),
            kind,
            collections: DashMap::new(),
            healthy: AtomicBool::new(true),
        }
    }

    /// Simulate an outage (or recovery).  While unhealthy every call fails.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    /// Number of records in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, |c| c.len())
    }

    fn ensure_up(&self) -> StoreResult<()> {
        if self.healthy.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                backend: self.name.clone(),
                reason: "connection refused".into(),
            })
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn read(&self, collection: &str, key: &str) -> StoreResult<Option<Value>> {
        self.ensure_up()?;
        Ok(self
            .collections
            .get(collection)
            .and_then(|c| c.get(key).cloned()))
    }

    async fn write(&self, collection: &str, key: &str, value: Value) -> StoreResult<()> {
        self.ensure_up()?;
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> StoreResult<bool> {
        self.ensure_up()?;
        Ok(self
            .collections
            .get_mut(collection)
            .is_some_and(|mut c| c.remove(key).is_some()))
    }

    async fn query(&self, collection: &str, query: &Query) -> StoreResult<Vec<Value>> {
        self.ensure_up()?;
        query.validate()?;
        let records: Vec<Value> = self
            .collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default();
        Ok(query.apply(records))
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.ensure_up()
    }
}
