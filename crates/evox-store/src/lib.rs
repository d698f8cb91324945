//! # evox-store
//!
//! Persistence layer for EVOX services.
//!
//! Application code talks to a [`PersistenceGateway`]; the gateway asks the
//! [`IntentRouter`] which registered backend should serve each operation,
//! given the data's intent and the health table kept by the
//! [`DatabaseServiceManager`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  PersistenceGateway  save / get / delete /   │
//! │                      query, timeouts, audit  │
//! │    RecordCache (moka, per-intent TTL)        │
//! │    Sealer (AES-256-GCM via ring)             │
//! ├──────────────────────────────────────────────┤
//! │  IntentRouter   strategy table, route cache  │
//! ├──────────────────────────────────────────────┤
//! │  DatabaseServiceManager  registry, health    │
//! │          loop, circuit breakers, HealthBus   │
//! ├──────────────────────────────────────────────┤
//! │  StorageBackend: MemoryBackend,              │
//! │                  SqliteBackend (rusqlite WAL)│
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use evox_kernel::{BackendKind, IntentRegistry};
//! use evox_store::{Database, DatabaseServiceManager, GatewayConfig, PersistenceGateway, SqliteBackend};
//!
//! let db = Database::open_and_migrate("data/evox.db").await?;
//! let manager = DatabaseServiceManager::default();
//! manager.register("primary", Arc::new(SqliteBackend::new("primary", BackendKind::Sql, db)), BackendKind::Sql);
//! manager.start_health_monitoring();
//!
//! let gateway = PersistenceGateway::new(manager, IntentRegistry::new(), GatewayConfig::default());
//! gateway.save(&order, Some(&Intent::Critical)).await?;
//! ```

pub mod backend;
pub mod breaker;
pub mod cache;
pub mod classify;
pub mod db;
pub mod error;
pub mod events;
pub mod gateway;
pub mod manager;
pub mod memory;
pub mod migration;
pub mod router;
pub mod seal;
pub mod sqlite;

// ── re-exports ───────────────────────────────────────────────────────

pub use backend::{DegradedBackend, Model, Operation, Query, StorageBackend};
pub use breaker::{CircuitBreaker, CircuitState};
pub use cache::{CacheStats, RecordCache};
pub use classify::{Classification, classify};
pub use db::Database;
pub use error::{FailureKind, StoreError, StoreResult};
pub use events::{HealthBus, HealthChange, HealthEvent};
pub use gateway::{AUDIT_TARGET, GatewayConfig, PersistenceGateway, QueryBuilder, Stored};
pub use manager::{DatabaseServiceManager, HealthConfig, RegisteredBackend, ServiceInfo};
pub use memory::MemoryBackend;
pub use router::{
    Durability, IntentRouter, Payload, RouteDecision, RouteMetadata, RouteStrategy, RoutingResult,
};
pub use seal::Sealer;
pub use sqlite::SqliteBackend;
