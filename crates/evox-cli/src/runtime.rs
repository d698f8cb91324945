//! Wiring of kernel and store components from an [`EvoxConfig`].

use std::sync::Arc;

use anyhow::{Context, Result};
use evox_kernel::{
    AdmissionQueue, AdmissionSnapshot, IntentRegistry, RouteTable, SchedulerStats, StatusProvider,
    SystemStatus, SystemStatusMonitor, TaskPriority, TaskScheduler, task_fn,
};
use evox_store::{
    Database, DatabaseServiceManager, MemoryBackend, PersistenceGateway, Sealer, ServiceInfo,
    SqliteBackend, StorageBackend,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{Driver, EvoxConfig};

/// Everything a running EVOX process owns.
pub struct Runtime {
    pub intents: IntentRegistry,
    pub monitor: Arc<SystemStatusMonitor>,
    pub admission: AdmissionQueue,
    pub scheduler: TaskScheduler,
    pub gateway: Arc<PersistenceGateway>,
}

/// Point-in-time report printed by `evox status`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub system_status: SystemStatus,
    pub load_factor: f64,
    pub admission: AdmissionSnapshot,
    pub scheduler: SchedulerStats,
    pub backends: Vec<ServiceInfo>,
    pub custom_intents: Vec<String>,
    pub routes: usize,
}

impl Runtime {
    /// Build every component.  Opens (and migrates) SQLite backends.
    pub async fn build(config: &EvoxConfig) -> Result<Self> {
        let intents = IntentRegistry::new();
        for (name, intent) in &config.intents {
            intents.register(name.clone(), intent.clone());
        }

        let routes = RouteTable::new(intents.clone());
        for (route, policy) in &config.routes {
            routes.register(route.clone(), policy.clone());
        }

        let monitor = Arc::new(SystemStatusMonitor::new(config.monitor.clone()));
        let status: Arc<dyn StatusProvider> = monitor.clone();
        let admission = AdmissionQueue::new(config.admission.clone(), status).with_routes(routes);
        let scheduler = TaskScheduler::new(config.scheduler.clone(), intents.clone());

        let manager = DatabaseServiceManager::new(config.health.clone());
        for (name, decl) in &config.backends {
            let backend: Arc<dyn StorageBackend> = match decl.driver {
                Driver::Memory => Arc::new(MemoryBackend::new(name.clone(), decl.kind)),
                Driver::Sqlite => {
                    let path = decl
                        .path
                        .as_ref()
                        .with_context(|| format!("backend `{name}` has no path"))?;
                    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                        std::fs::create_dir_all(parent).with_context(|| {
                            format!("failed to create directory {}", parent.display())
                        })?;
                    }
                    let db = Database::open_and_migrate(path)
                        .await
                        .with_context(|| format!("failed to open backend `{name}`"))?;
                    Arc::new(SqliteBackend::new(name.clone(), decl.kind, db))
                }
            };
            manager.register(name.clone(), backend, decl.kind);
        }

        let mut gateway = PersistenceGateway::new(manager, intents.clone(), config.gateway.clone());
        if let Some(sealer) = load_sealer(config)? {
            gateway = gateway.with_sealer(Arc::new(sealer));
        }

        Ok(Self {
            intents,
            monitor,
            admission,
            scheduler,
            gateway: Arc::new(gateway),
        })
    }

    /// Start workers, the health loop and periodic concurrency tuning.
    pub fn start(&self) -> Result<()> {
        self.scheduler.start().context("failed to start scheduler")?;
        self.gateway.manager().start_health_monitoring();

        let admission = self.admission.clone();
        self.scheduler
            .schedule_recurring(
                "admission-auto-adjust",
                TaskPriority::Low,
                admission.config().adjust_interval(),
                task_fn(move || {
                    let admission = admission.clone();
                    async move {
                        admission.auto_adjust();
                        Ok(serde_json::Value::Null)
                    }
                }),
            )
            .context("failed to schedule concurrency tuning")?;

        info!(
            backends = self.gateway.manager().len(),
            workers = self.scheduler.config().workers,
            "evox runtime started"
        );
        Ok(())
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            system_status: self.monitor.status(),
            load_factor: self.monitor.load_factor(),
            admission: self.admission.snapshot(),
            scheduler: self.scheduler.stats(),
            backends: self.gateway.manager().snapshot(),
            custom_intents: self.intents.custom_names(),
            routes: self.admission.routes().len(),
        }
    }

    /// Stop accepting work, drain the scheduler and stop health probes.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.gateway.shutdown();
        info!("evox runtime stopped");
    }
}

fn load_sealer(config: &EvoxConfig) -> Result<Option<Sealer>> {
    let Some(var) = &config.encryption_key_env else {
        return Ok(None);
    };
    match std::env::var(var) {
        Ok(encoded) => {
            let sealer = Sealer::from_base64(&encoded)
                .with_context(|| format!("invalid encryption key in ${var}"))?;
            info!(env = %var, "payload sealing enabled");
            Ok(Some(sealer))
        }
        Err(_) => {
            warn!(env = %var, "encryption key variable not set, sealed intents will be stored plain");
            Ok(None)
        }
    }
}
