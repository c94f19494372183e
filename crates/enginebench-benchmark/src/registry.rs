use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use enginebench_core::{BackendConfig, EngineError, EngineInfo, HealthStatus, ModelInfo, Result};
use futures::future::join_all;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::adapter::{AdapterFactory, EngineAdapter};
use crate::adapters::HttpAdapterFactory;

struct CachedHealth {
    checked: Instant,
    status: Arc<HealthStatus>,
}

/// Registered backends, their adapters and a TTL-bounded health cache.
///
/// Shared behind an `Arc`; every method takes `&self`.
pub struct ConnectionRegistry {
    adapters: DashMap<String, Arc<dyn EngineAdapter>>,
    configs: DashMap<String, BackendConfig>,
    health_cache: DashMap<String, CachedHealth>,
    health_ttl: Duration,
    factory: Arc<dyn AdapterFactory>,
}

impl ConnectionRegistry {
    pub fn new(health_ttl: Duration) -> Self {
        Self::with_factory(health_ttl, Arc::new(HttpAdapterFactory))
    }

    pub fn with_factory(health_ttl: Duration, factory: Arc<dyn AdapterFactory>) -> Self {
        Self {
            adapters: DashMap::new(),
            configs: DashMap::new(),
            health_cache: DashMap::new(),
            health_ttl,
            factory,
        }
    }

    /// Validate, build and probe one backend. It is kept only when the
    /// first probe reports healthy.
    #[instrument(skip(self, config), fields(engine = %config.name, kind = %config.kind))]
    pub async fn register(&self, config: BackendConfig) -> Result<()> {
        config.validate()?;
        let adapter = self.factory.create(config.clone())?;

        let status = probe(adapter.as_ref()).await;
        if !status.healthy {
            adapter.close().await;
            let reason = status.error.clone().unwrap_or_else(|| "unhealthy".to_string());
            warn!("Registration rejected: {}", reason);
            return Err(EngineError::Connection(format!(
                "{} failed health check: {}",
                config.name, reason
            )));
        }

        let name = config.name.clone();
        if let Some(previous) = self.adapters.insert(name.clone(), adapter) {
            debug!("Replacing existing adapter");
            previous.close().await;
        }
        self.configs.insert(name.clone(), config);
        self.store_health(&name, Arc::new(status));

        info!("Registered engine");
        Ok(())
    }

    /// Register every config independently; returns name -> success.
    pub async fn register_all(&self, configs: Vec<BackendConfig>) -> BTreeMap<String, bool> {
        let names: Vec<String> = configs.iter().map(|c| c.name.clone()).collect();
        let results = join_all(configs.into_iter().map(|c| self.register(c))).await;

        names
            .into_iter()
            .zip(results)
            .map(|(name, result)| (name, result.is_ok()))
            .collect()
    }

    /// Cached status when younger than the TTL and `use_cache`, otherwise a
    /// fresh probe. Only an unknown engine is an error.
    pub async fn health_check(&self, name: &str, use_cache: bool) -> Result<Arc<HealthStatus>> {
        let adapter = self.get(name)?;

        if use_cache {
            if let Some(status) = self.cached_health(name) {
                return Ok(status);
            }
        }

        let status = Arc::new(probe(adapter.as_ref()).await);
        self.store_health(name, Arc::clone(&status));
        Ok(status)
    }

    pub async fn health_check_all(&self, use_cache: bool) -> BTreeMap<String, Arc<HealthStatus>> {
        let names = self.list_engines();
        let checks = names.iter().map(|name| self.health_check(name, use_cache));
        let results = join_all(checks).await;

        names
            .into_iter()
            .zip(results)
            .filter_map(|(name, result)| result.ok().map(|status| (name, status)))
            .collect()
    }

    /// Models served by one engine; a failing listing yields an empty list.
    pub async fn discover_models(&self, name: &str) -> Result<Vec<ModelInfo>> {
        let adapter = self.get(name)?;
        match adapter.list_models().await {
            Ok(models) => Ok(models),
            Err(e) => {
                warn!(engine = name, "Model discovery failed: {}", e);
                Ok(Vec::new())
            }
        }
    }

    pub async fn discover_all_models(&self) -> BTreeMap<String, Vec<ModelInfo>> {
        let names = self.list_engines();
        let results = join_all(names.iter().map(|name| self.discover_models(name))).await;

        names
            .into_iter()
            .zip(results)
            .map(|(name, models)| (name, models.unwrap_or_default()))
            .collect()
    }

    pub async fn engine_info(&self, name: &str) -> Result<EngineInfo> {
        self.get(name)?.get_info().await
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn EngineAdapter>> {
        self.adapters
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::EngineNotFound(name.to_string()))
    }

    pub fn config(&self, name: &str) -> Option<BackendConfig> {
        self.configs.get(name).map(|entry| entry.value().clone())
    }

    pub fn list_engines(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Remove one engine, closing its adapter. Returns whether it existed.
    pub async fn unregister(&self, name: &str) -> bool {
        self.configs.remove(name);
        self.health_cache.remove(name);
        match self.adapters.remove(name) {
            Some((_, adapter)) => {
                adapter.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every adapter concurrently, then drop all state.
    pub async fn close_all(&self) {
        let names = self.list_engines();
        let adapters: Vec<Arc<dyn EngineAdapter>> = names
            .iter()
            .filter_map(|name| self.adapters.remove(name).map(|(_, a)| a))
            .collect();

        join_all(adapters.iter().map(|a| a.close())).await;

        self.adapters.clear();
        self.configs.clear();
        self.health_cache.clear();
        if !adapters.is_empty() {
            info!(count = adapters.len(), "Closed all engines");
        }
    }

    fn cached_health(&self, name: &str) -> Option<Arc<HealthStatus>> {
        let entry = self.health_cache.get(name)?;
        (entry.checked.elapsed() < self.health_ttl).then(|| Arc::clone(&entry.status))
    }

    fn store_health(&self, name: &str, status: Arc<HealthStatus>) {
        self.health_cache.insert(
            name.to_string(),
            CachedHealth {
                checked: Instant::now(),
                status,
            },
        );
    }
}

/// Run the adapter's health check, folding errors into an unhealthy status.
async fn probe(adapter: &dyn EngineAdapter) -> HealthStatus {
    match adapter.health_check().await {
        Ok(status) => status,
        Err(e) => {
            debug!(engine = adapter.name(), "Health probe failed: {}", e);
            let mut status = HealthStatus::unhealthy(adapter.name(), e.to_string());
            status
                .diagnostics
                .insert("error_kind".to_string(), Value::from(e.kind().label()));
            status
        }
    }
}
