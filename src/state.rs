//! Shared application state.

use crate::config::Config;
use crate::health::{HealthCheckApi, Registry};
use crate::metrics::MetricsCollector;
use crate::store::StoreError;
use crate::util::ShutdownSignal;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::{error, info};

/// Shared state accessible from all workers and tasks.
#[derive(Clone)]
pub struct AppState {
    /// Current configuration (swapped atomically on hot reload).
    config: Arc<ArcSwap<Config>>,

    /// Upstream groups built from the current configuration.
    registry: Arc<ArcSwap<Registry>>,

    metrics: MetricsCollector,

    shutdown: ShutdownSignal,
}

impl AppState {
    /// Build the registry for `config`.
    pub fn new(config: Config) -> Result<Self, StoreError> {
        let registry = Registry::from_config(&config, None)?;
        Ok(Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            registry: Arc::new(ArcSwap::from_pointee(registry)),
            metrics: MetricsCollector::new(),
            shutdown: ShutdownSignal::new(),
        })
    }

    /// Get the current configuration.
    pub fn config(&self) -> arc_swap::Guard<Arc<Config>> {
        self.config.load()
    }

    pub fn registry(&self) -> &Arc<ArcSwap<Registry>> {
        &self.registry
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Administrative handle on the live registry.
    pub fn api(&self) -> HealthCheckApi {
        HealthCheckApi::new(Arc::clone(&self.registry))
    }

    /// Swap in a new configuration. Groups present before and after keep
    /// their health records; on error the current state stays in place.
    pub fn reload(&self, config: Config) -> Result<(), StoreError> {
        let current = self.registry.load_full();
        let registry = match Registry::from_config(&config, Some(&*current)) {
            Ok(registry) => registry,
            Err(e) => {
                error!(error = %e, "failed to rebuild upstream registry, keeping current");
                return Err(e);
            }
        };

        info!(upstreams = registry.len(), "upstream registry swapped");
        self.registry.store(Arc::new(registry));
        self.config.store(Arc::new(config));
        Ok(())
    }

    /// Get the shutdown signal.
    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Trigger shutdown.
    pub fn trigger_shutdown(&self) {
        self.shutdown.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, UpstreamConfig};
    use crate::upstream::Module;

    fn config() -> Config {
        Config {
            upstreams: vec![UpstreamConfig {
                name: "api".to_string(),
                module: Module::Http,
                servers: vec![ServerConfig {
                    server: "127.0.0.1:9000".to_string(),
                    backup: false,
                }],
                check: Default::default(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_new_builds_registry() {
        let state = AppState::new(config()).unwrap();
        assert_eq!(state.registry().load().len(), 1);
        assert!(state.api().query_options(Module::Http, "api").is_ok());
        assert!(!state.shutdown().is_shutdown());
    }

    #[test]
    fn test_reload_keeps_zone() {
        let state = AppState::new(config()).unwrap();
        let zone = state.registry().load().zone(Module::Http, "api").unwrap();

        let mut next = config();
        next.healthcheck.rise = 3;
        state.reload(next).unwrap();

        let reloaded = state.registry().load().zone(Module::Http, "api").unwrap();
        assert!(Arc::ptr_eq(&zone, &reloaded));
        assert_eq!(reloaded.options().rise, 3);
        assert_eq!(state.config().healthcheck.rise, 3);
    }

    #[test]
    fn test_reload_failure_keeps_current() {
        let state = AppState::new(config()).unwrap();
        let mut next = config();
        next.global.zone_size = 1;
        next.upstreams[0].name = "other".to_string();

        assert!(state.reload(next).is_err());
        assert!(state.registry().load().zone(Module::Http, "api").is_some());
        assert_eq!(state.config().upstreams[0].name, "api");
    }
}
