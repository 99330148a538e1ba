//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Service registry combining registration, discovery and selection

use crate::{
    cache::{DiscoveryCache, ServiceRegistryView},
    config::RegistryConfig,
    discovery::{DiscoveryWatcher, WatchState},
    error::RegistryError,
    lease::{LeaseManager, Registration, RegistrationState},
    selector::{strategy_for, EndpointSelector},
    store::CoordinationStore,
    types::Endpoint,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Registration and discovery for one process
pub struct ServiceRegistry {
    config: RegistryConfig,
    leases: LeaseManager,
    watcher: DiscoveryWatcher,
    selector: EndpointSelector,
    registrations: Mutex<Vec<Registration>>,
}

impl ServiceRegistry {
    /// Create a registry over a store; nothing is registered or tracked yet
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: RegistryConfig,
    ) -> Result<Self, RegistryError> {
        config.validate()?;

        let cache = Arc::new(DiscoveryCache::new());
        let leases = LeaseManager::new(store.clone(), config.prefix.clone());
        let watcher = DiscoveryWatcher::new(
            store,
            cache.clone(),
            config.prefix.clone(),
            config.discovery.reconnect.clone(),
        );
        let selector =
            EndpointSelector::with_strategy(cache, strategy_for(config.selection.strategy));

        Ok(Self {
            config,
            leases,
            watcher,
            selector,
            registrations: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<DiscoveryCache> {
        self.watcher.cache()
    }

    /// Register this instance as described by the configuration
    pub async fn register_self(&self) -> Result<Option<String>, RegistryError> {
        let Some(registration) = self.config.registration.clone() else {
            return Ok(None);
        };

        let key = self
            .register(
                &registration.service_name,
                &registration.address(),
                registration.ttl_secs,
            )
            .await?;
        Ok(Some(key))
    }

    /// Register an address for a service, returning the record key
    pub async fn register(
        &self,
        service_name: &str,
        address: &str,
        ttl_secs: i64,
    ) -> Result<String, RegistryError> {
        let registration = self.leases.register(service_name, address, ttl_secs).await?;
        let key = registration.key().to_string();
        self.registrations.lock().await.push(registration);
        Ok(key)
    }

    /// Start tracking one service
    pub async fn track(&self, service_name: &str) -> Result<(), RegistryError> {
        self.watcher.track(service_name).await
    }

    /// Start tracking every configured service; failures are logged and skipped
    pub async fn track_configured(&self) -> Vec<(String, RegistryError)> {
        let failures = self
            .watcher
            .track_all(self.config.discovery.services.iter())
            .await;
        for (service_name, e) in &failures {
            error!("Not tracking service {}: {}", service_name, e);
        }
        failures
    }

    /// Select one endpoint of a service
    pub fn select_endpoint(&self, service_name: &str) -> Result<Endpoint, RegistryError> {
        self.selector.select_endpoint(service_name)
    }

    /// All endpoints currently known for a service
    pub fn endpoints(&self, service_name: &str) -> Vec<Endpoint> {
        self.cache().snapshot(service_name)
    }

    pub fn view(&self) -> ServiceRegistryView {
        self.cache().view()
    }

    pub fn service_state(&self, service_name: &str) -> WatchState {
        self.watcher.state(service_name)
    }

    pub fn service_states(&self) -> HashMap<String, WatchState> {
        self.watcher.states()
    }

    /// State of every registration, keyed by record key
    pub async fn registrations(&self) -> Vec<(String, RegistrationState)> {
        self.registrations
            .lock()
            .await
            .iter()
            .map(|registration| (registration.key().to_string(), registration.state()))
            .collect()
    }

    /// Stop every watcher and registration and wait for their tasks
    ///
    /// Registrations are revoked when `deregister_on_shutdown` is set and
    /// otherwise left to expire with their leases. They are released even
    /// when stopping a watch task fails; that error is returned afterwards.
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        info!("Shutting down service registry");
        let watcher_result = self.watcher.stop().await;
        if let Err(e) = &watcher_result {
            error!("Failed to stop watch tasks: {}", e);
        }

        let deregister = self
            .config
            .registration
            .as_ref()
            .is_some_and(|registration| registration.deregister_on_shutdown);

        let registrations: Vec<Registration> = self.registrations.lock().await.drain(..).collect();
        for registration in registrations {
            let key = registration.key().to_string();
            let result = if deregister && !registration.state().is_lost() {
                registration.deregister().await
            } else {
                registration.stop().await
            };
            if let Err(e) = result {
                warn!("Failed to release registration {}: {}", key, e);
            }
        }

        info!("Service registry shutdown completed");
        watcher_result
    }
}
