//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Service registration and discovery over a shared coordination store
//!
//! Instances advertise `host:port` endpoints under TTL-bound leases that a
//! keepalive task renews; callers keep a watch-driven local view of every
//! tracked service and pick one endpoint per lookup from it.
//!
//! Records live under `<prefix>/<service>/<discriminator>`, with the
//! instance's listening port as the discriminator.

pub mod cache;
pub mod config;
pub mod discovery;
pub mod error;
pub mod lease;
pub mod registry;
pub mod selector;
pub mod store;
pub mod types;

// Re-export main types
pub use cache::{DiscoveryCache, ServiceRegistryView};
pub use config::RegistryConfig;
pub use discovery::{DiscoveryWatcher, WatchState};
pub use error::RegistryError;
pub use lease::{LeaseManager, Registration, RegistrationState};
pub use registry::ServiceRegistry;
pub use selector::{EndpointSelector, RandomStrategy, RoundRobinStrategy, SelectionStrategy};
pub use store::{CoordinationStore, EtcdStore, MemoryStore};
pub use types::*;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Registry version information
pub const REGISTRY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default key prefix for service records
pub const DEFAULT_PREFIX: &str = "services";

/// Default etcd endpoint
pub const DEFAULT_ETCD_ENDPOINT: &str = "127.0.0.1:2379";

/// Default lease TTL in seconds
pub const DEFAULT_TTL_SECS: i64 = 10;

/// Connect to etcd and build a registry from configuration
pub async fn init_registry(config: RegistryConfig) -> RegistryResult<ServiceRegistry> {
    tracing::info!("Initializing service registry v{}", REGISTRY_VERSION);

    config.validate()?;
    let store = EtcdStore::connect(&config.store).await?;
    let registry = ServiceRegistry::new(std::sync::Arc::new(store), config)?;
    tracing::info!("Service registry initialization completed");

    Ok(registry)
}
