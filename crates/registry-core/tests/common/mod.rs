//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Shared helpers for registry integration tests

#![allow(dead_code)]

use registry_core::{
    cache::DiscoveryCache, config::ReconnectConfig, store::CoordinationStore, DiscoveryWatcher,
    LeaseManager, MemoryStore,
};
use std::sync::Arc;
use std::time::Duration;

pub const PREFIX: &str = "services";

/// Store, lease manager and watcher sharing one in-memory store
pub struct Harness {
    pub store: MemoryStore,
    pub leases: LeaseManager,
    pub watcher: DiscoveryWatcher,
}

impl Harness {
    pub fn new(reconnect: ReconnectConfig) -> Self {
        let store = MemoryStore::new();
        let shared: Arc<dyn CoordinationStore> = Arc::new(store.clone());
        let cache = Arc::new(DiscoveryCache::new());

        Self {
            leases: LeaseManager::new(shared.clone(), PREFIX),
            watcher: DiscoveryWatcher::new(shared, cache, PREFIX, reconnect),
            store,
        }
    }

    pub fn cache(&self) -> &Arc<DiscoveryCache> {
        self.watcher.cache()
    }
}

/// Reconnect settings with short, predictable delays
pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        enabled: true,
        max_attempts: 3,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(1),
        backoff_multiplier: 2.0,
    }
}

/// Poll `check` until it holds, panicking after a couple of seconds
pub async fn eventually<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
