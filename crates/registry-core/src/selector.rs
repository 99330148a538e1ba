//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Endpoint selection over the discovery cache

use crate::{
    cache::DiscoveryCache,
    config::SelectionStrategyKind,
    error::RegistryError,
    types::Endpoint,
};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Policy choosing one endpoint out of a non-empty snapshot
pub trait SelectionStrategy: Send + Sync {
    /// Index into `endpoints` of the chosen endpoint
    fn select(&self, service_name: &str, endpoints: &[Endpoint]) -> usize;

    fn name(&self) -> &'static str;
}

/// Uniformly random choice
#[derive(Debug, Default)]
pub struct RandomStrategy;

impl SelectionStrategy for RandomStrategy {
    fn select(&self, _service_name: &str, endpoints: &[Endpoint]) -> usize {
        rand::thread_rng().gen_range(0..endpoints.len())
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Cycles through endpoints in key order, one counter per service
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    counters: Mutex<HashMap<String, usize>>,
}

impl SelectionStrategy for RoundRobinStrategy {
    fn select(&self, service_name: &str, endpoints: &[Endpoint]) -> usize {
        let mut counters = self.counters.lock();
        let counter = counters.entry(service_name.to_string()).or_insert(0);
        let index = *counter % endpoints.len();
        *counter = counter.wrapping_add(1);
        index
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Build the strategy named in configuration
pub fn strategy_for(kind: SelectionStrategyKind) -> Box<dyn SelectionStrategy> {
    match kind {
        SelectionStrategyKind::Random => Box::new(RandomStrategy),
        SelectionStrategyKind::RoundRobin => Box::new(RoundRobinStrategy::default()),
    }
}

/// Picks one live endpoint per lookup
pub struct EndpointSelector {
    cache: Arc<DiscoveryCache>,
    strategy: Box<dyn SelectionStrategy>,
}

impl EndpointSelector {
    /// Selector using uniform random choice
    pub fn new(cache: Arc<DiscoveryCache>) -> Self {
        Self::with_strategy(cache, Box::new(RandomStrategy))
    }

    pub fn with_strategy(cache: Arc<DiscoveryCache>, strategy: Box<dyn SelectionStrategy>) -> Self {
        Self { cache, strategy }
    }

    /// Select one endpoint of a service
    pub fn select_endpoint(&self, service_name: &str) -> Result<Endpoint, RegistryError> {
        let mut endpoints = self.cache.snapshot(service_name);
        if endpoints.is_empty() {
            return Err(RegistryError::NoAvailableEndpoint(service_name.to_string()));
        }

        let index = self.strategy.select(service_name, &endpoints);
        let endpoint = endpoints.swap_remove(index.min(endpoints.len() - 1));
        debug!(
            "get service success, key: {}, endpoint: {} ({})",
            endpoint.key,
            endpoint.address,
            self.strategy.name()
        );
        Ok(endpoint)
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WatchEvent;

    fn cache_with(records: &[(&str, &str)]) -> Arc<DiscoveryCache> {
        let cache = Arc::new(DiscoveryCache::new());
        for (key, address) in records {
            cache.upsert("user", key, address);
        }
        cache
    }

    #[test]
    fn test_empty_service_is_unavailable() {
        let selector = EndpointSelector::new(Arc::new(DiscoveryCache::new()));
        match selector.select_endpoint("payments") {
            Err(RegistryError::NoAvailableEndpoint(service)) => assert_eq!(service, "payments"),
            other => panic!("expected NoAvailableEndpoint, got {:?}", other),
        }
    }

    #[test]
    fn test_single_endpoint_is_deterministic() {
        let selector = EndpointSelector::new(cache_with(&[("services/user/8088", "127.0.0.1:8088")]));
        for _ in 0..20 {
            let endpoint = selector.select_endpoint("user").unwrap();
            assert_eq!(endpoint.key, "services/user/8088");
            assert_eq!(endpoint.address, "127.0.0.1:8088");
        }
    }

    #[test]
    fn test_random_selection_is_roughly_uniform() {
        let selector = EndpointSelector::new(cache_with(&[
            ("services/user/8088", "127.0.0.1:8088"),
            ("services/user/8089", "127.0.0.1:8089"),
        ]));

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..4000 {
            let endpoint = selector.select_endpoint("user").unwrap();
            *counts.entry(endpoint.key).or_default() += 1;
        }

        assert_eq!(counts.len(), 2);
        for count in counts.values() {
            assert!(*count > 1600 && *count < 2400, "skewed distribution: {:?}", counts);
        }
    }

    #[test]
    fn test_round_robin_cycles_in_key_order() {
        let selector = EndpointSelector::with_strategy(
            cache_with(&[
                ("services/user/3", "127.0.0.1:3"),
                ("services/user/1", "127.0.0.1:1"),
                ("services/user/2", "127.0.0.1:2"),
            ]),
            strategy_for(SelectionStrategyKind::RoundRobin),
        );

        let picked: Vec<String> = (0..6)
            .map(|_| selector.select_endpoint("user").unwrap().key)
            .collect();
        assert_eq!(
            picked,
            vec![
                "services/user/1",
                "services/user/2",
                "services/user/3",
                "services/user/1",
                "services/user/2",
                "services/user/3",
            ]
        );
        assert_eq!(selector.strategy_name(), "round_robin");
    }

    #[test]
    fn test_deleted_endpoint_never_selected() {
        let cache = cache_with(&[
            ("services/user/8088", "127.0.0.1:8088"),
            ("services/user/8089", "127.0.0.1:8089"),
        ]);
        cache.apply("user", &WatchEvent::delete("services/user/8088", None));

        let selector = EndpointSelector::new(cache);
        for _ in 0..200 {
            assert_eq!(selector.select_endpoint("user").unwrap().key, "services/user/8089");
        }
    }
}
