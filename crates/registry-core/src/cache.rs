//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Local view of discovered endpoints
//!
//! [`DiscoveryCache`] maps a service name to the records currently known for
//! it. Every mutation and every snapshot takes the same lock, so a reader
//! never observes half of an applied change.

use crate::types::{Endpoint, EventKind, WatchEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info};

/// Service name to (record key to address)
pub type ServiceRegistryView = HashMap<String, HashMap<String, String>>;

/// Shared cache of endpoints per service
#[derive(Debug, Default)]
pub struct DiscoveryCache {
    services: Mutex<ServiceRegistryView>,
}

impl DiscoveryCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace one record
    pub fn upsert(&self, service_name: &str, key: &str, address: &str) {
        let mut services = self.services.lock();
        services
            .entry(service_name.to_string())
            .or_default()
            .insert(key.to_string(), address.to_string());
    }

    /// Remove one record, returning the address it had
    pub fn delete(&self, service_name: &str, key: &str) -> Option<String> {
        let mut services = self.services.lock();
        services
            .get_mut(service_name)
            .and_then(|endpoints| endpoints.remove(key))
    }

    /// Replace every record of a service with a freshly read set
    pub fn replace_service<I>(&self, service_name: &str, records: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let endpoints: HashMap<String, String> = records.into_iter().collect();
        let count = endpoints.len();
        self.services
            .lock()
            .insert(service_name.to_string(), endpoints);
        count
    }

    /// Apply one watch event to a service's records
    pub fn apply(&self, service_name: &str, event: &WatchEvent) {
        match event.kind {
            EventKind::Put => {
                self.upsert(service_name, &event.key, &event.value);
                info!(
                    "service {} put endpoint, key: {}, endpoint: {}",
                    service_name, event.key, event.value
                );
            }
            EventKind::Delete => {
                let removed = self.delete(service_name, &event.key);
                info!(
                    "service {} delete endpoint, key: {}, endpoint: {}",
                    service_name,
                    event.key,
                    event.prev_value.as_deref().or(removed.as_deref()).unwrap_or("")
                );
            }
        }
    }

    /// Consistent copy of a service's endpoints, ordered by key
    pub fn snapshot(&self, service_name: &str) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = {
            let services = self.services.lock();
            match services.get(service_name) {
                Some(records) => records
                    .iter()
                    .map(|(key, address)| Endpoint {
                        key: key.clone(),
                        address: address.clone(),
                    })
                    .collect(),
                None => Vec::new(),
            }
        };
        endpoints.sort_by(|a, b| a.key.cmp(&b.key));
        debug!("Snapshot of {} has {} endpoints", service_name, endpoints.len());
        endpoints
    }

    /// Consistent copy of the whole view
    pub fn view(&self) -> ServiceRegistryView {
        self.services.lock().clone()
    }

    /// Number of endpoints known for a service
    pub fn len(&self, service_name: &str) -> usize {
        self.services
            .lock()
            .get(service_name)
            .map_or(0, HashMap::len)
    }

    /// Whether no endpoint is known for a service
    pub fn is_empty(&self, service_name: &str) -> bool {
        self.len(service_name) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn keys(cache: &DiscoveryCache, service: &str) -> HashSet<String> {
        cache.snapshot(service).into_iter().map(|e| e.key).collect()
    }

    #[test]
    fn test_bootstrap_then_events() {
        let cache = DiscoveryCache::new();
        let count = cache.replace_service(
            "user",
            vec![("services/user/8088".to_string(), "127.0.0.1:8088".to_string())],
        );
        assert_eq!(count, 1);

        cache.apply("user", &WatchEvent::put("services/user/8089", "127.0.0.1:8089"));
        assert_eq!(cache.len("user"), 2);

        cache.apply("user", &WatchEvent::delete("services/user/8088", None));
        assert_eq!(
            keys(&cache, "user"),
            HashSet::from(["services/user/8089".to_string()])
        );
    }

    #[test]
    fn test_identical_put_is_idempotent() {
        let cache = DiscoveryCache::new();
        let event = WatchEvent::put("services/user/8088", "127.0.0.1:8088");

        cache.apply("user", &event);
        let once = cache.view();
        cache.apply("user", &event);
        assert_eq!(cache.view(), once);
    }

    #[test]
    fn test_delete_ignores_previous_value() {
        let cache = DiscoveryCache::new();
        cache.apply("user", &WatchEvent::put("services/user/8088", "127.0.0.1:8088"));
        cache.apply(
            "user",
            &WatchEvent::delete("services/user/8088", Some("10.9.9.9:1".to_string())),
        );
        assert!(cache.is_empty("user"));
    }

    #[test]
    fn test_put_updates_address() {
        let cache = DiscoveryCache::new();
        cache.upsert("user", "services/user/8088", "127.0.0.1:8088");
        cache.upsert("user", "services/user/8088", "10.0.0.1:8088");

        let snapshot = cache.snapshot("user");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].address, "10.0.0.1:8088");
    }

    #[test]
    fn test_replace_service_drops_stale_records() {
        let cache = DiscoveryCache::new();
        cache.upsert("user", "services/user/1", "127.0.0.1:1");
        cache.upsert("orders", "services/orders/1", "127.0.0.1:2");

        cache.replace_service(
            "user",
            vec![("services/user/2".to_string(), "127.0.0.1:3".to_string())],
        );

        assert_eq!(keys(&cache, "user"), HashSet::from(["services/user/2".to_string()]));
        assert_eq!(cache.len("orders"), 1);
    }

    #[test]
    fn test_unknown_service_is_empty() {
        let cache = DiscoveryCache::new();
        assert!(cache.snapshot("payments").is_empty());
        assert!(cache.delete("payments", "services/payments/1").is_none());
    }

    #[test]
    fn test_readers_never_see_partial_replacement() {
        let cache = Arc::new(DiscoveryCache::new());
        let pair_a: Vec<(String, String)> = vec![
            ("services/user/1".to_string(), "a:1".to_string()),
            ("services/user/2".to_string(), "a:2".to_string()),
        ];
        let pair_b: Vec<(String, String)> = vec![
            ("services/user/3".to_string(), "b:3".to_string()),
            ("services/user/4".to_string(), "b:4".to_string()),
        ];
        cache.replace_service("user", pair_a.clone());

        let writer = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for i in 0..2000 {
                    let records = if i % 2 == 0 { pair_b.clone() } else { pair_a.clone() };
                    cache.replace_service("user", records);
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        let snapshot = cache.snapshot("user");
                        assert_eq!(snapshot.len(), 2);
                        let first = snapshot[0].address.chars().next();
                        assert!(snapshot.iter().all(|e| e.address.chars().next() == first));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
