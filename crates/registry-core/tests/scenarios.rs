//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! End-to-end registration, discovery and selection scenarios

mod common;

use common::{eventually, Harness};
use registry_core::{config::ReconnectConfig, EndpointSelector, RegistryError};
use std::collections::HashMap;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_bootstrap_single_endpoint_is_selected() {
    let harness = Harness::new(ReconnectConfig::disabled());
    harness.store.insert("services/user/8088", "127.0.0.1:8088");

    harness.watcher.track("user").await.unwrap();

    let view = harness.cache().view();
    let expected: HashMap<String, String> =
        [("services/user/8088".to_string(), "127.0.0.1:8088".to_string())]
            .into_iter()
            .collect();
    assert_eq!(view.get("user"), Some(&expected));

    let selector = EndpointSelector::new(harness.cache().clone());
    for _ in 0..20 {
        let endpoint = selector.select_endpoint("user").unwrap();
        assert_eq!(endpoint.key, "services/user/8088");
        assert_eq!(endpoint.address, "127.0.0.1:8088");
    }
}

#[tokio::test(start_paused = true)]
async fn test_put_event_adds_endpoint_with_even_selection() {
    let harness = Harness::new(ReconnectConfig::disabled());
    harness.store.insert("services/user/8088", "127.0.0.1:8088");
    harness.watcher.track("user").await.unwrap();

    harness.store.insert("services/user/8089", "127.0.0.1:8089");
    eventually("second endpoint", || harness.cache().len("user") == 2).await;

    let selector = EndpointSelector::new(harness.cache().clone());
    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..2000 {
        let endpoint = selector.select_endpoint("user").unwrap();
        *counts.entry(endpoint.key).or_default() += 1;
    }

    assert_eq!(counts.len(), 2);
    for (key, count) in counts {
        assert!(
            (800..=1200).contains(&count),
            "{} selected {} times out of 2000",
            key,
            count
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_delete_event_removes_endpoint_from_selection() {
    let harness = Harness::new(ReconnectConfig::disabled());
    harness.store.insert("services/user/8088", "127.0.0.1:8088");
    harness.store.insert("services/user/8089", "127.0.0.1:8089");
    harness.watcher.track("user").await.unwrap();
    assert_eq!(harness.cache().len("user"), 2);

    assert!(harness.store.remove("services/user/8088"));
    eventually("delete applied", || harness.cache().len("user") == 1).await;

    let selector = EndpointSelector::new(harness.cache().clone());
    for _ in 0..200 {
        let endpoint = selector.select_endpoint("user").unwrap();
        assert_eq!(endpoint.key, "services/user/8089");
    }
}

#[tokio::test(start_paused = true)]
async fn test_lost_keepalive_expires_record_from_cache() {
    let harness = Harness::new(ReconnectConfig::disabled());
    let registration = harness
        .leases
        .register("user", "127.0.0.1:8088", 3)
        .await
        .unwrap();
    harness.watcher.track("user").await.unwrap();
    assert_eq!(harness.cache().len("user"), 1);

    harness.store.sever_keep_alives();
    let reason = registration.wait_lost().await;
    assert!(reason.is_some());

    // Nothing deregisters explicitly; only the lease expiry removes the record
    tokio::time::sleep(Duration::from_secs(4)).await;
    eventually("expired record removed", || harness.cache().is_empty("user")).await;
    assert!(harness.store.value("services/user/8088").is_none());
    assert!(!harness.store.lease_alive(registration.lease()));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_service_has_no_endpoint() {
    let harness = Harness::new(ReconnectConfig::disabled());
    harness.store.insert("services/user/8088", "127.0.0.1:8088");
    harness.watcher.track("user").await.unwrap();

    let selector = EndpointSelector::new(harness.cache().clone());
    let result = selector.select_endpoint("payments");
    assert!(matches!(result, Err(RegistryError::NoAvailableEndpoint(_))));
}

#[tokio::test(start_paused = true)]
async fn test_service_prefix_does_not_leak_into_similar_names() {
    let harness = Harness::new(ReconnectConfig::disabled());
    harness.store.insert("services/user/8088", "127.0.0.1:8088");
    harness.store.insert("services/users/9000", "127.0.0.1:9000");
    harness.watcher.track("user").await.unwrap();

    harness.store.insert("services/users/9001", "127.0.0.1:9001");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let endpoints = harness.cache().snapshot("user");
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].key, "services/user/8088");
}
