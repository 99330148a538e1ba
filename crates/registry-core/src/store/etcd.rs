//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! etcd coordination store

use super::{CoordinationStore, KeepAliveStream, WatchStream};
use crate::{
    config::StoreConfig,
    error::RegistryError,
    types::{EventKind, KeepAliveAck, LeaseId, WatchEvent},
};
use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions};
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// etcd-backed coordination store
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to the configured etcd endpoints
    pub async fn connect(config: &StoreConfig) -> Result<Self, RegistryError> {
        let connect_options = ConnectOptions::new()
            .with_connect_timeout(config.connect_timeout)
            .with_keep_alive(config.keep_alive_interval, config.keep_alive_timeout);

        let client = Client::connect(config.endpoints.clone(), Some(connect_options))
            .await
            .map_err(|e| {
                RegistryError::ConnectionError(format!("Failed to connect to etcd: {}", e))
            })?;

        info!("Connected to etcd at {:?}", config.endpoints);
        Ok(Self { client })
    }
}

/// Delay between keepalive requests for a lease with the given remaining TTL
fn renewal_interval(ttl: i64) -> Duration {
    Duration::from_secs((ttl / 3).max(1) as u64)
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn range_get(&self, prefix: &str) -> Result<Vec<(String, String)>, RegistryError> {
        let mut client = self.client.clone();
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| {
                RegistryError::ConnectionError(format!("Failed to read prefix {}: {}", prefix, e))
            })?;

        let mut pairs = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            let key = String::from_utf8_lossy(kv.key()).into_owned();
            let value = String::from_utf8_lossy(kv.value()).into_owned();
            pairs.push((key, value));
        }

        debug!("Read {} keys under {}", pairs.len(), prefix);
        Ok(pairs)
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream, RegistryError> {
        let mut client = self.client.clone();
        let (watcher, mut responses) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix().with_prev_key()))
            .await
            .map_err(|e| {
                RegistryError::ConnectionError(format!("Failed to watch prefix {}: {}", prefix, e))
            })?;

        let prefix = prefix.to_string();
        let stream = async_stream::stream! {
            // The watcher owns the request side; dropping it cancels the watch.
            let _watcher = watcher;
            loop {
                match responses.message().await {
                    Ok(Some(response)) => {
                        if response.canceled() {
                            warn!("etcd canceled watch on {}: {}", prefix, response.cancel_reason());
                            break;
                        }
                        for event in response.events() {
                            let Some(kv) = event.kv() else { continue };
                            let key = String::from_utf8_lossy(kv.key()).into_owned();
                            let prev_value = event
                                .prev_kv()
                                .map(|prev| String::from_utf8_lossy(prev.value()).into_owned());
                            let watch_event = match event.event_type() {
                                EventType::Put => WatchEvent {
                                    kind: EventKind::Put,
                                    key,
                                    value: String::from_utf8_lossy(kv.value()).into_owned(),
                                    prev_value,
                                },
                                EventType::Delete => WatchEvent::delete(key, prev_value),
                            };
                            yield Ok(watch_event);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(RegistryError::ConnectionError(format!(
                            "Watch on {} failed: {}",
                            prefix, e
                        )));
                        break;
                    }
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId, RegistryError> {
        let mut client = self.client.clone();
        let response = client.lease_grant(ttl_secs, None).await.map_err(|e| {
            RegistryError::RegistrationError(format!("Failed to create etcd lease: {}", e))
        })?;

        Ok(LeaseId(response.id()))
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<(), RegistryError> {
        let mut client = self.client.clone();
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease.0)))
            .await
            .map_err(|e| {
                RegistryError::RegistrationError(format!("Failed to put {} in etcd: {}", key, e))
            })?;

        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, RegistryError> {
        let mut client = self.client.clone();
        let (mut keeper, mut responses) = client.lease_keep_alive(lease.0).await.map_err(|e| {
            RegistryError::ConnectionError(format!("Failed to keep etcd lease alive: {}", e))
        })?;

        let stream = async_stream::stream! {
            loop {
                if let Err(e) = keeper.keep_alive().await {
                    yield Err(RegistryError::ConnectionError(format!(
                        "Failed to send keepalive for lease {}: {}",
                        lease, e
                    )));
                    break;
                }

                match responses.message().await {
                    Ok(Some(response)) => {
                        let ttl = response.ttl();
                        if ttl <= 0 {
                            yield Err(RegistryError::LeaseExpired(format!(
                                "lease {} is no longer known to etcd",
                                lease
                            )));
                            break;
                        }
                        yield Ok(KeepAliveAck { lease, ttl });
                        tokio::time::sleep(renewal_interval(ttl)).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(RegistryError::ConnectionError(format!(
                            "Keepalive for lease {} failed: {}",
                            lease, e
                        )));
                        break;
                    }
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), RegistryError> {
        let mut client = self.client.clone();
        client.lease_revoke(lease.0).await.map_err(|e| {
            RegistryError::ConnectionError(format!("Failed to revoke lease {}: {}", lease, e))
        })?;

        info!("Revoked lease {}", lease);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renewal_interval() {
        assert_eq!(renewal_interval(10), Duration::from_secs(3));
        assert_eq!(renewal_interval(30), Duration::from_secs(10));
        assert_eq!(renewal_interval(2), Duration::from_secs(1));
    }
}
