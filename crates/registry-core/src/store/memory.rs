//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! In-process coordination store
//!
//! Behaves like a single etcd member as far as the registry can tell: leases
//! expire on the tokio clock, expiry and revocation delete the bound keys and
//! notify watchers, and keepalive streams renew the lease every third of its
//! TTL. Faults can be injected to exercise the failure paths.

use super::{CoordinationStore, KeepAliveStream, WatchStream};
use crate::{
    error::RegistryError,
    types::{EventKind, KeepAliveAck, LeaseId, WatchEvent},
};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

struct StoredValue {
    value: String,
    lease: Option<LeaseId>,
}

struct LeaseEntry {
    ttl: i64,
    deadline: Instant,
    keys: HashSet<String>,
}

struct Watcher {
    prefix: String,
    sender: mpsc::UnboundedSender<Result<WatchEvent, RegistryError>>,
}

#[derive(Default)]
struct State {
    next_lease: i64,
    data: BTreeMap<String, StoredValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    watchers: Vec<Watcher>,
}

impl State {
    fn notify(&mut self, event: WatchEvent) {
        self.watchers.retain(|watcher| {
            if !event.key.starts_with(&watcher.prefix) {
                return !watcher.sender.is_closed();
            }
            watcher.sender.send(Ok(event.clone())).is_ok()
        });
    }

    fn set(&mut self, key: &str, value: &str, lease: Option<LeaseId>) {
        let previous = self.data.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                lease,
            },
        );

        if let Some(previous) = &previous {
            if let Some(old_lease) = previous.lease.filter(|old| Some(*old) != lease) {
                if let Some(entry) = self.leases.get_mut(&old_lease) {
                    entry.keys.remove(key);
                }
            }
        }
        if let Some(entry) = lease.and_then(|lease| self.leases.get_mut(&lease)) {
            entry.keys.insert(key.to_string());
        }

        self.notify(WatchEvent {
            kind: EventKind::Put,
            key: key.to_string(),
            value: value.to_string(),
            prev_value: previous.map(|previous| previous.value),
        });
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.data.remove(key) {
            Some(previous) => {
                if let Some(entry) = previous.lease.and_then(|lease| self.leases.get_mut(&lease)) {
                    entry.keys.remove(key);
                }
                self.notify(WatchEvent::delete(key, Some(previous.value)));
                true
            }
            None => false,
        }
    }

    fn drop_lease(&mut self, lease: LeaseId) -> bool {
        match self.leases.remove(&lease) {
            Some(entry) => {
                let mut keys: Vec<String> = entry.keys.into_iter().collect();
                keys.sort();
                for key in keys {
                    self.remove(&key);
                }
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct Faults {
    fail_grants: AtomicBool,
    fail_puts: AtomicBool,
    fail_range_gets: AtomicBool,
    fail_watches: AtomicBool,
    keep_alive_generation: AtomicU64,
}

/// In-memory coordination store with lease expiry and watch fan-out
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    faults: Arc<Faults>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a key that is not bound to any lease
    pub fn insert(&self, key: &str, value: &str) {
        self.state.lock().set(key, value, None);
    }

    /// Delete a key, returning whether it existed
    pub fn remove(&self, key: &str) -> bool {
        self.state.lock().remove(key)
    }

    /// Current value of a key
    pub fn value(&self, key: &str) -> Option<String> {
        self.state.lock().data.get(key).map(|stored| stored.value.clone())
    }

    /// Whether a lease is still alive
    pub fn lease_alive(&self, lease: LeaseId) -> bool {
        self.state.lock().leases.contains_key(&lease)
    }

    /// Number of open watch subscriptions
    pub fn watcher_count(&self) -> usize {
        let mut state = self.state.lock();
        state.watchers.retain(|watcher| !watcher.sender.is_closed());
        state.watchers.len()
    }

    /// End every open watch stream, as a store restart would
    pub fn close_watches(&self) {
        self.state.lock().watchers.clear();
    }

    /// Deliver an error to every open watch stream
    pub fn error_watches(&self, reason: &str) {
        self.state.lock().watchers.retain(|watcher| {
            watcher
                .sender
                .send(Err(RegistryError::ConnectionError(reason.to_string())))
                .is_ok()
        });
    }

    /// End every open keepalive stream without revoking the leases
    pub fn sever_keep_alives(&self) {
        self.faults
            .keep_alive_generation
            .fetch_add(1, Ordering::SeqCst);
    }

    /// Make lease grants fail
    pub fn fail_grants(&self, fail: bool) {
        self.faults.fail_grants.store(fail, Ordering::SeqCst);
    }

    /// Make puts fail
    pub fn fail_puts(&self, fail: bool) {
        self.faults.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Make prefix reads fail
    pub fn fail_range_gets(&self, fail: bool) {
        self.faults.fail_range_gets.store(fail, Ordering::SeqCst);
    }

    /// Make new watch subscriptions fail
    pub fn fail_watches(&self, fail: bool) {
        self.faults.fail_watches.store(fail, Ordering::SeqCst);
    }

    fn spawn_expiry(&self, lease: LeaseId) {
        let state = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            loop {
                let Some(shared) = state.upgrade() else { return };
                let deadline = {
                    let mut guard = shared.lock();
                    let Some(deadline) = guard.leases.get(&lease).map(|entry| entry.deadline)
                    else {
                        return;
                    };
                    if deadline <= Instant::now() {
                        debug!("Lease {} expired", lease);
                        guard.drop_lease(lease);
                        return;
                    }
                    deadline
                };
                drop(shared);
                tokio::time::sleep_until(deadline).await;
            }
        });
    }
}

fn renewal_interval(ttl: i64) -> Duration {
    Duration::from_millis((ttl.max(1) as u64 * 1000) / 3)
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn range_get(&self, prefix: &str) -> Result<Vec<(String, String)>, RegistryError> {
        if self.faults.fail_range_gets.load(Ordering::SeqCst) {
            return Err(RegistryError::ConnectionError(format!(
                "range read of {} failed",
                prefix
            )));
        }

        let state = self.state.lock();
        Ok(state
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, stored)| (key.clone(), stored.value.clone()))
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream, RegistryError> {
        if self.faults.fail_watches.load(Ordering::SeqCst) {
            return Err(RegistryError::ConnectionError(format!(
                "watch of {} failed",
                prefix
            )));
        }

        let (sender, mut receiver) = mpsc::unbounded_channel();
        self.state.lock().watchers.push(Watcher {
            prefix: prefix.to_string(),
            sender,
        });

        let stream = async_stream::stream! {
            while let Some(item) = receiver.recv().await {
                yield item;
            }
        };
        Ok(stream.boxed())
    }

    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId, RegistryError> {
        if self.faults.fail_grants.load(Ordering::SeqCst) {
            return Err(RegistryError::RegistrationError(
                "lease grant rejected".to_string(),
            ));
        }
        if ttl_secs < 1 {
            return Err(RegistryError::RegistrationError(format!(
                "invalid lease TTL {}",
                ttl_secs
            )));
        }

        let lease = {
            let mut state = self.state.lock();
            state.next_lease += 1;
            let lease = LeaseId(state.next_lease);
            state.leases.insert(
                lease,
                LeaseEntry {
                    ttl: ttl_secs,
                    deadline: Instant::now() + Duration::from_secs(ttl_secs as u64),
                    keys: HashSet::new(),
                },
            );
            lease
        };

        self.spawn_expiry(lease);
        Ok(lease)
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<(), RegistryError> {
        if self.faults.fail_puts.load(Ordering::SeqCst) {
            return Err(RegistryError::RegistrationError(format!(
                "put of {} rejected",
                key
            )));
        }

        let mut state = self.state.lock();
        if !state.leases.contains_key(&lease) {
            return Err(RegistryError::RegistrationError(format!(
                "lease {} not found",
                lease
            )));
        }
        state.set(key, value, Some(lease));
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, RegistryError> {
        if !self.lease_alive(lease) {
            return Err(RegistryError::LeaseExpired(format!(
                "lease {} not found",
                lease
            )));
        }

        let state = Arc::downgrade(&self.state);
        let faults = self.faults.clone();
        let generation = faults.keep_alive_generation.load(Ordering::SeqCst);

        let stream = async_stream::stream! {
            loop {
                if faults.keep_alive_generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                let Some(shared) = state.upgrade() else { break };
                let renewed = {
                    let mut guard = shared.lock();
                    guard.leases.get_mut(&lease).map(|entry| {
                        entry.deadline = Instant::now() + Duration::from_secs(entry.ttl as u64);
                        entry.ttl
                    })
                };
                drop(shared);

                match renewed {
                    Some(ttl) => {
                        yield Ok(KeepAliveAck { lease, ttl });
                        tokio::time::sleep(renewal_interval(ttl)).await;
                    }
                    None => {
                        yield Err(RegistryError::LeaseExpired(format!(
                            "lease {} not found",
                            lease
                        )));
                        break;
                    }
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), RegistryError> {
        if self.state.lock().drop_lease(lease) {
            Ok(())
        } else {
            Err(RegistryError::LeaseExpired(format!(
                "lease {} not found",
                lease
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_range_get_is_prefix_scoped() {
        let store = MemoryStore::new();
        store.insert("services/user/8088", "127.0.0.1:8088");
        store.insert("services/user/8089", "127.0.0.1:8089");
        store.insert("services/users/9000", "127.0.0.1:9000");

        let pairs = store.range_get("services/user/").await.unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "services/user/8088");
    }

    #[tokio::test]
    async fn test_watch_receives_put_and_delete() {
        let store = MemoryStore::new();
        let mut events = store.watch("services/user/").await.unwrap();

        store.insert("services/user/8088", "127.0.0.1:8088");
        store.insert("services/other/1", "127.0.0.1:1");
        store.remove("services/user/8088");

        let put = events.next().await.unwrap().unwrap();
        assert_eq!(put.kind, EventKind::Put);
        assert_eq!(put.value, "127.0.0.1:8088");

        let delete = events.next().await.unwrap().unwrap();
        assert_eq!(delete.kind, EventKind::Delete);
        assert_eq!(delete.prev_value.as_deref(), Some("127.0.0.1:8088"));

        store.close_watches();
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_error_watches_reaches_open_streams() {
        let store = MemoryStore::new();
        let mut events = store.watch("services/user/").await.unwrap();

        store.error_watches("member lost");
        match events.next().await {
            Some(Err(RegistryError::ConnectionError(reason))) => assert_eq!(reason, "member lost"),
            other => panic!("unexpected item {:?}", other.map(|item| item.is_ok())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_deletes_bound_keys() {
        let store = MemoryStore::new();
        let lease = store.grant(5).await.unwrap();
        store.put("services/user/8088", "127.0.0.1:8088", lease).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(store.value("services/user/8088").is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.value("services/user/8088").is_none());
        assert!(!store.lease_alive(lease));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_extends_lease_until_severed() {
        let store = MemoryStore::new();
        let lease = store.grant(3).await.unwrap();
        store.put("services/user/8088", "127.0.0.1:8088", lease).await.unwrap();

        let mut acks = store.keep_alive(lease).await.unwrap();
        let consumer = tokio::spawn(async move {
            let mut count = 0;
            while let Some(Ok(_)) = acks.next().await {
                count += 1;
            }
            count
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(store.lease_alive(lease));

        store.sever_keep_alives();
        let renewals = consumer.await.unwrap();
        assert!(renewals >= 10);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!store.lease_alive(lease));
        assert!(store.value("services/user/8088").is_none());
    }

    #[tokio::test]
    async fn test_put_requires_live_lease() {
        let store = MemoryStore::new();
        let result = store.put("services/user/1", "127.0.0.1:1", LeaseId(42)).await;
        assert!(matches!(result, Err(RegistryError::RegistrationError(_))));
    }
}
