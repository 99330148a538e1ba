//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Watch-driven discovery
//!
//! Each tracked service gets its own task that applies the store's change
//! events for `<prefix>/<service>/` to the shared [`DiscoveryCache`]. The
//! subscription is opened before the bootstrap read, so changes that land
//! between the read and the first received event are replayed rather than
//! lost; replaying them on top of the read is harmless because puts and
//! deletes are idempotent.
//!
//! When a stream closes, the task either gives up (reconnect disabled: the
//! service's entries simply stop updating) or re-reads and resubscribes with
//! exponential backoff until `max_attempts` consecutive failures.

use crate::{
    cache::DiscoveryCache,
    config::ReconnectConfig,
    error::RegistryError,
    store::{CoordinationStore, WatchStream},
    types::{validate_key_segment, ServiceKey, WatchEvent},
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of one tracked service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum WatchState {
    Uninitialized,
    Bootstrapping,
    Watching,
    Reconnecting { attempt: u32 },
    Terminated { reason: String },
    Stopped,
}

impl WatchState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, WatchState::Terminated { .. })
    }

    /// Whether a task is still maintaining the service's entries
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            WatchState::Bootstrapping | WatchState::Watching | WatchState::Reconnecting { .. }
        )
    }
}

struct ServiceWatch {
    state: watch::Receiver<WatchState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[derive(Clone)]
struct WatchContext {
    store: Arc<dyn CoordinationStore>,
    cache: Arc<DiscoveryCache>,
    prefix: String,
    service_name: String,
    service_prefix: String,
    reconnect: ReconnectConfig,
}

impl WatchContext {
    /// Open the subscription, then read and install the current records
    async fn subscribe(&self) -> Result<WatchStream, RegistryError> {
        let events = self.store.watch(&self.service_prefix).await?;
        let records = self.store.range_get(&self.service_prefix).await?;
        let count = self.cache.replace_service(
            &self.service_name,
            records.into_iter().filter(|(key, _)| self.owns(key)),
        );
        info!(
            "Bootstrapped service {} with {} endpoints",
            self.service_name, count
        );
        Ok(events)
    }

    /// Whether a key is an instance record of this service
    ///
    /// Keys nested deeper than `<prefix>/<service>/<discriminator>` share the
    /// watched prefix but belong to no service.
    fn owns(&self, key: &str) -> bool {
        match ServiceKey::parse(&self.prefix, key) {
            Ok(parsed) if parsed.service_name == self.service_name => true,
            _ => {
                warn!("Ignoring key {} under service {}", key, self.service_name);
                false
            }
        }
    }

    fn apply(&self, event: &WatchEvent) {
        if self.owns(&event.key) {
            self.cache.apply(&self.service_name, event);
        }
    }
}

/// Keeps the discovery cache in step with the store for a set of services
pub struct DiscoveryWatcher {
    store: Arc<dyn CoordinationStore>,
    cache: Arc<DiscoveryCache>,
    prefix: String,
    reconnect: ReconnectConfig,
    services: Mutex<HashMap<String, ServiceWatch>>,
}

impl DiscoveryWatcher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        cache: Arc<DiscoveryCache>,
        prefix: impl Into<String>,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self {
            store,
            cache,
            prefix: prefix.into(),
            reconnect,
            services: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<DiscoveryCache> {
        &self.cache
    }

    /// Bootstrap a service and start watching it
    ///
    /// Returns once the service's records are in the cache. Tracking a
    /// service that is already live is a no-op; a terminated or stopped
    /// service is bootstrapped again.
    pub async fn track(&self, service_name: &str) -> Result<(), RegistryError> {
        validate_key_segment("service name", service_name)?;

        let (state_tx, state_rx) = watch::channel(WatchState::Bootstrapping);
        let cancel = CancellationToken::new();

        let previous = {
            let mut services = self.services.lock();
            if let Some(existing) = services.get(service_name) {
                if existing.state.borrow().is_live() {
                    debug!("Service {} is already tracked", service_name);
                    return Ok(());
                }
            }
            services.insert(
                service_name.to_string(),
                ServiceWatch {
                    state: state_rx,
                    cancel: cancel.clone(),
                    task: None,
                },
            )
        };
        if let Some(mut previous) = previous {
            if let Some(task) = previous.task.take() {
                task.await?;
            }
        }

        let context = WatchContext {
            store: self.store.clone(),
            cache: self.cache.clone(),
            prefix: self.prefix.clone(),
            service_name: service_name.to_string(),
            service_prefix: ServiceKey::service_prefix(&self.prefix, service_name),
            reconnect: self.reconnect.clone(),
        };

        info!("Bootstrapping service {}", service_name);
        let events = match context.subscribe().await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to bootstrap service {}: {}", service_name, e);
                state_tx.send_replace(WatchState::Terminated {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        state_tx.send_replace(WatchState::Watching);
        let task = tokio::spawn(run_watch(context, events, state_tx, cancel));

        if let Some(entry) = self.services.lock().get_mut(service_name) {
            entry.task = Some(task);
        }
        Ok(())
    }

    /// Track several services; a failure for one does not affect the others
    pub async fn track_all<I, S>(&self, service_names: I) -> Vec<(String, RegistryError)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut failures = Vec::new();
        for service_name in service_names {
            let service_name = service_name.as_ref();
            if let Err(e) = self.track(service_name).await {
                failures.push((service_name.to_string(), e));
            }
        }
        failures
    }

    /// Current state of a service
    pub fn state(&self, service_name: &str) -> WatchState {
        self.services
            .lock()
            .get(service_name)
            .map(|entry| entry.state.borrow().clone())
            .unwrap_or(WatchState::Uninitialized)
    }

    /// Current state of every tracked service
    pub fn states(&self) -> HashMap<String, WatchState> {
        self.services
            .lock()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.state.borrow().clone()))
            .collect()
    }

    /// Receiver notified on every state change of a service
    pub fn subscribe_state(&self, service_name: &str) -> Option<watch::Receiver<WatchState>> {
        self.services
            .lock()
            .get(service_name)
            .map(|entry| entry.state.clone())
    }

    /// Names of every tracked service
    pub fn tracked(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop watching one service; its entries stay in the cache as last seen
    pub async fn untrack(&self, service_name: &str) -> Result<(), RegistryError> {
        let entry = self.services.lock().remove(service_name);
        if let Some(entry) = entry {
            join_watch(service_name, entry).await?;
        }
        Ok(())
    }

    /// Stop every watch task and wait for them to finish
    pub async fn stop(&self) -> Result<(), RegistryError> {
        let entries: Vec<(String, ServiceWatch)> = self.services.lock().drain().collect();
        info!("Stopping {} watch tasks", entries.len());

        let mut first_error = None;
        for (service_name, entry) in entries {
            if let Err(e) = join_watch(&service_name, entry).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for DiscoveryWatcher {
    fn drop(&mut self) {
        for entry in self.services.get_mut().values() {
            entry.cancel.cancel();
        }
    }
}

async fn join_watch(service_name: &str, mut entry: ServiceWatch) -> Result<(), RegistryError> {
    entry.cancel.cancel();
    if let Some(task) = entry.task.take() {
        task.await?;
    }
    debug!("Watch task for {} joined", service_name);
    Ok(())
}

async fn run_watch(
    context: WatchContext,
    mut events: WatchStream,
    state: watch::Sender<WatchState>,
    cancel: CancellationToken,
) {
    let service_name = context.service_name.clone();

    loop {
        let reason = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Stopped watching service {}", service_name);
                    state.send_replace(WatchState::Stopped);
                    return;
                }
                next = events.next() => match next {
                    Some(Ok(event)) => context.apply(&event),
                    Some(Err(e)) => break e.to_string(),
                    None => break "event stream ended".to_string(),
                }
            }
        };

        let closed = RegistryError::WatchStreamClosed(service_name.clone());
        if !context.reconnect.enabled {
            error!(
                "{} ({}); endpoints for {} will no longer update",
                closed, reason, service_name
            );
            state.send_replace(WatchState::Terminated {
                reason: format!("{}: {}", closed, reason),
            });
            return;
        }
        warn!("{} ({}); reconnecting", closed, reason);

        let mut attempt = 0;
        events = loop {
            attempt += 1;
            if attempt > context.reconnect.max_attempts {
                error!(
                    "Giving up on service {} after {} reconnect attempts; endpoints will no longer update",
                    service_name, context.reconnect.max_attempts
                );
                state.send_replace(WatchState::Terminated {
                    reason: format!(
                        "{}: reconnect failed after {} attempts",
                        closed, context.reconnect.max_attempts
                    ),
                });
                return;
            }

            state.send_replace(WatchState::Reconnecting { attempt });
            let delay = context.reconnect.backoff(attempt);
            debug!(
                "Reconnect attempt {} for {} in {:?}",
                attempt, service_name, delay
            );

            let result = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Stopped watching service {} while reconnecting", service_name);
                    state.send_replace(WatchState::Stopped);
                    return;
                }
                result = async {
                    tokio::time::sleep(delay).await;
                    context.subscribe().await
                } => result,
            };

            match result {
                Ok(events) => {
                    info!(
                        "Resubscribed to service {} after {} attempts",
                        service_name, attempt
                    );
                    break events;
                }
                Err(e) => warn!(
                    "Reconnect attempt {} for service {} failed: {}",
                    attempt, service_name, e
                ),
            }
        };

        state.send_replace(WatchState::Watching);
    }
}
