//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Lease-bound registration with keepalive
//!
//! A [`Registration`] is live for as long as its renewal task keeps consuming
//! keepalive acknowledgements. When the acknowledgement stream ends on its
//! own the record is left to expire with the lease and the registration
//! reports [`RegistrationState::Lost`]; nothing re-registers it.

use crate::{
    error::RegistryError,
    store::{CoordinationStore, KeepAliveStream},
    types::{discriminator_from_address, validate_key_segment, LeaseId, ServiceKey},
};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Observable state of a registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RegistrationState {
    /// Lease renewed `renewals` times, last reported TTL `ttl`
    Active {
        lease: LeaseId,
        ttl: i64,
        renewals: u64,
    },

    /// Renewal ended without being asked to; the record expires with the lease
    Lost { reason: String },

    /// Renewal stopped on request
    Stopped,
}

impl RegistrationState {
    pub fn is_active(&self) -> bool {
        matches!(self, RegistrationState::Active { .. })
    }

    pub fn is_lost(&self) -> bool {
        matches!(self, RegistrationState::Lost { .. })
    }
}

/// Registers service instances under TTL-bound leases
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn CoordinationStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Register `address` for `service_name`, using its port as discriminator
    pub async fn register(
        &self,
        service_name: &str,
        address: &str,
        ttl_secs: i64,
    ) -> Result<Registration, RegistryError> {
        let discriminator = discriminator_from_address(address)?;
        self.register_as(service_name, &discriminator, address, ttl_secs)
            .await
    }

    /// Register `address` for `service_name` under an explicit discriminator
    pub async fn register_as(
        &self,
        service_name: &str,
        discriminator: &str,
        address: &str,
        ttl_secs: i64,
    ) -> Result<Registration, RegistryError> {
        validate_key_segment("service name", service_name)?;
        validate_key_segment("discriminator", discriminator)?;
        if ttl_secs < 1 {
            return Err(RegistryError::Configuration(format!(
                "lease TTL must be at least 1 second, got {}",
                ttl_secs
            )));
        }

        let key = ServiceKey::new(&self.prefix, service_name, discriminator).to_string();

        let lease = self.store.grant(ttl_secs).await.map_err(|e| {
            error!("etcd create lease error: {}", e);
            RegistryError::RegistrationError(format!("Failed to grant lease: {}", e))
        })?;
        info!("Created lease {} with TTL {}s", lease, ttl_secs);

        if let Err(e) = self.store.put(&key, address, lease).await {
            error!("etcd lease put error: {}", e);
            self.release(lease).await;
            return Err(RegistryError::RegistrationError(format!(
                "Failed to write {}: {}",
                key, e
            )));
        }
        info!("Registered {} -> {} (lease: {})", key, address, lease);

        let acks = match self.store.keep_alive(lease).await {
            Ok(acks) => acks,
            Err(e) => {
                error!("Failed to start keepalive for lease {}: {}", lease, e);
                self.release(lease).await;
                return Err(RegistryError::RegistrationError(format!(
                    "Failed to keep lease {} alive: {}",
                    lease, e
                )));
            }
        };

        let (state_tx, state_rx) = watch::channel(RegistrationState::Active {
            lease,
            ttl: ttl_secs,
            renewals: 0,
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(renew(acks, state_tx, cancel.clone(), key.clone(), lease));

        Ok(Registration {
            service_name: service_name.to_string(),
            key,
            address: address.to_string(),
            lease,
            state: state_rx,
            cancel,
            task: Some(task),
            store: self.store.clone(),
        })
    }

    async fn release(&self, lease: LeaseId) {
        if let Err(e) = self.store.revoke(lease).await {
            warn!("Failed to release lease {}: {}", lease, e);
        }
    }
}

async fn renew(
    mut acks: KeepAliveStream,
    state: watch::Sender<RegistrationState>,
    cancel: CancellationToken,
    key: String,
    lease: LeaseId,
) {
    let mut renewals = 0u64;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("Stopped keeping lease {} alive for {}", lease, key);
                state.send_replace(RegistrationState::Stopped);
                return;
            }
            next = acks.next() => match next {
                Some(Ok(ack)) => {
                    renewals += 1;
                    match serde_json::to_string(&ack) {
                        Ok(body) => debug!("keep lease alive success: {}", body),
                        Err(_) => debug!("keep lease alive success: {:?}", ack),
                    }
                    state.send_replace(RegistrationState::Active {
                        lease,
                        ttl: ack.ttl,
                        renewals,
                    });
                }
                Some(Err(e)) => {
                    error!("Registration of {} lost, keepalive failed: {}", key, e);
                    state.send_replace(RegistrationState::Lost {
                        reason: e.to_string(),
                    });
                    return;
                }
                None => {
                    error!(
                        "Registration of {} lost, keepalive stream for lease {} ended",
                        key, lease
                    );
                    state.send_replace(RegistrationState::Lost {
                        reason: "keepalive stream ended".to_string(),
                    });
                    return;
                }
            }
        }
    }
}

/// Handle to one registered instance and its renewal task
///
/// Dropping the handle stops renewal; the record then expires with its lease.
pub struct Registration {
    service_name: String,
    key: String,
    address: String,
    lease: LeaseId,
    state: watch::Receiver<RegistrationState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    store: Arc<dyn CoordinationStore>,
}

impl Registration {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    /// Current registration state
    pub fn state(&self) -> RegistrationState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.state.clone()
    }

    /// Wait until renewal ends; returns the reason if the registration was lost
    pub async fn wait_lost(&self) -> Option<String> {
        let mut state = self.state.clone();
        let ended = state
            .wait_for(|state| !state.is_active())
            .await
            .map(|state| state.clone());

        match ended {
            Ok(RegistrationState::Lost { reason }) => Some(reason),
            _ => None,
        }
    }

    /// Stop renewing; the record disappears once the lease expires
    pub async fn stop(mut self) -> Result<(), RegistryError> {
        self.halt().await
    }

    /// Stop renewing and revoke the lease, removing the record immediately
    pub async fn deregister(mut self) -> Result<(), RegistryError> {
        self.halt().await?;
        self.store.revoke(self.lease).await?;
        info!("Deregistered {} (lease: {})", self.key, self.lease);
        Ok(())
    }

    async fn halt(&mut self) -> Result<(), RegistryError> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("key", &self.key)
            .field("address", &self.address)
            .field("lease", &self.lease)
            .field("state", &*self.state.borrow())
            .finish()
    }
}
