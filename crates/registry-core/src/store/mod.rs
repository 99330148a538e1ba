//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Coordination store backends
//!
//! The registry only ever talks to the store through [`CoordinationStore`],
//! which mirrors the handful of primitives an etcd-like store offers: prefix
//! reads, prefix watches, leases with keepalive, and lease-bound puts.

pub mod etcd;
pub mod memory;

use crate::{
    error::RegistryError,
    types::{KeepAliveAck, LeaseId, WatchEvent},
};
use async_trait::async_trait;
use futures::stream::BoxStream;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// Stream of change events for one watched prefix
pub type WatchStream = BoxStream<'static, Result<WatchEvent, RegistryError>>;

/// Stream of renewal acknowledgements for one lease
pub type KeepAliveStream = BoxStream<'static, Result<KeepAliveAck, RegistryError>>;

/// Primitive operations consumed from the coordination store
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read every key/value pair under a prefix
    async fn range_get(&self, prefix: &str) -> Result<Vec<(String, String)>, RegistryError>;

    /// Subscribe to changes under a prefix; the stream ends when the
    /// subscription is lost
    async fn watch(&self, prefix: &str) -> Result<WatchStream, RegistryError>;

    /// Grant a lease with the given TTL in seconds
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId, RegistryError>;

    /// Write a key bound to a lease
    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<(), RegistryError>;

    /// Start renewing a lease, yielding one acknowledgement per renewal
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, RegistryError>;

    /// Revoke a lease, deleting every key bound to it
    async fn revoke(&self, lease: LeaseId) -> Result<(), RegistryError>;
}
