//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Common types for registration and discovery

use crate::error::RegistryError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lease identifier issued by the coordination store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Record key of the form `<prefix>/<service>/<discriminator>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub prefix: String,
    pub service_name: String,
    pub discriminator: String,
}

impl ServiceKey {
    pub fn new(
        prefix: impl Into<String>,
        service_name: impl Into<String>,
        discriminator: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            service_name: service_name.into(),
            discriminator: discriminator.into(),
        }
    }

    /// Prefix covering every instance of a service, trailing slash included
    pub fn service_prefix(prefix: &str, service_name: &str) -> String {
        format!("{}/{}/", prefix, service_name)
    }

    /// Parse a full record key under the given prefix
    pub fn parse(prefix: &str, key: &str) -> Result<Self, RegistryError> {
        let rest = key
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                RegistryError::InvalidKey(format!("{} is not under prefix {}", key, prefix))
            })?;

        match rest.split_once('/') {
            Some((service_name, discriminator))
                if !service_name.is_empty()
                    && !discriminator.is_empty()
                    && !discriminator.contains('/') =>
            {
                Ok(Self::new(prefix, service_name, discriminator))
            }
            _ => Err(RegistryError::InvalidKey(format!(
                "{} does not name a service instance",
                key
            ))),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.prefix, self.service_name, self.discriminator)
    }
}

/// Check that a service name or discriminator is a single key segment
pub fn validate_key_segment(what: &str, value: &str) -> Result<(), RegistryError> {
    if value.is_empty() {
        return Err(RegistryError::InvalidKey(format!("{} must not be empty", what)));
    }
    if value.contains('/') {
        return Err(RegistryError::InvalidKey(format!(
            "{} must not contain '/': {}",
            what, value
        )));
    }
    Ok(())
}

/// Extract the port part of a `host:port` address
pub fn discriminator_from_address(address: &str) -> Result<String, RegistryError> {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(port.to_string())
        }
        _ => Err(RegistryError::InvalidKey(format!(
            "address {} is not in host:port form",
            address
        ))),
    }
}

/// One endpoint returned by selection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub key: String,
    pub address: String,
}

/// Kind of change carried by a watch event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Put,
    Delete,
}

/// Change event emitted by the store for a watched prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    pub value: String,
    pub prev_value: Option<String>,
}

impl WatchEvent {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Put,
            key: key.into(),
            value: value.into(),
            prev_value: None,
        }
    }

    pub fn delete(key: impl Into<String>, prev_value: Option<String>) -> Self {
        Self {
            kind: EventKind::Delete,
            key: key.into(),
            value: String::new(),
            prev_value,
        }
    }
}

/// Renewal acknowledgement from a keepalive stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveAck {
    pub lease: LeaseId,

    /// Remaining TTL in seconds after the renewal
    pub ttl: i64,
}
