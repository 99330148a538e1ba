//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Configuration for the service registry

use crate::{
    error::RegistryError, types::validate_key_segment, DEFAULT_ETCD_ENDPOINT, DEFAULT_PREFIX,
    DEFAULT_TTL_SECS,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for registration and discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Key prefix shared by every service record
    pub prefix: String,

    /// Coordination store connection settings
    pub store: StoreConfig,

    /// Registration of this instance, if any
    pub registration: Option<RegistrationConfig>,

    /// Discovery settings
    pub discovery: DiscoveryConfig,

    /// Endpoint selection settings
    pub selection: SelectionConfig,

    /// How often the agent reports the discovered view
    pub report_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            store: StoreConfig::default(),
            registration: None,
            discovery: DiscoveryConfig::default(),
            selection: SelectionConfig::default(),
            report_interval: Duration::from_secs(30),
        }
    }
}

/// Coordination store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// etcd endpoints
    pub endpoints: Vec<String>,

    /// Timeout for establishing a connection
    pub connect_timeout: Duration,

    /// Interval between HTTP/2 keepalive probes
    pub keep_alive_interval: Duration,

    /// Time to wait for a keepalive probe response before closing
    pub keep_alive_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_ETCD_ENDPOINT.to_string()],
            connect_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(10),
        }
    }
}

/// Registration of this instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Service name to register under
    pub service_name: String,

    /// Host other instances reach this one on
    pub host: String,

    /// Listening port, also used as the record discriminator
    pub port: u16,

    /// Lease TTL in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,

    /// Revoke the lease on graceful shutdown instead of waiting for expiry
    #[serde(default)]
    pub deregister_on_shutdown: bool,
}

fn default_ttl_secs() -> i64 {
    DEFAULT_TTL_SECS
}

impl RegistrationConfig {
    /// Address advertised in the service record
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Service names to track
    pub services: Vec<String>,

    /// Watch reconnection settings
    pub reconnect: ReconnectConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            services: vec!["user".to_string()],
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Reconnect-with-backoff settings for watch supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Re-bootstrap and resubscribe when a watch stream closes
    pub enabled: bool,

    /// Consecutive failed attempts before giving up on a service
    pub max_attempts: u32,

    /// Delay before the first attempt
    pub initial_backoff: Duration,

    /// Upper bound on the delay between attempts
    pub max_backoff: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Baseline behavior: a closed watch stream is terminal
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before the given 1-based attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let delay_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Endpoint selection configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub strategy: SelectionStrategyKind,
}

/// Selection strategies available from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategyKind {
    #[default]
    Random,
    RoundRobin,
}

impl RegistryConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RegistryError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML document
    pub fn from_toml(content: &str) -> Result<Self, RegistryError> {
        let config: RegistryConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply `REGISTRY_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), RegistryError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), RegistryError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(prefix) = lookup("REGISTRY_PREFIX") {
            self.prefix = prefix;
        }

        if let Some(endpoints) = lookup("REGISTRY_ETCD_ENDPOINTS") {
            self.store.endpoints = split_list(&endpoints);
        }

        if let Some(services) = lookup("REGISTRY_DISCOVER") {
            self.discovery.services = split_list(&services);
        }

        let service_name = lookup("REGISTRY_SERVICE_NAME");
        let port = lookup("REGISTRY_SERVICE_PORT")
            .map(|port| {
                port.parse::<u16>().map_err(|e| {
                    RegistryError::Configuration(format!("Invalid REGISTRY_SERVICE_PORT: {}", e))
                })
            })
            .transpose()?;
        let ttl_secs = lookup("REGISTRY_TTL_SECS")
            .map(|ttl| {
                ttl.parse::<i64>().map_err(|e| {
                    RegistryError::Configuration(format!("Invalid REGISTRY_TTL_SECS: {}", e))
                })
            })
            .transpose()?;
        let host = lookup("REGISTRY_SERVICE_HOST");

        if self.registration.is_none() {
            if let (Some(service_name), Some(port)) = (service_name.clone(), port) {
                self.registration = Some(RegistrationConfig {
                    service_name,
                    host: host.clone().unwrap_or_else(|| "127.0.0.1".to_string()),
                    port,
                    ttl_secs: default_ttl_secs(),
                    deregister_on_shutdown: false,
                });
            }
        }

        if let Some(registration) = self.registration.as_mut() {
            if let Some(service_name) = service_name {
                registration.service_name = service_name;
            }
            if let Some(host) = host {
                registration.host = host;
            }
            if let Some(port) = port {
                registration.port = port;
            }
            if let Some(ttl_secs) = ttl_secs {
                registration.ttl_secs = ttl_secs;
            }
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), RegistryError> {
        validate_prefix(&self.prefix)?;

        if self.store.endpoints.is_empty() {
            return Err(RegistryError::Configuration(
                "At least one store endpoint is required".to_string(),
            ));
        }

        for service in &self.discovery.services {
            validate_service_name("discovery service name", service)?;
        }

        if let Some(registration) = &self.registration {
            validate_service_name("registration service name", &registration.service_name)?;
            if registration.host.is_empty() {
                return Err(RegistryError::Configuration(
                    "Registration host must not be empty".to_string(),
                ));
            }
            if registration.ttl_secs < 1 {
                return Err(RegistryError::Configuration(format!(
                    "Registration TTL must be at least 1 second, got {}",
                    registration.ttl_secs
                )));
            }
        }

        if self.report_interval.is_zero() {
            return Err(RegistryError::Configuration(
                "Report interval must be greater than zero".to_string(),
            ));
        }

        if self.discovery.reconnect.enabled && self.discovery.reconnect.backoff_multiplier < 1.0 {
            return Err(RegistryError::Configuration(
                "Reconnect backoff multiplier must be at least 1.0".to_string(),
            ));
        }

        Ok(())
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn validate_prefix(prefix: &str) -> Result<(), RegistryError> {
    if prefix.is_empty() {
        return Err(RegistryError::Configuration("prefix must not be empty".to_string()));
    }
    if prefix.starts_with('/') || prefix.ends_with('/') {
        return Err(RegistryError::Configuration(format!(
            "prefix must not start or end with '/': {}",
            prefix
        )));
    }
    Ok(())
}

fn validate_service_name(what: &str, name: &str) -> Result<(), RegistryError> {
    validate_key_segment(what, name).map_err(|e| RegistryError::Configuration(e.to_string()))
}
