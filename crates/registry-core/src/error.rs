//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Error types for the service registry

use thiserror::Error;

/// Error type for registration and discovery operations
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Registration error: {0}")]
    RegistrationError(String),

    #[error("No available endpoint for service: {0}")]
    NoAvailableEndpoint(String),

    #[error("Watch stream closed for service: {0}")]
    WatchStreamClosed(String),

    #[error("Lease expired: {0}")]
    LeaseExpired(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<etcd_client::Error> for RegistryError {
    fn from(err: etcd_client::Error) -> Self {
        RegistryError::ConnectionError(err.to_string())
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        RegistryError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for RegistryError {
    fn from(err: toml::de::Error) -> Self {
        RegistryError::Configuration(err.to_string())
    }
}

impl From<tokio::task::JoinError> for RegistryError {
    fn from(err: tokio::task::JoinError) -> Self {
        RegistryError::Shutdown(err.to_string())
    }
}
