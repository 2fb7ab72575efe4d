// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Database backend selected by the URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    Sqlite,
    Postgres,
}

/// Provisioning engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// HTTP address callbacks are received on
    pub http_addr: SocketAddr,
    /// Base URL of the execution layer actions are submitted to
    pub execution_url: String,
    /// Externally reachable base URL of this service, used to build callback URLs
    pub callback_base_url: String,
    /// Page size when streaming handlers during restore
    pub restore_batch_size: i64,
    /// Request timeout towards the execution layer
    pub execution_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `PROVISIONING_DATABASE_URL`: `sqlite:` or `postgres://` connection string
    ///
    /// Optional (with defaults):
    /// - `PROVISIONING_HTTP_PORT`: callback server port (default: 8084)
    /// - `PROVISIONING_EXECUTION_URL`: execution layer base URL (default: http://127.0.0.1:8085)
    /// - `PROVISIONING_CALLBACK_BASE_URL`: base URL for callbacks (default: http://127.0.0.1:8084)
    /// - `PROVISIONING_RESTORE_BATCH_SIZE`: restore page size (default: 100)
    /// - `PROVISIONING_EXECUTION_TIMEOUT_SECS`: execution request timeout (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("PROVISIONING_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("PROVISIONING_DATABASE_URL"))?;
        if database_backend(&database_url).is_none() {
            return Err(ConfigError::Invalid(
                "PROVISIONING_DATABASE_URL",
                "must start with sqlite: or postgres://",
            ));
        }

        let http_port: u16 = parse_var(
            "PROVISIONING_HTTP_PORT",
            "8084",
            "must be a valid port number",
        )?;

        let execution_url = std::env::var("PROVISIONING_EXECUTION_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8085".to_string());
        let callback_base_url = std::env::var("PROVISIONING_CALLBACK_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8084".to_string());

        let restore_batch_size: i64 = parse_var(
            "PROVISIONING_RESTORE_BATCH_SIZE",
            "100",
            "must be a positive integer",
        )?;
        if restore_batch_size < 1 {
            return Err(ConfigError::Invalid(
                "PROVISIONING_RESTORE_BATCH_SIZE",
                "must be a positive integer",
            ));
        }

        let timeout_secs: u64 = parse_var(
            "PROVISIONING_EXECUTION_TIMEOUT_SECS",
            "30",
            "must be a whole number of seconds",
        )?;

        Ok(Self {
            database_url,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            execution_url,
            callback_base_url,
            restore_batch_size,
            execution_timeout: Duration::from_secs(timeout_secs),
        })
    }

    /// Backend implied by `database_url`.
    pub fn database_backend(&self) -> DatabaseBackend {
        database_backend(&self.database_url).unwrap_or(DatabaseBackend::Postgres)
    }
}

fn database_backend(url: &str) -> Option<DatabaseBackend> {
    if url.starts_with("sqlite:") {
        Some(DatabaseBackend::Sqlite)
    } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Some(DatabaseBackend::Postgres)
    } else {
        None
    }
}

fn parse_var<T: FromStr>(
    name: &'static str,
    default: &str,
    message: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(name, message))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
