// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning Core - standalone callback engine
//!
//! Receives callbacks from the execution layer over HTTP, reconciles resource
//! status, and re-attaches pending handlers on startup.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use provisioning_core::config::{Config, DatabaseBackend};
use provisioning_core::dispatch::HttpExecutionClient;
use provisioning_core::persistence::{SqlitePersistence, postgres};
use provisioning_core::runtime::EngineRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("provisioning_core=info".parse()?),
        )
        .init();

    info!("Starting Provisioning Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        http_addr = %config.http_addr,
        execution_url = %config.execution_url,
        backend = ?config.database_backend(),
        "Configuration loaded"
    );

    let executor = Arc::new(HttpExecutionClient::new(
        config.execution_url.clone(),
        config.callback_base_url.clone(),
        config.execution_timeout,
    )?);

    let builder = EngineRuntime::builder()
        .executor(executor)
        .bind_addr(config.http_addr)
        .restore_batch_size(config.restore_batch_size);

    // Connect to database and run migrations
    info!("Connecting to database...");
    let builder = match config.database_backend() {
        DatabaseBackend::Sqlite => {
            builder.persistence(Arc::new(SqlitePersistence::connect(&config.database_url).await?))
        }
        DatabaseBackend::Postgres => {
            builder.persistence(Arc::new(postgres::connect(&config.database_url, 10).await?))
        }
    };
    info!("Database ready");

    let runtime = builder.build()?.start().await?;
    let report = runtime.restore_report();
    info!(
        examined = report.examined,
        reattached = report.reattached,
        discarded = report.discarded,
        "Provisioning Core initialized successfully"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
