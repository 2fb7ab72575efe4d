// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for provisioning-core.
//!
//! [`EngineRuntime`] wires the registry, dispatcher, callback engine and
//! restore coordinator over one persistence backend, restores pending
//! handlers, and serves the callback routes until shut down.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use provisioning_core::runtime::EngineRuntime;
//! use provisioning_core::persistence::SqlitePersistence;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path("data/engine.db").await?);
//!
//!     let runtime = EngineRuntime::builder()
//!         .persistence(persistence)
//!         .executor(executor)
//!         .bind_addr("0.0.0.0:8084".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let request_id = runtime.dispatcher().dispatch(request).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::dispatch::{DispatchFollowUp, Dispatcher, ExecutionClient};
use crate::engine::CallbackDispatchEngine;
use crate::persistence::{HandlerStore, StatusStore};
use crate::registry::{CallbackHandlerRegistry, CallbackSubscriptions, DEFAULT_PAGE_SIZE};
use crate::restore::{RestoreCoordinator, RestoreReport};
use crate::server::{self, AppState};

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    handlers: Option<Arc<dyn HandlerStore>>,
    statuses: Option<Arc<dyn StatusStore>>,
    executor: Option<Arc<dyn ExecutionClient>>,
    bind_addr: SocketAddr,
    restore_batch_size: i64,
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("persistence", &self.handlers.as_ref().map(|_| "..."))
            .field("executor", &self.executor.as_ref().map(|_| "..."))
            .field("bind_addr", &self.bind_addr)
            .field("restore_batch_size", &self.restore_batch_size)
            .finish()
    }
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            handlers: None,
            statuses: None,
            executor: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8084)),
            restore_batch_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence backend for both handlers and status records (required).
    pub fn persistence<P>(mut self, persistence: Arc<P>) -> Self
    where
        P: HandlerStore + StatusStore + 'static,
    {
        self.handlers = Some(persistence.clone() as Arc<dyn HandlerStore>);
        self.statuses = Some(persistence as Arc<dyn StatusStore>);
        self
    }

    /// Set the execution layer client (required).
    pub fn executor(mut self, executor: Arc<dyn ExecutionClient>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set the bind address for the callback HTTP server.
    ///
    /// Default: `0.0.0.0:8084`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Page size used when restoring handlers.
    pub fn restore_batch_size(mut self, size: i64) -> Self {
        self.restore_batch_size = size;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let (Some(handlers), Some(statuses)) = (self.handlers, self.statuses) else {
            anyhow::bail!("persistence is required");
        };
        let executor = self
            .executor
            .ok_or_else(|| anyhow::anyhow!("executor is required"))?;

        Ok(EngineRuntimeConfig {
            handlers,
            statuses,
            executor,
            bind_addr: self.bind_addr,
            restore_batch_size: self.restore_batch_size,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    handlers: Arc<dyn HandlerStore>,
    statuses: Arc<dyn StatusStore>,
    executor: Arc<dyn ExecutionClient>,
    bind_addr: SocketAddr,
    restore_batch_size: i64,
}

impl std::fmt::Debug for EngineRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeConfig")
            .field("persistence", &"...")
            .field("executor", &"...")
            .field("bind_addr", &self.bind_addr)
            .field("restore_batch_size", &self.restore_batch_size)
            .finish()
    }
}

impl EngineRuntimeConfig {
    /// Restore pending handlers, then start serving callbacks.
    pub async fn start(self) -> Result<EngineRuntime> {
        let subscriptions = Arc::new(CallbackSubscriptions::new());
        let registry =
            CallbackHandlerRegistry::new(self.handlers).with_page_size(self.restore_batch_size);

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            self.statuses.clone(),
            self.executor,
            subscriptions.clone(),
        ));
        let engine = Arc::new(
            CallbackDispatchEngine::new(registry.clone(), self.statuses.clone(), subscriptions.clone())
                .with_follow_up(Arc::new(DispatchFollowUp::new(dispatcher.clone()))),
        );
        let restore = Arc::new(RestoreCoordinator::new(
            registry.clone(),
            self.statuses,
            subscriptions,
        ));

        let restore_report = restore.restore().await;

        let listener = TcpListener::bind(self.bind_addr).await?;
        let bind_addr = listener.local_addr()?;
        let state = Arc::new(AppState::new(engine, restore));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(server::serve(listener, state.clone(), shutdown_rx));

        info!(
            addr = %bind_addr,
            process_token = %registry.process_token(),
            reattached = restore_report.reattached,
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            server_handle,
            shutdown_tx,
            state,
            dispatcher,
            bind_addr,
            restore_report,
        })
    }
}

/// A running provisioning engine that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    server_handle: JoinHandle<Result<()>>,
    shutdown_tx: watch::Sender<bool>,
    state: Arc<AppState>,
    dispatcher: Arc<Dispatcher>,
    bind_addr: SocketAddr,
    restore_report: RestoreReport,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Address the callback server is bound to.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Dispatcher for starting actions.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn engine(&self) -> &Arc<CallbackDispatchEngine> {
        &self.state.engine
    }

    pub fn restore_coordinator(&self) -> &Arc<RestoreCoordinator> {
        &self.state.restore
    }

    /// Report of the restore pass run at startup.
    pub fn restore_report(&self) -> RestoreReport {
        self.restore_report
    }

    /// Gracefully shut down the runtime.
    ///
    /// In-flight callbacks finish; new connections are refused.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        let _ = self.shutdown_tx.send(true);

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("EngineRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("EngineRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("EngineRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }
}
