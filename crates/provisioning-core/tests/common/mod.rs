// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for provisioning-core integration tests.
//!
//! Provides TestContext wiring the registry, dispatcher, engine and restore
//! coordinator over a SQLite database, with a recording execution client.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use sqlx::sqlite::SqlitePoolOptions;

use provisioning_core::dispatch::{DispatchFollowUp, DispatchRequest, Dispatcher, ExecutionClient};
use provisioning_core::engine::{CallbackDispatchEngine, CallbackEvent, CallbackOutcome};
use provisioning_core::error::{EngineError, Result};
use provisioning_core::migrations;
use provisioning_core::model::{
    ActionKind, PendingHandler, RequestId, ResourceKey, ResourceStatusRecord,
};
use provisioning_core::persistence::{SqlitePersistence, StatusStore};
use provisioning_core::registry::{CallbackHandlerRegistry, CallbackSubscriptions};
use provisioning_core::restore::RestoreCoordinator;

/// Skip the test unless a PostgreSQL database is configured.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// Execution client that records every submitted handler.
#[derive(Default)]
pub struct RecordingExecutor {
    submitted: Mutex<Vec<PendingHandler>>,
    refuse: Mutex<Option<String>>,
}

impl RecordingExecutor {
    pub fn submitted(&self) -> Vec<PendingHandler> {
        self.submitted.lock().unwrap().clone()
    }

    /// Submissions of `action`, oldest first.
    pub fn submitted_for(&self, action: ActionKind) -> Vec<PendingHandler> {
        self.submitted()
            .into_iter()
            .filter(|h| h.action == action)
            .collect()
    }

    /// Make subsequent submissions fail with `reason`.
    pub fn refuse_with(&self, reason: &str) {
        *self.refuse.lock().unwrap() = Some(reason.to_string());
    }
}

#[async_trait]
impl ExecutionClient for RecordingExecutor {
    async fn submit(&self, handler: &PendingHandler) -> Result<()> {
        if let Some(reason) = self.refuse.lock().unwrap().clone() {
            return Err(EngineError::DispatchFailed {
                request_id: handler.request_id.to_string(),
                reason,
            });
        }
        self.submitted.lock().unwrap().push(handler.clone());
        Ok(())
    }
}

/// Test context with every component wired over one SQLite store.
pub struct TestContext {
    pub store: Arc<SqlitePersistence>,
    pub registry: CallbackHandlerRegistry,
    pub subscriptions: Arc<CallbackSubscriptions>,
    pub executor: Arc<RecordingExecutor>,
    pub dispatcher: Arc<Dispatcher>,
    pub engine: Arc<CallbackDispatchEngine>,
    pub restore: Arc<RestoreCoordinator>,
}

impl TestContext {
    /// Context over a fresh in-memory database.
    pub async fn in_memory() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");
        Self::with_store(Arc::new(SqlitePersistence::new(pool)))
    }

    /// Context over a file-backed database, as a fresh process would open it.
    pub async fn at_path(path: &Path) -> Self {
        let store = SqlitePersistence::from_path(path)
            .await
            .expect("Failed to open SQLite database");
        Self::with_store(Arc::new(store))
    }

    pub fn with_store(store: Arc<SqlitePersistence>) -> Self {
        let subscriptions = Arc::new(CallbackSubscriptions::new());
        let registry = CallbackHandlerRegistry::new(store.clone()).with_page_size(3);
        let executor = Arc::new(RecordingExecutor::default());
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            store.clone(),
            executor.clone(),
            subscriptions.clone(),
        ));
        let engine = Arc::new(
            CallbackDispatchEngine::new(registry.clone(), store.clone(), subscriptions.clone())
                .with_follow_up(Arc::new(DispatchFollowUp::new(dispatcher.clone()))),
        );
        let restore = Arc::new(RestoreCoordinator::new(
            registry.clone(),
            store.clone(),
            subscriptions.clone(),
        ));

        Self {
            store,
            registry,
            subscriptions,
            executor,
            dispatcher,
            engine,
            restore,
        }
    }

    /// Deliver a callback the way the HTTP layer would.
    pub async fn deliver(&self, request_id: &RequestId, payload: Value) -> Result<CallbackOutcome> {
        let handler = self.registry.get(request_id).await?;
        self.engine
            .handle_callback(CallbackEvent {
                request_id: request_id.clone(),
                route: handler.map(|h| (h.resource_kind, h.action)),
                payload,
            })
            .await
    }

    pub async fn status(&self, key: &ResourceKey) -> Option<ResourceStatusRecord> {
        self.store
            .get_status(key)
            .await
            .expect("Failed to read status")
    }

    /// Dispatch `request` and answer it with a plain success callback.
    pub async fn dispatch_and_succeed(&self, request: DispatchRequest) -> RequestId {
        let request_id = self
            .dispatcher
            .dispatch(request)
            .await
            .expect("Dispatch should succeed");
        self.deliver(&request_id, json!({"status": "ok"}))
            .await
            .expect("Callback should succeed");
        request_id
    }

    pub async fn close(&self) {
        self.store.pool().close().await;
    }
}
