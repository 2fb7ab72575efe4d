// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable registry of pending callback handlers.
//!
//! [`CallbackHandlerRegistry`] is the correlation table between dispatched
//! actions and their callbacks. Every mutation is a single conditional
//! statement in the [`HandlerStore`], so concurrent resolvers of the same
//! request id race in the database rather than in this process.
//!
//! [`CallbackSubscriptions`] is the in-memory index of handlers this process
//! is currently waiting on. It is rebuilt from the registry on restore.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::{PendingHandler, RequestId, ResourceKey};
use crate::persistence::HandlerStore;

/// Default page size for [`CallbackHandlerRegistry::list_all`].
pub const DEFAULT_PAGE_SIZE: i64 = 100;

/// Durable map of request id to pending handler.
#[derive(Clone)]
pub struct CallbackHandlerRegistry {
    store: Arc<dyn HandlerStore>,
    process_token: String,
    page_size: i64,
}

impl std::fmt::Debug for CallbackHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandlerRegistry")
            .field("store", &"...")
            .field("process_token", &self.process_token)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl CallbackHandlerRegistry {
    /// Create a registry with a fresh process token.
    pub fn new(store: Arc<dyn HandlerStore>) -> Self {
        Self {
            store,
            process_token: Uuid::new_v4().to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Page size used when streaming handlers. Values below 1 are clamped to 1.
    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Override the process token used as claim owner.
    pub fn with_process_token(mut self, token: impl Into<String>) -> Self {
        self.process_token = token.into();
        self
    }

    /// Token identifying claims made by this process lifetime.
    pub fn process_token(&self) -> &str {
        &self.process_token
    }

    /// Durably record a handler.
    #[instrument(skip(self, handler), fields(request_id = %handler.request_id, action = %handler.action))]
    pub async fn register(&self, handler: &PendingHandler) -> Result<()> {
        if !self.store.insert_handler(handler).await? {
            return Err(EngineError::DuplicateRequest {
                request_id: handler.request_id.to_string(),
            });
        }
        debug!("Handler registered");
        Ok(())
    }

    /// Claim a handler for this process.
    ///
    /// Fails with `NotFound` if the handler is unknown, already completed, or
    /// claimed by another resolver.
    #[instrument(skip(self), fields(request_id = %request_id))]
    pub async fn resolve(&self, request_id: &RequestId) -> Result<PendingHandler> {
        self.store
            .claim_handler(request_id, &self.process_token)
            .await?
            .ok_or_else(|| EngineError::not_found(request_id.as_str()))
    }

    /// Remove a handler. A second call for the same id fails with `NotFound`.
    #[instrument(skip(self), fields(request_id = %request_id))]
    pub async fn complete(&self, request_id: &RequestId) -> Result<()> {
        if self.store.delete_handler(request_id).await? {
            debug!("Handler completed");
            Ok(())
        } else {
            Err(EngineError::not_found(request_id.as_str()))
        }
    }

    /// Drop the claim on a handler so its callback can be delivered again.
    #[instrument(skip(self), fields(request_id = %request_id))]
    pub async fn release(&self, request_id: &RequestId) -> Result<()> {
        if self.store.release_handler(request_id).await? {
            Ok(())
        } else {
            Err(EngineError::not_found(request_id.as_str()))
        }
    }

    /// Handlers registered against `key`, claimed or not.
    pub async fn pending_for(&self, key: &ResourceKey) -> Result<Vec<PendingHandler>> {
        self.store.list_handlers_for_resource(key).await
    }

    /// Read a handler without claiming it.
    pub async fn get(&self, request_id: &RequestId) -> Result<Option<PendingHandler>> {
        self.store.get_handler(request_id).await
    }

    /// Stream every registered handler, one page at a time, ordered by request id.
    ///
    /// The stream is lazy and finite; calling this again restarts from the
    /// beginning. Handlers completed while the stream is open may or may not
    /// be yielded.
    pub fn list_all(&self) -> BoxStream<'static, Result<PendingHandler>> {
        let store = self.store.clone();
        let page_size = self.page_size;

        // State: `None` once the last page has been read.
        stream::try_unfold(Some(None::<RequestId>), move |cursor| {
            let store = store.clone();
            async move {
                let Some(after) = cursor else {
                    return Ok(None);
                };
                let page = store.list_handlers(after.as_ref(), page_size).await?;
                if page.is_empty() {
                    return Ok(None);
                }
                let next = if (page.len() as i64) < page_size {
                    None
                } else {
                    page.last().map(|h| Some(h.request_id.clone()))
                };
                Ok::<_, EngineError>(Some((stream::iter(page.into_iter().map(Ok)), next)))
            }
        })
        .try_flatten()
        .boxed()
    }
}

/// In-memory index of the handlers this process is waiting on.
///
/// The lock is only held around map operations, never across an await.
#[derive(Debug, Default)]
pub struct CallbackSubscriptions {
    attached: Mutex<HashMap<RequestId, String>>,
}

impl CallbackSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a handler's callback route. Returns `false` if it was already attached.
    pub fn attach(&self, handler: &PendingHandler) -> bool {
        self.lock()
            .insert(handler.request_id.clone(), handler.callback_uri.clone())
            .is_none()
    }

    /// Detach a handler. Returns `false` if it was not attached.
    pub fn detach(&self, request_id: &RequestId) -> bool {
        self.lock().remove(request_id).is_some()
    }

    pub fn is_attached(&self, request_id: &RequestId) -> bool {
        self.lock().contains_key(request_id)
    }

    /// Number of attached handlers per callback route.
    pub fn by_callback_uri(&self) -> BTreeMap<String, usize> {
        let mut routes = BTreeMap::new();
        for uri in self.lock().values() {
            *routes.entry(uri.clone()).or_insert(0) += 1;
        }
        routes
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, String>> {
        self.attached.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations;
    use crate::model::{ActionKind, ResourceKind};
    use crate::persistence::SqlitePersistence;
    use chrono::Utc;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_registry() -> CallbackHandlerRegistry {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");
        CallbackHandlerRegistry::new(Arc::new(SqlitePersistence::new(pool)))
    }

    fn handler(request_id: &str) -> PendingHandler {
        PendingHandler {
            request_id: RequestId::from(request_id),
            action: ActionKind::Start,
            resource_kind: ResourceKind::Exploratory,
            owner: "bob".to_string(),
            exploratory_name: "analysis".to_string(),
            computational_name: None,
            callback_uri: "/api/callbacks/exploratory/start".to_string(),
            context: serde_json::json!({}),
            created_at: Utc::now(),
            claimed_by: None,
        }
    }

    #[tokio::test]
    async fn test_register_duplicate() {
        let registry = test_registry().await;
        registry.register(&handler("r-1")).await.unwrap();

        let err = registry.register(&handler("r-1")).await.unwrap_err();
        assert_eq!(err.error_code(), "DUPLICATE_REQUEST");
    }

    #[tokio::test]
    async fn test_resolve_claims_for_process() {
        let registry = test_registry().await;
        registry.register(&handler("r-1")).await.unwrap();

        let resolved = registry.resolve(&RequestId::from("r-1")).await.unwrap();
        assert_eq!(resolved.claimed_by.as_deref(), Some(registry.process_token()));

        // A claimed handler is invisible to a second resolver
        let err = registry.resolve(&RequestId::from("r-1")).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        registry.release(&RequestId::from("r-1")).await.unwrap();
        assert!(registry.resolve(&RequestId::from("r-1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_unknown() {
        let registry = test_registry().await;
        let err = registry.resolve(&RequestId::from("ghost")).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_complete_twice() {
        let registry = test_registry().await;
        registry.register(&handler("r-1")).await.unwrap();

        registry.complete(&RequestId::from("r-1")).await.unwrap();
        let err = registry.complete(&RequestId::from("r-1")).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
        assert!(registry.get(&RequestId::from("r-1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_all_crosses_pages() {
        let registry = test_registry().await.with_page_size(2);
        for i in 0..5 {
            registry.register(&handler(&format!("r-{}", i))).await.unwrap();
        }

        let ids: Vec<String> = registry
            .list_all()
            .map_ok(|h| h.request_id.to_string())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(ids, vec!["r-0", "r-1", "r-2", "r-3", "r-4"]);

        // Restartable
        let again: Vec<PendingHandler> = registry.list_all().try_collect().await.unwrap();
        assert_eq!(again.len(), 5);
    }

    #[tokio::test]
    async fn test_list_all_empty_and_exact_page() {
        let registry = test_registry().await.with_page_size(2);
        let empty: Vec<PendingHandler> = registry.list_all().try_collect().await.unwrap();
        assert!(empty.is_empty());

        registry.register(&handler("a")).await.unwrap();
        registry.register(&handler("b")).await.unwrap();
        let all: Vec<PendingHandler> = registry.list_all().try_collect().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_subscriptions_attach_is_idempotent() {
        let subscriptions = CallbackSubscriptions::new();
        let h = handler("r-1");

        assert!(subscriptions.attach(&h));
        assert!(!subscriptions.attach(&h));
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(
            subscriptions.by_callback_uri().get("/api/callbacks/exploratory/start"),
            Some(&1)
        );

        assert!(subscriptions.detach(&h.request_id));
        assert!(!subscriptions.detach(&h.request_id));
        assert!(subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_page_size_is_clamped() {
        let registry = test_registry().await.with_page_size(0);
        assert_eq!(registry.page_size, 1);

        registry.register(&handler("a")).await.unwrap();
        registry.register(&handler("b")).await.unwrap();
        let all: Vec<PendingHandler> = registry.list_all().try_collect().await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
