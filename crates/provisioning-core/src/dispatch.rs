// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound actions: admission, handler registration and submission to the
//! execution layer.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{error, info, instrument, warn};

use crate::engine::FollowUpTrigger;
use crate::error::{EngineError, Result};
use crate::model::{
    ActionKind, PendingHandler, RequestId, ResourceDescriptor, ResourceKey, ResourceKind,
    ResourceStatusRecord, UserInstanceStatus,
};
use crate::persistence::StatusStore;
use crate::registry::{CallbackHandlerRegistry, CallbackSubscriptions};
use crate::status_mapper;

/// Context key linking a follow-up action to the request that caused it.
pub const ORIGIN_REQUEST_ID: &str = "origin_request_id";

/// Route the execution layer posts callbacks for `(resource_kind, action)` to.
pub fn callback_path(resource_kind: ResourceKind, action: ActionKind) -> String {
    format!("/api/callbacks/{}/{}", resource_kind, action)
}

/// Hands an action to the execution layer.
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Submit the action described by `handler`. The callback is expected later.
    async fn submit(&self, handler: &PendingHandler) -> Result<()>;
}

/// A request to run an action against a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub action: ActionKind,
    pub resource_kind: ResourceKind,
    pub owner: String,
    pub exploratory_name: String,
    pub computational_name: Option<String>,
    /// Opaque context stored with the handler and passed to follow-ups.
    pub context: Value,
}

impl DispatchRequest {
    pub fn exploratory(
        action: ActionKind,
        owner: impl Into<String>,
        exploratory_name: impl Into<String>,
    ) -> Self {
        Self {
            action,
            resource_kind: ResourceKind::Exploratory,
            owner: owner.into(),
            exploratory_name: exploratory_name.into(),
            computational_name: None,
            context: json!({}),
        }
    }

    pub fn computational(
        action: ActionKind,
        owner: impl Into<String>,
        exploratory_name: impl Into<String>,
        computational_name: impl Into<String>,
    ) -> Self {
        Self {
            action,
            resource_kind: ResourceKind::Computational,
            owner: owner.into(),
            exploratory_name: exploratory_name.into(),
            computational_name: Some(computational_name.into()),
            context: json!({}),
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey {
            owner: self.owner.clone(),
            exploratory_name: self.exploratory_name.clone(),
            computational_name: self.computational_name.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        require_non_empty("owner", &self.owner)?;
        require_non_empty("exploratory_name", &self.exploratory_name)?;
        match (self.resource_kind, self.computational_name.as_deref()) {
            (ResourceKind::Computational, Some(name)) => require_non_empty("computational_name", name),
            (ResourceKind::Computational, None) => Err(EngineError::ValidationError {
                field: "computational_name".to_string(),
                message: "required for computational resources".to_string(),
            }),
            (ResourceKind::Exploratory, Some(_)) => Err(EngineError::ValidationError {
                field: "computational_name".to_string(),
                message: "not allowed for exploratory resources".to_string(),
            }),
            (ResourceKind::Exploratory, None) => Ok(()),
        }
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(EngineError::ValidationError {
            field: field.to_string(),
            message: "must not be empty".to_string(),
        });
    }
    Ok(())
}

/// Starts actions and registers the handlers their callbacks resolve.
pub struct Dispatcher {
    registry: CallbackHandlerRegistry,
    statuses: Arc<dyn StatusStore>,
    executor: Arc<dyn ExecutionClient>,
    subscriptions: Arc<CallbackSubscriptions>,
}

impl Dispatcher {
    pub fn new(
        registry: CallbackHandlerRegistry,
        statuses: Arc<dyn StatusStore>,
        executor: Arc<dyn ExecutionClient>,
        subscriptions: Arc<CallbackSubscriptions>,
    ) -> Self {
        Self {
            registry,
            statuses,
            executor,
            subscriptions,
        }
    }

    /// Dispatch an action, returning the request id its callback must carry.
    ///
    /// Rejected with `ResourceBusy` unless the resource's current status
    /// admits the action and, for a resource already in progress, no other
    /// handler is pending for it. At most one action is outstanding per
    /// resource.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<RequestId> {
        self.dispatch_caused_by(request, None).await
    }

    /// Dispatch on behalf of the still pending handler `origin`, which does
    /// not count as outstanding for admission.
    #[instrument(
        skip(self, request, origin),
        fields(action = %request.action, resource_kind = %request.resource_kind)
    )]
    async fn dispatch_caused_by(
        &self,
        request: DispatchRequest,
        origin: Option<&RequestId>,
    ) -> Result<RequestId> {
        request.validate()?;

        let key = request.resource_key();
        let rule = status_mapper::rule(request.action);
        let current = self.statuses.get_status(&key).await?;
        let current_status = current.as_ref().map(|record| record.status);
        if !rule.admits(current_status) {
            return Err(busy(&key, current_status));
        }
        if current_status.is_some_and(|status| status.is_in_progress()) {
            let outstanding = self.registry.pending_for(&key).await?;
            if outstanding
                .iter()
                .any(|handler| Some(&handler.request_id) != origin)
            {
                return Err(busy(&key, current_status));
            }
        }

        let handler = PendingHandler {
            request_id: RequestId::generate(),
            action: request.action,
            resource_kind: request.resource_kind,
            owner: request.owner,
            exploratory_name: request.exploratory_name,
            computational_name: request.computational_name,
            callback_uri: callback_path(request.resource_kind, request.action),
            context: request.context,
            created_at: Utc::now(),
            claimed_by: None,
        };
        self.registry.register(&handler).await?;

        let in_progress = match &current {
            Some(record) => {
                let mut next = record.with_status(rule.in_progress);
                next.error_message = None;
                next
            }
            None => ResourceStatusRecord::new(key.clone(), handler.resource_kind, rule.in_progress),
        };
        let written = match self.statuses.put_status(&in_progress, current_status).await {
            Ok(written) => written,
            Err(e) => {
                self.discard(&handler.request_id).await;
                return Err(e);
            }
        };
        if !written {
            self.discard(&handler.request_id).await;
            let latest = self
                .statuses
                .get_status(&key)
                .await
                .ok()
                .flatten()
                .map(|record| record.status);
            return Err(busy(&key, latest));
        }

        self.subscriptions.attach(&handler);

        if let Err(e) = self.executor.submit(&handler).await {
            warn!(request_id = %handler.request_id, error = %e, "Execution layer refused action");
            let mut failed = in_progress.with_status(UserInstanceStatus::Failed);
            failed.error_message = Some(e.to_string());
            if let Err(store_err) = self.statuses.put_status(&failed, Some(rule.in_progress)).await {
                error!(error = %store_err, "Failed to record dispatch failure");
            }
            self.discard(&handler.request_id).await;
            return Err(EngineError::DispatchFailed {
                request_id: handler.request_id.to_string(),
                reason: e.to_string(),
            });
        }

        info!(request_id = %handler.request_id, resource = %key, "Action dispatched");
        Ok(handler.request_id)
    }

    async fn discard(&self, request_id: &RequestId) {
        if let Err(e) = self.registry.complete(request_id).await {
            error!(request_id = %request_id, error = %e, "Failed to discard handler");
        }
        self.subscriptions.detach(request_id);
    }
}

fn busy(key: &ResourceKey, status: Option<UserInstanceStatus>) -> EngineError {
    EngineError::ResourceBusy {
        resource: key.to_string(),
        status: status.map_or("absent", |s| s.as_str()).to_string(),
    }
}

/// Dispatches post-create configuration through a [`Dispatcher`].
pub struct DispatchFollowUp {
    dispatcher: Arc<Dispatcher>,
}

impl DispatchFollowUp {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl FollowUpTrigger for DispatchFollowUp {
    async fn configure(&self, origin: &RequestId, resource: &ResourceDescriptor) -> Result<()> {
        let context = match &resource.context {
            Value::Object(map) => {
                let mut map = map.clone();
                map.insert(ORIGIN_REQUEST_ID.to_string(), json!(origin));
                Value::Object(map)
            }
            Value::Null => json!({ ORIGIN_REQUEST_ID: origin }),
            other => json!({ ORIGIN_REQUEST_ID: origin, "context": other }),
        };

        let request = DispatchRequest {
            action: ActionKind::Configure,
            resource_kind: resource.resource_kind,
            owner: resource.key.owner.clone(),
            exploratory_name: resource.key.exploratory_name.clone(),
            computational_name: resource.key.computational_name.clone(),
            context,
        };
        let request_id = self
            .dispatcher
            .dispatch_caused_by(request, Some(origin))
            .await?;
        info!(origin = %origin, request_id = %request_id, "Configure follow-up dispatched");
        Ok(())
    }
}

#[cfg(feature = "server")]
pub use self::http::HttpExecutionClient;

#[cfg(feature = "server")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde::Serialize;
    use serde_json::Value;
    use tracing::debug;

    use super::ExecutionClient;
    use crate::error::{EngineError, Result};
    use crate::model::PendingHandler;

    /// Posts actions to the execution layer over HTTP.
    ///
    /// `POST {base_url}/{resource_kind}/{action}` with the handler fields and
    /// the absolute URL the callback must be posted to.
    #[derive(Debug, Clone)]
    pub struct HttpExecutionClient {
        client: reqwest::Client,
        base_url: String,
        callback_base_url: String,
    }

    #[derive(Serialize)]
    struct SubmitBody<'a> {
        request_id: &'a str,
        action: &'a str,
        resource_kind: &'a str,
        owner: &'a str,
        exploratory_name: &'a str,
        computational_name: Option<&'a str>,
        callback_url: String,
        context: &'a Value,
    }

    impl HttpExecutionClient {
        pub fn new(
            base_url: impl Into<String>,
            callback_base_url: impl Into<String>,
            timeout: Duration,
        ) -> reqwest::Result<Self> {
            let client = reqwest::Client::builder().timeout(timeout).build()?;
            Ok(Self {
                client,
                base_url: base_url.into().trim_end_matches('/').to_string(),
                callback_base_url: callback_base_url.into().trim_end_matches('/').to_string(),
            })
        }

        fn failed(handler: &PendingHandler, reason: impl std::fmt::Display) -> EngineError {
            EngineError::DispatchFailed {
                request_id: handler.request_id.to_string(),
                reason: reason.to_string(),
            }
        }
    }

    #[async_trait]
    impl ExecutionClient for HttpExecutionClient {
        async fn submit(&self, handler: &PendingHandler) -> Result<()> {
            let url = format!(
                "{}/{}/{}",
                self.base_url, handler.resource_kind, handler.action
            );
            let body = SubmitBody {
                request_id: handler.request_id.as_str(),
                action: handler.action.as_str(),
                resource_kind: handler.resource_kind.as_str(),
                owner: &handler.owner,
                exploratory_name: &handler.exploratory_name,
                computational_name: handler.computational_name.as_deref(),
                callback_url: format!("{}{}", self.callback_base_url, handler.callback_uri),
                context: &handler.context,
            };

            debug!(url = %url, request_id = %handler.request_id, "Submitting action");
            let response = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| Self::failed(handler, e))?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(Self::failed(
                    handler,
                    format!("execution layer returned {}: {}", status, text),
                ));
            }
            Ok(())
        }
    }
}
