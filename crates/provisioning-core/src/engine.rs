// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound callback processing.
//!
//! [`CallbackDispatchEngine::handle_callback`] turns one callback into at most
//! one status transition:
//!
//! ```text
//! resolve ──► route check ──► parse ──► load status ──► next_status
//!                                                           │
//!             complete + detach ◄── follow-up ◄── conditional put
//! ```
//!
//! Storage failures release the claim and surface as
//! [`EngineError::StorageUnavailable`] so the execution layer retries. A
//! callback is acknowledged only after its handler is completed.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{EngineError, Result};
use crate::model::{
    ActionKind, PendingHandler, RequestId, ResourceDescriptor, ResourceKind, ResourceStatusRecord,
    UserInstanceStatus,
};
use crate::persistence::StatusStore;
use crate::registry::{CallbackHandlerRegistry, CallbackSubscriptions};
use crate::result_parser::{self, CallbackResult};
use crate::status_mapper::{self, Decision, FollowUp, Outcome, Transition};

/// Receives follow-up actions requested by a transition.
#[async_trait]
pub trait FollowUpTrigger: Send + Sync {
    /// Start post-create configuration of `resource`, caused by `origin`.
    async fn configure(&self, origin: &RequestId, resource: &ResourceDescriptor) -> Result<()>;
}

/// An inbound callback.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackEvent {
    pub request_id: RequestId,
    /// Kind and action taken from the callback route, when the route carries them.
    pub route: Option<(ResourceKind, ActionKind)>,
    pub payload: Value,
}

/// What a callback did. Every variant is acknowledged to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallbackOutcome {
    /// The status record was moved to `status`.
    Applied {
        status: UserInstanceStatus,
        follow_up: bool,
    },
    /// No pending handler; a duplicate or late delivery.
    AlreadyHandled,
    /// The payload could not be parsed; the handler was dropped.
    Rejected { reason: String },
    /// The resource had moved on; the handler was dropped.
    Stale { current: Option<UserInstanceStatus> },
    /// The route does not match the handler; it stays pending.
    Misrouted,
}

/// Applies callbacks to resource status records.
pub struct CallbackDispatchEngine {
    registry: CallbackHandlerRegistry,
    statuses: Arc<dyn StatusStore>,
    subscriptions: Arc<CallbackSubscriptions>,
    follow_up: Option<Arc<dyn FollowUpTrigger>>,
}

impl std::fmt::Debug for CallbackDispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackDispatchEngine")
            .field("registry", &self.registry)
            .field("attached", &self.subscriptions.len())
            .field("follow_up", &self.follow_up.as_ref().map(|_| "..."))
            .finish()
    }
}

impl CallbackDispatchEngine {
    pub fn new(
        registry: CallbackHandlerRegistry,
        statuses: Arc<dyn StatusStore>,
        subscriptions: Arc<CallbackSubscriptions>,
    ) -> Self {
        Self {
            registry,
            statuses,
            subscriptions,
            follow_up: None,
        }
    }

    /// Set the trigger invoked for follow-up actions.
    pub fn with_follow_up(mut self, trigger: Arc<dyn FollowUpTrigger>) -> Self {
        self.follow_up = Some(trigger);
        self
    }

    pub fn registry(&self) -> &CallbackHandlerRegistry {
        &self.registry
    }

    pub fn subscriptions(&self) -> &Arc<CallbackSubscriptions> {
        &self.subscriptions
    }

    /// Process one callback.
    ///
    /// Only [`EngineError::StorageUnavailable`] is returned; every other
    /// condition is folded into a [`CallbackOutcome`].
    #[instrument(skip(self, event), fields(request_id = %event.request_id))]
    pub async fn handle_callback(&self, event: CallbackEvent) -> Result<CallbackOutcome> {
        let handler = match self.registry.resolve(&event.request_id).await {
            Ok(handler) => handler,
            Err(EngineError::NotFound { .. }) => {
                debug!("No pending handler, callback already handled");
                return Ok(CallbackOutcome::AlreadyHandled);
            }
            Err(e) => return Err(e),
        };

        if let Some((resource_kind, action)) = event.route
            && (resource_kind != handler.resource_kind || action != handler.action)
        {
            warn!(
                route_kind = %resource_kind,
                route_action = %action,
                handler_kind = %handler.resource_kind,
                handler_action = %handler.action,
                "Callback route does not match pending handler"
            );
            self.registry.release(&handler.request_id).await?;
            return Ok(CallbackOutcome::Misrouted);
        }

        let result = match result_parser::parse(handler.resource_kind, handler.action, &event.payload)
        {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, action = %handler.action, "Rejecting malformed callback");
                self.finish(&handler).await?;
                return Ok(CallbackOutcome::Rejected {
                    reason: e.to_string(),
                });
            }
        };

        let key = handler.resource_key();
        let current = match self.statuses.get_status(&key).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                warn!(resource = %key, "No status record for resource, dropping callback");
                self.finish(&handler).await?;
                return Ok(CallbackOutcome::Stale { current: None });
            }
            Err(e) => return Err(self.abandon(&handler, e).await),
        };

        let transition = match status_mapper::next_status(
            current.status,
            &key,
            handler.resource_kind,
            handler.action,
            &result,
        ) {
            Decision::Apply(transition) => transition,
            Decision::Stale { current } => {
                info!(resource = %key, current = %current, "Resource moved on, dropping stale callback");
                self.finish(&handler).await?;
                return Ok(CallbackOutcome::Stale {
                    current: Some(current),
                });
            }
        };

        if let Outcome::Incompatible(e) = &transition.outcome {
            warn!(resource = %key, error = %e, "Incompatible callback result, marking resource failed");
        }

        let next = next_record(&current, &handler, &transition, &result);
        match self.statuses.put_status(&next, Some(current.status)).await {
            Ok(true) => {}
            Ok(false) => {
                info!(resource = %key, "Status changed concurrently, dropping callback");
                self.finish(&handler).await?;
                return Ok(CallbackOutcome::Stale {
                    current: Some(current.status),
                });
            }
            Err(e) => return Err(self.abandon(&handler, e).await),
        }

        info!(
            resource = %key,
            action = %handler.action,
            from = %current.status,
            to = %next.status,
            "Status transition applied"
        );

        let follow_up = transition.follow_up.is_some();
        if let Some(FollowUp::Configure) = transition.follow_up {
            self.trigger_configure(&handler).await;
        }

        self.finish(&handler).await?;
        Ok(CallbackOutcome::Applied {
            status: next.status,
            follow_up,
        })
    }

    async fn trigger_configure(&self, handler: &PendingHandler) {
        let Some(trigger) = &self.follow_up else {
            warn!("Configure follow-up requested but no trigger is installed");
            return;
        };
        if let Err(e) = trigger
            .configure(&handler.request_id, &handler.descriptor())
            .await
        {
            error!(error = %e, "Configure follow-up failed");
        }
    }

    /// Complete the handler and detach it.
    ///
    /// The callback is acknowledged only once this succeeds; a storage
    /// failure releases the claim so a redelivery can finish the job.
    async fn finish(&self, handler: &PendingHandler) -> Result<()> {
        match self.registry.complete(&handler.request_id).await {
            Ok(()) => {}
            Err(EngineError::NotFound { .. }) => {
                debug!("Handler already completed");
            }
            Err(e) => return Err(self.abandon(handler, e).await),
        }
        self.subscriptions.detach(&handler.request_id);
        Ok(())
    }

    /// Release the claim after a storage failure and hand back the error.
    async fn abandon(&self, handler: &PendingHandler, err: EngineError) -> EngineError {
        error!(error = %err, "Storage failure while handling callback");
        if let Err(release_err) = self.registry.release(&handler.request_id).await {
            error!(error = %release_err, "Failed to release handler claim");
        }
        err
    }
}

/// Build the record to persist. Identifiers from the payload overwrite the
/// stored ones only when present, on success and failure alike.
fn next_record(
    current: &ResourceStatusRecord,
    handler: &PendingHandler,
    transition: &Transition,
    result: &CallbackResult,
) -> ResourceStatusRecord {
    let mut next = current.with_status(transition.status);
    if let Some(instance_id) = &result.instance_id {
        next.instance_id = Some(instance_id.clone());
    }
    if let Some(host_id) = &result.host_id {
        next.host_id = Some(host_id.clone());
    }
    if !result.urls.is_empty() {
        next.urls = result.urls.clone();
    }
    next.error_message = match &transition.outcome {
        Outcome::Succeeded => None,
        Outcome::Failed => Some(
            result
                .error_message
                .clone()
                .unwrap_or_else(|| format!("{} {} failed", handler.resource_kind, handler.action)),
        ),
        Outcome::Incompatible(e) => Some(result.error_message.clone().unwrap_or_else(|| e.to_string())),
    };
    next
}
