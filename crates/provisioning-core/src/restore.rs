// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Re-attachment of pending handlers after a restart.

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{EngineError, Result};
use crate::model::PendingHandler;
use crate::persistence::StatusStore;
use crate::registry::{CallbackHandlerRegistry, CallbackSubscriptions};
use crate::status_mapper;

/// Counts from one restore pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// Handlers read from the registry.
    pub examined: usize,
    /// Handlers newly attached to this process.
    pub reattached: usize,
    /// Handlers dropped because their resource no longer awaits the callback.
    pub discarded: usize,
    /// Claims from an earlier process lifetime that were dropped.
    pub released: usize,
}

enum Restored {
    Attached { newly: bool, released: bool },
    Discarded,
}

/// Rebuilds the in-memory subscriptions from the durable registry.
pub struct RestoreCoordinator {
    registry: CallbackHandlerRegistry,
    statuses: Arc<dyn StatusStore>,
    subscriptions: Arc<CallbackSubscriptions>,
}

impl RestoreCoordinator {
    pub fn new(
        registry: CallbackHandlerRegistry,
        statuses: Arc<dyn StatusStore>,
        subscriptions: Arc<CallbackSubscriptions>,
    ) -> Self {
        Self {
            registry,
            statuses,
            subscriptions,
        }
    }

    /// Re-attach every handler that can still be answered.
    ///
    /// Safe to run repeatedly; a second pass reattaches nothing. Storage
    /// errors end the pass early and are logged, never returned.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> RestoreReport {
        let mut report = RestoreReport::default();
        let mut handlers = self.registry.list_all();

        while let Some(next) = handlers.next().await {
            let handler = match next {
                Ok(handler) => handler,
                Err(e) => {
                    error!(error = %e, "Failed to list pending handlers, restore incomplete");
                    break;
                }
            };
            report.examined += 1;

            match self.restore_one(&handler).await {
                Ok(Restored::Attached { newly, released }) => {
                    report.reattached += usize::from(newly);
                    report.released += usize::from(released);
                }
                Ok(Restored::Discarded) => report.discarded += 1,
                Err(e) => {
                    warn!(request_id = %handler.request_id, error = %e, "Failed to restore handler");
                }
            }
        }

        info!(
            examined = report.examined,
            reattached = report.reattached,
            discarded = report.discarded,
            released = report.released,
            "Restore complete"
        );
        report
    }

    async fn restore_one(&self, handler: &PendingHandler) -> Result<Restored> {
        let key = handler.resource_key();
        let current = self
            .statuses
            .get_status(&key)
            .await?
            .map(|record| record.status);

        if !status_mapper::awaits_callback(handler.action, current) {
            debug!(
                request_id = %handler.request_id,
                resource = %key,
                action = %handler.action,
                "Discarding handler whose resource no longer awaits a callback"
            );
            match self.registry.complete(&handler.request_id).await {
                Ok(()) | Err(EngineError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
            self.subscriptions.detach(&handler.request_id);
            return Ok(Restored::Discarded);
        }

        let released = match handler.claimed_by.as_deref() {
            Some(owner) if owner != self.registry.process_token() => {
                self.registry.release(&handler.request_id).await?;
                true
            }
            _ => false,
        };

        Ok(Restored::Attached {
            newly: self.subscriptions.attach(handler),
            released,
        })
    }
}
