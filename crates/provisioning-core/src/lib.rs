// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning Core - Callback Correlation and Status Reconciliation
//!
//! This crate correlates asynchronous callbacks from an infrastructure
//! execution layer with the actions that caused them, and reconciles the
//! durable status of notebook (exploratory) and cluster (computational)
//! resources with what the execution layer reports.
//!
//! # Architecture
//!
//! ```text
//!        dispatch(request)                        POST /api/callbacks/{kind}/{action}
//!              │                                               │
//!              ▼                                               ▼
//! ┌─────────────────────────┐   submit   ┌──────────────────────────────────┐
//! │       Dispatcher        │──────────► │        Execution Layer            │
//! │  admission + register   │            │  (provisions, calls back later)   │
//! └─────────────────────────┘            └──────────────────────────────────┘
//!              │                                               │
//!              ▼                                               ▼
//! ┌─────────────────────────┐  resolve   ┌──────────────────────────────────┐
//! │ CallbackHandlerRegistry │◄───────────│     CallbackDispatchEngine        │
//! │  (durable, claimable)   │  complete  │ ResultParser → StatusMapper       │
//! └─────────────────────────┘            └──────────────────────────────────┘
//!              ▲                                               │
//!              │ list_all                      conditional put │
//! ┌─────────────────────────┐            ┌──────────────────────────────────┐
//! │   RestoreCoordinator    │───────────►│           StatusStore             │
//! │  (startup / on demand)  │            │    (resource status records)      │
//! └─────────────────────────┘            └──────────────────────────────────┘
//! ```
//!
//! # Status Lifecycle
//!
//! ```text
//!  (absent) ──create──► creating ──ok──► running ──stop──► stopping ──ok──► stopped
//!                           │                ▲                                 │
//!                           │ computational  │                                 │
//!                           ▼                │                                 │
//!                      configuring ──ok──────┘◄──────── starting ◄──start──────┘
//!
//!  any in-progress status ──err──► failed ──terminate──► terminating ──ok──► terminated
//! ```
//!
//! The full admission and callback table lives in [`status_mapper`].
//!
//! # Delivery Guarantees
//!
//! - A callback is applied at most once: `resolve` atomically claims the
//!   handler, and a second delivery sees no pending handler.
//! - Status writes are conditional on the status observed before the
//!   transition, so racing callbacks cannot interleave.
//! - Pending handlers survive restarts and are re-attached by
//!   [`restore::RestoreCoordinator`].
//!
//! # Configuration
//!
//! The standalone binary reads `PROVISIONING_*` environment variables; see
//! [`config::Config::from_env`].

/// Configuration loaded from environment variables.
pub mod config;

/// Outbound actions: admission, handler registration and execution-layer submission.
pub mod dispatch;

/// Inbound callback processing.
pub mod engine;

/// Error types with stable error codes.
pub mod error;

/// Embedded SQLite and PostgreSQL migrations.
pub mod migrations;

/// Identifiers, kinds, statuses and records.
pub mod model;

/// Handler and status storage traits with SQLite and PostgreSQL backends.
pub mod persistence;

/// Durable pending-handler registry and in-memory subscriptions.
pub mod registry;

/// Re-attachment of pending handlers after a restart.
pub mod restore;

/// Callback payload parsing.
pub mod result_parser;

/// Embeddable runtime wiring every component behind the HTTP server.
#[cfg(feature = "server")]
pub mod runtime;

/// Axum routes for callbacks, restore and health.
#[cfg(feature = "server")]
pub mod server;

/// Table-driven status transitions.
pub mod status_mapper;

pub use dispatch::{DispatchFollowUp, DispatchRequest, Dispatcher, ExecutionClient};
pub use engine::{CallbackDispatchEngine, CallbackEvent, CallbackOutcome, FollowUpTrigger};
pub use error::{EngineError, Result};
pub use model::{
    ActionKind, PendingHandler, RequestId, ResourceDescriptor, ResourceKey, ResourceKind,
    ResourceStatusRecord, ResourceUrl, UserInstanceStatus,
};
pub use registry::{CallbackHandlerRegistry, CallbackSubscriptions};
pub use restore::{RestoreCoordinator, RestoreReport};
