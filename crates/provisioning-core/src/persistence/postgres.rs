// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence for pending handlers and resource status records.
//!
//! Each operation is a free function over a [`PgPool`]; [`PostgresPersistence`]
//! wires them into the store traits.

use chrono::Utc;
use sqlx::PgPool;

use crate::error::{EngineError, Result};
use crate::model::{
    PendingHandler, RequestId, ResourceKey, ResourceStatusRecord, UserInstanceStatus,
};

use super::{HandlerRow, HandlerStore, StatusRow, StatusStore, rows_into};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Handler Operations
// ============================================================================

/// Insert a handler unless its request id is taken.
pub async fn insert_handler(pool: &PgPool, handler: &PendingHandler) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO callback_handlers
            (request_id, action, resource_kind, owner, exploratory_name,
             computational_name, callback_uri, context, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (request_id) DO NOTHING
        "#,
    )
    .bind(handler.request_id.as_str())
    .bind(handler.action.as_str())
    .bind(handler.resource_kind.as_str())
    .bind(&handler.owner)
    .bind(&handler.exploratory_name)
    .bind(handler.computational_name.as_deref())
    .bind(&handler.callback_uri)
    .bind(serde_json::to_string(&handler.context)?)
    .bind(handler.created_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Get a handler by request id.
pub async fn get_handler(pool: &PgPool, request_id: &str) -> Result<Option<PendingHandler>> {
    let row = sqlx::query_as::<_, HandlerRow>(
        r#"
        SELECT request_id, action, resource_kind, owner, exploratory_name,
               computational_name, callback_uri, context, created_at, claimed_by
        FROM callback_handlers
        WHERE request_id = $1
        "#,
    )
    .bind(request_id)
    .fetch_optional(pool)
    .await?;

    row.map(PendingHandler::try_from).transpose()
}

/// Claim an unclaimed handler.
///
/// The `claimed_by IS NULL` predicate makes concurrent claims race at the row
/// lock; exactly one caller gets the row back.
pub async fn claim_handler(
    pool: &PgPool,
    request_id: &str,
    owner: &str,
) -> Result<Option<PendingHandler>> {
    let row = sqlx::query_as::<_, HandlerRow>(
        r#"
        UPDATE callback_handlers
        SET claimed_by = $1, claimed_at = $2
        WHERE request_id = $3 AND claimed_by IS NULL
        RETURNING request_id, action, resource_kind, owner, exploratory_name,
                  computational_name, callback_uri, context, created_at, claimed_by
        "#,
    )
    .bind(owner)
    .bind(Utc::now())
    .bind(request_id)
    .fetch_optional(pool)
    .await?;

    row.map(PendingHandler::try_from).transpose()
}

/// Drop the claim on a handler.
pub async fn release_handler(pool: &PgPool, request_id: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE callback_handlers
        SET claimed_by = NULL, claimed_at = NULL
        WHERE request_id = $1
        "#,
    )
    .bind(request_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Delete a handler.
pub async fn delete_handler(pool: &PgPool, request_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM callback_handlers WHERE request_id = $1")
        .bind(request_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// List handlers ordered by request id, strictly after `after`.
pub async fn list_handlers(
    pool: &PgPool,
    after: Option<&str>,
    limit: i64,
) -> Result<Vec<PendingHandler>> {
    let rows = sqlx::query_as::<_, HandlerRow>(
        r#"
        SELECT request_id, action, resource_kind, owner, exploratory_name,
               computational_name, callback_uri, context, created_at, claimed_by
        FROM callback_handlers
        WHERE $1::text IS NULL OR request_id > $1
        ORDER BY request_id
        LIMIT $2
        "#,
    )
    .bind(after)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows_into(rows)
}

/// List handlers registered against one resource.
pub async fn list_handlers_for_resource(
    pool: &PgPool,
    key: &ResourceKey,
) -> Result<Vec<PendingHandler>> {
    let rows = sqlx::query_as::<_, HandlerRow>(
        r#"
        SELECT request_id, action, resource_kind, owner, exploratory_name,
               computational_name, callback_uri, context, created_at, claimed_by
        FROM callback_handlers
        WHERE owner = $1 AND exploratory_name = $2
          AND computational_name IS NOT DISTINCT FROM $3
        ORDER BY request_id
        "#,
    )
    .bind(&key.owner)
    .bind(&key.exploratory_name)
    .bind(key.computational_name.as_deref())
    .fetch_all(pool)
    .await?;

    rows_into(rows)
}

// ============================================================================
// Status Operations
// ============================================================================

/// Get the status record of a resource.
pub async fn get_status(pool: &PgPool, key: &ResourceKey) -> Result<Option<ResourceStatusRecord>> {
    let row = sqlx::query_as::<_, StatusRow>(
        r#"
        SELECT owner, exploratory_name, computational_name, resource_kind, status,
               instance_id, host_id, urls, error_message, updated_at
        FROM resource_status
        WHERE owner = $1 AND exploratory_name = $2 AND computational_name = $3
        "#,
    )
    .bind(&key.owner)
    .bind(&key.exploratory_name)
    .bind(key.computational_column())
    .fetch_optional(pool)
    .await?;

    row.map(ResourceStatusRecord::try_from).transpose()
}

/// Insert a status record if none exists for its key.
pub async fn insert_status(pool: &PgPool, record: &ResourceStatusRecord) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO resource_status
            (owner, exploratory_name, computational_name, resource_kind, status,
             instance_id, host_id, urls, error_message, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (owner, exploratory_name, computational_name) DO NOTHING
        "#,
    )
    .bind(&record.key.owner)
    .bind(&record.key.exploratory_name)
    .bind(record.key.computational_column())
    .bind(record.resource_kind.as_str())
    .bind(record.status.as_str())
    .bind(record.instance_id.as_deref())
    .bind(record.host_id.as_deref())
    .bind(serde_json::to_string(&record.urls)?)
    .bind(record.error_message.as_deref())
    .bind(record.updated_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Overwrite a status record if its stored status is still `expected`.
pub async fn compare_and_set_status(
    pool: &PgPool,
    record: &ResourceStatusRecord,
    expected: UserInstanceStatus,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE resource_status
        SET resource_kind = $1,
            status = $2,
            instance_id = $3,
            host_id = $4,
            urls = $5,
            error_message = $6,
            updated_at = $7
        WHERE owner = $8
          AND exploratory_name = $9
          AND computational_name = $10
          AND status = $11
        "#,
    )
    .bind(record.resource_kind.as_str())
    .bind(record.status.as_str())
    .bind(record.instance_id.as_deref())
    .bind(record.host_id.as_deref())
    .bind(serde_json::to_string(&record.urls)?)
    .bind(record.error_message.as_deref())
    .bind(record.updated_at)
    .bind(&record.key.owner)
    .bind(&record.key.exploratory_name)
    .bind(record.key.computational_column())
    .bind(expected.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Trait Implementations
// ============================================================================

#[async_trait::async_trait]
impl HandlerStore for PostgresPersistence {
    async fn insert_handler(&self, handler: &PendingHandler) -> Result<bool> {
        insert_handler(&self.pool, handler).await
    }

    async fn get_handler(&self, request_id: &RequestId) -> Result<Option<PendingHandler>> {
        get_handler(&self.pool, request_id.as_str()).await
    }

    async fn claim_handler(
        &self,
        request_id: &RequestId,
        owner: &str,
    ) -> Result<Option<PendingHandler>> {
        claim_handler(&self.pool, request_id.as_str(), owner).await
    }

    async fn release_handler(&self, request_id: &RequestId) -> Result<bool> {
        release_handler(&self.pool, request_id.as_str()).await
    }

    async fn delete_handler(&self, request_id: &RequestId) -> Result<bool> {
        delete_handler(&self.pool, request_id.as_str()).await
    }

    async fn list_handlers(
        &self,
        after: Option<&RequestId>,
        limit: i64,
    ) -> Result<Vec<PendingHandler>> {
        list_handlers(&self.pool, after.map(RequestId::as_str), limit).await
    }

    async fn list_handlers_for_resource(
        &self,
        key: &ResourceKey,
    ) -> Result<Vec<PendingHandler>> {
        list_handlers_for_resource(&self.pool, key).await
    }
}

#[async_trait::async_trait]
impl StatusStore for PostgresPersistence {
    async fn get_status(&self, key: &ResourceKey) -> Result<Option<ResourceStatusRecord>> {
        get_status(&self.pool, key).await
    }

    async fn put_status(
        &self,
        record: &ResourceStatusRecord,
        expected: Option<UserInstanceStatus>,
    ) -> Result<bool> {
        match expected {
            None => insert_status(&self.pool, record).await,
            Some(expected) => compare_and_set_status(&self.pool, record, expected).await,
        }
    }
}

/// Connect to a Postgres URL and run migrations.
pub async fn connect(url: &str, max_connections: u32) -> Result<PostgresPersistence> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(|e| EngineError::storage("connect", e))?;

    crate::migrations::run_postgres(&pool)
        .await
        .map_err(|e| EngineError::storage("migrate", e))?;

    Ok(PostgresPersistence::new(pool))
}
