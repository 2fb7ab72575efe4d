//! Persistence interfaces and backends for provisioning-core.
//!
//! Two collaborators share one database: the [`HandlerStore`] behind the
//! callback registry and the [`StatusStore`] owning resource status records.
//! Both backends implement both traits.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{EngineError, Result};
use crate::model::{
    PendingHandler, RequestId, ResourceKey, ResourceStatusRecord, UserInstanceStatus,
};

/// Storage of pending callback handlers.
///
/// All conditional operations must be atomic at the database level; callers
/// hold no in-process lock around them.
#[async_trait]
pub trait HandlerStore: Send + Sync {
    /// Insert a handler. Returns `false` if the request id already exists.
    async fn insert_handler(&self, handler: &PendingHandler) -> Result<bool>;

    /// Read a handler without claiming it.
    async fn get_handler(&self, request_id: &RequestId) -> Result<Option<PendingHandler>>;

    /// Claim an unclaimed handler for `owner`, returning it.
    ///
    /// Returns `None` if the handler is absent or already claimed.
    async fn claim_handler(
        &self,
        request_id: &RequestId,
        owner: &str,
    ) -> Result<Option<PendingHandler>>;

    /// Drop a claim. Returns `false` if the handler is absent.
    async fn release_handler(&self, request_id: &RequestId) -> Result<bool>;

    /// Delete a handler. Returns `false` if it was already gone.
    async fn delete_handler(&self, request_id: &RequestId) -> Result<bool>;

    /// One page of handlers ordered by request id, strictly after `after`.
    async fn list_handlers(
        &self,
        after: Option<&RequestId>,
        limit: i64,
    ) -> Result<Vec<PendingHandler>>;

    /// Every handler registered against `key`, ordered by request id.
    async fn list_handlers_for_resource(&self, key: &ResourceKey) -> Result<Vec<PendingHandler>>;
}

/// Storage of resource status records.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn get_status(&self, key: &ResourceKey) -> Result<Option<ResourceStatusRecord>>;

    /// Write `record` only if the stored status still equals `expected`.
    ///
    /// `expected = None` inserts, and only if no record exists for the key.
    /// Returns whether the write was applied.
    async fn put_status(
        &self,
        record: &ResourceStatusRecord,
        expected: Option<UserInstanceStatus>,
    ) -> Result<bool>;
}

/// Raw `callback_handlers` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct HandlerRow {
    pub request_id: String,
    pub action: String,
    pub resource_kind: String,
    pub owner: String,
    pub exploratory_name: String,
    pub computational_name: Option<String>,
    pub callback_uri: String,
    pub context: String,
    pub created_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
}

impl TryFrom<HandlerRow> for PendingHandler {
    type Error = EngineError;

    fn try_from(row: HandlerRow) -> Result<Self> {
        Ok(Self {
            request_id: RequestId::from(row.request_id),
            action: row.action.parse().map_err(decode_error)?,
            resource_kind: row.resource_kind.parse().map_err(decode_error)?,
            owner: row.owner,
            exploratory_name: row.exploratory_name,
            computational_name: row.computational_name,
            callback_uri: row.callback_uri,
            context: serde_json::from_str(&row.context)?,
            created_at: row.created_at,
            claimed_by: row.claimed_by,
        })
    }
}

/// Raw `resource_status` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct StatusRow {
    pub owner: String,
    pub exploratory_name: String,
    pub computational_name: String,
    pub resource_kind: String,
    pub status: String,
    pub instance_id: Option<String>,
    pub host_id: Option<String>,
    pub urls: String,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<StatusRow> for ResourceStatusRecord {
    type Error = EngineError;

    fn try_from(row: StatusRow) -> Result<Self> {
        Ok(Self {
            key: ResourceKey {
                owner: row.owner,
                exploratory_name: row.exploratory_name,
                computational_name: (!row.computational_name.is_empty())
                    .then_some(row.computational_name),
            },
            resource_kind: row.resource_kind.parse().map_err(decode_error)?,
            status: row.status.parse().map_err(decode_error)?,
            instance_id: row.instance_id,
            host_id: row.host_id,
            urls: serde_json::from_str(&row.urls)?,
            error_message: row.error_message,
            updated_at: row.updated_at,
        })
    }
}

fn decode_error(err: EngineError) -> EngineError {
    EngineError::storage("decode", err)
}

pub(crate) fn rows_into<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = EngineError>,
{
    rows.into_iter().map(T::try_from).collect()
}
