//! SQLite-backed persistence implementation.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::error::{EngineError, Result};
use crate::migrations;
use crate::model::{
    PendingHandler, RequestId, ResourceKey, ResourceStatusRecord, UserInstanceStatus,
};

use super::{HandlerRow, HandlerStore, StatusRow, StatusStore, rows_into};

const HANDLER_COLUMNS: &str = "request_id, action, resource_kind, owner, exploratory_name, \
     computational_name, callback_uri, context, created_at, claimed_by";

const STATUS_COLUMNS: &str = "owner, exploratory_name, computational_name, resource_kind, \
     status, instance_id, host_id, urls, error_message, updated_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::storage(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        Self::connect(&format!("sqlite:{}", path.to_string_lossy())).await
    }

    /// Connect to a `sqlite:` URL, creating the file if missing, and run migrations.
    ///
    /// WAL mode with a busy timeout lets the pooled connections write concurrently.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| EngineError::storage("connect", format!("Invalid SQLite URL {}: {}", url, e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                EngineError::storage("connect", format!("Failed to connect to {}: {}", url, e))
            })?;

        migrations::run_sqlite(&pool)
            .await
            .map_err(|e| EngineError::storage("migrate", format!("Failed to run migrations: {}", e)))?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl HandlerStore for SqlitePersistence {
    async fn insert_handler(&self, handler: &PendingHandler) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO callback_handlers
                (request_id, action, resource_kind, owner, exploratory_name,
                 computational_name, callback_uri, context, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
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
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_handler(&self, request_id: &RequestId) -> Result<Option<PendingHandler>> {
        let row = sqlx::query_as::<_, HandlerRow>(&format!(
            "SELECT {} FROM callback_handlers WHERE request_id = ?1",
            HANDLER_COLUMNS
        ))
        .bind(request_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(PendingHandler::try_from).transpose()
    }

    async fn claim_handler(
        &self,
        request_id: &RequestId,
        owner: &str,
    ) -> Result<Option<PendingHandler>> {
        let row = sqlx::query_as::<_, HandlerRow>(&format!(
            r#"
            UPDATE callback_handlers
            SET claimed_by = ?1, claimed_at = ?2
            WHERE request_id = ?3 AND claimed_by IS NULL
            RETURNING {}
            "#,
            HANDLER_COLUMNS
        ))
        .bind(owner)
        .bind(Utc::now())
        .bind(request_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(PendingHandler::try_from).transpose()
    }

    async fn release_handler(&self, request_id: &RequestId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE callback_handlers
            SET claimed_by = NULL, claimed_at = NULL
            WHERE request_id = ?1
            "#,
        )
        .bind(request_id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_handler(&self, request_id: &RequestId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM callback_handlers WHERE request_id = ?1")
            .bind(request_id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_handlers(
        &self,
        after: Option<&RequestId>,
        limit: i64,
    ) -> Result<Vec<PendingHandler>> {
        let rows = sqlx::query_as::<_, HandlerRow>(&format!(
            r#"
            SELECT {}
            FROM callback_handlers
            WHERE ?1 IS NULL OR request_id > ?1
            ORDER BY request_id
            LIMIT ?2
            "#,
            HANDLER_COLUMNS
        ))
        .bind(after.map(RequestId::as_str))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows_into(rows)
    }

    async fn list_handlers_for_resource(
        &self,
        key: &ResourceKey,
    ) -> Result<Vec<PendingHandler>> {
        let rows = sqlx::query_as::<_, HandlerRow>(&format!(
            r#"
            SELECT {}
            FROM callback_handlers
            WHERE owner = ?1 AND exploratory_name = ?2 AND computational_name IS ?3
            ORDER BY request_id
            "#,
            HANDLER_COLUMNS
        ))
        .bind(&key.owner)
        .bind(&key.exploratory_name)
        .bind(key.computational_name.as_deref())
        .fetch_all(&self.pool)
        .await?;

        rows_into(rows)
    }
}

#[async_trait::async_trait]
impl StatusStore for SqlitePersistence {
    async fn get_status(&self, key: &ResourceKey) -> Result<Option<ResourceStatusRecord>> {
        let row = sqlx::query_as::<_, StatusRow>(&format!(
            r#"
            SELECT {}
            FROM resource_status
            WHERE owner = ?1 AND exploratory_name = ?2 AND computational_name = ?3
            "#,
            STATUS_COLUMNS
        ))
        .bind(&key.owner)
        .bind(&key.exploratory_name)
        .bind(key.computational_column())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ResourceStatusRecord::try_from).transpose()
    }

    async fn put_status(
        &self,
        record: &ResourceStatusRecord,
        expected: Option<UserInstanceStatus>,
    ) -> Result<bool> {
        let urls = serde_json::to_string(&record.urls)?;
        let result = match expected {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO resource_status
                        (owner, exploratory_name, computational_name, resource_kind, status,
                         instance_id, host_id, urls, error_message, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
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
                .bind(&urls)
                .bind(record.error_message.as_deref())
                .bind(record.updated_at)
                .execute(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE resource_status
                    SET resource_kind = ?1,
                        status = ?2,
                        instance_id = ?3,
                        host_id = ?4,
                        urls = ?5,
                        error_message = ?6,
                        updated_at = ?7
                    WHERE owner = ?8
                      AND exploratory_name = ?9
                      AND computational_name = ?10
                      AND status = ?11
                    "#,
                )
                .bind(record.resource_kind.as_str())
                .bind(record.status.as_str())
                .bind(record.instance_id.as_deref())
                .bind(record.host_id.as_deref())
                .bind(&urls)
                .bind(record.error_message.as_deref())
                .bind(record.updated_at)
                .bind(&record.key.owner)
                .bind(&record.key.exploratory_name)
                .bind(record.key.computational_column())
                .bind(expected.as_str())
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActionKind, ResourceKind, ResourceUrl};
    use serde_json::json;

    /// Create an in-memory SQLite persistence for testing.
    async fn test_persistence() -> SqlitePersistence {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");

        SqlitePersistence::new(pool)
    }

    fn handler(request_id: &str) -> PendingHandler {
        PendingHandler {
            request_id: RequestId::from(request_id),
            action: ActionKind::Create,
            resource_kind: ResourceKind::Computational,
            owner: "alice".to_string(),
            exploratory_name: "notebook".to_string(),
            computational_name: Some("spark".to_string()),
            callback_uri: "/api/callbacks/computational/create".to_string(),
            context: json!({"image": "spark:3"}),
            created_at: Utc::now(),
            claimed_by: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_handler() {
        let persistence = test_persistence().await;
        let handler = handler("req-1");

        assert!(persistence.insert_handler(&handler).await.unwrap());

        let loaded = persistence
            .get_handler(&handler.request_id)
            .await
            .expect("Failed to get handler")
            .expect("Handler should exist");

        assert_eq!(loaded.action, ActionKind::Create);
        assert_eq!(loaded.computational_name.as_deref(), Some("spark"));
        assert_eq!(loaded.context, json!({"image": "spark:3"}));
        assert!(loaded.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_insert_duplicate_handler() {
        let persistence = test_persistence().await;
        let handler = handler("req-1");

        assert!(persistence.insert_handler(&handler).await.unwrap());
        assert!(!persistence.insert_handler(&handler).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let persistence = test_persistence().await;
        let handler = handler("req-1");
        persistence.insert_handler(&handler).await.unwrap();

        let first = persistence
            .claim_handler(&handler.request_id, "process-a")
            .await
            .unwrap();
        assert_eq!(first.unwrap().claimed_by.as_deref(), Some("process-a"));

        let second = persistence
            .claim_handler(&handler.request_id, "process-b")
            .await
            .unwrap();
        assert!(second.is_none());

        assert!(persistence.release_handler(&handler.request_id).await.unwrap());
        let third = persistence
            .claim_handler(&handler.request_id, "process-b")
            .await
            .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn test_claim_missing_handler() {
        let persistence = test_persistence().await;
        let claimed = persistence
            .claim_handler(&RequestId::from("nope"), "process-a")
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_delete_handler_once() {
        let persistence = test_persistence().await;
        let handler = handler("req-1");
        persistence.insert_handler(&handler).await.unwrap();

        assert!(persistence.delete_handler(&handler.request_id).await.unwrap());
        assert!(!persistence.delete_handler(&handler.request_id).await.unwrap());
        assert!(
            persistence
                .get_handler(&handler.request_id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_list_handlers_pages_by_request_id() {
        let persistence = test_persistence().await;
        for id in ["c", "a", "e", "b", "d"] {
            persistence.insert_handler(&handler(id)).await.unwrap();
        }

        let first = persistence.list_handlers(None, 2).await.unwrap();
        let ids: Vec<_> = first.iter().map(|h| h.request_id.to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let second = persistence
            .list_handlers(Some(&first[1].request_id), 2)
            .await
            .unwrap();
        let ids: Vec<_> = second.iter().map(|h| h.request_id.to_string()).collect();
        assert_eq!(ids, vec!["c", "d"]);

        let last = persistence
            .list_handlers(Some(&RequestId::from("d")), 2)
            .await
            .unwrap();
        assert_eq!(last.len(), 1);
    }

    #[tokio::test]
    async fn test_list_handlers_for_resource() {
        let persistence = test_persistence().await;
        persistence.insert_handler(&handler("a")).await.unwrap();
        persistence.insert_handler(&handler("b")).await.unwrap();
        let mut other = handler("c");
        other.exploratory_name = "elsewhere".to_string();
        persistence.insert_handler(&other).await.unwrap();

        let key = handler("a").resource_key();
        let ids: Vec<_> = persistence
            .list_handlers_for_resource(&key)
            .await
            .unwrap()
            .iter()
            .map(|h| h.request_id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        let missing = ResourceKey::exploratory("nobody", "nothing");
        assert!(
            persistence
                .list_handlers_for_resource(&missing)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_put_status_insert_only_if_absent() {
        let persistence = test_persistence().await;
        let key = ResourceKey::exploratory("alice", "notebook");
        let record =
            ResourceStatusRecord::new(key.clone(), ResourceKind::Exploratory, UserInstanceStatus::Creating);

        assert!(persistence.put_status(&record, None).await.unwrap());
        assert!(!persistence.put_status(&record, None).await.unwrap());

        let loaded = persistence.get_status(&key).await.unwrap().unwrap();
        assert_eq!(loaded.status, UserInstanceStatus::Creating);
        assert!(loaded.key.computational_name.is_none());
    }

    #[tokio::test]
    async fn test_put_status_is_conditional() {
        let persistence = test_persistence().await;
        let key = ResourceKey::computational("alice", "notebook", "spark");
        let record = ResourceStatusRecord::new(
            key.clone(),
            ResourceKind::Computational,
            UserInstanceStatus::Creating,
        );
        persistence.put_status(&record, None).await.unwrap();

        let mut running = record.with_status(UserInstanceStatus::Configuring);
        running.instance_id = Some("i-1;i-2".to_string());
        running.urls = vec![ResourceUrl {
            description: "Spark".to_string(),
            url: "http://master:8080".to_string(),
        }];

        // Wrong precondition
        assert!(
            !persistence
                .put_status(&running, Some(UserInstanceStatus::Stopping))
                .await
                .unwrap()
        );
        assert!(
            persistence
                .put_status(&running, Some(UserInstanceStatus::Creating))
                .await
                .unwrap()
        );

        let loaded = persistence.get_status(&key).await.unwrap().unwrap();
        assert_eq!(loaded.status, UserInstanceStatus::Configuring);
        assert_eq!(loaded.instance_id.as_deref(), Some("i-1;i-2"));
        assert_eq!(loaded.urls.len(), 1);
        assert_eq!(loaded.key.computational_name.as_deref(), Some("spark"));
    }

    #[tokio::test]
    async fn test_get_status_not_found() {
        let persistence = test_persistence().await;
        let result = persistence
            .get_status(&ResourceKey::exploratory("nobody", "nothing"))
            .await
            .expect("Query should succeed");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_file_backed_database_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.db");

        {
            let persistence = SqlitePersistence::from_path(&path).await.unwrap();
            persistence.insert_handler(&handler("req-1")).await.unwrap();
            persistence.pool().close().await;
        }

        let reopened = SqlitePersistence::from_path(&path).await.unwrap();
        let handlers = reopened.list_handlers(None, 10).await.unwrap();
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].request_id.as_str(), "req-1");
    }
}
