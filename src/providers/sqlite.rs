use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use uuid::Uuid;

use super::{InstanceInfo, InstanceStore, ProviderError};
use crate::WorkflowIdentity;
use crate::runtime::snapshot::WorkflowSnapshot;

/// SQLite-backed instance store.
///
/// Snapshots are stored as JSON text next to a few indexed columns used by
/// [`InstanceStore::list_instances`]. Saves that carry key changes run in a
/// single database transaction.
pub struct SqliteInstanceStore {
    pool: SqlitePool,
}

impl SqliteInstanceStore {
    /// Convert sqlx error to ProviderError with appropriate retry classification
    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let error_msg = e.to_string();

        // SQLITE_BUSY (database locked) - retryable
        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            return ProviderError::retryable(operation, format!("Database locked: {error_msg}"));
        }

        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, format!("Constraint violation: {error_msg}"));
        }

        if error_msg.contains("connection") || error_msg.contains("timeout") {
            return ProviderError::retryable(operation, format!("Connection error: {error_msg}"));
        }

        ProviderError::retryable(operation, error_msg)
    }

    /// Create a new SQLite store
    ///
    /// # Arguments
    /// * `database_url` - SQLite connection string (e.g., "sqlite:data.db?mode=rwc" or "sqlite::memory:")
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        Self::create_schema(&pool).await?;
        debug!(target: "duroflow::providers::sqlite", url = database_url, "sqlite instance store ready");
        Ok(Self { pool })
    }

    /// Shared in-memory database, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        // shared cache so pooled connections see the same database
        Self::new(&format!("sqlite:file:duroflow-{}?mode=memory&cache=shared", Uuid::new_v4())).await
    }

    pub fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                workflow_name TEXT NOT NULL,
                workflow_version TEXT,
                completed INTEGER NOT NULL DEFAULT 0,
                saved_at INTEGER NOT NULL,
                snapshot TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instance_keys (
                key_id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_instance_keys_instance ON instance_keys(instance_id)")
            .execute(pool)
            .await?;
        Ok(())
    }

    fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }

    async fn save_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        snapshot: &WorkflowSnapshot,
    ) -> Result<(), ProviderError> {
        let body = serde_json::to_string(snapshot).map_err(|e| ProviderError::corrupt_snapshot("save", e))?;
        sqlx::query(
            r#"
            INSERT INTO instances (instance_id, workflow_name, workflow_version, completed, saved_at, snapshot)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(instance_id) DO UPDATE SET
                workflow_name = excluded.workflow_name,
                workflow_version = excluded.workflow_version,
                completed = excluded.completed,
                saved_at = excluded.saved_at,
                snapshot = excluded.snapshot
            "#,
        )
        .bind(snapshot.instance_id.to_string())
        .bind(&snapshot.identity.name)
        .bind(snapshot.identity.version.as_ref().map(|v| v.to_string()))
        .bind(snapshot.is_completed() as i64)
        .bind(Self::now_millis())
        .bind(body)
        .execute(&mut **tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("save", e))?;
        Ok(())
    }

    async fn associate_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        instance: Uuid,
        keys: &[Uuid],
    ) -> Result<(), ProviderError> {
        for key in keys {
            let owner: Option<String> = sqlx::query_scalar("SELECT instance_id FROM instance_keys WHERE key_id = ?")
                .bind(key.to_string())
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("associate_keys", e))?;
            match owner {
                Some(owner) if owner != instance.to_string() => {
                    return Err(ProviderError::key_conflict(*key, owner));
                }
                Some(_) => {}
                None => {
                    sqlx::query("INSERT INTO instance_keys (key_id, instance_id) VALUES (?, ?)")
                        .bind(key.to_string())
                        .bind(instance.to_string())
                        .execute(&mut **tx)
                        .await
                        .map_err(|e| Self::sqlx_to_provider_error("associate_keys", e))?;
                }
            }
        }
        Ok(())
    }

    async fn disassociate_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        keys: &[Uuid],
    ) -> Result<(), ProviderError> {
        for key in keys {
            sqlx::query("DELETE FROM instance_keys WHERE key_id = ?")
                .bind(key.to_string())
                .execute(&mut **tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("disassociate_keys", e))?;
        }
        Ok(())
    }

    async fn begin(&self, operation: &str) -> Result<sqlx::Transaction<'static, sqlx::Sqlite>, ProviderError> {
        self.pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))
    }

    async fn commit(tx: sqlx::Transaction<'_, sqlx::Sqlite>, operation: &str) -> Result<(), ProviderError> {
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(operation, e))
    }
}

#[async_trait::async_trait]
impl InstanceStore for SqliteInstanceStore {
    async fn save(&self, snapshot: &WorkflowSnapshot) -> Result<(), ProviderError> {
        let mut tx = self.begin("save").await?;
        Self::save_in_tx(&mut tx, snapshot).await?;
        Self::commit(tx, "save").await
    }

    async fn load(&self, instance: Uuid) -> Result<Option<WorkflowSnapshot>, ProviderError> {
        let body: Option<String> = sqlx::query_scalar("SELECT snapshot FROM instances WHERE instance_id = ?")
            .bind(instance.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("load", e))?;
        match body {
            Some(body) => WorkflowSnapshot::from_json(body.as_bytes())
                .map(Some)
                .map_err(|e| ProviderError::corrupt_snapshot("load", e)),
            None => Ok(None),
        }
    }

    async fn delete(&self, instance: Uuid) -> Result<bool, ProviderError> {
        let mut tx = self.begin("delete").await?;
        sqlx::query("DELETE FROM instance_keys WHERE instance_id = ?")
            .bind(instance.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("delete", e))?;
        let removed = sqlx::query("DELETE FROM instances WHERE instance_id = ?")
            .bind(instance.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("delete", e))?
            .rows_affected();
        Self::commit(tx, "delete").await?;
        Ok(removed > 0)
    }

    async fn associate_keys(&self, instance: Uuid, keys: &[Uuid]) -> Result<(), ProviderError> {
        let mut tx = self.begin("associate_keys").await?;
        Self::associate_in_tx(&mut tx, instance, keys).await?;
        Self::commit(tx, "associate_keys").await
    }

    async fn disassociate_keys(&self, keys: &[Uuid]) -> Result<(), ProviderError> {
        let mut tx = self.begin("disassociate_keys").await?;
        Self::disassociate_in_tx(&mut tx, keys).await?;
        Self::commit(tx, "disassociate_keys").await
    }

    async fn lookup_key(&self, key: Uuid) -> Result<Option<Uuid>, ProviderError> {
        let owner: Option<String> = sqlx::query_scalar("SELECT instance_id FROM instance_keys WHERE key_id = ?")
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("lookup_key", e))?;
        owner
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| ProviderError::permanent("lookup_key", format!("corrupt instance id: {e}")))
    }

    async fn list_instances(&self) -> Result<Vec<InstanceInfo>, ProviderError> {
        let rows = sqlx::query(
            "SELECT instance_id, workflow_name, workflow_version, completed, saved_at FROM instances ORDER BY instance_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("list_instances", e))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row
                .try_get("instance_id")
                .map_err(|e| Self::sqlx_to_provider_error("list_instances", e))?;
            let name: String = row
                .try_get("workflow_name")
                .map_err(|e| Self::sqlx_to_provider_error("list_instances", e))?;
            let version: Option<String> = row.try_get("workflow_version").unwrap_or(None);
            let completed: i64 = row.try_get("completed").unwrap_or(0);
            let saved_at: i64 = row.try_get("saved_at").unwrap_or(0);

            let instance_id = Uuid::parse_str(&id)
                .map_err(|e| ProviderError::permanent("list_instances", format!("corrupt instance id: {e}")))?;
            let mut identity = WorkflowIdentity::new(name);
            if let Some(v) = version.and_then(|v| semver::Version::parse(&v).ok()) {
                identity = identity.with_version(v);
            }
            out.push(InstanceInfo {
                instance_id,
                identity,
                completed: completed != 0,
                saved_at_ms: saved_at.max(0) as u64,
            });
        }
        Ok(out)
    }

    async fn save_with_keys(
        &self,
        snapshot: &WorkflowSnapshot,
        associate: &[Uuid],
        disassociate: &[Uuid],
    ) -> Result<(), ProviderError> {
        let mut tx = self.begin("save").await?;
        Self::save_in_tx(&mut tx, snapshot).await?;
        Self::disassociate_in_tx(&mut tx, disassociate).await?;
        Self::associate_in_tx(&mut tx, snapshot.instance_id, associate).await?;
        Self::commit(tx, "save").await
    }
}
