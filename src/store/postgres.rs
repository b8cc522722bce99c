//! PostgreSQL store for recording rows.

use async_trait::async_trait;
use deadpool_postgres::{Config, Pool, Runtime};
use serde_json::Value;
use tokio_postgres::NoTls;

use crate::config::{DatabaseConfig, RecordingColumns};
use crate::error::DatabaseError;
use crate::recording::{ErrorMetadata, RecordingState, RecordingStatus};
use crate::store::RecordingStore;

/// Statements for one table layout.
///
/// Identifiers are quoted, so configured names are matched case-sensitively.
/// Status values travel as text and are cast to the enum type when the
/// column has one.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Statements {
    select_state: String,
    update_status: String,
    update_status_and_metadata: String,
    update_file_name: String,
}

impl Statements {
    fn new(table: &str, columns: &RecordingColumns) -> Self {
        let table = quote(table);
        let id = quote(&columns.id);
        let status = quote(&columns.status);
        let metadata = quote(&columns.error_metadata);
        let file_name = quote(&columns.file_name);
        let status_param = match &columns.status_type {
            Some(ty) => format!("$2::text::{}", quote(ty)),
            None => "$2".to_string(),
        };

        Self {
            select_state: format!(
                "SELECT {status}::text AS status, {metadata} AS error_metadata \
                 FROM {table} WHERE {id} = $1"
            ),
            update_status: format!("UPDATE {table} SET {status} = {status_param} WHERE {id} = $1"),
            update_status_and_metadata: format!(
                "UPDATE {table} SET {status} = {status_param}, {metadata} = $3 WHERE {id} = $1"
            ),
            update_file_name: format!("UPDATE {table} SET {file_name} = $2 WHERE {id} = $1"),
        }
    }
}

/// Quote a validated identifier.
fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

/// Recording store backed by a deadpool connection pool.
pub struct PgRecordingStore {
    pool: Pool,
    sql: Statements,
}

impl PgRecordingStore {
    /// Create a new store and connect to the database.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let mut cfg = Config::new();
        cfg.url = Some(config.url().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self::with_pool(pool, config))
    }

    /// Wrap an existing pool using the table layout from `config`.
    pub fn with_pool(pool: Pool, config: &DatabaseConfig) -> Self {
        Self {
            pool,
            sql: Statements::new(&config.table, &config.columns),
        }
    }

    /// Get a connection from the pool.
    pub async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.query_one("SELECT 1", &[]).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordingStore for PgRecordingStore {
    async fn get_state(&self, recording_id: &str) -> Result<Option<RecordingState>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn.query_opt(self.sql.select_state.as_str(), &[&recording_id]).await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.try_get("status")?;
        let status = status
            .parse::<RecordingStatus>()
            .map_err(DatabaseError::Serialization)?;
        let metadata: Option<Value> = row.try_get("error_metadata")?;

        Ok(Some(RecordingState {
            status,
            error_metadata: metadata.as_ref().and_then(ErrorMetadata::from_stored),
        }))
    }

    async fn update_status(
        &self,
        recording_id: &str,
        status: RecordingStatus,
        error_metadata: Option<&ErrorMetadata>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let status = status.as_str();

        match error_metadata {
            Some(meta) => {
                let doc = meta.to_value();
                conn.execute(
                    self.sql.update_status_and_metadata.as_str(),
                    &[&recording_id, &status, &doc],
                )
                .await?;
            }
            None => {
                conn.execute(self.sql.update_status.as_str(), &[&recording_id, &status])
                    .await?;
            }
        }
        Ok(())
    }

    async fn set_file_name(
        &self,
        recording_id: &str,
        file_name: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(self.sql.update_file_name.as_str(), &[&recording_id, &file_name])
            .await?;
        if updated == 0 {
            return Err(DatabaseError::Query(format!(
                "recording {recording_id} not found while setting file name"
            )));
        }
        Ok(())
    }
}
