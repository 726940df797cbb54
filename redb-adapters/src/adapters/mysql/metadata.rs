use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::Pool;
use redb_types::errors::DatabaseError;

use crate::interface::MetadataOperator;

use super::query_error;

#[derive(Debug)]
pub struct MysqlMetadata {
    pool: Pool,
}

impl MysqlMetadata {
    pub(super) fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self, operation: &str) -> Result<mysql_async::Conn, DatabaseError> {
        self.pool
            .get_conn()
            .await
            .map_err(|e| query_error(operation, e))
    }
}

#[async_trait]
impl MetadataOperator for MysqlMetadata {
    async fn version(&self) -> Result<String, DatabaseError> {
        let mut conn = self.conn("metadata.version").await?;
        let version: Option<String> = conn
            .query_first("SELECT VERSION()")
            .await
            .map_err(|e| query_error("metadata.version", e))?;
        Ok(version.unwrap_or_default())
    }

    async fn instance_identifier(&self) -> Result<String, DatabaseError> {
        let mut conn = self.conn("metadata.instance_identifier").await?;
        let uuid: Option<String> = conn
            .query_first("SELECT @@server_uuid")
            .await
            .map_err(|e| query_error("metadata.instance_identifier", e))?;
        Ok(uuid.unwrap_or_default())
    }

    async fn database_size_bytes(&self) -> Result<u64, DatabaseError> {
        let mut conn = self.conn("metadata.database_size_bytes").await?;
        let size: Option<Option<u64>> = conn
            .query_first(
                "SELECT SUM(DATA_LENGTH + INDEX_LENGTH) FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = DATABASE()",
            )
            .await
            .map_err(|e| query_error("metadata.database_size_bytes", e))?;
        Ok(size.flatten().unwrap_or(0))
    }

    async fn table_count(&self) -> Result<u64, DatabaseError> {
        let mut conn = self.conn("metadata.table_count").await?;
        let count: Option<u64> = conn
            .query_first(
                "SELECT COUNT(*) FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE'",
            )
            .await
            .map_err(|e| query_error("metadata.table_count", e))?;
        Ok(count.unwrap_or(0))
    }

    async fn execute_command(&self, command: &str) -> Result<(), DatabaseError> {
        let mut conn = self.conn("metadata.execute_command").await?;
        conn.query_drop(command)
            .await
            .map_err(|e| query_error("metadata.execute_command", e))
    }
}
