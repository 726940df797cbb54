use std::sync::Arc;

use async_trait::async_trait;
use redb_types::errors::DatabaseError;
use tokio_postgres::Client;

use crate::interface::MetadataOperator;

use super::connection::query_error;

#[derive(Debug)]
pub struct PostgresMetadata {
    client: Arc<Client>,
}

impl PostgresMetadata {
    pub(super) fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MetadataOperator for PostgresMetadata {
    async fn version(&self) -> Result<String, DatabaseError> {
        let row = self
            .client
            .query_one("SELECT version()", &[])
            .await
            .map_err(|e| query_error("metadata.version", e))?;
        Ok(row.get(0))
    }

    async fn instance_identifier(&self) -> Result<String, DatabaseError> {
        let row = self
            .client
            .query_one(
                "SELECT system_identifier::text FROM pg_control_system()",
                &[],
            )
            .await
            .map_err(|e| query_error("metadata.instance_identifier", e))?;
        Ok(row.get(0))
    }

    async fn database_size_bytes(&self) -> Result<u64, DatabaseError> {
        let row = self
            .client
            .query_one("SELECT pg_database_size(current_database())", &[])
            .await
            .map_err(|e| query_error("metadata.database_size_bytes", e))?;
        let size: i64 = row.get(0);
        Ok(size.max(0) as u64)
    }

    async fn table_count(&self) -> Result<u64, DatabaseError> {
        let row = self
            .client
            .query_one(
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_type = 'BASE TABLE' \
                 AND table_schema NOT IN ('pg_catalog', 'information_schema')",
                &[],
            )
            .await
            .map_err(|e| query_error("metadata.table_count", e))?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }

    async fn execute_command(&self, command: &str) -> Result<(), DatabaseError> {
        self.client
            .batch_execute(command)
            .await
            .map_err(|e| query_error("metadata.execute_command", e))
    }
}
