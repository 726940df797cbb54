use std::sync::Arc;

use async_trait::async_trait;
use redb_types::errors::DatabaseError;
use tokio_postgres::Client;

use crate::interface::InstanceOperator;

use super::connection::{query_error, quote_ident};

#[derive(Debug)]
pub struct PostgresInstance {
    client: Arc<Client>,
}

impl PostgresInstance {
    pub(super) fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InstanceOperator for PostgresInstance {
    async fn list_databases(&self) -> Result<Vec<String>, DatabaseError> {
        let rows = self
            .client
            .query(
                "SELECT datname FROM pg_database WHERE NOT datistemplate ORDER BY datname",
                &[],
            )
            .await
            .map_err(|e| query_error("list_databases", e))?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn create_database(&self, name: &str) -> Result<(), DatabaseError> {
        let sql = format!("CREATE DATABASE {}", quote_ident(name));
        self.client
            .batch_execute(&sql)
            .await
            .map_err(|e| query_error("create_database", e))
    }

    async fn drop_database(&self, name: &str) -> Result<(), DatabaseError> {
        let sql = format!("DROP DATABASE {}", quote_ident(name));
        self.client
            .batch_execute(&sql)
            .await
            .map_err(|e| query_error("drop_database", e))
    }
}
