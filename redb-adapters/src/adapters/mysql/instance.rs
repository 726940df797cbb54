use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::Pool;
use redb_types::errors::DatabaseError;

use crate::interface::InstanceOperator;

use super::{query_error, quote_ident};

#[derive(Debug)]
pub struct MysqlInstance {
    pool: Pool,
}

impl MysqlInstance {
    pub(super) fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstanceOperator for MysqlInstance {
    async fn list_databases(&self) -> Result<Vec<String>, DatabaseError> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| query_error("list_databases", e))?;
        conn.query("SHOW DATABASES")
            .await
            .map_err(|e| query_error("list_databases", e))
    }

    async fn create_database(&self, name: &str) -> Result<(), DatabaseError> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| query_error("create_database", e))?;
        conn.query_drop(format!("CREATE DATABASE {}", quote_ident(name)))
            .await
            .map_err(|e| query_error("create_database", e))
    }

    async fn drop_database(&self, name: &str) -> Result<(), DatabaseError> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| query_error("drop_database", e))?;
        conn.query_drop(format!("DROP DATABASE {}", quote_ident(name)))
            .await
            .map_err(|e| query_error("drop_database", e))
    }
}
