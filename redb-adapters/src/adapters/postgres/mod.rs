//! Postgres adapter: full schema/data/replication/metadata support.
//!
//! CDC uses a logical replication slot decoded with `wal2json`
//! (format-version 2), polled through `pg_logical_slot_peek_changes`;
//! checkpointing advances the slot, so a resume replays nothing before the
//! saved LSN.

use std::sync::Arc;

use async_trait::async_trait;
use redb_types::errors::DatabaseError;
use redb_types::models::{ConnectionConfig, DatabaseType, InstanceConfig};

use crate::interface::{Connection, DatabaseAdapter, InstanceConnection};

pub mod connection;
mod data;
mod instance;
mod metadata;
mod replication;
mod schema;
#[cfg(test)]
mod tests;
mod types;

pub use data::PostgresData;
pub use metadata::PostgresMetadata;
pub use replication::{PostgresReplication, PostgresReplicationSource};
pub use schema::PostgresSchema;

pub(crate) const TYPE: DatabaseType = DatabaseType::Postgres;

#[derive(Debug, Clone, Copy)]
pub struct PostgresAdapter;

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn database_type(&self) -> DatabaseType {
        TYPE
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Connection, DatabaseError> {
        let client = Arc::new(connection::connect(config).await?);
        let schema_filter = config.schema.clone();
        Ok(Connection::new(
            TYPE,
            config.clone(),
            Arc::new(PostgresSchema::new(client.clone(), schema_filter.clone())),
            Arc::new(PostgresData::new(client.clone(), schema_filter.clone())),
            Arc::new(PostgresReplication::new(client.clone())),
            Arc::new(PostgresMetadata::new(client)),
        ))
    }

    async fn connect_instance(
        &self,
        config: &InstanceConfig,
    ) -> Result<InstanceConnection, DatabaseError> {
        let client = Arc::new(connection::connect_instance(config).await?);
        Ok(InstanceConnection {
            database_type: TYPE,
            config: config.clone(),
            instance: Arc::new(instance::PostgresInstance::new(client)),
        })
    }
}
