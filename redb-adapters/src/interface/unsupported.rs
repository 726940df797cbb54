//! Null-object operators: every method answers `OperationNotSupported` so
//! call sites can hold an operator for each group without branching.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use redb_types::errors::DatabaseError;
use redb_types::models::{CdcEvent, DatabaseType, JsonRow, Table, UnifiedModel};

use super::{
    DataOperator, MetadataOperator, Publication, RawEvent, ReplicationConfig,
    ReplicationMechanism, ReplicationOperator, ReplicationSlot, ReplicationSource,
    ReplicationStatus, SchemaOperator, StreamParams, StreamResult, TableIdentifier,
};

#[derive(Debug, Clone, Copy)]
pub struct UnsupportedSchema(pub DatabaseType);

#[async_trait]
impl SchemaOperator for UnsupportedSchema {
    fn is_supported(&self) -> bool {
        false
    }

    async fn discover_schema(&self) -> Result<UnifiedModel, DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "schema.discover_schema"))
    }

    async fn create_structure(&self, _model: &UnifiedModel) -> Result<(), DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "schema.create_structure"))
    }

    async fn list_tables(&self) -> Result<Vec<TableIdentifier>, DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "schema.list_tables"))
    }

    async fn get_table_schema(&self, _table: &TableIdentifier) -> Result<Table, DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "schema.get_table_schema"))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UnsupportedData(pub DatabaseType);

#[async_trait]
impl DataOperator for UnsupportedData {
    fn is_supported(&self) -> bool {
        false
    }

    async fn fetch(
        &self,
        _table: &TableIdentifier,
        _limit: Option<usize>,
    ) -> Result<Vec<JsonRow>, DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "data.fetch"))
    }

    async fn fetch_with_columns(
        &self,
        _table: &TableIdentifier,
        _columns: &[String],
        _limit: Option<usize>,
    ) -> Result<Vec<JsonRow>, DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "data.fetch_with_columns"))
    }

    async fn insert(
        &self,
        _table: &TableIdentifier,
        _rows: &[JsonRow],
    ) -> Result<u64, DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "data.insert"))
    }

    async fn update(
        &self,
        _table: &TableIdentifier,
        _assignments: &JsonRow,
        _filter: &JsonRow,
    ) -> Result<u64, DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "data.update"))
    }

    async fn upsert(
        &self,
        _table: &TableIdentifier,
        _key_columns: &[String],
        _rows: &[JsonRow],
    ) -> Result<u64, DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "data.upsert"))
    }

    async fn delete(
        &self,
        _table: &TableIdentifier,
        _filter: &JsonRow,
    ) -> Result<u64, DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "data.delete"))
    }

    async fn stream(&self, _params: &StreamParams) -> Result<StreamResult, DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "data.stream"))
    }

    async fn execute_query(&self, _query: &str) -> Result<Vec<JsonRow>, DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "data.execute_query"))
    }

    async fn execute_count_query(&self, _query: &str) -> Result<u64, DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "data.execute_count_query"))
    }

    async fn get_row_count(
        &self,
        _table: &TableIdentifier,
        _filter: Option<&str>,
    ) -> Result<u64, DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "data.get_row_count"))
    }

    async fn wipe(&self) -> Result<(), DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "data.wipe"))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UnsupportedReplication(pub DatabaseType);

#[async_trait]
impl ReplicationOperator for UnsupportedReplication {
    fn database_type(&self) -> DatabaseType {
        self.0
    }

    fn is_supported(&self) -> bool {
        false
    }

    fn supported_mechanisms(&self) -> Vec<ReplicationMechanism> {
        vec![]
    }

    async fn check_prerequisites(&self) -> Result<(), DatabaseError> {
        Err(DatabaseError::unsupported(
            self.0,
            "replication.check_prerequisites",
        ))
    }

    async fn current_position(&self) -> Result<String, DatabaseError> {
        Err(DatabaseError::unsupported(
            self.0,
            "replication.current_position",
        ))
    }

    async fn connect(
        &self,
        _config: &ReplicationConfig,
    ) -> Result<Arc<dyn ReplicationSource>, DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "replication.connect"))
    }

    fn parse_event(&self, _raw: &RawEvent) -> Result<CdcEvent, DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "replication.parse_event"))
    }

    async fn apply_cdc_event(&self, _event: &CdcEvent) -> Result<(), DatabaseError> {
        Err(DatabaseError::unsupported(
            self.0,
            "replication.apply_cdc_event",
        ))
    }

    async fn list_slots(&self) -> Result<Vec<ReplicationSlot>, DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "replication.list_slots"))
    }

    async fn drop_slot(&self, _name: &str) -> Result<(), DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "replication.drop_slot"))
    }

    async fn list_publications(&self) -> Result<Vec<Publication>, DatabaseError> {
        Err(DatabaseError::unsupported(
            self.0,
            "replication.list_publications",
        ))
    }

    async fn drop_publication(&self, _name: &str) -> Result<(), DatabaseError> {
        Err(DatabaseError::unsupported(
            self.0,
            "replication.drop_publication",
        ))
    }

    async fn replication_status(
        &self,
        _slot_name: &str,
    ) -> Result<ReplicationStatus, DatabaseError> {
        Err(DatabaseError::unsupported(
            self.0,
            "replication.replication_status",
        ))
    }

    fn compare_positions(&self, _left: &str, _right: &str) -> Option<Ordering> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UnsupportedMetadata(pub DatabaseType);

#[async_trait]
impl MetadataOperator for UnsupportedMetadata {
    fn is_supported(&self) -> bool {
        false
    }

    async fn version(&self) -> Result<String, DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "metadata.version"))
    }

    async fn instance_identifier(&self) -> Result<String, DatabaseError> {
        Err(DatabaseError::unsupported(
            self.0,
            "metadata.instance_identifier",
        ))
    }

    async fn database_size_bytes(&self) -> Result<u64, DatabaseError> {
        Err(DatabaseError::unsupported(
            self.0,
            "metadata.database_size_bytes",
        ))
    }

    async fn table_count(&self) -> Result<u64, DatabaseError> {
        Err(DatabaseError::unsupported(self.0, "metadata.table_count"))
    }

    async fn execute_command(&self, _command: &str) -> Result<(), DatabaseError> {
        Err(DatabaseError::unsupported(
            self.0,
            "metadata.execute_command",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb_types::errors::ErrorKind;

    #[tokio::test]
    async fn unsupported_replication_names_type_and_operation() {
        let replication = UnsupportedReplication(DatabaseType::Mysql);
        assert!(!replication.is_supported());

        let err = replication.check_prerequisites().await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::OperationNotSupported));
        assert_eq!(err.database_type, "mysql");
        assert_eq!(err.operation, "replication.check_prerequisites");
    }

    #[tokio::test]
    async fn unsupported_schema_is_flagged() {
        let schema = UnsupportedSchema(DatabaseType::Memory);
        assert!(!schema.is_supported());
        assert!(schema.discover_schema().await.is_err());
    }
}
