//! In-process adapter. Backs unit tests and local stream topics; implements
//! all four capability groups, including a replayable event-log replication
//! source whose positions are monotonically increasing sequence numbers.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use redb_types::errors::{DatabaseError, ErrorKind, ResourceKind};
use redb_types::models::{
    CdcEvent, ConnectionConfig, DatabaseType, InstanceConfig, JsonRow, Table, UnifiedModel,
};
use redb_types::parking_lot::RwLock;
use redb_types::serde_json;

use crate::interface::{
    Connection, DatabaseAdapter, DataOperator, InstanceConnection, InstanceOperator,
    MetadataOperator, SchemaOperator, StreamParams, StreamResult, TableIdentifier,
};

mod replication;

pub use replication::{MemoryReplication, MemoryReplicationSource};

use replication::ReplicationLog;

const TYPE: DatabaseType = DatabaseType::Memory;

fn err(operation: &str, kind: ErrorKind) -> DatabaseError {
    DatabaseError::new(TYPE.as_str(), operation, kind)
}

/// One logical in-memory database: tables, rows, and the change log every
/// write is recorded into.
#[derive(Debug)]
pub struct MemoryDatabase {
    name: String,
    instance_id: String,
    tables: RwLock<BTreeMap<String, MemoryTable>>,
    log: ReplicationLog,
    checkpoints: RwLock<BTreeMap<String, String>>,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: Table,
    rows: Vec<JsonRow>,
}

impl MemoryDatabase {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            tables: RwLock::new(BTreeMap::new()),
            log: ReplicationLog::default(),
            checkpoints: RwLock::new(BTreeMap::new()),
        }
    }

    fn insert_rows(&self, table: &str, rows: &[JsonRow]) -> Result<u64, DatabaseError> {
        {
            let mut tables = self.tables.write();
            let entry = tables
                .get_mut(table)
                .ok_or_else(|| table_not_found("insert", table))?;
            entry.rows.extend(rows.iter().cloned());
        }
        for row in rows {
            self.log.append(CdcEvent::insert(table, row.clone()));
        }
        Ok(rows.len() as u64)
    }

    fn update_rows(
        &self,
        table: &str,
        assignments: &JsonRow,
        filter: &JsonRow,
    ) -> Result<u64, DatabaseError> {
        let mut changed = Vec::new();
        {
            let mut tables = self.tables.write();
            let entry = tables
                .get_mut(table)
                .ok_or_else(|| table_not_found("update", table))?;
            for row in entry.rows.iter_mut() {
                if matches_filter(row, filter) {
                    let old = row.clone();
                    for (column, value) in assignments {
                        row.insert(column.clone(), value.clone());
                    }
                    changed.push((old, row.clone()));
                }
            }
        }
        let count = changed.len() as u64;
        for (old, new) in changed {
            self.log.append(CdcEvent::update(table, new, Some(old)));
        }
        Ok(count)
    }

    fn delete_rows(&self, table: &str, filter: &JsonRow) -> Result<u64, DatabaseError> {
        let mut removed = Vec::new();
        {
            let mut tables = self.tables.write();
            let entry = tables
                .get_mut(table)
                .ok_or_else(|| table_not_found("delete", table))?;
            entry.rows.retain(|row| {
                if matches_filter(row, filter) {
                    removed.push(row.clone());
                    false
                } else {
                    true
                }
            });
        }
        let count = removed.len() as u64;
        for row in removed {
            self.log.append(CdcEvent::delete(table, row));
        }
        Ok(count)
    }

    fn truncate_table(&self, table: &str) -> Result<(), DatabaseError> {
        {
            let mut tables = self.tables.write();
            let entry = tables
                .get_mut(table)
                .ok_or_else(|| table_not_found("truncate", table))?;
            entry.rows.clear();
        }
        self.log.append(CdcEvent::truncate(table));
        Ok(())
    }

    fn primary_key_of(&self, table: &str) -> Vec<String> {
        self.tables
            .read()
            .get(table)
            .map(|t| {
                t.schema
                    .primary_key_columns()
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn table_not_found(operation: &str, table: &str) -> DatabaseError {
    err(
        operation,
        ErrorKind::NotFound(ResourceKind::Table, table.to_string()),
    )
}

fn matches_filter(row: &JsonRow, filter: &JsonRow) -> bool {
    filter
        .iter()
        .all(|(column, value)| row.get(column) == Some(value))
}

fn project(row: &JsonRow, columns: &[String]) -> JsonRow {
    columns
        .iter()
        .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
        .collect()
}

/// The in-process database server: one shared handle, databases created on
/// first connect.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    databases: Arc<RwLock<BTreeMap<String, Arc<MemoryDatabase>>>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn database(&self, name: &str) -> Arc<MemoryDatabase> {
        let mut databases = self.databases.write();
        databases
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryDatabase::new(name)))
            .clone()
    }
}

#[async_trait]
impl DatabaseAdapter for MemoryAdapter {
    fn database_type(&self) -> DatabaseType {
        TYPE
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Connection, DatabaseError> {
        if config.database.is_empty() {
            return Err(err(
                "connect",
                ErrorKind::InvalidConfiguration("database name must not be empty".to_string()),
            ));
        }
        let database = self.database(&config.database);
        Ok(Connection::new(
            TYPE,
            config.clone(),
            Arc::new(MemorySchema {
                database: database.clone(),
            }),
            Arc::new(MemoryData {
                database: database.clone(),
            }),
            Arc::new(MemoryReplication::new(database.clone())),
            Arc::new(MemoryMetadata { database }),
        ))
    }

    async fn connect_instance(
        &self,
        config: &InstanceConfig,
    ) -> Result<InstanceConnection, DatabaseError> {
        Ok(InstanceConnection {
            database_type: TYPE,
            config: config.clone(),
            instance: Arc::new(MemoryInstance {
                databases: self.databases.clone(),
            }),
        })
    }
}

#[derive(Debug)]
struct MemoryInstance {
    databases: Arc<RwLock<BTreeMap<String, Arc<MemoryDatabase>>>>,
}

#[async_trait]
impl InstanceOperator for MemoryInstance {
    async fn list_databases(&self) -> Result<Vec<String>, DatabaseError> {
        Ok(self.databases.read().keys().cloned().collect())
    }

    async fn create_database(&self, name: &str) -> Result<(), DatabaseError> {
        self.databases
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryDatabase::new(name)));
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<(), DatabaseError> {
        self.databases.write().remove(name).map(|_| ()).ok_or_else(|| {
            err(
                "drop_database",
                ErrorKind::NotFound(ResourceKind::Database, name.to_string()),
            )
        })
    }
}

#[derive(Debug)]
struct MemorySchema {
    database: Arc<MemoryDatabase>,
}

#[async_trait]
impl SchemaOperator for MemorySchema {
    async fn discover_schema(&self) -> Result<UnifiedModel, DatabaseError> {
        let tables = self.database.tables.read();
        Ok(UnifiedModel {
            tables: tables.values().map(|t| t.schema.clone()).collect(),
            ..Default::default()
        })
    }

    async fn create_structure(&self, model: &UnifiedModel) -> Result<(), DatabaseError> {
        model
            .validate()
            .map_err(|e| err("create_structure", ErrorKind::InvalidConfiguration(e.to_string())))?;
        let mut tables = self.database.tables.write();
        for table in &model.tables {
            tables
                .entry(table.name.clone())
                .or_insert_with(|| MemoryTable {
                    schema: table.clone(),
                    rows: vec![],
                });
        }
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<TableIdentifier>, DatabaseError> {
        Ok(self
            .database
            .tables
            .read()
            .keys()
            .cloned()
            .map(TableIdentifier::new)
            .collect())
    }

    async fn get_table_schema(&self, table: &TableIdentifier) -> Result<Table, DatabaseError> {
        self.database
            .tables
            .read()
            .get(&table.name)
            .map(|t| t.schema.clone())
            .ok_or_else(|| table_not_found("get_table_schema", &table.name))
    }
}

#[derive(Debug)]
struct MemoryData {
    database: Arc<MemoryDatabase>,
}

impl MemoryData {
    fn rows_of(&self, table: &str, operation: &str) -> Result<Vec<JsonRow>, DatabaseError> {
        self.database
            .tables
            .read()
            .get(table)
            .map(|t| t.rows.clone())
            .ok_or_else(|| table_not_found(operation, table))
    }
}

#[async_trait]
impl DataOperator for MemoryData {
    async fn fetch(
        &self,
        table: &TableIdentifier,
        limit: Option<usize>,
    ) -> Result<Vec<JsonRow>, DatabaseError> {
        let mut rows = self.rows_of(&table.name, "fetch")?;
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn fetch_with_columns(
        &self,
        table: &TableIdentifier,
        columns: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<JsonRow>, DatabaseError> {
        let rows = self.fetch(table, limit).await?;
        Ok(rows.iter().map(|row| project(row, columns)).collect())
    }

    async fn insert(
        &self,
        table: &TableIdentifier,
        rows: &[JsonRow],
    ) -> Result<u64, DatabaseError> {
        self.database.insert_rows(&table.name, rows)
    }

    async fn update(
        &self,
        table: &TableIdentifier,
        assignments: &JsonRow,
        filter: &JsonRow,
    ) -> Result<u64, DatabaseError> {
        self.database.update_rows(&table.name, assignments, filter)
    }

    async fn upsert(
        &self,
        table: &TableIdentifier,
        key_columns: &[String],
        rows: &[JsonRow],
    ) -> Result<u64, DatabaseError> {
        let mut affected = 0;
        for row in rows {
            let key = project(row, key_columns);
            if key.len() == key_columns.len()
                && self
                    .rows_of(&table.name, "upsert")?
                    .iter()
                    .any(|r| matches_filter(r, &key))
            {
                affected += self.database.update_rows(&table.name, row, &key)?;
            } else {
                affected += self.database.insert_rows(&table.name, &[row.clone()])?;
            }
        }
        Ok(affected)
    }

    async fn delete(
        &self,
        table: &TableIdentifier,
        filter: &JsonRow,
    ) -> Result<u64, DatabaseError> {
        self.database.delete_rows(&table.name, filter)
    }

    async fn stream(&self, params: &StreamParams) -> Result<StreamResult, DatabaseError> {
        let rows = self.rows_of(&params.table.name, "stream")?;
        let offset: usize = match &params.cursor {
            Some(cursor) => cursor.parse().map_err(|_| {
                err(
                    "stream",
                    ErrorKind::InvalidQuery(format!("malformed stream cursor `{cursor}`")),
                )
            })?,
            None => 0,
        };
        let end = (offset + params.batch_size).min(rows.len());
        let mut batch: Vec<JsonRow> = rows[offset.min(rows.len())..end].to_vec();
        if let Some(columns) = &params.columns {
            batch = batch.iter().map(|row| project(row, columns)).collect();
        }
        let has_more = end < rows.len();
        Ok(StreamResult {
            batch,
            has_more,
            next_cursor: has_more.then(|| end.to_string()),
        })
    }

    async fn execute_query(&self, _query: &str) -> Result<Vec<JsonRow>, DatabaseError> {
        Err(err(
            "execute_query",
            ErrorKind::InvalidQuery("memory adapter has no native query language".to_string()),
        ))
    }

    async fn execute_count_query(&self, _query: &str) -> Result<u64, DatabaseError> {
        Err(err(
            "execute_count_query",
            ErrorKind::InvalidQuery("memory adapter has no native query language".to_string()),
        ))
    }

    async fn get_row_count(
        &self,
        table: &TableIdentifier,
        filter: Option<&str>,
    ) -> Result<u64, DatabaseError> {
        if filter.is_some() {
            return Err(err(
                "get_row_count",
                ErrorKind::InvalidQuery("memory adapter does not support row filters".to_string()),
            ));
        }
        Ok(self.rows_of(&table.name, "get_row_count")?.len() as u64)
    }

    async fn wipe(&self) -> Result<(), DatabaseError> {
        let names: Vec<String> = self.database.tables.read().keys().cloned().collect();
        for name in names {
            self.database.truncate_table(&name)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryMetadata {
    database: Arc<MemoryDatabase>,
}

#[async_trait]
impl MetadataOperator for MemoryMetadata {
    async fn version(&self) -> Result<String, DatabaseError> {
        Ok(format!("memory {}", env!("CARGO_PKG_VERSION")))
    }

    async fn instance_identifier(&self) -> Result<String, DatabaseError> {
        Ok(format!(
            "{}:{}",
            self.database.name, self.database.instance_id
        ))
    }

    async fn database_size_bytes(&self) -> Result<u64, DatabaseError> {
        let tables = self.database.tables.read();
        let mut size = 0u64;
        for table in tables.values() {
            for row in &table.rows {
                size += serde_json::to_string(row)
                    .map(|s| s.len() as u64)
                    .unwrap_or(0);
            }
        }
        Ok(size)
    }

    async fn table_count(&self) -> Result<u64, DatabaseError> {
        Ok(self.database.tables.read().len() as u64)
    }

    async fn execute_command(&self, command: &str) -> Result<(), DatabaseError> {
        match command.trim() {
            "reset" => {
                let names: Vec<String> =
                    self.database.tables.read().keys().cloned().collect();
                for name in names {
                    self.database.truncate_table(&name)?;
                }
                Ok(())
            }
            other => Err(err(
                "execute_command",
                ErrorKind::InvalidQuery(format!("unknown admin command `{other}`")),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb_types::models::{Column, SemanticType, SslConfig};
    use redb_types::serde_json::json;

    pub(crate) fn config(database: &str) -> ConnectionConfig {
        ConnectionConfig {
            id: format!("db_{database}"),
            name: database.to_string(),
            connection_type: "memory".to_string(),
            host: "localhost".to_string(),
            port: 0,
            username: String::new(),
            password: String::new(),
            database: database.to_string(),
            schema: None,
            ssl: SslConfig::default(),
            options: Default::default(),
        }
    }

    pub(crate) fn users_model() -> UnifiedModel {
        UnifiedModel {
            tables: vec![Table {
                schema: None,
                name: "users".to_string(),
                columns: vec![
                    Column::new("id", SemanticType::Int32).primary_key(),
                    Column::new("name", SemanticType::Text),
                ],
                indexes: vec![],
                constraints: vec![],
            }],
            ..Default::default()
        }
    }

    pub(crate) fn user(id: i64, name: &str) -> JsonRow {
        [
            ("id".to_string(), json!(id)),
            ("name".to_string(), json!(name)),
        ]
        .into_iter()
        .collect()
    }

    async fn connected() -> Connection {
        let adapter = MemoryAdapter::new();
        let connection = adapter.connect(&config("src")).await.unwrap();
        connection
            .schema()
            .create_structure(&users_model())
            .await
            .unwrap();
        connection
    }

    #[tokio::test]
    async fn connect_reports_adapter_type() {
        let adapter = MemoryAdapter::new();
        let connection = adapter.connect(&config("db")).await.unwrap();
        assert_eq!(connection.database_type(), adapter.database_type());
    }

    #[tokio::test]
    async fn discover_schema_is_idempotent() {
        let connection = connected().await;
        let first = connection.schema().discover_schema().await.unwrap();
        let second = connection.schema().discover_schema().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.tables.len(), 1);
    }

    #[tokio::test]
    async fn crud_round_trip() {
        let connection = connected().await;
        let table = TableIdentifier::new("users");
        let data = connection.data();

        assert_eq!(data.insert(&table, &[user(1, "a"), user(2, "b")]).await.unwrap(), 2);
        assert_eq!(data.get_row_count(&table, None).await.unwrap(), 2);

        let assignments: JsonRow = [("name".to_string(), json!("z"))].into_iter().collect();
        let filter: JsonRow = [("id".to_string(), json!(1))].into_iter().collect();
        assert_eq!(data.update(&table, &assignments, &filter).await.unwrap(), 1);

        let rows = data.fetch(&table, None).await.unwrap();
        assert!(rows.iter().any(|r| r.get("name") == Some(&json!("z"))));

        assert_eq!(data.delete(&table, &filter).await.unwrap(), 1);
        assert_eq!(data.get_row_count(&table, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn upsert_inserts_then_updates() {
        let connection = connected().await;
        let table = TableIdentifier::new("users");
        let keys = vec!["id".to_string()];

        let affected = connection
            .data()
            .upsert(&table, &keys, &[user(1, "a")])
            .await
            .unwrap();
        assert_eq!(affected, 1);

        connection
            .data()
            .upsert(&table, &keys, &[user(1, "a2"), user(2, "b")])
            .await
            .unwrap();
        let rows = connection.data().fetch(&table, None).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.get("name") == Some(&json!("a2"))));
    }

    #[tokio::test]
    async fn stream_is_restartable_from_cursor() {
        let connection = connected().await;
        let table = TableIdentifier::new("users");
        let rows: Vec<JsonRow> = (0..5).map(|i| user(i, &format!("u{i}"))).collect();
        connection.data().insert(&table, &rows).await.unwrap();

        let mut params = StreamParams {
            table: table.clone(),
            columns: None,
            batch_size: 2,
            cursor: None,
        };
        let first = connection.data().stream(&params).await.unwrap();
        assert_eq!(first.batch.len(), 2);
        assert!(first.has_more);

        // Restart from the returned cursor, as a resumed copy would.
        params.cursor = first.next_cursor;
        let second = connection.data().stream(&params).await.unwrap();
        assert_eq!(second.batch.len(), 2);

        params.cursor = second.next_cursor;
        let last = connection.data().stream(&params).await.unwrap();
        assert_eq!(last.batch.len(), 1);
        assert!(!last.has_more);
        assert_eq!(last.next_cursor, None);
    }

    #[tokio::test]
    async fn fetch_from_unknown_table_is_not_found() {
        let connection = connected().await;
        let err = connection
            .data()
            .fetch(&TableIdentifier::new("missing"), None)
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::NotFound(ResourceKind::Table, _)));
    }
}
