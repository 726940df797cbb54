use std::cmp::Ordering;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redb_types::errors::DatabaseError;
use redb_types::models::{
    CdcEvent, ConnectionConfig, DatabaseType, InstanceConfig, JsonRow, Table,
    TransformationRule, UnifiedModel,
};
use redb_types::serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::capabilities::{capabilities_for, Capabilities};
use crate::transform::{self, TransformationClient};

pub mod unsupported;

/// A table name, optionally qualified with a schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(crate = "redb_types::serde")]
pub struct TableIdentifier {
    #[serde(default)]
    pub schema: Option<String>,
    pub name: String,
}

impl TableIdentifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    pub fn with_schema(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }
}

impl Display for TableIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Static per-technology handler able to open connections.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync + Debug {
    fn database_type(&self) -> DatabaseType;

    fn capabilities(&self) -> Capabilities {
        capabilities_for(self.database_type())
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Connection, DatabaseError>;

    /// Server-level connection for list/create/drop database operations.
    async fn connect_instance(
        &self,
        config: &InstanceConfig,
    ) -> Result<InstanceConnection, DatabaseError>;
}

/// An active session against one logical database: the connection config plus
/// the four capability-group operators. Groups the adapter does not support
/// are null objects answering `OperationNotSupported`.
#[derive(Debug, Clone)]
pub struct Connection {
    database_type: DatabaseType,
    config: ConnectionConfig,
    schema: Arc<dyn SchemaOperator>,
    data: Arc<dyn DataOperator>,
    replication: Arc<dyn ReplicationOperator>,
    metadata: Arc<dyn MetadataOperator>,
}

impl Connection {
    pub fn new(
        database_type: DatabaseType,
        config: ConnectionConfig,
        schema: Arc<dyn SchemaOperator>,
        data: Arc<dyn DataOperator>,
        replication: Arc<dyn ReplicationOperator>,
        metadata: Arc<dyn MetadataOperator>,
    ) -> Self {
        Self {
            database_type,
            config,
            schema,
            data,
            replication,
            metadata,
        }
    }

    pub fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn schema(&self) -> &Arc<dyn SchemaOperator> {
        &self.schema
    }

    pub fn data(&self) -> &Arc<dyn DataOperator> {
        &self.data
    }

    pub fn replication(&self) -> &Arc<dyn ReplicationOperator> {
        &self.replication
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataOperator> {
        &self.metadata
    }
}

/// Server-level session used for database management.
#[derive(Debug, Clone)]
pub struct InstanceConnection {
    pub database_type: DatabaseType,
    pub config: InstanceConfig,
    pub instance: Arc<dyn InstanceOperator>,
}

#[async_trait]
pub trait InstanceOperator: Send + Sync + Debug {
    async fn list_databases(&self) -> Result<Vec<String>, DatabaseError>;
    async fn create_database(&self, name: &str) -> Result<(), DatabaseError>;
    async fn drop_database(&self, name: &str) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait SchemaOperator: Send + Sync + Debug {
    fn is_supported(&self) -> bool {
        true
    }

    /// Normalizes the live schema into a [`UnifiedModel`]. Idempotent: two
    /// calls against an unchanged database yield equal models, with every
    /// collection sorted by name.
    async fn discover_schema(&self) -> Result<UnifiedModel, DatabaseError>;

    /// Materializes the model's tables (and supporting objects) in this
    /// database. Existing objects are left alone.
    async fn create_structure(&self, model: &UnifiedModel) -> Result<(), DatabaseError>;

    async fn list_tables(&self) -> Result<Vec<TableIdentifier>, DatabaseError>;

    async fn get_table_schema(&self, table: &TableIdentifier) -> Result<Table, DatabaseError>;
}

/// Parameters for one bounded batch of a restartable table scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub table: TableIdentifier,
    pub columns: Option<Vec<String>>,
    pub batch_size: usize,
    /// Opaque cursor from the previous batch; `None` starts from the top.
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamResult {
    pub batch: Vec<JsonRow>,
    pub has_more: bool,
    /// Final when `has_more` is false.
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait DataOperator: Send + Sync + Debug {
    fn is_supported(&self) -> bool {
        true
    }

    async fn fetch(
        &self,
        table: &TableIdentifier,
        limit: Option<usize>,
    ) -> Result<Vec<JsonRow>, DatabaseError>;

    async fn fetch_with_columns(
        &self,
        table: &TableIdentifier,
        columns: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<JsonRow>, DatabaseError>;

    /// Returns the number of rows written.
    async fn insert(&self, table: &TableIdentifier, rows: &[JsonRow])
        -> Result<u64, DatabaseError>;

    async fn update(
        &self,
        table: &TableIdentifier,
        assignments: &JsonRow,
        filter: &JsonRow,
    ) -> Result<u64, DatabaseError>;

    async fn upsert(
        &self,
        table: &TableIdentifier,
        key_columns: &[String],
        rows: &[JsonRow],
    ) -> Result<u64, DatabaseError>;

    async fn delete(&self, table: &TableIdentifier, filter: &JsonRow)
        -> Result<u64, DatabaseError>;

    /// One bounded batch of a restartable scan; resume with `next_cursor`.
    async fn stream(&self, params: &StreamParams) -> Result<StreamResult, DatabaseError>;

    /// Runs a query in the adapter's native language.
    async fn execute_query(&self, query: &str) -> Result<Vec<JsonRow>, DatabaseError>;

    async fn execute_count_query(&self, query: &str) -> Result<u64, DatabaseError>;

    async fn get_row_count(
        &self,
        table: &TableIdentifier,
        filter: Option<&str>,
    ) -> Result<u64, DatabaseError>;

    /// Deletes every row of every table.
    async fn wipe(&self) -> Result<(), DatabaseError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(crate = "redb_types::serde", rename_all = "snake_case")]
pub enum ReplicationMechanism {
    WalLogical,
    Binlog,
    EventLog,
}

/// Configuration for opening one CDC feed.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub relationship_id: String,
    pub slot_name: String,
    pub publication: Option<String>,
    pub tables: Vec<TableIdentifier>,
    /// Resume point; `None` starts from the current position.
    pub start_position: Option<String>,
    pub poll_interval: Duration,
}

impl ReplicationConfig {
    pub fn new(relationship_id: impl Into<String>, slot_name: impl Into<String>) -> Self {
        Self {
            relationship_id: relationship_id.into(),
            slot_name: slot_name.into(),
            publication: None,
            tables: vec![],
            start_position: None,
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(crate = "redb_types::serde")]
pub struct ReplicationSlot {
    pub name: String,
    #[serde(default)]
    pub plugin: Option<String>,
    pub active: bool,
    #[serde(default)]
    pub position: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(crate = "redb_types::serde")]
pub struct Publication {
    pub name: String,
    #[serde(default)]
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(crate = "redb_types::serde")]
pub struct ReplicationStatus {
    pub active: bool,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub lag_bytes: Option<u64>,
}

/// A vendor-specific change record before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub payload: redb_types::serde_json::Value,
    pub position: Option<String>,
}

#[async_trait]
pub trait ReplicationOperator: Send + Sync + Debug {
    fn database_type(&self) -> DatabaseType;

    fn is_supported(&self) -> bool;

    fn supported_mechanisms(&self) -> Vec<ReplicationMechanism>;

    /// Verifies required server settings (logical WAL, binlog format, ...)
    /// before a feed is opened.
    async fn check_prerequisites(&self) -> Result<(), DatabaseError>;

    /// The position a feed opened right now would start from; captured as
    /// the snapshot point before an initial copy.
    async fn current_position(&self) -> Result<String, DatabaseError>;

    async fn connect(
        &self,
        config: &ReplicationConfig,
    ) -> Result<Arc<dyn ReplicationSource>, DatabaseError>;

    /// Normalizes one vendor event into the universal model. Malformed input
    /// is an `InvalidQuery`.
    fn parse_event(&self, raw: &RawEvent) -> Result<CdcEvent, DatabaseError>;

    /// Applies one universal event through this adapter's native write path.
    /// Unless the store deduplicates by transaction id, delivery is
    /// at-least-once and relies on upstream checkpointing.
    async fn apply_cdc_event(&self, event: &CdcEvent) -> Result<(), DatabaseError>;

    /// Applies the ordered field rules to `data`. Only `function` and
    /// `expression` rules consult the external transformation service.
    async fn transform_data(
        &self,
        data: JsonRow,
        rules: &[TransformationRule],
        client: Option<&TransformationClient>,
    ) -> Result<JsonRow, DatabaseError> {
        transform::apply_rules(data, rules, client)
            .await
            .map_err(|kind| {
                DatabaseError::new(self.database_type().as_str(), "transform_data", kind)
            })
    }

    async fn list_slots(&self) -> Result<Vec<ReplicationSlot>, DatabaseError>;

    async fn drop_slot(&self, name: &str) -> Result<(), DatabaseError>;

    async fn list_publications(&self) -> Result<Vec<Publication>, DatabaseError>;

    async fn drop_publication(&self, name: &str) -> Result<(), DatabaseError>;

    async fn replication_status(
        &self,
        slot_name: &str,
    ) -> Result<ReplicationStatus, DatabaseError>;

    /// Total order over this adapter's position strings, when one is
    /// defined. `None` for foreign or malformed positions.
    fn compare_positions(&self, left: &str, right: &str) -> Option<Ordering>;
}

/// A live handle to the source side of a CDC feed.
///
/// `start`, `stop` and `close` are idempotent with respect to repeated calls
/// after completion. The position string is opaque to callers and stable for
/// a given adapter.
#[async_trait]
pub trait ReplicationSource: Send + Sync + Debug {
    /// Produces raw events into `sender` until stopped or the channel
    /// closes. The bounded channel is the pipeline's back-pressure window.
    async fn start(&self, sender: mpsc::Sender<RawEvent>) -> Result<(), DatabaseError>;

    async fn stop(&self) -> Result<(), DatabaseError>;

    async fn close(&self) -> Result<(), DatabaseError>;

    fn get_position(&self) -> Option<String>;

    fn set_position(&self, position: &str);

    /// Durably persists `position`; a later resume must produce events
    /// strictly after it.
    async fn save_checkpoint(&self, position: &str) -> Result<(), DatabaseError>;

    /// True exactly while events are being produced.
    fn is_active(&self) -> bool;
}

#[async_trait]
pub trait MetadataOperator: Send + Sync + Debug {
    fn is_supported(&self) -> bool {
        true
    }

    async fn version(&self) -> Result<String, DatabaseError>;

    /// Stable unique identifier of the database instance.
    async fn instance_identifier(&self) -> Result<String, DatabaseError>;

    async fn database_size_bytes(&self) -> Result<u64, DatabaseError>;

    async fn table_count(&self) -> Result<u64, DatabaseError>;

    /// Runs an administrative command in the adapter's native language.
    async fn execute_command(&self, command: &str) -> Result<(), DatabaseError>;
}
