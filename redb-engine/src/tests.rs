use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use redb_adapters::adapters::memory::MemoryAdapter;
use redb_adapters::interface::unsupported::UnsupportedReplication;
use redb_adapters::interface::{
    Connection, DatabaseAdapter, DataOperator, InstanceConnection, ReplicationOperator,
    SchemaOperator, TableIdentifier,
};
use redb_adapters::AdapterRegistry;
use redb_types::async_trait::async_trait;
use redb_types::errors::DatabaseError;
use redb_types::models::{
    CdcEvent, Column, ConnectionConfig, DatabaseType, InstanceConfig, JsonRow, Mapping,
    MappingEndpoint, MappingType, RelationshipPhase, RelationshipType, SemanticType, Table,
    TransformationRule, TransformationType, UnifiedModel,
};
use redb_types::parking_lot::Mutex;
use redb_types::serde_json::json;
use redb_types::storage::{MemoryMetadataStore, MetadataStore};
use tokio_stream::StreamExt;

use crate::pipeline::CdcEventRouter;
use crate::relationship::{ProgressEvent, RelationshipEngine};

fn memory_config(id: &str, database: &str) -> ConnectionConfig {
    ConnectionConfig {
        id: id.to_string(),
        name: database.to_string(),
        connection_type: "memory".to_string(),
        host: "localhost".to_string(),
        port: 0,
        username: String::new(),
        password: String::new(),
        database: database.to_string(),
        schema: None,
        ssl: Default::default(),
        options: Default::default(),
    }
}

fn users_model() -> UnifiedModel {
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

fn user(id: i64, name: &str) -> JsonRow {
    [
        ("id".to_string(), json!(id)),
        ("name".to_string(), json!(name)),
    ]
    .into_iter()
    .collect()
}

fn users_mapping(rules: Vec<TransformationRule>) -> Mapping {
    Mapping {
        id: "map_users".to_string(),
        name: "users".to_string(),
        description: None,
        mapping_type: MappingType::TableToTable,
        source: MappingEndpoint::Table {
            database_id: "db_src".to_string(),
            table: "users".to_string(),
        },
        target: MappingEndpoint::Table {
            database_id: "db_tgt".to_string(),
            table: "users".to_string(),
        },
        rules,
        version: 1,
        policy_id: None,
    }
}

struct TestContext {
    engine: RelationshipEngine,
    store: Arc<MemoryMetadataStore>,
    source: Connection,
    target: Connection,
}

async fn setup(rules: Vec<TransformationRule>) -> TestContext {
    let registry = Arc::new(AdapterRegistry::new());
    registry.register(Arc::new(MemoryAdapter::new()));

    let store = Arc::new(MemoryMetadataStore::new());
    let source_config = memory_config("db_src", "src");
    let target_config = memory_config("db_tgt", "tgt");
    store.save_connection_config(&source_config).await.unwrap();
    store.save_connection_config(&target_config).await.unwrap();
    store.save_mapping(&users_mapping(rules)).await.unwrap();

    let source = registry.connect(&source_config).await.unwrap();
    source.schema().create_structure(&users_model()).await.unwrap();
    let target = registry.connect(&target_config).await.unwrap();
    target.schema().create_structure(&users_model()).await.unwrap();

    let store_handle: Arc<dyn MetadataStore> = store.clone();
    TestContext {
        engine: RelationshipEngine::new(registry, store_handle),
        store,
        source,
        target,
    }
}

async fn drain(stream: tokio_stream::wrappers::ReceiverStream<ProgressEvent>) -> Vec<ProgressEvent> {
    let collected: Vec<ProgressEvent> = stream.collect().await;
    collected
}

async fn wait_for_rows(connection: &Connection, expected: u64) {
    let table = TableIdentifier::new("users");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let count = connection.data().get_row_count(&table, None).await.unwrap();
        if count == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "target still has {count} rows, expected {expected}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn replication_happy_path() {
    let ctx = setup(vec![]).await;
    let table = TableIdentifier::new("users");
    ctx.source
        .data()
        .insert(&table, &[user(1, "a"), user(2, "b")])
        .await
        .unwrap();

    let relationship = ctx
        .engine
        .add_relationship("users", RelationshipType::Replication)
        .await
        .unwrap();
    let events = drain(
        ctx.engine
            .start(&relationship.id, Some(2), Some(1))
            .await
            .unwrap(),
    )
    .await;

    assert!(events
        .iter()
        .any(|e| e.phase == RelationshipPhase::InitialCopy));
    assert_eq!(
        events.last().unwrap().phase,
        RelationshipPhase::Active,
        "{events:?}"
    );

    // The initial copy moved the snapshot.
    wait_for_rows(&ctx.target, 2).await;

    // Steady-state CDC picks up a new row.
    ctx.source.data().insert(&table, &[user(3, "c")]).await.unwrap();
    wait_for_rows(&ctx.target, 3).await;

    let rows = ctx.target.data().fetch(&table, None).await.unwrap();
    assert!(rows.iter().any(|r| r.get("name") == Some(&json!("c"))));

    ctx.engine.remove(&relationship.id, false).await.unwrap();
    assert!(ctx
        .store
        .get_relationship(&relationship.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn pause_holds_back_changes_and_resume_catches_up() {
    let ctx = setup(vec![]).await;
    let table = TableIdentifier::new("users");
    ctx.source
        .data()
        .insert(&table, &[user(1, "a"), user(2, "b")])
        .await
        .unwrap();

    let relationship = ctx
        .engine
        .add_relationship("users", RelationshipType::Replication)
        .await
        .unwrap();
    drain(ctx.engine.start(&relationship.id, Some(2), Some(1)).await.unwrap()).await;

    ctx.source.data().insert(&table, &[user(3, "c")]).await.unwrap();
    wait_for_rows(&ctx.target, 3).await;

    ctx.engine.pause(&relationship.id).await.unwrap();
    let paused = ctx
        .store
        .get_relationship(&relationship.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paused.phase, RelationshipPhase::Paused);
    let position_at_pause = paused.saved_position.clone().expect("position checkpointed");

    // Changes made while paused stay at the source.
    ctx.source.data().insert(&table, &[user(4, "d")]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    wait_for_rows(&ctx.target, 3).await;

    drain(ctx.engine.resume(&relationship.id, true).await.unwrap()).await;
    wait_for_rows(&ctx.target, 4).await;
    let rows = ctx.target.data().fetch(&table, None).await.unwrap();
    assert!(rows.iter().any(|r| r.get("id") == Some(&json!(4))));

    // No double consumption: exactly one row with id 4.
    assert_eq!(
        rows.iter().filter(|r| r.get("id") == Some(&json!(4))).count(),
        1
    );

    // The persisted position only moves forward across transitions.
    ctx.engine.pause(&relationship.id).await.unwrap();
    let position_after_resume = ctx
        .store
        .get_relationship(&relationship.id)
        .await
        .unwrap()
        .unwrap()
        .saved_position
        .unwrap();
    let order = ctx
        .source
        .replication()
        .compare_positions(&position_at_pause, &position_after_resume)
        .expect("memory positions are totally ordered");
    assert_ne!(order, Ordering::Greater);
}

#[tokio::test]
async fn transformation_rules_apply_during_copy_and_cdc() {
    let rule = TransformationRule::unary(TransformationType::Uppercase, "name", "name");
    let ctx = setup(vec![rule]).await;
    let table = TableIdentifier::new("users");
    ctx.source.data().insert(&table, &[user(5, "eve")]).await.unwrap();

    let relationship = ctx
        .engine
        .add_relationship("users", RelationshipType::Replication)
        .await
        .unwrap();
    drain(ctx.engine.start(&relationship.id, None, None).await.unwrap()).await;
    wait_for_rows(&ctx.target, 1).await;

    let rows = ctx.target.data().fetch(&table, None).await.unwrap();
    assert_eq!(rows[0].get("name"), Some(&json!("EVE")));

    ctx.source.data().insert(&table, &[user(6, "bob")]).await.unwrap();
    wait_for_rows(&ctx.target, 2).await;
    let rows = ctx.target.data().fetch(&table, None).await.unwrap();
    assert!(rows.iter().any(|r| r.get("name") == Some(&json!("BOB"))));
}

/// Memory-backed adapter that advertises itself as a technology without
/// replication support.
#[derive(Debug)]
struct NoReplicationAdapter {
    inner: MemoryAdapter,
}

#[async_trait]
impl DatabaseAdapter for NoReplicationAdapter {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Mysql
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Connection, DatabaseError> {
        let backing = self.inner.connect(config).await?;
        Ok(Connection::new(
            DatabaseType::Mysql,
            config.clone(),
            backing.schema().clone(),
            backing.data().clone(),
            Arc::new(UnsupportedReplication(DatabaseType::Mysql)),
            backing.metadata().clone(),
        ))
    }

    async fn connect_instance(
        &self,
        config: &InstanceConfig,
    ) -> Result<InstanceConnection, DatabaseError> {
        self.inner.connect_instance(config).await
    }
}

#[tokio::test]
async fn start_without_replication_support_is_rejected() {
    let registry = Arc::new(AdapterRegistry::new());
    registry.register(Arc::new(MemoryAdapter::new()));
    registry.register(Arc::new(NoReplicationAdapter {
        inner: MemoryAdapter::new(),
    }));

    let store = Arc::new(MemoryMetadataStore::new());
    let mut source_config = memory_config("db_src", "src");
    source_config.connection_type = "mysql".to_string();
    let target_config = memory_config("db_tgt", "tgt");
    store.save_connection_config(&source_config).await.unwrap();
    store.save_connection_config(&target_config).await.unwrap();
    store.save_mapping(&users_mapping(vec![])).await.unwrap();

    let source = registry.connect(&source_config).await.unwrap();
    source.schema().create_structure(&users_model()).await.unwrap();
    let target = registry.connect(&target_config).await.unwrap();
    target.schema().create_structure(&users_model()).await.unwrap();

    let store_handle: Arc<dyn MetadataStore> = store;
    let engine = RelationshipEngine::new(registry, store_handle);
    let relationship = engine
        .add_relationship("users", RelationshipType::Replication)
        .await
        .unwrap();

    let events = drain(engine.start(&relationship.id, None, None).await.unwrap()).await;
    let terminal = events.last().unwrap();
    assert_eq!(terminal.phase, RelationshipPhase::Error);
    assert_eq!(terminal.error.as_deref(), Some("operation_not_supported"));
    assert!(
        terminal.errors[0].contains("mysql") && terminal.errors[0].contains("replication.start"),
        "{terminal:?}"
    );
}

#[tokio::test]
async fn migration_relationships_are_rejected_at_creation() {
    let ctx = setup(vec![]).await;
    let err = ctx
        .engine
        .add_relationship("users", RelationshipType::Migration)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not supported"));
}

#[derive(Debug, Default)]
struct CaptureRouter {
    events: Mutex<Vec<CdcEvent>>,
}

#[async_trait]
impl CdcEventRouter for CaptureRouter {
    async fn route(&self, event: CdcEvent) -> Result<(), DatabaseError> {
        self.events.lock().push(event);
        Ok(())
    }
}

#[tokio::test]
async fn remote_targets_route_through_the_mesh() {
    let registry = Arc::new(AdapterRegistry::new());
    registry.register(Arc::new(MemoryAdapter::new()));

    let store = Arc::new(MemoryMetadataStore::new());
    let source_config = memory_config("db_src", "src");
    let mut target_config = memory_config("db_tgt", "tgt");
    target_config
        .options
        .insert("anchor_node".to_string(), "9".to_string());
    store.save_connection_config(&source_config).await.unwrap();
    store.save_connection_config(&target_config).await.unwrap();
    store.save_mapping(&users_mapping(vec![])).await.unwrap();

    let source = registry.connect(&source_config).await.unwrap();
    source.schema().create_structure(&users_model()).await.unwrap();
    let target = registry.connect(&target_config).await.unwrap();
    target.schema().create_structure(&users_model()).await.unwrap();

    let store_handle: Arc<dyn MetadataStore> = store;
    let engine = RelationshipEngine::new(registry, store_handle);
    let router = Arc::new(CaptureRouter::default());
    engine.set_mesh_router(router.clone(), 1);

    let relationship = engine
        .add_relationship("users", RelationshipType::Replication)
        .await
        .unwrap();
    drain(engine.start(&relationship.id, None, None).await.unwrap()).await;

    let table = TableIdentifier::new("users");
    source.data().insert(&table, &[user(7, "g")]).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let routed = router.events.lock().clone();
        if let Some(event) = routed.first() {
            assert_eq!(event.source_node, Some(1));
            assert_eq!(event.target_node, Some(9));
            assert_eq!(event.table_name, "users");
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no event was routed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    engine.remove(&relationship.id, true).await.unwrap();
}
