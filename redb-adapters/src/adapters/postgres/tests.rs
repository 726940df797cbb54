//! Live-database tests. They need a local Postgres with `wal_level=logical`
//! and are ignored by default; run with
//! `cargo test -p redb-adapters postgres:: -- --ignored`.

use redb_types::models::{Column, ConnectionConfig, SemanticType, SslConfig, Table, UnifiedModel};
use redb_types::serde_json::json;
use serial_test::serial;
use tokio::sync::mpsc;

use crate::interface::{
    DatabaseAdapter, DataOperator, ReplicationConfig, ReplicationOperator, SchemaOperator,
    TableIdentifier,
};

use super::PostgresAdapter;

fn load_test_connection_config() -> ConnectionConfig {
    let env = |key: &str, default: &str| std::env::var(key).unwrap_or_else(|_| default.to_string());
    ConnectionConfig {
        id: "pg_test".to_string(),
        name: "pg_test".to_string(),
        connection_type: "postgres".to_string(),
        host: env("REDB_TEST_PG_HOST", "localhost"),
        port: env("REDB_TEST_PG_PORT", "5432").parse().unwrap(),
        username: env("REDB_TEST_PG_USER", "postgres"),
        password: env("REDB_TEST_PG_PASSWORD", "postgres"),
        database: env("REDB_TEST_PG_DATABASE", "redb_test"),
        schema: None,
        ssl: SslConfig::default(),
        options: Default::default(),
    }
}

fn test_table(name: &str) -> Table {
    Table {
        schema: Some("public".to_string()),
        name: name.to_string(),
        columns: vec![
            Column::new("id", SemanticType::Int32).primary_key(),
            Column::new("name", SemanticType::Text),
        ],
        indexes: vec![],
        constraints: vec![],
    }
}

#[tokio::test]
#[ignore]
#[serial]
async fn discover_schema_is_idempotent_against_live_database() {
    let config = load_test_connection_config();
    let connection = PostgresAdapter.connect(&config).await.unwrap();
    connection
        .schema()
        .create_structure(&UnifiedModel {
            tables: vec![test_table("discover_test")],
            ..Default::default()
        })
        .await
        .unwrap();

    let first = connection.schema().discover_schema().await.unwrap();
    let second = connection.schema().discover_schema().await.unwrap();
    assert_eq!(first, second);
    assert!(first.table("discover_test").is_some());
}

#[tokio::test]
#[ignore]
#[serial]
async fn crud_round_trip_against_live_database() {
    let config = load_test_connection_config();
    let connection = PostgresAdapter.connect(&config).await.unwrap();
    let table = TableIdentifier::with_schema("public", "crud_test");
    connection
        .schema()
        .create_structure(&UnifiedModel {
            tables: vec![test_table("crud_test")],
            ..Default::default()
        })
        .await
        .unwrap();
    connection
        .data()
        .delete(&table, &Default::default())
        .await
        .unwrap();

    let rows = vec![
        [("id".to_string(), json!(1)), ("name".to_string(), json!("a"))]
            .into_iter()
            .collect(),
        [("id".to_string(), json!(2)), ("name".to_string(), json!("b"))]
            .into_iter()
            .collect(),
    ];
    assert_eq!(connection.data().insert(&table, &rows).await.unwrap(), 2);
    assert_eq!(
        connection.data().get_row_count(&table, None).await.unwrap(),
        2
    );

    let fetched = connection.data().fetch(&table, None).await.unwrap();
    assert_eq!(fetched.len(), 2);
}

#[tokio::test]
#[ignore]
#[serial]
async fn replication_continues_from_saved_position() {
    let config = load_test_connection_config();
    let connection = PostgresAdapter.connect(&config).await.unwrap();
    let replication = connection.replication();
    replication.check_prerequisites().await.unwrap();

    let table = TableIdentifier::with_schema("public", "cdc_test");
    connection
        .schema()
        .create_structure(&UnifiedModel {
            tables: vec![test_table("cdc_test")],
            ..Default::default()
        })
        .await
        .unwrap();

    let slot = format!("redb_test_slot_{}", rand::random::<u32>());
    let mut replication_config = ReplicationConfig::new("rel_test", &slot);
    replication_config.start_position = Some(replication.current_position().await.unwrap());
    let source = replication.connect(&replication_config).await.unwrap();

    let (tx, mut rx) = mpsc::channel(64);
    let producer = {
        let source = source.clone();
        tokio::spawn(async move { source.start(tx).await })
    };

    let row = [("id".to_string(), json!(10)), ("name".to_string(), json!("x"))]
        .into_iter()
        .collect();
    connection.data().insert(&table, &[row]).await.unwrap();

    let raw = tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv())
        .await
        .expect("no change arrived in time")
        .unwrap();
    let event = replication.parse_event(&raw).unwrap();
    assert_eq!(event.table_name, "cdc_test");
    event.validate().unwrap();

    source.stop().await.unwrap();
    producer.await.unwrap().unwrap();
    replication.drop_slot(&slot).await.unwrap();
}
