use std::sync::Arc;

use actix_web::{test, web, App};
use redb_adapters::interface::{DataOperator, SchemaOperator, TableIdentifier};
use redb_adapters::AdapterRegistry;
use redb_engine::RelationshipEngine;
use redb_mesh::{MeshNode, NodeOptions};
use redb_types::models::{
    Column, ConnectionConfig, JsonRow, SemanticType, Table, UnifiedModel,
};
use redb_types::serde_json::{json, Value};
use redb_types::storage::{MemoryMetadataStore, MetadataStore};

use crate::rest;
use crate::state::AppState;

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

async fn test_state() -> AppState {
    let registry = AdapterRegistry::with_default_adapters();
    let store: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
    let mesh = MeshNode::bootstrap(
        store.clone(),
        NodeOptions {
            name: "test-node".to_string(),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            region_id: None,
        },
    )
    .await
    .unwrap();
    let engine = Arc::new(RelationshipEngine::new(registry.clone(), store.clone()));
    AppState::new(registry, store, engine, mesh)
}

#[actix_web::test]
async fn database_and_mapping_round_trip() {
    let state = test_state().await;
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(rest::configure),
    )
    .await;

    // Register a database connection.
    let request = test::TestRequest::post()
        .uri("/v1/databases/connect")
        .set_json(memory_config("db_src", "src"))
        .to_request();
    let response: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(response["id"], json!("db_src"));
    assert_eq!(response["database_type"], json!("memory"));
    assert_eq!(response["capabilities"]["replication"], json!(true));

    let request = test::TestRequest::get().uri("/v1/databases").to_request();
    let databases: Vec<Value> = test::call_and_read_body_json(&app, request).await;
    assert_eq!(databases.len(), 1);
    // Credentials never serialize back out.
    assert!(databases[0].get("password").is_none());

    // Table-scope mapping from column URIs.
    let request = test::TestRequest::post()
        .uri("/v1/mappings")
        .set_json(json!({
            "scope": "table",
            "source": "redb:/data/database/db_src/table/users/column/name",
            "target": "redb:/data/database/db_tgt/table/users/column/name",
            "name": "users",
        }))
        .to_request();
    let mapping: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(mapping["mapping_type"], json!("table_to_table"));
    assert_eq!(mapping["source"]["database_id"], json!("db_src"));

    // Malformed URIs are invalid queries.
    let request = test::TestRequest::post()
        .uri("/v1/mappings")
        .set_json(json!({
            "scope": "table",
            "source": "redb:/data/database/db_src/table/users",
            "target": "redb:/data/database/db_tgt/table/users/column/name",
        }))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 400);

    let request = test::TestRequest::get().uri("/v1/mappings/users").to_request();
    let shown: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(shown["name"], json!("users"));
}

#[actix_web::test]
async fn start_relationship_streams_progress() {
    let state = test_state().await;

    // Seed both databases out of band, as a deployment pipeline would.
    let source = state
        .registry
        .connect(&memory_config("db_src", "src"))
        .await
        .unwrap();
    source.schema().create_structure(&users_model()).await.unwrap();
    let rows: Vec<JsonRow> = vec![
        [("id".to_string(), json!(1)), ("name".to_string(), json!("a"))]
            .into_iter()
            .collect(),
        [("id".to_string(), json!(2)), ("name".to_string(), json!("b"))]
            .into_iter()
            .collect(),
    ];
    source
        .data()
        .insert(&TableIdentifier::new("users"), &rows)
        .await
        .unwrap();
    let target = state
        .registry
        .connect(&memory_config("db_tgt", "tgt"))
        .await
        .unwrap();
    target.schema().create_structure(&users_model()).await.unwrap();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(rest::configure),
    )
    .await;

    for config in [memory_config("db_src", "src"), memory_config("db_tgt", "tgt")] {
        let request = test::TestRequest::post()
            .uri("/v1/databases/connect")
            .set_json(config)
            .to_request();
        assert!(test::call_service(&app, request).await.status().is_success());
    }

    let request = test::TestRequest::post()
        .uri("/v1/mappings")
        .set_json(json!({
            "scope": "table",
            "source": "redb:/data/database/db_src/table/users/column/name",
            "target": "redb:/data/database/db_tgt/table/users/column/name",
            "name": "users",
        }))
        .to_request();
    assert!(test::call_service(&app, request).await.status().is_success());

    let request = test::TestRequest::post()
        .uri("/v1/relationships")
        .set_json(json!({"mapping_name": "users"}))
        .to_request();
    let relationship: Value = test::call_and_read_body_json(&app, request).await;
    let id = relationship["id"].as_str().unwrap().to_string();
    assert_eq!(relationship["phase"], json!("created"));

    // The progress stream is line-delimited JSON ending in an active record.
    let request = test::TestRequest::post()
        .uri(&format!("/v1/relationships/{id}/start"))
        .set_json(json!({"batch_size": 2, "parallel_workers": 1}))
        .to_request();
    let body = test::call_and_read_body(&app, request).await;
    let lines: Vec<Value> = std::str::from_utf8(&body)
        .unwrap()
        .lines()
        .map(|line| redb_types::serde_json::from_str(line).unwrap())
        .collect();
    assert!(!lines.is_empty());
    assert_eq!(lines.last().unwrap()["phase"], json!("active"));
    assert!(lines.iter().any(|l| l["phase"] == json!("initial_copy")));

    let copied = target
        .data()
        .get_row_count(&TableIdentifier::new("users"), None)
        .await
        .unwrap();
    assert_eq!(copied, 2);

    let request = test::TestRequest::post()
        .uri(&format!("/v1/relationships/{id}/stop"))
        .to_request();
    let stopped: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(stopped["phase"], json!("paused"));

    let request = test::TestRequest::get().uri("/v1/relationships").to_request();
    let listed: Vec<Value> = test::call_and_read_body_json(&app, request).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["phase"], json!("paused"));
}

#[actix_web::test]
async fn mesh_endpoints_expose_node_state() {
    let state = test_state().await;
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(rest::configure),
    )
    .await;

    // No mesh yet.
    let request = test::TestRequest::get().uri("/v1/mesh").to_request();
    assert_eq!(test::call_service(&app, request).await.status(), 404);

    let request = test::TestRequest::get().uri("/v1/node/status").to_request();
    let status: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(status["status"], json!("clean"));

    let request = test::TestRequest::post()
        .uri("/v1/mesh/seed")
        .set_json(json!({"name": "m"}))
        .to_request();
    let mesh: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(mesh["node_count"], json!(1));

    let request = test::TestRequest::get().uri("/v1/mesh").to_request();
    let shown: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(shown["name"], json!("m"));

    let request = test::TestRequest::get().uri("/v1/nodes").to_request();
    let nodes: Vec<Value> = test::call_and_read_body_json(&app, request).await;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["status"], json!("active"));
}
