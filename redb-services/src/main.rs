use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use redb_adapters::transform::TransformationClient;
use redb_adapters::AdapterRegistry;
use redb_engine::RelationshipEngine;
use redb_mesh::{MeshNode, NodeOptions};
use redb_services::{rest, AppState};
use redb_types::log::info;
use redb_types::storage::{MemoryMetadataStore, MetadataStore};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let api_addr = env_or("REDB_API_ADDR", "0.0.0.0:7300");
    let mesh_addr = env_or("REDB_MESH_ADDR", "0.0.0.0:7400")
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}")))?;

    let store: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
    let registry = AdapterRegistry::with_default_adapters();
    let mesh = MeshNode::bootstrap(
        store.clone(),
        NodeOptions {
            name: env_or("REDB_NODE_NAME", "redb-node"),
            listen_addr: mesh_addr,
            region_id: std::env::var("REDB_REGION").ok(),
        },
    )
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    let mut engine = RelationshipEngine::new(registry.clone(), store.clone());
    if let Ok(endpoint) = std::env::var("REDB_TRANSFORM_ENDPOINT") {
        engine =
            engine.with_transform_client(TransformationClient::new(endpoint, Duration::from_secs(5)));
    }
    let state = AppState::new(registry, store, Arc::new(engine), mesh);

    info!("control api listening on {api_addr}");
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(rest::configure)
    })
    .bind(api_addr)?
    .run()
    .await
}
