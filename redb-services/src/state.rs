use std::sync::Arc;

use async_trait::async_trait;
use redb_adapters::interface::ReplicationOperator;
use redb_adapters::AdapterRegistry;
use redb_engine::RelationshipEngine;
use redb_mesh::{CdcEventHandler, MeshNode, MeshRouter};
use redb_types::errors::{DatabaseError, ErrorKind, ResourceKind};
use redb_types::models::CdcEvent;
use redb_types::storage::MetadataStore;

/// Shared service state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AdapterRegistry>,
    pub store: Arc<dyn MetadataStore>,
    pub engine: Arc<RelationshipEngine>,
    pub mesh: Arc<MeshNode>,
}

impl AppState {
    /// Wires the three subsystems together: the engine routes remote
    /// targets through the mesh, and CDC events arriving over the mesh are
    /// applied through the local adapter connections.
    pub fn new(
        registry: Arc<AdapterRegistry>,
        store: Arc<dyn MetadataStore>,
        engine: Arc<RelationshipEngine>,
        mesh: Arc<MeshNode>,
    ) -> Self {
        let router = Arc::new(MeshRouter::new(mesh.clone()));
        engine.set_mesh_router(router, mesh.node_id());
        mesh.set_cdc_handler(Arc::new(LocalApplyHandler {
            registry: registry.clone(),
            store: store.clone(),
        }));
        Self {
            registry,
            store,
            engine,
            mesh,
        }
    }
}

/// Applies mesh-routed CDC events against the database they target.
#[derive(Debug)]
struct LocalApplyHandler {
    registry: Arc<AdapterRegistry>,
    store: Arc<dyn MetadataStore>,
}

#[async_trait]
impl CdcEventHandler for LocalApplyHandler {
    async fn apply(&self, event: CdcEvent) -> Result<(), DatabaseError> {
        let database_id = event
            .metadata
            .get("target_database")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                DatabaseError::new(
                    "mesh",
                    "apply",
                    ErrorKind::InvalidQuery(
                        "routed event carries no target database".to_string(),
                    ),
                )
            })?;
        let config = self
            .store
            .get_connection_config(database_id)
            .await
            .map_err(|e| {
                DatabaseError::new("mesh", "apply", ErrorKind::TransactionFailed(Box::new(e)))
            })?
            .ok_or_else(|| {
                DatabaseError::new(
                    "mesh",
                    "apply",
                    ErrorKind::NotFound(ResourceKind::Database, database_id.to_string()),
                )
            })?;
        let connection = self.registry.connect(&config).await?;
        connection.replication().apply_cdc_event(&event).await
    }
}
