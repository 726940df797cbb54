use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::errors::{ResourceKind, StorageError};
use crate::models::{
    CdcStatistics, ConnectionConfig, Mapping, MeshInfo, NodeInfo, Relationship,
};

/// Narrow data-access interface over the external transactional metadata
/// store. The core only requires multi-row transactions from the backing
/// store; each method here is one such transaction.
#[async_trait]
pub trait MetadataStore: Send + Sync + Debug {
    async fn load_node_identity(&self) -> Result<Option<NodeInfo>, StorageError>;
    async fn save_node_identity(&self, node: &NodeInfo) -> Result<(), StorageError>;

    async fn load_mesh(&self) -> Result<Option<MeshInfo>, StorageError>;
    /// `None` purges the local mesh record (leave/wipe).
    async fn save_mesh(&self, mesh: Option<&MeshInfo>) -> Result<(), StorageError>;
    async fn load_peers(&self) -> Result<Vec<NodeInfo>, StorageError>;
    async fn save_peers(&self, peers: &[NodeInfo]) -> Result<(), StorageError>;

    async fn save_connection_config(&self, config: &ConnectionConfig)
        -> Result<(), StorageError>;
    async fn get_connection_config(
        &self,
        id: &str,
    ) -> Result<Option<ConnectionConfig>, StorageError>;
    async fn list_connection_configs(&self) -> Result<Vec<ConnectionConfig>, StorageError>;
    async fn delete_connection_config(&self, id: &str) -> Result<(), StorageError>;

    async fn save_mapping(&self, mapping: &Mapping) -> Result<(), StorageError>;
    async fn get_mapping(&self, id: &str) -> Result<Option<Mapping>, StorageError>;
    async fn get_mapping_by_name(&self, name: &str) -> Result<Option<Mapping>, StorageError>;
    async fn list_mappings(&self) -> Result<Vec<Mapping>, StorageError>;

    async fn save_relationship(&self, relationship: &Relationship) -> Result<(), StorageError>;
    async fn get_relationship(&self, id: &str) -> Result<Option<Relationship>, StorageError>;
    async fn list_relationships(&self) -> Result<Vec<Relationship>, StorageError>;
    async fn delete_relationship(&self, id: &str) -> Result<(), StorageError>;

    /// Durable per-relationship position update; positions are never shared
    /// across relationships.
    async fn save_position(
        &self,
        relationship_id: &str,
        position: &str,
    ) -> Result<(), StorageError>;
    async fn save_statistics(
        &self,
        relationship_id: &str,
        statistics: &CdcStatistics,
    ) -> Result<(), StorageError>;
}

/// In-process implementation backing tests and the single-node runtime.
/// A coarse lock per call stands in for the store's transactions.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    inner: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    node: Option<NodeInfo>,
    mesh: Option<MeshInfo>,
    peers: Vec<NodeInfo>,
    connections: BTreeMap<String, ConnectionConfig>,
    mappings: BTreeMap<String, Mapping>,
    relationships: BTreeMap<String, Relationship>,
    statistics: BTreeMap<String, CdcStatistics>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn load_node_identity(&self) -> Result<Option<NodeInfo>, StorageError> {
        Ok(self.inner.read().node.clone())
    }

    async fn save_node_identity(&self, node: &NodeInfo) -> Result<(), StorageError> {
        self.inner.write().node = Some(node.clone());
        Ok(())
    }

    async fn load_mesh(&self) -> Result<Option<MeshInfo>, StorageError> {
        Ok(self.inner.read().mesh.clone())
    }

    async fn save_mesh(&self, mesh: Option<&MeshInfo>) -> Result<(), StorageError> {
        self.inner.write().mesh = mesh.cloned();
        Ok(())
    }

    async fn load_peers(&self) -> Result<Vec<NodeInfo>, StorageError> {
        Ok(self.inner.read().peers.clone())
    }

    async fn save_peers(&self, peers: &[NodeInfo]) -> Result<(), StorageError> {
        self.inner.write().peers = peers.to_vec();
        Ok(())
    }

    async fn save_connection_config(
        &self,
        config: &ConnectionConfig,
    ) -> Result<(), StorageError> {
        self.inner
            .write()
            .connections
            .insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn get_connection_config(
        &self,
        id: &str,
    ) -> Result<Option<ConnectionConfig>, StorageError> {
        Ok(self.inner.read().connections.get(id).cloned())
    }

    async fn list_connection_configs(&self) -> Result<Vec<ConnectionConfig>, StorageError> {
        Ok(self.inner.read().connections.values().cloned().collect())
    }

    async fn delete_connection_config(&self, id: &str) -> Result<(), StorageError> {
        self.inner.write().connections.remove(id);
        Ok(())
    }

    async fn save_mapping(&self, mapping: &Mapping) -> Result<(), StorageError> {
        self.inner
            .write()
            .mappings
            .insert(mapping.id.clone(), mapping.clone());
        Ok(())
    }

    async fn get_mapping(&self, id: &str) -> Result<Option<Mapping>, StorageError> {
        Ok(self.inner.read().mappings.get(id).cloned())
    }

    async fn get_mapping_by_name(&self, name: &str) -> Result<Option<Mapping>, StorageError> {
        Ok(self
            .inner
            .read()
            .mappings
            .values()
            .find(|m| m.name == name)
            .cloned())
    }

    async fn list_mappings(&self) -> Result<Vec<Mapping>, StorageError> {
        Ok(self.inner.read().mappings.values().cloned().collect())
    }

    async fn save_relationship(&self, relationship: &Relationship) -> Result<(), StorageError> {
        self.inner
            .write()
            .relationships
            .insert(relationship.id.clone(), relationship.clone());
        Ok(())
    }

    async fn get_relationship(&self, id: &str) -> Result<Option<Relationship>, StorageError> {
        Ok(self.inner.read().relationships.get(id).cloned())
    }

    async fn list_relationships(&self) -> Result<Vec<Relationship>, StorageError> {
        Ok(self.inner.read().relationships.values().cloned().collect())
    }

    async fn delete_relationship(&self, id: &str) -> Result<(), StorageError> {
        let mut state = self.inner.write();
        state.relationships.remove(id);
        state.statistics.remove(id);
        Ok(())
    }

    async fn save_position(
        &self,
        relationship_id: &str,
        position: &str,
    ) -> Result<(), StorageError> {
        let mut state = self.inner.write();
        let relationship = state.relationships.get_mut(relationship_id).ok_or_else(|| {
            StorageError::NotFound(ResourceKind::Relationship, relationship_id.to_string())
        })?;
        relationship.saved_position = Some(position.to_string());
        Ok(())
    }

    async fn save_statistics(
        &self,
        relationship_id: &str,
        statistics: &CdcStatistics,
    ) -> Result<(), StorageError> {
        self.inner
            .write()
            .statistics
            .insert(relationship_id.to_string(), statistics.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        RelationshipPhase, RelationshipType, TableEndpoint,
    };
    use chrono::Utc;

    fn relationship(id: &str) -> Relationship {
        Relationship {
            id: id.to_string(),
            mapping_id: "map_1".to_string(),
            relationship_type: RelationshipType::Replication,
            source: TableEndpoint {
                database_id: "db_1".to_string(),
                table: "users".to_string(),
            },
            target: TableEndpoint {
                database_id: "db_2".to_string(),
                table: "users".to_string(),
            },
            phase: RelationshipPhase::Created,
            cdc_status: Default::default(),
            saved_position: None,
            errors: vec![],
            options: Default::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn position_is_per_relationship() {
        let store = MemoryMetadataStore::new();
        store.save_relationship(&relationship("rel_1")).await.unwrap();
        store.save_relationship(&relationship("rel_2")).await.unwrap();

        store.save_position("rel_1", "0/AA").await.unwrap();

        let first = store.get_relationship("rel_1").await.unwrap().unwrap();
        let second = store.get_relationship("rel_2").await.unwrap().unwrap();
        assert_eq!(first.saved_position.as_deref(), Some("0/AA"));
        assert_eq!(second.saved_position, None);
    }

    #[tokio::test]
    async fn save_position_for_missing_relationship_fails() {
        let store = MemoryMetadataStore::new();
        assert!(store.save_position("rel_x", "0/AA").await.is_err());
    }
}
