//! The membership view: a copy-on-write snapshot for lock-free reads, with
//! every mutation persisted through the metadata store before it is
//! published. Mutations are serialized by the node's single operation lock.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use redb_types::models::{JoinStrategy, MeshInfo, MeshStatus, NodeInfo, NodeStatus};
use redb_types::storage::MetadataStore;

use crate::errors::MeshError;

#[derive(Debug, Clone, Default)]
pub struct MeshView {
    pub mesh: Option<MeshInfo>,
    pub members: HashMap<u64, NodeInfo>,
}

impl MeshView {
    pub fn member(&self, node_id: u64) -> Option<&NodeInfo> {
        self.members.get(&node_id)
    }

    /// Evicted peers stay in the view as offline until they re-join.
    pub fn is_quarantined(&self, node_id: u64) -> bool {
        self.members
            .get(&node_id)
            .map(|m| m.status == NodeStatus::Offline)
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> u32 {
        self.members
            .values()
            .filter(|m| m.status == NodeStatus::Active)
            .count() as u32
    }
}

#[derive(Debug)]
pub(crate) struct Membership {
    store: Arc<dyn MetadataStore>,
    view: ArcSwap<MeshView>,
    /// Mesh control operations are one-in-flight per node.
    pub(crate) op_lock: tokio::sync::Mutex<()>,
}

impl Membership {
    pub(crate) async fn load(store: Arc<dyn MetadataStore>) -> Result<Self, MeshError> {
        let mesh = store.load_mesh().await?;
        let members = store
            .load_peers()
            .await?
            .into_iter()
            .map(|peer| (peer.node_id, peer))
            .collect();
        Ok(Self {
            store,
            view: ArcSwap::from_pointee(MeshView { mesh, members }),
            op_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub(crate) fn snapshot(&self) -> Arc<MeshView> {
        self.view.load_full()
    }

    /// Persists and publishes a new view. Counts are recomputed here so
    /// callers only describe membership, never bookkeeping.
    pub(crate) async fn replace(
        &self,
        mut view: MeshView,
        open_connections: u32,
    ) -> Result<(), MeshError> {
        if let Some(mesh) = &mut view.mesh {
            mesh.node_count = view
                .members
                .values()
                .filter(|m| m.status == NodeStatus::Active)
                .count() as u32;
            mesh.connection_count = open_connections;
        }
        self.store.save_mesh(view.mesh.as_ref()).await?;
        let peers: Vec<NodeInfo> = view.members.values().cloned().collect();
        self.store.save_peers(&peers).await?;
        self.view.store(Arc::new(view));
        Ok(())
    }

    /// Purges every mesh record; required before seed/join on a clean node.
    pub(crate) async fn purge(&self) -> Result<(), MeshError> {
        self.store.save_mesh(None).await?;
        self.store.save_peers(&[]).await?;
        self.view.store(Arc::new(MeshView::default()));
        Ok(())
    }
}

/// Resolves the mesh configuration a joining node ends up with.
///
/// `inherit` adopts the remote mesh unchanged; `merge` unions the settings
/// with local defaults winning conflicts; `overwrite` is an elevated
/// operation handled (and rejected) at the remote side.
pub(crate) fn merge_mesh(
    local: Option<&MeshInfo>,
    remote: &MeshInfo,
    strategy: JoinStrategy,
) -> MeshInfo {
    match (strategy, local) {
        (JoinStrategy::Inherit, _) | (_, None) => remote.clone(),
        (JoinStrategy::Merge, Some(local)) => MeshInfo {
            mesh_id: remote.mesh_id.clone(),
            name: remote.name.clone(),
            description: local
                .description
                .clone()
                .or_else(|| remote.description.clone()),
            allow_join: local.allow_join && remote.allow_join,
            node_count: remote.node_count,
            connection_count: remote.connection_count,
            status: MeshStatus::Active,
        },
        (JoinStrategy::Overwrite, Some(local)) => MeshInfo {
            mesh_id: remote.mesh_id.clone(),
            ..local.clone()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh(id: &str, allow_join: bool, description: Option<&str>) -> MeshInfo {
        MeshInfo {
            mesh_id: id.to_string(),
            name: id.to_string(),
            description: description.map(str::to_string),
            allow_join,
            node_count: 1,
            connection_count: 0,
            status: MeshStatus::Active,
        }
    }

    #[test]
    fn inherit_adopts_the_remote_mesh() {
        let local = mesh("local", false, Some("mine"));
        let remote = mesh("remote", true, None);
        let merged = merge_mesh(Some(&local), &remote, JoinStrategy::Inherit);
        assert_eq!(merged.mesh_id, "remote");
        assert!(merged.allow_join);
        assert_eq!(merged.description, None);
    }

    #[test]
    fn merge_prefers_local_defaults_on_conflict() {
        let local = mesh("local", false, Some("mine"));
        let remote = mesh("remote", true, Some("theirs"));
        let merged = merge_mesh(Some(&local), &remote, JoinStrategy::Merge);
        assert_eq!(merged.mesh_id, "remote");
        assert!(!merged.allow_join);
        assert_eq!(merged.description.as_deref(), Some("mine"));
    }
}
