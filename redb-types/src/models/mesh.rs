use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Clean,
    Joining,
    Active,
    Leaving,
    Offline,
}

impl Display for NodeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeStatus::Clean => "clean",
            NodeStatus::Joining => "joining",
            NodeStatus::Active => "active",
            NodeStatus::Leaving => "leaving",
            NodeStatus::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// One running core process. `node_id` is assigned at first bootstrap and
/// stable for the lifetime of the installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: u64,
    pub name: String,
    pub platform: String,
    pub version: String,
    #[serde(default)]
    pub region_id: Option<String>,
    pub addr: SocketAddr,
    pub status: NodeStatus,
    #[serde(default)]
    pub mesh_id: Option<String>,
}

impl NodeInfo {
    /// A node is in exactly one mesh iff its status is active or leaving.
    pub fn mesh_state_consistent(&self) -> bool {
        let meshed = matches!(self.status, NodeStatus::Active | NodeStatus::Leaving);
        meshed == self.mesh_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshStatus {
    Active,
    Dissolving,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshInfo {
    pub mesh_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub allow_join: bool,
    pub node_count: u32,
    pub connection_count: u32,
    pub status: MeshStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

/// Point-in-time view of one directed peer link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub peer_node_id: u64,
    pub remote_addr: SocketAddr,
    pub status: ConnectionStatus,
    pub rtt_micros: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub tls: bool,
    #[serde(default)]
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    /// Local adopts the remote mesh configuration.
    #[default]
    Inherit,
    /// Union of local and remote settings, local defaults win conflicts.
    Merge,
    /// Local forces its settings onto the mesh; needs elevated privilege
    /// on the remote side.
    Overwrite,
}
