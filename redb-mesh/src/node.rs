//! The per-process mesh node: persistent identity, the membership state
//! machine (seed/join/extend/leave/evict), peer connections and inbound
//! dispatch.

use std::collections::HashMap;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use redb_types::errors::{DatabaseError, ResourceKind};
use redb_types::log::{debug, error, info, warn};
use redb_types::models::{
    CdcEvent, ConnectionInfo, JoinStrategy, MeshInfo, MeshStatus, NodeInfo, NodeStatus,
};
use redb_types::parking_lot::RwLock;
use redb_types::storage::MetadataStore;
use tokio::net::{TcpListener, TcpStream};

use crate::connection::{InboundHandler, PeerConnection};
use crate::errors::MeshError;
use crate::membership::{merge_mesh, Membership, MeshView};
use crate::protocol::{self, framed, HandshakeIntent, MeshFrames, MeshMessage, HANDSHAKE_TIMEOUT};

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period for queued frames to flush before a socket closes.
const FLUSH_GRACE: Duration = Duration::from_millis(100);

/// Applies CDC events that arrive over the mesh for this node; wired by the
/// service layer to the local adapter connections.
#[async_trait]
pub trait CdcEventHandler: Send + Sync + Debug {
    async fn apply(&self, event: CdcEvent) -> Result<(), DatabaseError>;
}

#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub name: String,
    pub listen_addr: SocketAddr,
    pub region_id: Option<String>,
}

#[derive(Debug)]
pub struct MeshNode {
    store: Arc<dyn MetadataStore>,
    identity: RwLock<NodeInfo>,
    membership: Membership,
    connections: RwLock<HashMap<u64, Arc<PeerConnection>>>,
    cdc_handler: RwLock<Option<Arc<dyn CdcEventHandler>>>,
    self_ref: Weak<MeshNode>,
}

/// Thin dispatch target handed to connection reader tasks; upgrades to the
/// node on delivery so a dropped node just stops consuming.
#[derive(Debug)]
struct NodeHandler {
    node: Weak<MeshNode>,
}

#[async_trait]
impl InboundHandler for NodeHandler {
    async fn handle(&self, from: u64, message: MeshMessage) {
        if let Some(node) = self.node.upgrade() {
            node.dispatch(from, message).await;
        }
    }

    async fn disconnected(&self, peer_node_id: u64) {
        if let Some(node) = self.node.upgrade() {
            node.peer_disconnected(peer_node_id);
        }
    }
}

impl MeshNode {
    /// Loads (or mints) the node identity, binds the listener and starts
    /// accepting peers. The identity's `node_id` is assigned once, at first
    /// bootstrap, and is stable afterwards.
    pub async fn bootstrap(
        store: Arc<dyn MetadataStore>,
        options: NodeOptions,
    ) -> Result<Arc<Self>, MeshError> {
        let listener = TcpListener::bind(options.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let identity = match store.load_node_identity().await? {
            Some(mut node) => {
                node.addr = local_addr;
                node
            }
            None => NodeInfo {
                node_id: rand::random::<u64>() | 1,
                name: options.name.clone(),
                platform: std::env::consts::OS.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                region_id: options.region_id.clone(),
                addr: local_addr,
                status: NodeStatus::Clean,
                mesh_id: None,
            },
        };
        store.save_node_identity(&identity).await?;

        let membership = Membership::load(store.clone()).await?;
        let node = Arc::new_cyclic(|weak: &Weak<MeshNode>| Self {
            store,
            identity: RwLock::new(identity),
            membership,
            connections: RwLock::new(HashMap::new()),
            cdc_handler: RwLock::new(None),
            self_ref: weak.clone(),
        });

        let accept_node = node.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let node = accept_node.clone();
                        tokio::spawn(async move {
                            if let Err(e) = node.handle_incoming(stream).await {
                                debug!("handshake with {addr} failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        info!(
            "node {} listening on {local_addr}",
            node.identity.read().node_id
        );
        Ok(node)
    }

    pub fn node_id(&self) -> u64 {
        self.identity.read().node_id
    }

    pub fn info(&self) -> NodeInfo {
        self.identity.read().clone()
    }

    pub fn status(&self) -> NodeStatus {
        self.identity.read().status
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.identity.read().addr
    }

    pub fn set_cdc_handler(&self, handler: Arc<dyn CdcEventHandler>) {
        *self.cdc_handler.write() = Some(handler);
    }

    /// Current mesh view with live counters.
    pub fn mesh(&self) -> Option<MeshInfo> {
        let snapshot = self.membership.snapshot();
        snapshot.mesh.clone().map(|mut mesh| {
            mesh.node_count = snapshot.active_count();
            mesh.connection_count = self.open_connection_count();
            mesh
        })
    }

    pub fn list_nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> =
            self.membership.snapshot().members.values().cloned().collect();
        nodes.sort_by_key(|n| n.node_id);
        nodes
    }

    pub fn show_node(&self, node_id: u64) -> Option<NodeInfo> {
        if node_id == self.node_id() {
            return Some(self.info());
        }
        self.membership.snapshot().member(node_id).cloned()
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .connections
            .read()
            .values()
            .map(|c| c.info())
            .collect();
        infos.sort_by_key(|c| c.peer_node_id);
        infos
    }

    fn open_connection_count(&self) -> u32 {
        self.connections
            .read()
            .values()
            .filter(|c| c.is_open())
            .count() as u32
    }

    fn ensure_status(&self, expected: NodeStatus, operation: &str) -> Result<(), MeshError> {
        let status = self.status();
        if status != expected {
            return Err(MeshError::InvalidState(format!(
                "{operation} requires a {expected} node, this node is {status}"
            )));
        }
        Ok(())
    }

    async fn set_identity(
        &self,
        status: NodeStatus,
        mesh_id: Option<String>,
    ) -> Result<(), MeshError> {
        let mut updated = self.identity.read().clone();
        updated.status = status;
        updated.mesh_id = mesh_id;
        self.store.save_node_identity(&updated).await?;
        *self.identity.write() = updated;
        Ok(())
    }

    /// Creates a new mesh with this node as the only member. Valid on a
    /// clean node only; residual mesh records are purged first.
    pub async fn seed(
        &self,
        name: &str,
        description: Option<String>,
    ) -> Result<MeshInfo, MeshError> {
        let _guard = self.membership.op_lock.lock().await;
        self.ensure_status(NodeStatus::Clean, "seed")?;
        self.membership.purge().await?;

        let mesh = MeshInfo {
            mesh_id: format!("mesh_{}", uuid::Uuid::new_v4().simple()),
            name: name.to_string(),
            description,
            allow_join: true,
            node_count: 1,
            connection_count: 0,
            status: MeshStatus::Active,
        };
        self.set_identity(NodeStatus::Active, Some(mesh.mesh_id.clone()))
            .await?;
        let mut members = HashMap::new();
        members.insert(self.node_id(), self.info());
        self.membership
            .replace(
                MeshView {
                    mesh: Some(mesh.clone()),
                    members,
                },
                0,
            )
            .await?;
        info!("seeded mesh `{}` ({})", mesh.name, mesh.mesh_id);
        Ok(mesh)
    }

    /// Operator toggle for whether the mesh accepts new joiners.
    pub async fn set_allow_join(&self, allow_join: bool) -> Result<(), MeshError> {
        let _guard = self.membership.op_lock.lock().await;
        let mut view = (*self.membership.snapshot()).clone();
        let mesh = view
            .mesh
            .as_mut()
            .ok_or_else(|| MeshError::InvalidState("node is not in a mesh".to_string()))?;
        mesh.allow_join = allow_join;
        self.membership
            .replace(view, self.open_connection_count())
            .await?;
        self.broadcast_membership(None);
        Ok(())
    }

    /// Joins an existing mesh through `target`. Valid on a clean node; on
    /// any failure the node rolls back to clean with no mesh state.
    pub async fn join(
        &self,
        target: SocketAddr,
        strategy: JoinStrategy,
        timeout: Duration,
    ) -> Result<MeshInfo, MeshError> {
        let _guard = self.membership.op_lock.lock().await;
        self.ensure_status(NodeStatus::Clean, "join")?;
        self.membership.purge().await?;
        self.set_identity(NodeStatus::Joining, None).await?;

        match self.join_inner(target, strategy, timeout).await {
            Ok(mesh) => {
                info!("joined mesh `{}` via {target}", mesh.mesh_id);
                Ok(mesh)
            }
            Err(e) => {
                let _ = self.membership.purge().await;
                let _ = self.set_identity(NodeStatus::Clean, None).await;
                Err(e)
            }
        }
    }

    async fn join_inner(
        &self,
        target: SocketAddr,
        strategy: JoinStrategy,
        timeout: Duration,
    ) -> Result<MeshInfo, MeshError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(target))
            .await
            .map_err(|_| MeshError::DeadlineExceeded("join".to_string()))??;
        let mut frames = framed(stream);

        protocol::send(
            &mut frames,
            &MeshMessage::Hello {
                node: self.info(),
                mesh_id: None,
                intent: HandshakeIntent::Join,
            },
        )
        .await?;
        let ack = protocol::recv(&mut frames, timeout, "join handshake").await?;
        let MeshMessage::HelloAck {
            node: remote,
            accepted,
            reason,
            ..
        } = ack
        else {
            return Err(MeshError::UnexpectedMessage("join handshake"));
        };
        if !accepted {
            return Err(MeshError::PermissionDenied(
                reason.unwrap_or_else(|| "handshake refused".to_string()),
            ));
        }

        protocol::send(
            &mut frames,
            &MeshMessage::JoinRequest {
                strategy,
                mesh: None,
            },
        )
        .await?;
        let response = protocol::recv(&mut frames, timeout, "join request").await?;
        let MeshMessage::JoinResponse {
            accepted,
            reason,
            mesh,
            members,
        } = response
        else {
            return Err(MeshError::UnexpectedMessage("join request"));
        };
        if !accepted {
            return Err(MeshError::PermissionDenied(
                reason.unwrap_or_else(|| "join refused".to_string()),
            ));
        }
        let mesh = mesh.ok_or(MeshError::UnexpectedMessage("join request"))?;

        self.set_identity(NodeStatus::Active, Some(mesh.mesh_id.clone()))
            .await?;
        let mut member_map: HashMap<u64, NodeInfo> =
            members.into_iter().map(|m| (m.node_id, m)).collect();
        member_map.insert(self.node_id(), self.info());

        self.register_connection(remote, frames);
        self.membership
            .replace(
                MeshView {
                    mesh: Some(mesh.clone()),
                    members: member_map,
                },
                self.open_connection_count(),
            )
            .await?;
        Ok(mesh)
    }

    /// Absorbs a clean node into this mesh; the symmetric of `join`, driven
    /// from the already-meshed side.
    pub async fn extend(
        &self,
        target: SocketAddr,
        strategy: JoinStrategy,
        timeout: Duration,
    ) -> Result<NodeInfo, MeshError> {
        let _guard = self.membership.op_lock.lock().await;
        self.ensure_status(NodeStatus::Active, "extend")?;
        let snapshot = self.membership.snapshot();
        let mesh = snapshot
            .mesh
            .clone()
            .ok_or_else(|| MeshError::InvalidState("node has no mesh record".to_string()))?;

        let stream = tokio::time::timeout(timeout, TcpStream::connect(target))
            .await
            .map_err(|_| MeshError::DeadlineExceeded("extend".to_string()))??;
        let mut frames = framed(stream);

        protocol::send(
            &mut frames,
            &MeshMessage::Hello {
                node: self.info(),
                mesh_id: Some(mesh.mesh_id.clone()),
                intent: HandshakeIntent::Extend,
            },
        )
        .await?;
        let ack = protocol::recv(&mut frames, timeout, "extend handshake").await?;
        let MeshMessage::HelloAck {
            node: remote,
            accepted,
            reason,
            ..
        } = ack
        else {
            return Err(MeshError::UnexpectedMessage("extend handshake"));
        };
        if !accepted {
            return Err(MeshError::Rejected(
                reason.unwrap_or_else(|| "extend refused".to_string()),
            ));
        }
        if remote.status != NodeStatus::Clean {
            return Err(MeshError::InvalidState(format!(
                "extend target must be clean, node {} is {}",
                remote.node_id, remote.status
            )));
        }

        protocol::send(
            &mut frames,
            &MeshMessage::ExtendRequest {
                strategy,
                mesh: mesh.clone(),
                members: snapshot.members.values().cloned().collect(),
            },
        )
        .await?;
        let response = protocol::recv(&mut frames, timeout, "extend request").await?;
        let MeshMessage::ExtendResponse {
            accepted,
            reason,
            node,
        } = response
        else {
            return Err(MeshError::UnexpectedMessage("extend request"));
        };
        if !accepted {
            return Err(MeshError::Rejected(
                reason.unwrap_or_else(|| "extend refused".to_string()),
            ));
        }
        let new_member = node.ok_or(MeshError::UnexpectedMessage("extend request"))?;

        let mut view = (*snapshot).clone();
        view.members.insert(new_member.node_id, new_member.clone());
        let connection = self.register_connection(new_member.clone(), frames);
        self.membership
            .replace(view, self.open_connection_count())
            .await?;
        self.broadcast_membership(Some(connection.peer_node_id()));
        info!(
            "extended mesh `{}` to node {}",
            mesh.mesh_id, new_member.node_id
        );
        Ok(new_member)
    }

    /// Leaves the mesh: announce (unless forced), close connections, purge
    /// local mesh state, return to clean.
    pub async fn leave(&self, force: bool) -> Result<(), MeshError> {
        let _guard = self.membership.op_lock.lock().await;
        self.ensure_status(NodeStatus::Active, "leave")?;
        let mesh_id = self.identity.read().mesh_id.clone();
        self.set_identity(NodeStatus::Leaving, mesh_id).await?;

        if !force {
            let node_id = self.node_id();
            let connections: Vec<Arc<PeerConnection>> =
                self.connections.read().values().cloned().collect();
            for connection in connections {
                let _ = connection.send(MeshMessage::Leave { node_id }).await;
            }
            tokio::time::sleep(FLUSH_GRACE).await;
        }

        self.close_all_connections();
        self.membership.purge().await?;
        self.set_identity(NodeStatus::Clean, None).await?;
        info!("left mesh");
        Ok(())
    }

    /// Removes another node from the mesh view; with `clean_target` the
    /// node is also told to wipe its local mesh state. The evicted node is
    /// quarantined: its reconnects are refused until it re-joins.
    pub async fn evict(&self, target_node_id: u64, clean_target: bool) -> Result<(), MeshError> {
        let _guard = self.membership.op_lock.lock().await;
        self.ensure_status(NodeStatus::Active, "evict")?;
        if target_node_id == self.node_id() {
            return Err(MeshError::InvalidState(
                "a node cannot evict itself, leave instead".to_string(),
            ));
        }
        let snapshot = self.membership.snapshot();
        let Some(member) = snapshot.member(target_node_id).cloned() else {
            return Err(MeshError::NotFound(
                ResourceKind::Node,
                target_node_id.to_string(),
            ));
        };

        if clean_target {
            match self
                .connection_for(target_node_id, member.addr, DEFAULT_DIAL_TIMEOUT)
                .await
            {
                Ok(connection) => {
                    let _ = connection
                        .send(MeshMessage::Evict {
                            node_id: target_node_id,
                            wipe: true,
                        })
                        .await;
                    tokio::time::sleep(FLUSH_GRACE).await;
                }
                Err(e) => warn!("could not deliver wipe to node {target_node_id}: {e}"),
            }
        }

        if let Some(connection) = self.connections.write().remove(&target_node_id) {
            connection.close();
        }

        let mut view = (*snapshot).clone();
        if let Some(member) = view.members.get_mut(&target_node_id) {
            member.status = NodeStatus::Offline;
        }
        self.membership
            .replace(view, self.open_connection_count())
            .await?;
        self.broadcast_membership(None);
        info!("evicted node {target_node_id}");
        Ok(())
    }

    /// Direct connection to a node already in the membership.
    pub async fn add_connection(
        &self,
        peer_node_id: u64,
        timeout: Duration,
    ) -> Result<ConnectionInfo, MeshError> {
        self.ensure_status(NodeStatus::Active, "add_connection")?;
        let connection = self.route_to(peer_node_id, timeout).await?;
        Ok(connection.info())
    }

    pub fn drop_connection(&self, peer_node_id: u64) -> Result<(), MeshError> {
        let connection = self
            .connections
            .write()
            .remove(&peer_node_id)
            .ok_or_else(|| {
                MeshError::NotFound(ResourceKind::Connection, peer_node_id.to_string())
            })?;
        connection.close();
        Ok(())
    }

    /// Resolves a route: an open connection when one exists, dialing on
    /// demand otherwise. No store-and-forward: with no route the caller
    /// gets the failure back.
    pub(crate) async fn route_to(
        &self,
        peer_node_id: u64,
        timeout: Duration,
    ) -> Result<Arc<PeerConnection>, MeshError> {
        if let Some(connection) = self.connections.read().get(&peer_node_id) {
            if connection.is_open() {
                return Ok(connection.clone());
            }
        }
        let snapshot = self.membership.snapshot();
        let member = snapshot
            .member(peer_node_id)
            .cloned()
            .ok_or(MeshError::NoRoute(peer_node_id))?;
        if snapshot.is_quarantined(peer_node_id) {
            return Err(MeshError::NoRoute(peer_node_id));
        }
        self.connection_for(peer_node_id, member.addr, timeout).await
    }

    async fn connection_for(
        &self,
        peer_node_id: u64,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Arc<PeerConnection>, MeshError> {
        if let Some(connection) = self.connections.read().get(&peer_node_id) {
            if connection.is_open() {
                return Ok(connection.clone());
            }
        }
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| MeshError::DeadlineExceeded("dial".to_string()))??;
        let mut frames = framed(stream);
        let me = self.info();
        let mesh_id = me.mesh_id.clone();
        protocol::send(
            &mut frames,
            &MeshMessage::Hello {
                node: me,
                mesh_id,
                intent: HandshakeIntent::Connect,
            },
        )
        .await?;
        let ack = protocol::recv(&mut frames, HANDSHAKE_TIMEOUT, "connect handshake").await?;
        let MeshMessage::HelloAck {
            node: remote,
            accepted,
            reason,
            ..
        } = ack
        else {
            return Err(MeshError::UnexpectedMessage("connect handshake"));
        };
        if !accepted {
            return Err(MeshError::PermissionDenied(
                reason.unwrap_or_else(|| "connection refused".to_string()),
            ));
        }
        Ok(self.register_connection(remote, frames))
    }

    pub(crate) async fn send_to(
        &self,
        peer_node_id: u64,
        message: MeshMessage,
    ) -> Result<(), MeshError> {
        let connection = self.route_to(peer_node_id, DEFAULT_DIAL_TIMEOUT).await?;
        connection.send(message).await
    }

    fn register_connection(&self, peer: NodeInfo, frames: MeshFrames) -> Arc<PeerConnection> {
        let handler: Arc<dyn InboundHandler> = Arc::new(NodeHandler {
            node: self.self_ref.clone(),
        });
        let connection = PeerConnection::spawn(peer, frames, handler);
        let previous = self
            .connections
            .write()
            .insert(connection.peer_node_id(), connection.clone());
        if let Some(previous) = previous {
            previous.close();
        }
        connection
    }

    fn close_all_connections(&self) {
        let mut connections = self.connections.write();
        for (_, connection) in connections.drain() {
            connection.close();
        }
    }

    /// Pushes the authoritative view to every open peer except `exclude`.
    fn broadcast_membership(&self, exclude: Option<u64>) {
        let snapshot = self.membership.snapshot();
        let Some(mesh) = snapshot.mesh.clone() else {
            return;
        };
        let members: Vec<NodeInfo> = snapshot.members.values().cloned().collect();
        for connection in self.connections.read().values() {
            if Some(connection.peer_node_id()) == exclude || !connection.is_open() {
                continue;
            }
            connection.try_send(MeshMessage::MembershipUpdate {
                mesh: mesh.clone(),
                members: members.clone(),
            });
        }
    }

    async fn handle_incoming(&self, stream: TcpStream) -> Result<(), MeshError> {
        let mut frames = framed(stream);
        let hello = protocol::recv(&mut frames, HANDSHAKE_TIMEOUT, "hello").await?;
        let MeshMessage::Hello {
            node: peer,
            mesh_id: peer_mesh,
            intent,
        } = hello
        else {
            return Err(MeshError::UnexpectedMessage("hello"));
        };

        if self.membership.snapshot().is_quarantined(peer.node_id) {
            protocol::send(
                &mut frames,
                &MeshMessage::HelloAck {
                    node: self.info(),
                    accepted: false,
                    reason: Some(
                        "node was evicted from the mesh; re-join after cleanup".to_string(),
                    ),
                    mesh: None,
                },
            )
            .await?;
            return Ok(());
        }

        match intent {
            HandshakeIntent::Connect => self.accept_connect(frames, peer, peer_mesh).await,
            HandshakeIntent::Join => self.accept_join(frames, peer).await,
            HandshakeIntent::Extend => self.accept_extend(frames, peer).await,
        }
    }

    async fn accept_connect(
        &self,
        mut frames: MeshFrames,
        peer: NodeInfo,
        peer_mesh: Option<String>,
    ) -> Result<(), MeshError> {
        let me = self.info();
        let snapshot = self.membership.snapshot();
        let accepted = me.status == NodeStatus::Active
            && peer_mesh == me.mesh_id
            && snapshot.member(peer.node_id).is_some();
        if !accepted {
            protocol::send(
                &mut frames,
                &MeshMessage::HelloAck {
                    node: me,
                    accepted: false,
                    reason: Some("peer is not a member of this mesh".to_string()),
                    mesh: None,
                },
            )
            .await?;
            return Ok(());
        }
        protocol::send(
            &mut frames,
            &MeshMessage::HelloAck {
                node: me,
                accepted: true,
                reason: None,
                mesh: snapshot.mesh.clone(),
            },
        )
        .await?;
        self.register_connection(peer, frames);
        Ok(())
    }

    async fn accept_join(&self, mut frames: MeshFrames, peer: NodeInfo) -> Result<(), MeshError> {
        let _guard = self.membership.op_lock.lock().await;
        let me = self.info();
        if me.status != NodeStatus::Active {
            protocol::send(
                &mut frames,
                &MeshMessage::HelloAck {
                    node: me,
                    accepted: false,
                    reason: Some("node is not part of a mesh".to_string()),
                    mesh: None,
                },
            )
            .await?;
            return Ok(());
        }
        let snapshot = self.membership.snapshot();
        let mesh = snapshot.mesh.clone().ok_or_else(|| {
            MeshError::InvalidState("active node without mesh record".to_string())
        })?;
        protocol::send(
            &mut frames,
            &MeshMessage::HelloAck {
                node: me,
                accepted: true,
                reason: None,
                mesh: Some(mesh.clone()),
            },
        )
        .await?;

        let request = protocol::recv(&mut frames, HANDSHAKE_TIMEOUT, "join request").await?;
        let MeshMessage::JoinRequest {
            strategy,
            mesh: joiner_defaults,
        } = request
        else {
            return Err(MeshError::UnexpectedMessage("join request"));
        };

        if !mesh.allow_join {
            protocol::send(
                &mut frames,
                &MeshMessage::JoinResponse {
                    accepted: false,
                    reason: Some("mesh does not allow joins".to_string()),
                    mesh: None,
                    members: vec![],
                },
            )
            .await?;
            return Ok(());
        }
        if strategy == JoinStrategy::Overwrite {
            protocol::send(
                &mut frames,
                &MeshMessage::JoinResponse {
                    accepted: false,
                    reason: Some("overwrite strategy requires elevated privilege".to_string()),
                    mesh: None,
                    members: vec![],
                },
            )
            .await?;
            return Ok(());
        }

        let mesh = merge_mesh(joiner_defaults.as_ref(), &mesh, strategy);
        let mut joiner = peer;
        joiner.status = NodeStatus::Active;
        joiner.mesh_id = Some(mesh.mesh_id.clone());

        let mut view = (*snapshot).clone();
        view.mesh = Some(mesh.clone());
        view.members.insert(joiner.node_id, joiner.clone());
        let members: Vec<NodeInfo> = view.members.values().cloned().collect();
        self.membership
            .replace(view, self.open_connection_count())
            .await?;

        protocol::send(
            &mut frames,
            &MeshMessage::JoinResponse {
                accepted: true,
                reason: None,
                mesh: Some(mesh),
                members,
            },
        )
        .await?;

        let connection = self.register_connection(joiner, frames);
        self.broadcast_membership(Some(connection.peer_node_id()));
        Ok(())
    }

    async fn accept_extend(&self, mut frames: MeshFrames, peer: NodeInfo) -> Result<(), MeshError> {
        let _guard = self.membership.op_lock.lock().await;
        let me = self.info();
        if me.status != NodeStatus::Clean {
            protocol::send(
                &mut frames,
                &MeshMessage::HelloAck {
                    node: me.clone(),
                    accepted: false,
                    reason: Some(format!(
                        "extend target must be clean, node is {}",
                        me.status
                    )),
                    mesh: None,
                },
            )
            .await?;
            return Ok(());
        }
        protocol::send(
            &mut frames,
            &MeshMessage::HelloAck {
                node: me,
                accepted: true,
                reason: None,
                mesh: None,
            },
        )
        .await?;

        let request = protocol::recv(&mut frames, HANDSHAKE_TIMEOUT, "extend request").await?;
        let MeshMessage::ExtendRequest {
            strategy,
            mesh,
            members,
        } = request
        else {
            return Err(MeshError::UnexpectedMessage("extend request"));
        };

        self.membership.purge().await?;
        let mesh = merge_mesh(None, &mesh, strategy);
        self.set_identity(NodeStatus::Active, Some(mesh.mesh_id.clone()))
            .await?;
        let mut member_map: HashMap<u64, NodeInfo> =
            members.into_iter().map(|m| (m.node_id, m)).collect();
        member_map.insert(self.node_id(), self.info());

        // Publish the adopted view before answering so the initiator never
        // observes this node half-joined.
        self.membership
            .replace(
                MeshView {
                    mesh: Some(mesh),
                    members: member_map,
                },
                self.open_connection_count(),
            )
            .await?;

        protocol::send(
            &mut frames,
            &MeshMessage::ExtendResponse {
                accepted: true,
                reason: None,
                node: Some(self.info()),
            },
        )
        .await?;

        self.register_connection(peer, frames);
        Ok(())
    }

    async fn handle_cdc(&self, event: CdcEvent) {
        if let Some(target) = event.target_node {
            if target != self.node_id() {
                warn!("dropping cdc event addressed to node {target}, no store-and-forward");
                return;
            }
        }
        let handler = self.cdc_handler.read().clone();
        match handler {
            Some(handler) => {
                if let Err(e) = handler.apply(event).await {
                    error!("failed to apply routed cdc event: {e}");
                }
            }
            None => warn!("cdc event arrived with no handler wired"),
        }
    }

    async fn wipe(&self) {
        info!("remote wipe received, purging mesh state");
        self.close_all_connections();
        if let Err(e) = self.membership.purge().await {
            error!("wipe failed to purge membership: {e}");
        }
        if let Err(e) = self.set_identity(NodeStatus::Clean, None).await {
            error!("wipe failed to reset identity: {e}");
        }
    }

    /// Steady-state inbound dispatch, called from connection reader tasks.
    async fn dispatch(&self, from: u64, message: MeshMessage) {
        match message {
            MeshMessage::Cdc { event } => self.handle_cdc(event).await,
            MeshMessage::MembershipUpdate { mesh, members } => {
                let _guard = self.membership.op_lock.lock().await;
                let me = self.info();
                if me.mesh_id.as_deref() != Some(mesh.mesh_id.as_str()) {
                    return;
                }
                let mut member_map: HashMap<u64, NodeInfo> =
                    members.into_iter().map(|m| (m.node_id, m)).collect();
                // Our own record stays authoritative locally.
                member_map.insert(me.node_id, me);
                let view = MeshView {
                    mesh: Some(mesh),
                    members: member_map,
                };
                if let Err(e) = self
                    .membership
                    .replace(view, self.open_connection_count())
                    .await
                {
                    error!("failed to adopt membership update from {from}: {e}");
                }
            }
            MeshMessage::Leave { node_id } => {
                let _guard = self.membership.op_lock.lock().await;
                let mut view = (*self.membership.snapshot()).clone();
                view.members.remove(&node_id);
                if let Some(connection) = self.connections.write().remove(&node_id) {
                    connection.close();
                }
                if let Err(e) = self
                    .membership
                    .replace(view, self.open_connection_count())
                    .await
                {
                    error!("failed to apply leave of node {node_id}: {e}");
                }
                debug!("node {node_id} left the mesh");
            }
            MeshMessage::Evict { node_id, wipe } => {
                if node_id == self.node_id() {
                    if wipe {
                        self.wipe().await;
                    }
                    return;
                }
                let _guard = self.membership.op_lock.lock().await;
                let mut view = (*self.membership.snapshot()).clone();
                if let Some(member) = view.members.get_mut(&node_id) {
                    member.status = NodeStatus::Offline;
                }
                if let Some(connection) = self.connections.write().remove(&node_id) {
                    connection.close();
                }
                let _ = self
                    .membership
                    .replace(view, self.open_connection_count())
                    .await;
            }
            other => {
                debug!("ignoring unexpected steady-state message from {from}: {other:?}");
            }
        }
    }

    fn peer_disconnected(&self, peer_node_id: u64) {
        let mut connections = self.connections.write();
        if let Some(existing) = connections.get(&peer_node_id) {
            if !existing.is_open() {
                connections.remove(&peer_node_id);
                debug!("connection to node {peer_node_id} closed");
            }
        }
    }
}
