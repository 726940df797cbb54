//! Mesh wire protocol: length-delimited JSON frames over TCP.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use redb_types::models::{CdcEvent, JoinStrategy, MeshInfo, NodeInfo};
use redb_types::serde::{Deserialize, Serialize};
use redb_types::serde_json;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::errors::MeshError;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(crate = "redb_types::serde", rename_all = "snake_case")]
pub enum HandshakeIntent {
    /// Plain data/control connection between two meshed nodes.
    Connect,
    /// A clean node asking to join the peer's mesh.
    Join,
    /// A meshed node absorbing a clean peer.
    Extend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(crate = "redb_types::serde", tag = "type", rename_all = "snake_case")]
pub enum MeshMessage {
    Hello {
        node: NodeInfo,
        mesh_id: Option<String>,
        intent: HandshakeIntent,
    },
    HelloAck {
        node: NodeInfo,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mesh: Option<MeshInfo>,
    },
    JoinRequest {
        strategy: JoinStrategy,
        /// The joiner's local defaults, used by the merge strategy.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mesh: Option<MeshInfo>,
    },
    JoinResponse {
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mesh: Option<MeshInfo>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        members: Vec<NodeInfo>,
    },
    ExtendRequest {
        strategy: JoinStrategy,
        mesh: MeshInfo,
        members: Vec<NodeInfo>,
    },
    ExtendResponse {
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node: Option<NodeInfo>,
    },
    /// Authoritative view replacement pushed after membership changes.
    MembershipUpdate {
        mesh: MeshInfo,
        members: Vec<NodeInfo>,
    },
    Leave {
        node_id: u64,
    },
    Evict {
        node_id: u64,
        wipe: bool,
    },
    Cdc {
        event: CdcEvent,
    },
    Ping {
        nonce: u64,
        sent_micros: u64,
    },
    Pong {
        nonce: u64,
        sent_micros: u64,
    },
}

pub type MeshFrames = Framed<TcpStream, LengthDelimitedCodec>;

pub fn framed(stream: TcpStream) -> MeshFrames {
    Framed::new(stream, LengthDelimitedCodec::new())
}

pub fn encode(message: &MeshMessage) -> Result<Bytes, MeshError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub async fn send(frames: &mut MeshFrames, message: &MeshMessage) -> Result<(), MeshError> {
    frames.send(encode(message)?).await?;
    Ok(())
}

/// Receives one frame with a deadline; used during handshakes where a stuck
/// peer must not wedge the membership state machine.
pub async fn recv(
    frames: &mut MeshFrames,
    timeout: Duration,
    operation: &'static str,
) -> Result<MeshMessage, MeshError> {
    let frame = tokio::time::timeout(timeout, frames.next())
        .await
        .map_err(|_| MeshError::DeadlineExceeded(operation.to_string()))?;
    match frame {
        Some(Ok(bytes)) => Ok(serde_json::from_slice(&bytes)?),
        Some(Err(e)) => Err(e.into()),
        None => Err(MeshError::UnexpectedMessage(operation)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb_types::models::NodeStatus;

    #[test]
    fn messages_round_trip_as_json() {
        let node = NodeInfo {
            node_id: 7,
            name: "n1".to_string(),
            platform: "linux".to_string(),
            version: "0.1.0".to_string(),
            region_id: None,
            addr: "127.0.0.1:4000".parse().unwrap(),
            status: NodeStatus::Active,
            mesh_id: Some("mesh_1".to_string()),
        };
        let message = MeshMessage::Hello {
            node,
            mesh_id: Some("mesh_1".to_string()),
            intent: HandshakeIntent::Connect,
        };
        let encoded = encode(&message).unwrap();
        let decoded: MeshMessage = serde_json::from_slice(&encoded).unwrap();
        match decoded {
            MeshMessage::Hello { node, intent, .. } => {
                assert_eq!(node.node_id, 7);
                assert_eq!(intent, HandshakeIntent::Connect);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn cdc_frames_keep_metadata_opaque() {
        let mut event = CdcEvent::truncate("users");
        event
            .metadata
            .insert("trace".to_string(), serde_json::json!({"span": 9}));
        event.target_node = Some(12);
        let encoded = encode(&MeshMessage::Cdc { event }).unwrap();
        let decoded: MeshMessage = serde_json::from_slice(&encoded).unwrap();
        let MeshMessage::Cdc { event } = decoded else {
            panic!("expected cdc frame");
        };
        assert_eq!(event.target_node, Some(12));
        assert_eq!(
            event.metadata.get("trace"),
            Some(&serde_json::json!({"span": 9}))
        );
    }
}
