//! Routes CDC events produced by local pipelines to the node anchoring the
//! target database. The router holds node ids only; connections are
//! resolved through the membership snapshot at send time.

use std::sync::Arc;

use async_trait::async_trait;
use redb_engine::pipeline::CdcEventRouter;
use redb_types::errors::{DatabaseError, ErrorKind};
use redb_types::models::CdcEvent;

use crate::node::MeshNode;
use crate::protocol::MeshMessage;

#[derive(Debug, Clone)]
pub struct MeshRouter {
    node: Arc<MeshNode>,
}

impl MeshRouter {
    pub fn new(node: Arc<MeshNode>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl CdcEventRouter for MeshRouter {
    async fn route(&self, event: CdcEvent) -> Result<(), DatabaseError> {
        let Some(target) = event.target_node else {
            return Err(DatabaseError::new(
                "mesh",
                "route",
                ErrorKind::InvalidQuery("cdc event has no target node".to_string()),
            ));
        };
        self.node
            .send_to(target, MeshMessage::Cdc { event })
            .await
            .map_err(|e| {
                DatabaseError::new(
                    "mesh",
                    "route",
                    ErrorKind::ConnectionFailed(Box::new(e)),
                )
            })
    }
}
