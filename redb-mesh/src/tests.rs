use std::sync::Arc;
use std::time::Duration;

use redb_engine::pipeline::CdcEventRouter;
use redb_types::async_trait::async_trait;
use redb_types::errors::DatabaseError;
use redb_types::models::{CdcEvent, JoinStrategy, NodeStatus};
use redb_types::parking_lot::Mutex;
use redb_types::serde_json::json;
use redb_types::storage::{MemoryMetadataStore, MetadataStore};

use crate::errors::MeshError;
use crate::node::{CdcEventHandler, MeshNode, NodeOptions};
use crate::router::MeshRouter;

const OP_TIMEOUT: Duration = Duration::from_secs(5);

async fn test_node(name: &str) -> Arc<MeshNode> {
    let store: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
    MeshNode::bootstrap(
        store,
        NodeOptions {
            name: name.to_string(),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            region_id: None,
        },
    )
    .await
    .unwrap()
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn seed_extend_and_leave() {
    let n1 = test_node("n1").await;
    let n2 = test_node("n2").await;
    assert_eq!(n1.status(), NodeStatus::Clean);
    assert!(n1.mesh().is_none());

    let mesh = n1.seed("m", None).await.unwrap();
    assert_eq!(n1.status(), NodeStatus::Active);
    assert_eq!(mesh.node_count, 1);
    assert!(n1.info().mesh_state_consistent());

    let member = n1
        .extend(n2.local_addr(), JoinStrategy::Inherit, OP_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(member.node_id, n2.node_id());
    assert_eq!(n2.status(), NodeStatus::Active);
    assert_eq!(n1.mesh().unwrap().node_count, 2);
    assert_eq!(n2.mesh().unwrap().node_count, 2);
    assert_eq!(n1.list_connections().len(), 1);
    wait_until("n2 to register the connection", || {
        n2.list_connections().len() == 1
    })
    .await;

    n2.leave(false).await.unwrap();
    assert_eq!(n2.status(), NodeStatus::Clean);
    assert!(n2.mesh().is_none());
    assert!(n2.info().mesh_state_consistent());

    wait_until("n1 to see the departure", || {
        n1.mesh().map(|m| m.node_count) == Some(1) && n1.list_connections().is_empty()
    })
    .await;
}

#[tokio::test]
async fn join_merges_into_the_mesh() {
    let n1 = test_node("n1").await;
    let n2 = test_node("n2").await;
    n1.seed("m", Some("primary".to_string())).await.unwrap();

    let mesh = n2
        .join(n1.local_addr(), JoinStrategy::Inherit, OP_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(n2.status(), NodeStatus::Active);
    assert_eq!(n2.info().mesh_id.as_deref(), Some(mesh.mesh_id.as_str()));
    assert_eq!(n2.mesh().unwrap().node_count, 2);
    wait_until("n1 to count two nodes", || {
        n1.mesh().map(|m| m.node_count) == Some(2)
    })
    .await;

    // Both views agree on the member set.
    let n1_ids: Vec<u64> = n1.list_nodes().iter().map(|n| n.node_id).collect();
    let n2_ids: Vec<u64> = n2.list_nodes().iter().map(|n| n.node_id).collect();
    assert_eq!(n1_ids, n2_ids);
}

#[tokio::test]
async fn join_is_refused_when_joins_are_disabled() {
    let n1 = test_node("n1").await;
    let n2 = test_node("n2").await;
    n1.seed("m", None).await.unwrap();
    n1.set_allow_join(false).await.unwrap();

    let err = n2
        .join(n1.local_addr(), JoinStrategy::Inherit, OP_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::PermissionDenied(_)), "{err:?}");
    // The failed join leaves no residue.
    assert_eq!(n2.status(), NodeStatus::Clean);
    assert!(n2.mesh().is_none());
}

#[tokio::test]
async fn seed_requires_a_clean_node() {
    let n1 = test_node("n1").await;
    n1.seed("m", None).await.unwrap();
    let err = n1.seed("again", None).await.unwrap_err();
    assert!(matches!(err, MeshError::InvalidState(_)));
}

#[tokio::test]
async fn evict_wipes_and_quarantines_the_target() {
    let n1 = test_node("n1").await;
    let n2 = test_node("n2").await;
    n1.seed("m", None).await.unwrap();
    n1.extend(n2.local_addr(), JoinStrategy::Inherit, OP_TIMEOUT)
        .await
        .unwrap();

    n1.evict(n2.node_id(), true).await.unwrap();

    // The target observes the remote wipe and returns to clean.
    wait_until("n2 to wipe", || n2.status() == NodeStatus::Clean).await;
    assert!(n2.mesh().is_none());

    // The evictor keeps the node in view as offline.
    let view = n1.show_node(n2.node_id()).unwrap();
    assert_eq!(view.status, NodeStatus::Offline);
    assert_eq!(n1.mesh().unwrap().node_count, 1);

    // An unsolicited reconnect is refused until a fresh join cycle.
    let err = n2
        .join(n1.local_addr(), JoinStrategy::Inherit, OP_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::PermissionDenied(_)), "{err:?}");
}

#[derive(Debug, Default)]
struct CaptureHandler {
    events: Mutex<Vec<CdcEvent>>,
}

#[async_trait]
impl CdcEventHandler for CaptureHandler {
    async fn apply(&self, event: CdcEvent) -> Result<(), DatabaseError> {
        self.events.lock().push(event);
        Ok(())
    }
}

#[tokio::test]
async fn cdc_events_route_to_the_anchoring_node() {
    let n1 = test_node("n1").await;
    let n2 = test_node("n2").await;
    n1.seed("m", None).await.unwrap();
    n1.extend(n2.local_addr(), JoinStrategy::Inherit, OP_TIMEOUT)
        .await
        .unwrap();

    let handler = Arc::new(CaptureHandler::default());
    n2.set_cdc_handler(handler.clone());

    let router = MeshRouter::new(n1.clone());
    let mut event = CdcEvent::insert(
        "users",
        [("id".to_string(), json!(1))].into_iter().collect(),
    );
    event.source_node = Some(n1.node_id());
    event.target_node = Some(n2.node_id());
    router.route(event).await.unwrap();

    wait_until("the event to arrive", || !handler.events.lock().is_empty()).await;
    let received = handler.events.lock()[0].clone();
    assert_eq!(received.table_name, "users");
    assert_eq!(received.source_node, Some(n1.node_id()));

    // Without a target there is nothing to route.
    let unrouted = CdcEvent::truncate("users");
    assert!(router.route(unrouted).await.is_err());
}

#[tokio::test]
async fn add_and_drop_connection() {
    let n1 = test_node("n1").await;
    let n2 = test_node("n2").await;
    n1.seed("m", None).await.unwrap();
    n1.extend(n2.local_addr(), JoinStrategy::Inherit, OP_TIMEOUT)
        .await
        .unwrap();

    // The extend handshake already connected the pair; dropping and
    // re-adding exercises the on-demand dial path.
    n1.drop_connection(n2.node_id()).unwrap();
    wait_until("connection teardown", || n1.list_connections().is_empty()).await;

    let info = n1.add_connection(n2.node_id(), OP_TIMEOUT).await.unwrap();
    assert_eq!(info.peer_node_id, n2.node_id());
    assert!(!n1.list_connections().is_empty());

    assert!(n1.drop_connection(99).is_err());
}

#[tokio::test]
async fn identity_survives_restart() {
    let store: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
    let options = NodeOptions {
        name: "n1".to_string(),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        region_id: Some("eu".to_string()),
    };
    let first = MeshNode::bootstrap(store.clone(), options.clone()).await.unwrap();
    let first_id = first.node_id();
    drop(first);

    let second = MeshNode::bootstrap(store, options).await.unwrap();
    assert_eq!(second.node_id(), first_id);
    assert_eq!(second.info().region_id.as_deref(), Some("eu"));
}
