//! The relationship lifecycle: created → initial_copy → active ⇄ paused,
//! with error and removed as terminal phases. One task owns each running
//! relationship; pause and remove arrive over a single-consumer command
//! channel.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use redb_adapters::transform::TransformationClient;
use redb_adapters::AdapterRegistry;
use redb_types::errors::ResourceKind;
use redb_types::log::info;
use redb_types::models::{
    CdcStatus, Mapping, Relationship, RelationshipPhase, RelationshipType, TableEndpoint,
};
use redb_types::parking_lot::{Mutex, RwLock};
use redb_types::serde::{Deserialize, Serialize};
use redb_types::storage::MetadataStore;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::errors::EngineError;
use crate::pipeline::CdcEventRouter;

mod executor;
mod snapshot;

use executor::{cleanup_artifacts, RelationshipExecutor, StartMode};

pub(crate) enum Command {
    Pause {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Remove {
        force: bool,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

/// One record of the progress stream returned by `start`/`resume`. The
/// terminal record carries phase `active` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(crate = "redb_types::serde")]
pub struct ProgressEvent {
    pub phase: RelationshipPhase,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_copied: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ProgressEvent {
    pub(crate) fn message(phase: RelationshipPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            rows_copied: None,
            total_rows: None,
            error: None,
            errors: vec![],
        }
    }

    pub(crate) fn copied(rows_copied: u64, total_rows: u64) -> Self {
        Self {
            rows_copied: Some(rows_copied),
            total_rows: Some(total_rows),
            ..Self::message(RelationshipPhase::InitialCopy, "copying")
        }
    }

    pub(crate) fn failure(error: &EngineError) -> Self {
        Self {
            error: Some(error.kind_name().to_string()),
            errors: vec![error.to_string()],
            ..Self::message(RelationshipPhase::Error, error.to_string())
        }
    }
}

pub(crate) type RunningMap = Arc<Mutex<HashMap<String, mpsc::Sender<Command>>>>;

/// Owns the relationship state machine and the executor tasks behind it.
#[derive(Debug)]
pub struct RelationshipEngine {
    registry: Arc<AdapterRegistry>,
    store: Arc<dyn MetadataStore>,
    transform_client: Option<Arc<TransformationClient>>,
    mesh: RwLock<Option<(Arc<dyn CdcEventRouter>, u64)>>,
    running: RunningMap,
}

impl RelationshipEngine {
    pub fn new(registry: Arc<AdapterRegistry>, store: Arc<dyn MetadataStore>) -> Self {
        Self {
            registry,
            store,
            transform_client: None,
            mesh: RwLock::new(None),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_transform_client(mut self, client: TransformationClient) -> Self {
        self.transform_client = Some(Arc::new(client));
        self
    }

    /// Wires the mesh router in; targets anchored on other nodes are then
    /// reached through it instead of a local adapter connection.
    pub fn set_mesh_router(&self, router: Arc<dyn CdcEventRouter>, local_node_id: u64) {
        *self.mesh.write() = Some((router, local_node_id));
    }

    /// Creates a relationship from a mapping. Types other than
    /// `replication` are rejected here, not at start time.
    pub async fn add_relationship(
        &self,
        mapping_name: &str,
        relationship_type: RelationshipType,
    ) -> Result<Relationship, EngineError> {
        if relationship_type != RelationshipType::Replication {
            return Err(EngineError::UnsupportedRelationshipType(relationship_type));
        }
        let mapping = self
            .store
            .get_mapping_by_name(mapping_name)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(ResourceKind::Mapping, mapping_name.to_string())
            })?;
        let (source, target) = relationship_endpoints(&mapping)?;

        let relationship = Relationship {
            id: format!("rel_{}", uuid::Uuid::new_v4().simple()),
            mapping_id: mapping.id.clone(),
            relationship_type,
            source,
            target,
            phase: RelationshipPhase::Created,
            cdc_status: CdcStatus::Inactive,
            saved_position: None,
            errors: vec![],
            options: Default::default(),
            created_at: Utc::now(),
        };
        self.store.save_relationship(&relationship).await?;
        Ok(relationship)
    }

    /// Starts the initial copy and hands over to CDC, streaming progress.
    /// A second start for the same id observes the current phase instead of
    /// racing the first.
    pub async fn start(
        &self,
        id: &str,
        batch_size: Option<usize>,
        parallel_workers: Option<usize>,
    ) -> Result<ReceiverStream<ProgressEvent>, EngineError> {
        let mut relationship = self
            .store
            .get_relationship(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(ResourceKind::Relationship, id.to_string()))?;

        if let Some(batch_size) = batch_size {
            relationship.options.batch_size = batch_size.max(1);
        }
        if let Some(parallel_workers) = parallel_workers {
            relationship.options.parallel_workers = parallel_workers.max(1);
        }

        match relationship.phase {
            RelationshipPhase::Created | RelationshipPhase::Error => {}
            RelationshipPhase::InitialCopy | RelationshipPhase::Active => {
                return Ok(self.already_running_stream(&relationship));
            }
            RelationshipPhase::Paused => {
                return Err(EngineError::InvalidState(format!(
                    "relationship `{id}` is paused; resume it instead"
                )));
            }
            RelationshipPhase::Removed => {
                return Err(EngineError::InvalidState(format!(
                    "relationship `{id}` has been removed"
                )));
            }
        }

        self.store.save_relationship(&relationship).await?;
        self.spawn_executor(relationship, StartMode::Fresh).await
    }

    /// Reconnects replication at the saved position, optionally re-copying
    /// tables whose row counts diverged.
    pub async fn resume(
        &self,
        id: &str,
        skip_data_sync: bool,
    ) -> Result<ReceiverStream<ProgressEvent>, EngineError> {
        let relationship = self
            .store
            .get_relationship(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(ResourceKind::Relationship, id.to_string()))?;
        if relationship.phase != RelationshipPhase::Paused {
            return Err(EngineError::InvalidState(format!(
                "relationship `{id}` is {}, only paused relationships resume",
                relationship.phase
            )));
        }
        self.spawn_executor(relationship, StartMode::Resume { skip_data_sync })
            .await
    }

    /// Stops the CDC pipeline after a final checkpoint. Rejected during the
    /// initial copy.
    pub async fn pause(&self, id: &str) -> Result<(), EngineError> {
        let sender = self.running.lock().get(id).cloned().ok_or_else(|| {
            EngineError::InvalidState(format!("relationship `{id}` is not running"))
        })?;
        let (reply, response) = oneshot::channel();
        sender
            .send(Command::Pause { reply })
            .await
            .map_err(|_| EngineError::InvalidState(format!("relationship `{id}` just stopped")))?;
        response
            .await
            .map_err(|_| EngineError::InvalidState(format!("relationship `{id}` just stopped")))?
    }

    /// Stops CDC, drops engine-created adapter artifacts and deletes the
    /// record. Target data is never deleted. Valid from any phase.
    pub async fn remove(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let sender = self.running.lock().get(id).cloned();
        if let Some(sender) = sender {
            let (reply, response) = oneshot::channel();
            if sender.send(Command::Remove { force, reply }).await.is_ok() {
                return response.await.map_err(|_| {
                    EngineError::InvalidState(format!("relationship `{id}` just stopped"))
                })?;
            }
        }

        let relationship = self
            .store
            .get_relationship(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(ResourceKind::Relationship, id.to_string()))?;
        cleanup_artifacts(&self.registry, &self.store, &relationship, force).await?;
        self.store.delete_relationship(id).await?;
        info!("removed relationship `{id}`");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Relationship>, EngineError> {
        Ok(self.store.list_relationships().await?)
    }

    pub async fn show(&self, id: &str) -> Result<Relationship, EngineError> {
        self.store
            .get_relationship(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(ResourceKind::Relationship, id.to_string()))
    }

    fn already_running_stream(&self, relationship: &Relationship) -> ReceiverStream<ProgressEvent> {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(ProgressEvent::message(
            relationship.phase,
            "relationship already starting",
        ));
        ReceiverStream::new(rx)
    }

    async fn spawn_executor(
        &self,
        relationship: Relationship,
        mode: StartMode,
    ) -> Result<ReceiverStream<ProgressEvent>, EngineError> {
        let mapping = self
            .store
            .get_mapping(&relationship.mapping_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(ResourceKind::Mapping, relationship.mapping_id.clone())
            })?;

        let (progress_tx, progress_rx) = mpsc::channel(64);
        let (command_tx, command_rx) = mpsc::channel(8);
        {
            let mut running = self.running.lock();
            if running.contains_key(&relationship.id) {
                return Ok(self.already_running_stream(&relationship));
            }
            running.insert(relationship.id.clone(), command_tx);
        }

        let executor = RelationshipExecutor {
            registry: self.registry.clone(),
            store: self.store.clone(),
            transform_client: self.transform_client.clone(),
            mesh: self.mesh.read().clone(),
            running: self.running.clone(),
            relationship,
            mapping,
            mode,
            progress: Some(progress_tx),
            commands: command_rx,
        };
        tokio::spawn(executor.run());
        Ok(ReceiverStream::new(progress_rx))
    }
}

fn relationship_endpoints(
    mapping: &Mapping,
) -> Result<(TableEndpoint, TableEndpoint), EngineError> {
    let endpoint = |end: &redb_types::models::MappingEndpoint| match end {
        redb_types::models::MappingEndpoint::Table { database_id, table } => Ok(TableEndpoint {
            database_id: database_id.clone(),
            table: table.clone(),
        }),
        redb_types::models::MappingEndpoint::Database { database_id } => Ok(TableEndpoint {
            database_id: database_id.clone(),
            // Empty means every table of the database.
            table: String::new(),
        }),
        redb_types::models::MappingEndpoint::Stream { topic } => {
            Err(EngineError::InvalidState(format!(
                "stream endpoint `{topic}` cannot back a replication relationship"
            )))
        }
    };
    Ok((endpoint(&mapping.source)?, endpoint(&mapping.target)?))
}
