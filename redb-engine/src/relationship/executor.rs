use std::collections::HashMap;
use std::sync::Arc;

use redb_adapters::interface::{
    Connection, ReplicationConfig, SchemaOperator, TableIdentifier,
};
use redb_adapters::transform::TransformationClient;
use redb_adapters::AdapterRegistry;
use redb_types::errors::{DatabaseError, ErrorKind, ResourceKind};
use redb_types::log::{info, warn};
use redb_types::models::{
    CdcStatus, Mapping, Relationship, RelationshipPhase,
};
use redb_types::storage::MetadataStore;
use tokio::sync::{mpsc, watch};

use crate::errors::EngineError;
use crate::pipeline::{ApplyTarget, CdcEventRouter, CdcPipeline, PipelineOptions};

use super::snapshot::{self, CopyControl, CopySpec};
use super::{Command, ProgressEvent, RunningMap};

#[derive(Debug, Clone, Copy)]
pub(crate) enum StartMode {
    Fresh,
    Resume { skip_data_sync: bool },
}

pub(crate) struct RelationshipExecutor {
    pub(crate) registry: Arc<AdapterRegistry>,
    pub(crate) store: Arc<dyn MetadataStore>,
    pub(crate) transform_client: Option<Arc<TransformationClient>>,
    pub(crate) mesh: Option<(Arc<dyn CdcEventRouter>, u64)>,
    pub(crate) running: RunningMap,
    pub(crate) relationship: Relationship,
    pub(crate) mapping: Mapping,
    pub(crate) mode: StartMode,
    pub(crate) progress: Option<mpsc::Sender<ProgressEvent>>,
    pub(crate) commands: mpsc::Receiver<Command>,
}

/// Replication slot names must be lowercase alphanumerics and underscores.
pub(crate) fn slot_name(relationship_id: &str) -> String {
    let mut name = String::with_capacity(relationship_id.len() + 5);
    name.push_str("redb_");
    for c in relationship_id.chars() {
        name.push(match c {
            'a'..='z' | '0'..='9' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        });
    }
    name
}

/// Drops the adapter-side artifacts the engine created for a relationship.
/// With `force`, non-fatal cleanup errors are logged and skipped.
pub(crate) async fn cleanup_artifacts(
    registry: &Arc<AdapterRegistry>,
    store: &Arc<dyn MetadataStore>,
    relationship: &Relationship,
    force: bool,
) -> Result<(), EngineError> {
    let Some(config) = store
        .get_connection_config(&relationship.source.database_id)
        .await?
    else {
        // Source connection already deleted; nothing left to clean.
        return Ok(());
    };
    let connection = match registry.connect(&config).await {
        Ok(connection) => connection,
        Err(e) if force => {
            warn!("skipping artifact cleanup, source unreachable: {e}");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let replication = connection.replication();
    if !replication.is_supported() {
        return Ok(());
    }
    let slot = slot_name(&relationship.id);
    if let Err(e) = replication.drop_slot(&slot).await {
        let missing = matches!(e.kind, ErrorKind::NotFound(_, _));
        if !missing && !force {
            return Err(e.into());
        }
        if !missing {
            warn!("skipping slot cleanup for `{slot}`: {e}");
        }
    }
    Ok(())
}

impl RelationshipExecutor {
    pub(crate) async fn run(mut self) {
        let id = self.relationship.id.clone();
        if let Err(e) = self.drive().await {
            warn!("[{id}] relationship failed: {e}");
            if let Ok(Some(mut relationship)) = self.store.get_relationship(&id).await {
                relationship.record_error(e.to_string());
                let _ = self.store.save_relationship(&relationship).await;
            }
            self.emit(ProgressEvent::failure(&e)).await;
        }
        self.running.lock().remove(&id);
    }

    async fn emit(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(event).await;
        }
    }

    async fn set_phase(
        &mut self,
        phase: RelationshipPhase,
        cdc_status: CdcStatus,
    ) -> Result<(), EngineError> {
        // Reload first: the pipeline writes positions under this id.
        let mut relationship = self
            .store
            .get_relationship(&self.relationship.id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(ResourceKind::Relationship, self.relationship.id.clone())
            })?;
        relationship.phase = phase;
        relationship.cdc_status = cdc_status;
        relationship.options = self.relationship.options.clone();
        self.store.save_relationship(&relationship).await?;
        self.relationship = relationship;
        Ok(())
    }

    async fn connect_endpoint(&self, database_id: &str) -> Result<Connection, EngineError> {
        let config = self
            .store
            .get_connection_config(database_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(ResourceKind::Database, database_id.to_string())
            })?;
        Ok(self.registry.connect(&config).await?)
    }

    /// The table pairs this relationship moves: one pair for table scope,
    /// every source table for database scope.
    async fn table_pairs(
        &self,
        source: &Connection,
    ) -> Result<Vec<(TableIdentifier, TableIdentifier)>, EngineError> {
        if !self.relationship.source.table.is_empty() {
            return Ok(vec![(
                TableIdentifier::new(self.relationship.source.table.clone()),
                TableIdentifier::new(if self.relationship.target.table.is_empty() {
                    self.relationship.source.table.clone()
                } else {
                    self.relationship.target.table.clone()
                }),
            )]);
        }
        let tables = source.schema().list_tables().await?;
        Ok(tables
            .into_iter()
            .map(|table| {
                let target = TableIdentifier::new(table.name.clone());
                (table, target)
            })
            .collect())
    }

    async fn drive(&mut self) -> Result<(), EngineError> {
        let id = self.relationship.id.clone();
        self.emit(ProgressEvent::message(
            self.relationship.phase,
            "validating mapping and endpoints",
        ))
        .await;

        self.mapping
            .validate()
            .map_err(|kind| EngineError::InvalidState(kind.to_string()))?;

        let source = self.connect_endpoint(&self.relationship.source.database_id).await?;
        let target = self.connect_endpoint(&self.relationship.target.database_id).await?;
        let target_config = target.config().clone();

        let replication = source.replication().clone();
        if !replication.is_supported() {
            return Err(DatabaseError::unsupported(
                source.database_type(),
                "replication.start",
            )
            .into());
        }
        replication.check_prerequisites().await?;

        let tables = self.table_pairs(&source).await?;
        let table_map: HashMap<String, String> = tables
            .iter()
            .map(|(s, t)| (s.name.clone(), t.name.clone()))
            .collect();

        let start_position = match self.mode {
            StartMode::Fresh => {
                // Snapshot point first, copy second: changes made during the
                // copy are replayed by CDC, never lost.
                let snapshot_position = replication.current_position().await?;
                self.set_phase(RelationshipPhase::InitialCopy, CdcStatus::Inactive)
                    .await?;
                self.store.save_position(&id, &snapshot_position).await?;

                let spec = CopySpec {
                    source: &source,
                    target: &target,
                    tables: &tables,
                    rules: self.mapping.rules.clone(),
                    client: self.transform_client.clone(),
                    batch_size: self.relationship.options.batch_size,
                    parallel_workers: self.relationship.options.parallel_workers,
                };
                match snapshot::run_initial_copy(
                    &spec,
                    self.progress.as_ref(),
                    &mut self.commands,
                )
                .await?
                {
                    CopyControl::Completed => {}
                    CopyControl::Removed { force, reply } => {
                        let result = self.finish_remove(force).await;
                        let _ = reply.send(result);
                        return Ok(());
                    }
                }
                snapshot_position
            }
            StartMode::Resume { skip_data_sync } => {
                if !skip_data_sync {
                    let spec = CopySpec {
                        source: &source,
                        target: &target,
                        tables: &tables,
                        rules: self.mapping.rules.clone(),
                        client: self.transform_client.clone(),
                        batch_size: self.relationship.options.batch_size,
                        parallel_workers: self.relationship.options.parallel_workers,
                    };
                    if let CopyControl::Removed { force, reply } = snapshot::recopy_diverged(
                        &spec,
                        self.progress.as_ref(),
                        &mut self.commands,
                    )
                    .await?
                    {
                        let result = self.finish_remove(force).await;
                        let _ = reply.send(result);
                        return Ok(());
                    }
                }
                match &self.relationship.saved_position {
                    Some(position) => position.clone(),
                    None => replication.current_position().await?,
                }
            }
        };

        let mut replication_config = ReplicationConfig::new(id.as_str(), slot_name(&id));
        replication_config.start_position = Some(start_position);
        replication_config.tables = tables.iter().map(|(s, _)| s.clone()).collect();
        let feed = replication.connect(&replication_config).await?;

        let apply_target = self.apply_target(&target, &target_config);
        let pipeline = CdcPipeline::new(
            id.as_str(),
            replication.clone(),
            feed.clone(),
            apply_target,
            table_map,
            self.mapping.rules.clone(),
            self.transform_client.clone(),
            self.store.clone(),
            PipelineOptions::from(&self.relationship.options),
        );

        self.set_phase(RelationshipPhase::Active, CdcStatus::Running)
            .await?;
        // Terminal progress record; the stream ends here for the client.
        self.emit(ProgressEvent::message(
            RelationshipPhase::Active,
            "initial copy complete, cdc running",
        ))
        .await;
        self.progress = None;
        info!("[{id}] cdc pipeline active");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut pipeline_task = tokio::spawn(pipeline.run(shutdown_rx));

        loop {
            tokio::select! {
                result = &mut pipeline_task => {
                    let result = result.unwrap_or_else(|e| {
                        Err(EngineError::PipelineHalted(format!("pipeline task panicked: {e}")))
                    });
                    result?;
                    // The source ended on its own; leave the relationship
                    // resumable from the checkpointed position.
                    self.set_phase(RelationshipPhase::Paused, CdcStatus::Stopped).await?;
                    return Ok(());
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        continue;
                    };
                    shutdown_tx.send_replace(true);
                    let result = (&mut pipeline_task).await.unwrap_or_else(|e| {
                        Err(EngineError::PipelineHalted(format!("pipeline task panicked: {e}")))
                    });
                    match command {
                        Command::Pause { reply } => {
                            let outcome = match result {
                                Ok(()) => {
                                    if let Err(e) = feed.close().await {
                                        warn!("[{id}] source close failed: {e}");
                                    }
                                    self.set_phase(RelationshipPhase::Paused, CdcStatus::Stopped)
                                        .await
                                }
                                Err(e) => Err(e),
                            };
                            let failed = outcome.is_err();
                            let _ = reply.send(outcome);
                            if failed {
                                return Err(EngineError::InvalidState(format!(
                                    "relationship `{id}` failed while pausing"
                                )));
                            }
                            info!("[{id}] paused");
                            return Ok(());
                        }
                        Command::Remove { force, reply } => {
                            if let Err(e) = result {
                                warn!("[{id}] pipeline error during removal: {e}");
                            }
                            if let Err(e) = feed.close().await {
                                warn!("[{id}] source close failed: {e}");
                            }
                            let outcome = self.finish_remove(force).await;
                            let _ = reply.send(outcome);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn apply_target(&self, target: &Connection, config: &redb_types::models::ConnectionConfig) -> ApplyTarget {
        if let (Some((router, local_node)), Some(anchor)) = (
            &self.mesh,
            config.options.get("anchor_node").and_then(|v| v.parse::<u64>().ok()),
        ) {
            if anchor != *local_node {
                return ApplyTarget::Remote {
                    router: router.clone(),
                    source_node: *local_node,
                    target_node: anchor,
                    target_database: self.relationship.target.database_id.clone(),
                };
            }
        }
        ApplyTarget::Local(target.clone())
    }

    async fn finish_remove(&mut self, force: bool) -> Result<(), EngineError> {
        let id = self.relationship.id.clone();
        cleanup_artifacts(&self.registry, &self.store, &self.relationship, force).await?;
        self.set_phase(RelationshipPhase::Removed, CdcStatus::Stopped)
            .await?;
        self.store.delete_relationship(&id).await?;
        info!("removed relationship `{id}`");
        Ok(())
    }
}
