//! Initial bulk copy: restartable streamed reads from the source fanned out
//! to transform-and-write workers, with per-table cursors and progress
//! events. Also the divergence re-copy used by `resume(skip_data_sync =
//! false)`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use redb_adapters::interface::{
    Connection, DataOperator, SchemaOperator, StreamParams, TableIdentifier,
};
use redb_adapters::transform::{self, TransformationClient};
use redb_types::errors::DatabaseError;
use redb_types::log::{debug, info};
use redb_types::models::{JsonRow, TransformationRule};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinSet;

use crate::errors::EngineError;

use super::{Command, ProgressEvent};

pub(crate) struct CopySpec<'a> {
    pub source: &'a Connection,
    pub target: &'a Connection,
    pub tables: &'a [(TableIdentifier, TableIdentifier)],
    pub rules: Vec<TransformationRule>,
    pub client: Option<Arc<TransformationClient>>,
    pub batch_size: usize,
    pub parallel_workers: usize,
}

pub(crate) enum CopyControl {
    Completed,
    /// A remove command arrived mid-copy; the executor finishes it.
    Removed {
        force: bool,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

pub(crate) async fn run_initial_copy(
    spec: &CopySpec<'_>,
    progress: Option<&mpsc::Sender<ProgressEvent>>,
    commands: &mut mpsc::Receiver<Command>,
) -> Result<CopyControl, EngineError> {
    for (source_table, target_table) in spec.tables {
        if let Some(control) = copy_table(spec, source_table, target_table, progress, commands).await? {
            return Ok(control);
        }
    }
    Ok(CopyControl::Completed)
}

/// Re-runs the copy only for tables whose source/target row counts diverge
/// by more than 1% of the source count (any difference counts for tables
/// under a hundred rows).
pub(crate) async fn recopy_diverged(
    spec: &CopySpec<'_>,
    progress: Option<&mpsc::Sender<ProgressEvent>>,
    commands: &mut mpsc::Receiver<Command>,
) -> Result<CopyControl, EngineError> {
    for (source_table, target_table) in spec.tables {
        let source_rows = spec.source.data().get_row_count(source_table, None).await?;
        let target_rows = spec.target.data().get_row_count(target_table, None).await?;
        let delta = source_rows.abs_diff(target_rows);
        if delta <= source_rows / 100 {
            continue;
        }
        info!(
            "re-copying `{source_table}`: source has {source_rows} rows, target {target_rows}"
        );
        if let Some(control) = copy_table(spec, source_table, target_table, progress, commands).await? {
            return Ok(control);
        }
    }
    Ok(CopyControl::Completed)
}

/// One table: a reader walks the stream cursor chain; up to
/// `parallel_workers` workers transform and write the batches.
async fn copy_table(
    spec: &CopySpec<'_>,
    source_table: &TableIdentifier,
    target_table: &TableIdentifier,
    progress: Option<&mpsc::Sender<ProgressEvent>>,
    commands: &mut mpsc::Receiver<Command>,
) -> Result<Option<CopyControl>, EngineError> {
    let total_rows = spec.source.data().get_row_count(source_table, None).await?;
    let key_columns: Vec<String> = match spec.source.schema().get_table_schema(source_table).await
    {
        Ok(schema) => schema
            .primary_key_columns()
            .into_iter()
            .map(str::to_string)
            .collect(),
        // Without schema discovery there is no key; fall back to inserts.
        Err(_) => vec![],
    };

    let copied = Arc::new(AtomicU64::new(0));
    let (batch_tx, batch_rx) = mpsc::channel::<Vec<JsonRow>>(spec.parallel_workers.max(1));
    let batch_rx = Arc::new(Mutex::new(batch_rx));
    let (stop_tx, _) = watch::channel(false);

    let mut workers: JoinSet<Result<(), EngineError>> = JoinSet::new();
    for _ in 0..spec.parallel_workers.max(1) {
        let batch_rx = batch_rx.clone();
        let target = spec.target.clone();
        let target_table = target_table.clone();
        let rules = spec.rules.clone();
        let client = spec.client.clone();
        let key_columns = key_columns.clone();
        let copied = copied.clone();
        let mut stop_rx = stop_tx.subscribe();
        workers.spawn(async move {
            loop {
                let batch = {
                    let mut rx = batch_rx.lock().await;
                    tokio::select! {
                        batch = rx.recv() => batch,
                        _ = stop_rx.changed() => return Ok(()),
                    }
                };
                let Some(batch) = batch else {
                    return Ok(());
                };
                let mut rows = Vec::with_capacity(batch.len());
                for row in batch {
                    let row = transform::apply_rules(row, &rules, client.as_deref())
                        .await
                        .map_err(|kind| {
                            DatabaseError::new(
                                target.database_type().as_str(),
                                "transform_data",
                                kind,
                            )
                        })?;
                    rows.push(row);
                }
                if key_columns.is_empty() {
                    target.data().insert(&target_table, &rows).await?;
                } else {
                    target.data().upsert(&target_table, &key_columns, &rows).await?;
                }
                copied.fetch_add(rows.len() as u64, Ordering::SeqCst);
            }
        });
    }

    let mut cursor: Option<String> = None;
    let mut removed: Option<CopyControl> = None;
    loop {
        // Commands are honored at batch boundaries: remove stops the copy,
        // pause is rejected outright.
        match commands.try_recv() {
            Ok(Command::Pause { reply }) => {
                let _ = reply.send(Err(EngineError::InvalidState(
                    "initial copy cannot be paused".to_string(),
                )));
            }
            Ok(Command::Remove { force, reply }) => {
                removed = Some(CopyControl::Removed { force, reply });
                break;
            }
            Err(_) => {}
        }

        let params = StreamParams {
            table: source_table.clone(),
            columns: None,
            batch_size: spec.batch_size.max(1),
            cursor: cursor.take(),
        };
        let result = spec.source.data().stream(&params).await?;
        if !result.batch.is_empty() && batch_tx.send(result.batch).await.is_err() {
            break;
        }
        if let Some(sender) = progress {
            let _ = sender
                .send(ProgressEvent::copied(
                    copied.load(Ordering::SeqCst),
                    total_rows,
                ))
                .await;
        }
        if !result.has_more {
            break;
        }
        cursor = result.next_cursor;
    }

    if removed.is_some() {
        stop_tx.send_replace(true);
    }
    drop(batch_tx);
    while let Some(joined) = workers.join_next().await {
        joined.map_err(|e| EngineError::PipelineHalted(format!("copy worker panicked: {e}")))??;
    }

    if removed.is_none() {
        debug!(
            "copied {} of {total_rows} rows into `{target_table}`",
            copied.load(Ordering::SeqCst)
        );
        if let Some(sender) = progress {
            let _ = sender
                .send(ProgressEvent::copied(
                    copied.load(Ordering::SeqCst),
                    total_rows,
                ))
                .await;
        }
    }
    Ok(removed)
}
