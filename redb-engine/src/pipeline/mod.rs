//! The per-relationship CDC pipeline: produce → transform → apply.
//!
//! A bounded channel between the replication source task and the pipeline
//! loop is the in-flight window; when it fills, the source stalls and the
//! database applies its native back-pressure. Events from one source are
//! applied in arrival order; only adjacent inserts may be coalesced into a
//! batched apply when the target offers a batch path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redb_adapters::interface::{
    Connection, DataOperator, RawEvent, ReplicationOperator, ReplicationSource, TableIdentifier,
};
use redb_adapters::transform::TransformationClient;
use redb_types::async_trait::async_trait;
use redb_types::errors::DatabaseError;
use redb_types::log::{debug, error, warn};
use redb_types::models::{
    CdcEvent, CdcOperation, CdcStatistics, JsonRow, ParsePolicy, RelationshipOptions,
    TransformationRule,
};
use redb_types::parking_lot::Mutex;
use redb_types::storage::MetadataStore;
use tokio::sync::{mpsc, watch};

use crate::errors::EngineError;

const MAX_INSERT_BATCH: usize = 64;

/// Hand-off point for events whose target lives on another node. The mesh
/// router implements this; the pipeline stays transport-agnostic.
#[async_trait]
pub trait CdcEventRouter: Send + Sync + std::fmt::Debug {
    async fn route(&self, event: CdcEvent) -> Result<(), DatabaseError>;
}

/// Where applied events land: the local adapter connection, or a mesh route
/// tagged with source and target node ids.
#[derive(Debug, Clone)]
pub enum ApplyTarget {
    Local(Connection),
    Remote {
        router: Arc<dyn CdcEventRouter>,
        source_node: u64,
        target_node: u64,
        /// Database id the anchoring node applies into.
        target_database: String,
    },
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub window_size: usize,
    pub checkpoint_interval: Duration,
    pub parse_policy: ParsePolicy,
    pub max_apply_retries: u32,
    pub retry_base_delay: Duration,
    pub batch_inserts: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from(&RelationshipOptions::default())
    }
}

impl From<&RelationshipOptions> for PipelineOptions {
    fn from(options: &RelationshipOptions) -> Self {
        Self {
            window_size: options.window_size.max(1),
            checkpoint_interval: Duration::from_secs(options.checkpoint_interval_secs.max(1)),
            parse_policy: options.parse_policy,
            max_apply_retries: options.max_apply_retries,
            retry_base_delay: Duration::from_millis(options.retry_base_delay_ms.max(1)),
            batch_inserts: true,
        }
    }
}

pub struct CdcPipeline {
    relationship_id: String,
    replication: Arc<dyn ReplicationOperator>,
    source: Arc<dyn ReplicationSource>,
    target: ApplyTarget,
    /// Source table name → target table name.
    table_map: HashMap<String, String>,
    rules: Vec<TransformationRule>,
    transform_client: Option<Arc<TransformationClient>>,
    store: Arc<dyn MetadataStore>,
    statistics: Arc<Mutex<CdcStatistics>>,
    options: PipelineOptions,
    /// Last applied position; seeded with the start position so a stop
    /// before the first event still checkpoints correctly.
    position: Option<String>,
}

impl CdcPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        relationship_id: impl Into<String>,
        replication: Arc<dyn ReplicationOperator>,
        source: Arc<dyn ReplicationSource>,
        target: ApplyTarget,
        table_map: HashMap<String, String>,
        rules: Vec<TransformationRule>,
        transform_client: Option<Arc<TransformationClient>>,
        store: Arc<dyn MetadataStore>,
        options: PipelineOptions,
    ) -> Self {
        let position = source.get_position();
        Self {
            relationship_id: relationship_id.into(),
            replication,
            source,
            target,
            table_map,
            rules,
            transform_client,
            store,
            statistics: Arc::new(Mutex::new(CdcStatistics::default())),
            options,
            position,
        }
    }

    pub fn statistics_handle(&self) -> Arc<Mutex<CdcStatistics>> {
        self.statistics.clone()
    }

    /// Runs until the shutdown signal flips, the source ends, or the retry
    /// budget is exhausted. A final synchronous checkpoint runs on every
    /// graceful path; on failure the last saved position is preserved.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        let (tx, mut rx) = mpsc::channel::<RawEvent>(self.options.window_size);
        let producer = {
            let source = self.source.clone();
            tokio::spawn(async move { source.start(tx).await })
        };

        let mut checkpoint_timer = tokio::time::interval(self.options.checkpoint_interval);
        checkpoint_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut dirty = false;

        let outcome = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
                _ = checkpoint_timer.tick() => {
                    if dirty {
                        if let Err(e) = self.checkpoint().await {
                            warn!("[{}] checkpoint failed: {e}", self.relationship_id);
                        } else {
                            dirty = false;
                        }
                    }
                }
                raw = rx.recv() => {
                    let Some(raw) = raw else {
                        debug!("[{}] replication source ended", self.relationship_id);
                        break Ok(());
                    };
                    match self.process(raw, &mut rx).await {
                        Ok(applied) => dirty = dirty || applied,
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        // Stop the producer and force a final synchronous checkpoint so a
        // later resume replays nothing that was already applied.
        if let Err(e) = self.source.stop().await {
            warn!("[{}] source stop failed: {e}", self.relationship_id);
        }
        drop(rx);
        if let Err(e) = producer.await.unwrap_or(Ok(())) {
            warn!("[{}] replication source task failed: {e}", self.relationship_id);
        }
        if let Err(e) = self.checkpoint().await {
            warn!("[{}] final checkpoint failed: {e}", self.relationship_id);
        }

        outcome
    }

    /// Handles one raw event, opportunistically coalescing adjacent inserts
    /// already sitting in the window. Returns whether anything was applied.
    async fn process(
        &mut self,
        raw: RawEvent,
        rx: &mut mpsc::Receiver<RawEvent>,
    ) -> Result<bool, EngineError> {
        let Some(first) = self.prepare(raw).await? else {
            return Ok(false);
        };

        let batchable = self.options.batch_inserts
            && first.operation == CdcOperation::Insert
            && self.local_batch_target().is_some();
        if !batchable {
            self.apply_with_retry(&first).await?;
            self.record(&first);
            return Ok(true);
        }

        let mut batch = vec![first];
        let mut tail: Option<CdcEvent> = None;
        while batch.len() < MAX_INSERT_BATCH {
            match rx.try_recv() {
                Ok(raw) => match self.prepare(raw).await? {
                    Some(event) if event.operation == CdcOperation::Insert => batch.push(event),
                    Some(event) => {
                        tail = Some(event);
                        break;
                    }
                    None => continue,
                },
                Err(_) => break,
            }
        }

        self.apply_insert_batch(&batch).await?;
        for event in &batch {
            self.record(event);
        }
        if let Some(event) = tail {
            self.apply_with_retry(&event).await?;
            self.record(&event);
        }
        Ok(true)
    }

    /// Parse → validate → transform → retarget. `None` means the event was
    /// dropped under the at-least-once parse policy.
    async fn prepare(&self, raw: RawEvent) -> Result<Option<CdcEvent>, EngineError> {
        let parsed = self
            .replication
            .parse_event(&raw)
            .and_then(|event| match event.validate() {
                Ok(()) => Ok(event),
                Err(kind) => Err(DatabaseError::new(
                    self.replication.database_type().as_str(),
                    "replication.parse_event",
                    kind,
                )),
            });
        let mut event = match parsed {
            Ok(event) => event,
            Err(e) => {
                self.statistics.lock().record_failure();
                return match self.options.parse_policy {
                    ParsePolicy::DropMalformed => {
                        warn!("[{}] dropping malformed event: {e}", self.relationship_id);
                        Ok(None)
                    }
                    ParsePolicy::Halt => {
                        error!("[{}] malformed event halted pipeline: {e}", self.relationship_id);
                        Err(e.into())
                    }
                };
            }
        };

        if let Some(data) = event.data.take() {
            let transformed = self
                .transform_with_retry(data)
                .await?;
            event.data = Some(transformed);
        }
        if let Some(target) = self.table_map.get(&event.table_name) {
            event.table_name = target.clone();
            // The source-side schema name has no meaning on the target.
            event.schema_name = None;
        }
        Ok(Some(event))
    }

    async fn transform_with_retry(&self, data: JsonRow) -> Result<JsonRow, EngineError> {
        let mut attempt = 0;
        loop {
            let result = self
                .replication
                .transform_data(
                    data.clone(),
                    &self.rules,
                    self.transform_client.as_deref(),
                )
                .await;
            match result {
                Ok(row) => return Ok(row),
                Err(e) if e.is_transient() && attempt < self.options.max_apply_retries => {
                    attempt += 1;
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn apply_with_retry(&self, event: &CdcEvent) -> Result<(), EngineError> {
        let mut attempt = 0;
        loop {
            match self.apply(event).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.options.max_apply_retries => {
                    attempt += 1;
                    warn!(
                        "[{}] transient apply failure (attempt {attempt}): {e}",
                        self.relationship_id
                    );
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn apply(&self, event: &CdcEvent) -> Result<(), DatabaseError> {
        match &self.target {
            ApplyTarget::Local(connection) => {
                connection.replication().apply_cdc_event(event).await
            }
            ApplyTarget::Remote {
                router,
                source_node,
                target_node,
                target_database,
            } => {
                let mut event = event.clone();
                event.source_node = Some(*source_node);
                event.target_node = Some(*target_node);
                event.metadata.insert(
                    "target_database".to_string(),
                    redb_types::serde_json::Value::String(target_database.clone()),
                );
                router.route(event).await
            }
        }
    }

    fn local_batch_target(&self) -> Option<&Connection> {
        match &self.target {
            ApplyTarget::Local(connection)
                if redb_adapters::capabilities_for(connection.database_type()).batch_apply =>
            {
                Some(connection)
            }
            _ => None,
        }
    }

    /// Applies a run of adjacent inserts through the target's batch path,
    /// grouped per table in encounter order.
    async fn apply_insert_batch(&self, batch: &[CdcEvent]) -> Result<(), EngineError> {
        let Some(connection) = self.local_batch_target() else {
            for event in batch {
                self.apply_with_retry(event).await?;
            }
            return Ok(());
        };

        let mut groups: Vec<(String, Vec<JsonRow>)> = Vec::new();
        for event in batch {
            let row = event.data.clone().unwrap_or_default();
            match groups.last_mut() {
                Some((table, rows)) if *table == event.table_name => rows.push(row),
                _ => groups.push((event.table_name.clone(), vec![row])),
            }
        }

        for (table, rows) in groups {
            let table = TableIdentifier::new(table);
            let mut attempt = 0;
            loop {
                match connection.data().insert(&table, &rows).await {
                    Ok(_) => break,
                    Err(e) if e.is_transient() && attempt < self.options.max_apply_retries => {
                        attempt += 1;
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    fn record(&mut self, event: &CdcEvent) {
        // Clock skew can make this negative; count it as zero lag then.
        let latency = (chrono::Utc::now() - event.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let position = event.lsn.as_deref();
        self.statistics.lock().record_event(
            event.operation,
            event.payload_bytes(),
            latency,
            position,
        );
        if let Some(position) = &event.lsn {
            self.position = Some(position.clone());
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(8);
        (self.options.retry_base_delay * factor).min(Duration::from_secs(10))
    }

    /// Durable checkpoint: adapter-side first, then the metadata store, then
    /// a statistics snapshot.
    async fn checkpoint(&self) -> Result<(), EngineError> {
        let Some(position) = self.position.clone() else {
            return Ok(());
        };
        self.source.save_checkpoint(&position).await?;
        self.store
            .save_position(&self.relationship_id, &position)
            .await?;
        let snapshot = self.statistics.lock().clone();
        self.store
            .save_statistics(&self.relationship_id, &snapshot)
            .await?;
        Ok(())
    }

    pub fn position(&self) -> Option<&str> {
        self.position.as_deref()
    }
}

impl std::fmt::Debug for CdcPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdcPipeline")
            .field("relationship_id", &self.relationship_id)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}
