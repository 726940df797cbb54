use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use redb_types::errors::{DatabaseError, ErrorKind};
use redb_types::log::warn;
use redb_types::models::{CdcEvent, CdcOperation, JsonRow};
use redb_types::parking_lot::RwLock;
use redb_types::serde_json;
use tokio::sync::{mpsc, watch, Notify};

use crate::interface::{
    Publication, RawEvent, ReplicationConfig, ReplicationMechanism, ReplicationOperator,
    ReplicationSlot, ReplicationSource, ReplicationStatus,
};

use super::{err, project, MemoryDatabase, TYPE};

/// Append-only change log. Positions are 1-based sequence numbers rendered
/// as decimal strings; position `p` means "`p` events consumed".
#[derive(Debug, Default)]
pub(crate) struct ReplicationLog {
    entries: RwLock<Vec<CdcEvent>>,
    notify: Notify,
}

impl ReplicationLog {
    pub(crate) fn append(&self, mut event: CdcEvent) {
        let mut entries = self.entries.write();
        event.lsn = Some((entries.len() as u64 + 1).to_string());
        entries.push(event);
        drop(entries);
        self.notify.notify_waiters();
    }

    fn len(&self) -> u64 {
        self.entries.read().len() as u64
    }

    fn read_from(&self, position: u64, limit: usize) -> Vec<CdcEvent> {
        let entries = self.entries.read();
        entries
            .iter()
            .skip(position as usize)
            .take(limit)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct MemoryReplication {
    database: Arc<MemoryDatabase>,
}

impl MemoryReplication {
    pub(crate) fn new(database: Arc<MemoryDatabase>) -> Self {
        Self { database }
    }
}

#[async_trait]
impl ReplicationOperator for MemoryReplication {
    fn database_type(&self) -> redb_types::models::DatabaseType {
        TYPE
    }

    fn is_supported(&self) -> bool {
        true
    }

    fn supported_mechanisms(&self) -> Vec<ReplicationMechanism> {
        vec![ReplicationMechanism::EventLog]
    }

    async fn check_prerequisites(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn current_position(&self) -> Result<String, DatabaseError> {
        Ok(self.database.log.len().to_string())
    }

    async fn connect(
        &self,
        config: &ReplicationConfig,
    ) -> Result<Arc<dyn ReplicationSource>, DatabaseError> {
        let position = match &config.start_position {
            Some(position) => position.parse::<u64>().map_err(|_| {
                err(
                    "replication.connect",
                    ErrorKind::InvalidConfiguration(format!(
                        "malformed start position `{position}`"
                    )),
                )
            })?,
            None => self.database.log.len(),
        };
        Ok(Arc::new(MemoryReplicationSource::new(
            self.database.clone(),
            config.slot_name.clone(),
            position,
        )))
    }

    fn parse_event(&self, raw: &RawEvent) -> Result<CdcEvent, DatabaseError> {
        serde_json::from_value(raw.payload.clone()).map_err(|e| {
            err(
                "replication.parse_event",
                ErrorKind::InvalidQuery(format!("malformed change record: {e}")),
            )
        })
    }

    async fn apply_cdc_event(&self, event: &CdcEvent) -> Result<(), DatabaseError> {
        match event.operation {
            CdcOperation::Insert => {
                let data = event.data.clone().unwrap_or_default();
                self.database.insert_rows(&event.table_name, &[data])?;
            }
            CdcOperation::Update => {
                let data = event.data.clone().unwrap_or_default();
                let filter = self.apply_filter(event, &data);
                self.database.update_rows(&event.table_name, &data, &filter)?;
            }
            CdcOperation::Delete => {
                let filter = event.old_data.clone().unwrap_or_default();
                self.database.delete_rows(&event.table_name, &filter)?;
            }
            CdcOperation::Truncate => {
                self.database.truncate_table(&event.table_name)?;
            }
        }
        Ok(())
    }

    async fn list_slots(&self) -> Result<Vec<ReplicationSlot>, DatabaseError> {
        Ok(self
            .database
            .checkpoints
            .read()
            .iter()
            .map(|(name, position)| ReplicationSlot {
                name: name.clone(),
                plugin: Some("event-log".to_string()),
                active: false,
                position: Some(position.clone()),
            })
            .collect())
    }

    async fn drop_slot(&self, name: &str) -> Result<(), DatabaseError> {
        self.database.checkpoints.write().remove(name);
        Ok(())
    }

    async fn list_publications(&self) -> Result<Vec<Publication>, DatabaseError> {
        Ok(vec![])
    }

    async fn drop_publication(&self, _name: &str) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn replication_status(
        &self,
        slot_name: &str,
    ) -> Result<ReplicationStatus, DatabaseError> {
        let checkpoints = self.database.checkpoints.read();
        let position = checkpoints.get(slot_name).cloned();
        let consumed = position
            .as_deref()
            .and_then(|p| p.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(ReplicationStatus {
            active: false,
            position,
            lag_bytes: Some(self.database.log.len().saturating_sub(consumed)),
        })
    }

    fn compare_positions(&self, left: &str, right: &str) -> Option<Ordering> {
        let left = left.parse::<u64>().ok()?;
        let right = right.parse::<u64>().ok()?;
        Some(left.cmp(&right))
    }
}

impl MemoryReplication {
    /// Row filter for an update: previous values when the event carries
    /// them, otherwise the primary-key projection of the new values.
    fn apply_filter(&self, event: &CdcEvent, data: &JsonRow) -> JsonRow {
        if let Some(old) = &event.old_data {
            if !old.is_empty() {
                return old.clone();
            }
        }
        let key = self.database.primary_key_of(&event.table_name);
        if key.is_empty() {
            data.clone()
        } else {
            project(data, &key)
        }
    }
}

/// Live feed over a database's change log. Producing is driven by `start`;
/// `stop`/`close` settle the feed and are safe to repeat.
#[derive(Debug)]
pub struct MemoryReplicationSource {
    database: Arc<MemoryDatabase>,
    slot: String,
    position: AtomicU64,
    active: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl MemoryReplicationSource {
    fn new(database: Arc<MemoryDatabase>, slot: String, position: u64) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            database,
            slot,
            position: AtomicU64::new(position),
            active: AtomicBool::new(false),
            stop_tx,
        }
    }
}

#[async_trait]
impl ReplicationSource for MemoryReplicationSource {
    async fn start(&self, sender: mpsc::Sender<RawEvent>) -> Result<(), DatabaseError> {
        if self.active.swap(true, AtomicOrdering::SeqCst) {
            return Ok(());
        }
        self.stop_tx.send_replace(false);
        let mut stop_rx = self.stop_tx.subscribe();

        'produce: while !*stop_rx.borrow() {
            // Register for wakeups before reading so appends between the
            // read and the await are not missed.
            let notified = self.database.log.notify.notified();
            let from = self.position.load(AtomicOrdering::SeqCst);
            let batch = self.database.log.read_from(from, 256);
            if batch.is_empty() {
                tokio::select! {
                    _ = notified => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break 'produce;
                        }
                    }
                }
                continue;
            }
            for event in batch {
                let position = event.lsn.clone();
                let payload = serde_json::to_value(&event).map_err(|e| {
                    err(
                        "replication.start",
                        ErrorKind::InvalidQuery(format!("unencodable change record: {e}")),
                    )
                })?;
                if sender.send(RawEvent { payload, position }).await.is_err() {
                    // Pipeline went away; settle and wait for a restart.
                    break 'produce;
                }
                self.position.fetch_add(1, AtomicOrdering::SeqCst);
            }
        }

        self.active.store(false, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), DatabaseError> {
        self.stop_tx.send_replace(true);
        self.database.log.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), DatabaseError> {
        self.stop().await
    }

    fn get_position(&self) -> Option<String> {
        Some(self.position.load(AtomicOrdering::SeqCst).to_string())
    }

    fn set_position(&self, position: &str) {
        match position.parse::<u64>() {
            Ok(parsed) => self.position.store(parsed, AtomicOrdering::SeqCst),
            Err(_) => warn!("ignoring malformed memory position `{position}`"),
        }
    }

    async fn save_checkpoint(&self, position: &str) -> Result<(), DatabaseError> {
        self.database
            .checkpoints
            .write()
            .insert(self.slot.clone(), position.to_string());
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(AtomicOrdering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{config, user, users_model};
    use super::*;
    use crate::interface::{DatabaseAdapter, TableIdentifier};
    use super::super::MemoryAdapter;
    use std::time::Duration;

    async fn replicating_connection() -> crate::interface::Connection {
        let adapter = MemoryAdapter::new();
        let connection = adapter.connect(&config("cdc")).await.unwrap();
        connection
            .schema()
            .create_structure(&users_model())
            .await
            .unwrap();
        connection
    }

    #[tokio::test]
    async fn writes_flow_through_the_source() {
        let connection = replicating_connection().await;
        let table = TableIdentifier::new("users");
        let replication = connection.replication();

        let source = replication
            .connect(&ReplicationConfig::new("rel_1", "slot_1"))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let producer = {
            let source = source.clone();
            tokio::spawn(async move { source.start(tx).await })
        };

        connection
            .data()
            .insert(&table, &[user(1, "a")])
            .await
            .unwrap();

        let raw = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let event = replication.parse_event(&raw).unwrap();
        assert_eq!(event.operation, CdcOperation::Insert);
        assert_eq!(event.table_name, "users");

        source.stop().await.unwrap();
        producer.await.unwrap().unwrap();
        assert!(!source.is_active());
    }

    #[tokio::test]
    async fn resume_from_position_skips_consumed_events() {
        let connection = replicating_connection().await;
        let table = TableIdentifier::new("users");
        let replication = connection.replication();

        connection
            .data()
            .insert(&table, &[user(1, "a"), user(2, "b")])
            .await
            .unwrap();

        // Resume after the first event only.
        let mut config = ReplicationConfig::new("rel_1", "slot_1");
        config.start_position = Some("1".to_string());
        let source = replication.connect(&config).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let producer = {
            let source = source.clone();
            tokio::spawn(async move { source.start(tx).await })
        };

        let raw = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let event = replication.parse_event(&raw).unwrap();
        assert_eq!(event.data.unwrap().get("id"), Some(&2.into()));

        source.stop().await.unwrap();
        producer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn positions_have_a_total_order() {
        let connection = replicating_connection().await;
        let replication = connection.replication();
        assert_eq!(replication.compare_positions("2", "10"), Some(Ordering::Less));
        assert_eq!(replication.compare_positions("7", "7"), Some(Ordering::Equal));
        assert_eq!(replication.compare_positions("0/AA", "7"), None);
    }

    #[tokio::test]
    async fn checkpoints_survive_in_slots() {
        let connection = replicating_connection().await;
        let replication = connection.replication();
        let source = replication
            .connect(&ReplicationConfig::new("rel_1", "slot_1"))
            .await
            .unwrap();
        source.save_checkpoint("5").await.unwrap();

        let slots = replication.list_slots().await.unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].position.as_deref(), Some("5"));

        replication.drop_slot("slot_1").await.unwrap();
        assert!(replication.list_slots().await.unwrap().is_empty());
    }
}
