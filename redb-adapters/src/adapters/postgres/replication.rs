use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb_types::errors::{DatabaseError, ErrorKind};
use redb_types::log::{debug, warn};
use redb_types::models::{CdcEvent, CdcOperation, JsonRow};
use redb_types::parking_lot::Mutex;
use redb_types::serde_json::{self, Value};
use tokio::sync::{mpsc, watch};
use tokio_postgres::Client;

use crate::interface::{
    DataOperator, Publication, RawEvent, ReplicationConfig, ReplicationMechanism,
    ReplicationOperator, ReplicationSlot, ReplicationSource, ReplicationStatus, TableIdentifier,
};

use super::connection::{qualify, query_error, quote_ident};
use super::data::PostgresData;
use super::TYPE;

const PEEK_BATCH: i32 = 256;
const DECODER_PLUGIN: &str = "wal2json";

fn err(operation: &str, kind: ErrorKind) -> DatabaseError {
    DatabaseError::new(TYPE.as_str(), operation, kind)
}

/// Textual LSN (`X/Y` in hex) as a totally ordered integer.
fn parse_lsn(position: &str) -> Option<u64> {
    let (high, low) = position.split_once('/')?;
    let high = u64::from_str_radix(high, 16).ok()?;
    let low = u64::from_str_radix(low, 16).ok()?;
    Some((high << 32) | low)
}

#[derive(Debug)]
pub struct PostgresReplication {
    client: Arc<Client>,
}

impl PostgresReplication {
    pub(super) fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReplicationOperator for PostgresReplication {
    fn database_type(&self) -> redb_types::models::DatabaseType {
        TYPE
    }

    fn is_supported(&self) -> bool {
        true
    }

    fn supported_mechanisms(&self) -> Vec<ReplicationMechanism> {
        vec![ReplicationMechanism::WalLogical]
    }

    async fn check_prerequisites(&self) -> Result<(), DatabaseError> {
        let operation = "replication.check_prerequisites";
        let row = self
            .client
            .query_one("SHOW wal_level", &[])
            .await
            .map_err(|e| query_error(operation, e))?;
        let wal_level: String = row.get(0);
        if wal_level != "logical" {
            return Err(err(
                operation,
                ErrorKind::InvalidConfiguration(format!(
                    "wal_level is `{wal_level}`, logical decoding requires `logical`"
                )),
            ));
        }

        let row = self
            .client
            .query_one("SHOW max_replication_slots", &[])
            .await
            .map_err(|e| query_error(operation, e))?;
        let max_slots: String = row.get(0);
        let max_slots: i64 = max_slots.parse().unwrap_or(0);
        let row = self
            .client
            .query_one("SELECT COUNT(*) FROM pg_replication_slots", &[])
            .await
            .map_err(|e| query_error(operation, e))?;
        let used: i64 = row.get(0);
        if used >= max_slots {
            return Err(err(
                operation,
                ErrorKind::InvalidConfiguration(format!(
                    "all {max_slots} replication slots are in use"
                )),
            ));
        }
        Ok(())
    }

    async fn current_position(&self) -> Result<String, DatabaseError> {
        let row = self
            .client
            .query_one("SELECT pg_current_wal_lsn()::text", &[])
            .await
            .map_err(|e| query_error("replication.current_position", e))?;
        Ok(row.get(0))
    }

    async fn connect(
        &self,
        config: &ReplicationConfig,
    ) -> Result<Arc<dyn ReplicationSource>, DatabaseError> {
        let operation = "replication.connect";
        let existing = self
            .client
            .query_opt(
                "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
                &[&config.slot_name],
            )
            .await
            .map_err(|e| query_error(operation, e))?;
        if existing.is_none() {
            self.client
                .query(
                    "SELECT pg_create_logical_replication_slot($1, $2)",
                    &[&config.slot_name, &DECODER_PLUGIN],
                )
                .await
                .map_err(|e| query_error(operation, e))?;
            debug!("created replication slot `{}`", config.slot_name);
        }

        let start = match &config.start_position {
            Some(position) => {
                parse_lsn(position).ok_or_else(|| {
                    err(
                        operation,
                        ErrorKind::InvalidConfiguration(format!(
                            "malformed start position `{position}`"
                        )),
                    )
                })?;
                Some(position.clone())
            }
            None => None,
        };

        Ok(Arc::new(PostgresReplicationSource {
            client: self.client.clone(),
            slot: config.slot_name.clone(),
            poll_interval: config.poll_interval,
            state: Mutex::new(SourceState { position: start }),
            active: AtomicBool::new(false),
            stop_tx: watch::channel(false).0,
        }))
    }

    fn parse_event(&self, raw: &RawEvent) -> Result<CdcEvent, DatabaseError> {
        parse_wal2json_change(raw)
            .map_err(|reason| err("replication.parse_event", ErrorKind::InvalidQuery(reason)))
    }

    async fn apply_cdc_event(&self, event: &CdcEvent) -> Result<(), DatabaseError> {
        let operation = "replication.apply_cdc_event";
        let data_operator = PostgresData::new(self.client.clone(), None);
        let table = TableIdentifier {
            schema: event.schema_name.clone(),
            name: event.table_name.clone(),
        };
        match event.operation {
            CdcOperation::Insert => {
                let data = event.data.clone().unwrap_or_default();
                // `ON CONFLICT DO NOTHING` keeps redelivered inserts harmless
                // under at-least-once delivery.
                insert_do_nothing(&self.client, &table, &data).await?;
            }
            CdcOperation::Update => {
                let data = event.data.clone().unwrap_or_default();
                let filter = event.old_data.clone().unwrap_or_else(|| data.clone());
                data_operator.update(&table, &data, &filter).await?;
            }
            CdcOperation::Delete => {
                let filter = event.old_data.clone().ok_or_else(|| {
                    err(
                        operation,
                        ErrorKind::InvalidQuery("delete event carries no old data".to_string()),
                    )
                })?;
                data_operator.delete(&table, &filter).await?;
            }
            CdcOperation::Truncate => {
                let sql = format!("TRUNCATE TABLE {}", qualify(&table));
                self.client
                    .batch_execute(&sql)
                    .await
                    .map_err(|e| query_error(operation, e))?;
            }
        }
        Ok(())
    }

    async fn list_slots(&self) -> Result<Vec<ReplicationSlot>, DatabaseError> {
        let sql = "SELECT slot_name, plugin, active, confirmed_flush_lsn::text \
                   FROM pg_replication_slots ORDER BY slot_name";
        let rows = self
            .client
            .query(sql, &[])
            .await
            .map_err(|e| query_error("replication.list_slots", e))?;
        Ok(rows
            .iter()
            .map(|row| ReplicationSlot {
                name: row.get(0),
                plugin: row.get(1),
                active: row.get(2),
                position: row.get(3),
            })
            .collect())
    }

    async fn drop_slot(&self, name: &str) -> Result<(), DatabaseError> {
        self.client
            .query("SELECT pg_drop_replication_slot($1)", &[&name])
            .await
            .map_err(|e| query_error("replication.drop_slot", e))?;
        Ok(())
    }

    async fn list_publications(&self) -> Result<Vec<Publication>, DatabaseError> {
        let operation = "replication.list_publications";
        let rows = self
            .client
            .query("SELECT pubname FROM pg_publication ORDER BY pubname", &[])
            .await
            .map_err(|e| query_error(operation, e))?;
        let mut publications = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.get(0);
            let tables = self
                .client
                .query(
                    "SELECT tablename FROM pg_publication_tables WHERE pubname = $1 \
                     ORDER BY tablename",
                    &[&name],
                )
                .await
                .map_err(|e| query_error(operation, e))?;
            publications.push(Publication {
                name,
                tables: tables.iter().map(|r| r.get(0)).collect(),
            });
        }
        Ok(publications)
    }

    async fn drop_publication(&self, name: &str) -> Result<(), DatabaseError> {
        let sql = format!("DROP PUBLICATION IF EXISTS {}", quote_ident(name));
        self.client
            .batch_execute(&sql)
            .await
            .map_err(|e| query_error("replication.drop_publication", e))?;
        Ok(())
    }

    async fn replication_status(
        &self,
        slot_name: &str,
    ) -> Result<ReplicationStatus, DatabaseError> {
        let sql = "SELECT active, confirmed_flush_lsn::text, \
                          pg_wal_lsn_diff(pg_current_wal_lsn(), confirmed_flush_lsn)::bigint \
                   FROM pg_replication_slots WHERE slot_name = $1";
        let row = self
            .client
            .query_opt(sql, &[&slot_name])
            .await
            .map_err(|e| query_error("replication.replication_status", e))?;
        match row {
            Some(row) => Ok(ReplicationStatus {
                active: row.get(0),
                position: row.get(1),
                lag_bytes: row
                    .get::<_, Option<i64>>(2)
                    .map(|lag| lag.max(0) as u64),
            }),
            None => Err(err(
                "replication.replication_status",
                ErrorKind::NotFound(
                    redb_types::errors::ResourceKind::Slot,
                    slot_name.to_string(),
                ),
            )),
        }
    }

    fn compare_positions(&self, left: &str, right: &str) -> Option<Ordering> {
        Some(parse_lsn(left)?.cmp(&parse_lsn(right)?))
    }
}

async fn insert_do_nothing(
    client: &Client,
    table: &TableIdentifier,
    data: &JsonRow,
) -> Result<(), DatabaseError> {
    use super::types::JsonParam;

    if data.is_empty() {
        return Ok(());
    }
    let columns: Vec<&String> = data.keys().collect();
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
    let sql = format!(
        "INSERT INTO {} ({column_list}) VALUES ({}) ON CONFLICT DO NOTHING",
        qualify(table),
        placeholders.join(", ")
    );
    let params: Vec<JsonParam> = data.values().map(JsonParam).collect();
    let refs: Vec<&(dyn postgres_types::ToSql + Sync)> = params
        .iter()
        .map(|p| p as &(dyn postgres_types::ToSql + Sync))
        .collect();
    client
        .execute(&sql, &refs)
        .await
        .map_err(|e| query_error("replication.apply_cdc_event", e))?;
    Ok(())
}

/// One decoded `wal2json` format-version-2 change row.
fn parse_wal2json_change(raw: &RawEvent) -> Result<CdcEvent, String> {
    let payload = raw
        .payload
        .as_object()
        .ok_or_else(|| "change record is not a JSON object".to_string())?;
    let action = payload
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| "change record is missing `action`".to_string())?;
    let table = payload
        .get("table")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("`{action}` change is missing `table`"))?;
    let schema = payload.get("schema").and_then(Value::as_str);

    let columns = || field_list(payload.get("columns"));
    let identity = || field_list(payload.get("identity"));

    let (operation, data, old_data) = match action {
        "I" => (CdcOperation::Insert, columns(), None),
        "U" => (CdcOperation::Update, columns(), identity()),
        "D" => (CdcOperation::Delete, None, identity()),
        "T" => (CdcOperation::Truncate, None, None),
        other => return Err(format!("unsupported wal2json action `{other}`")),
    };

    let timestamp = payload
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_wal2json_timestamp)
        .unwrap_or_else(Utc::now);

    Ok(CdcEvent {
        operation,
        schema_name: schema.map(str::to_string),
        table_name: table.to_string(),
        data,
        old_data,
        timestamp,
        lsn: raw.position.clone(),
        transaction_id: payload
            .get("xid")
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())),
        metadata: JsonRow::new(),
        source_node: None,
        target_node: None,
    })
}

fn field_list(value: Option<&Value>) -> Option<JsonRow> {
    let fields = value?.as_array()?;
    let mut row = JsonRow::new();
    for field in fields {
        let name = field.get("name")?.as_str()?;
        let value = field.get("value").cloned().unwrap_or(Value::Null);
        row.insert(name.to_string(), value);
    }
    Some(row)
}

fn parse_wal2json_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
        .or_else(|| {
            DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z")
                .ok()
                .map(|t| t.with_timezone(&Utc))
        })
}

#[derive(Debug)]
struct SourceState {
    /// Last emitted LSN; peeked rows at or before it are skipped.
    position: Option<String>,
}

/// Polling feed over a `wal2json` slot. The slot itself holds the durable
/// position; in-memory state only filters redeliveries between checkpoints.
#[derive(Debug)]
pub struct PostgresReplicationSource {
    client: Arc<Client>,
    slot: String,
    poll_interval: Duration,
    state: Mutex<SourceState>,
    active: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

#[async_trait]
impl ReplicationSource for PostgresReplicationSource {
    async fn start(&self, sender: mpsc::Sender<RawEvent>) -> Result<(), DatabaseError> {
        let operation = "replication.start";
        if self.active.swap(true, AtomicOrdering::SeqCst) {
            return Ok(());
        }
        self.stop_tx.send_replace(false);
        let mut stop_rx = self.stop_tx.subscribe();

        let result = 'produce: loop {
            if *stop_rx.borrow() {
                break Ok(());
            }
            let sql = "SELECT lsn::text, xid::text, data \
                       FROM pg_logical_slot_peek_changes($1, NULL, $2, \
                            'format-version', '2', \
                            'include-timestamp', 'true', \
                            'include-transaction', 'false')";
            let rows = match self.client.query(sql, &[&self.slot, &PEEK_BATCH]).await {
                Ok(rows) => rows,
                Err(e) => break Err(query_error(operation, e)),
            };

            let last_emitted = self.state.lock().position.clone();
            let last_emitted_lsn = last_emitted.as_deref().and_then(parse_lsn);

            let mut produced = false;
            for row in rows {
                let lsn: String = row.get(0);
                let xid: Option<String> = row.get(1);
                let data: String = row.get(2);

                if let (Some(seen), Some(current)) = (last_emitted_lsn, parse_lsn(&lsn)) {
                    if current <= seen {
                        continue;
                    }
                }

                let payload = match serde_json::from_str::<Value>(&data) {
                    Ok(Value::Object(mut object)) => {
                        if let Some(xid) = &xid {
                            object.insert("xid".to_string(), Value::String(xid.clone()));
                        }
                        Value::Object(object)
                    }
                    // Hand malformed payloads to the pipeline so its parse
                    // policy decides between dropping and halting.
                    _ => Value::String(data),
                };

                if sender
                    .send(RawEvent {
                        payload,
                        position: Some(lsn.clone()),
                    })
                    .await
                    .is_err()
                {
                    break 'produce Ok(());
                }
                self.state.lock().position = Some(lsn);
                produced = true;
            }

            if !produced {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break Ok(());
                        }
                    }
                }
            }
        };

        self.active.store(false, AtomicOrdering::SeqCst);
        result
    }

    async fn stop(&self) -> Result<(), DatabaseError> {
        self.stop_tx.send_replace(true);
        Ok(())
    }

    async fn close(&self) -> Result<(), DatabaseError> {
        self.stop().await
    }

    fn get_position(&self) -> Option<String> {
        self.state.lock().position.clone()
    }

    fn set_position(&self, position: &str) {
        if parse_lsn(position).is_none() {
            warn!("ignoring malformed lsn `{position}`");
            return;
        }
        self.state.lock().position = Some(position.to_string());
    }

    async fn save_checkpoint(&self, position: &str) -> Result<(), DatabaseError> {
        self.client
            .query(
                "SELECT pg_replication_slot_advance($1, $2::pg_lsn)",
                &[&self.slot, &position],
            )
            .await
            .map_err(|e| query_error("replication.save_checkpoint", e))?;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(AtomicOrdering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb_types::serde_json::json;

    #[test]
    fn lsn_order_is_total() {
        assert!(parse_lsn("0/16B3748").unwrap() < parse_lsn("1/0").unwrap());
        assert_eq!(parse_lsn("0/0"), Some(0));
        assert_eq!(parse_lsn("16B3748"), None);
        assert_eq!(parse_lsn("zz/0"), None);
    }

    #[test]
    fn insert_change_parses() {
        let raw = RawEvent {
            payload: json!({
                "action": "I",
                "schema": "public",
                "table": "users",
                "xid": "771",
                "columns": [
                    {"name": "id", "type": "integer", "value": 3},
                    {"name": "name", "type": "text", "value": "c"},
                ],
            }),
            position: Some("0/16B3748".to_string()),
        };
        let event = parse_wal2json_change(&raw).unwrap();
        assert_eq!(event.operation, CdcOperation::Insert);
        assert_eq!(event.table_name, "users");
        assert_eq!(event.schema_name.as_deref(), Some("public"));
        assert_eq!(event.data.as_ref().unwrap().get("id"), Some(&json!(3)));
        assert_eq!(event.lsn.as_deref(), Some("0/16B3748"));
        assert_eq!(event.transaction_id.as_deref(), Some("771"));
        assert!(event.validate().is_ok());
    }

    #[test]
    fn update_change_keeps_identity_as_old_data() {
        let raw = RawEvent {
            payload: json!({
                "action": "U",
                "schema": "public",
                "table": "users",
                "columns": [
                    {"name": "id", "value": 3},
                    {"name": "name", "value": "c2"},
                ],
                "identity": [
                    {"name": "id", "value": 3},
                ],
            }),
            position: Some("0/16B3800".to_string()),
        };
        let event = parse_wal2json_change(&raw).unwrap();
        assert_eq!(event.operation, CdcOperation::Update);
        assert_eq!(event.old_data.as_ref().unwrap().get("id"), Some(&json!(3)));
    }

    #[test]
    fn unknown_action_is_rejected() {
        let raw = RawEvent {
            payload: json!({"action": "M", "table": "users"}),
            position: None,
        };
        assert!(parse_wal2json_change(&raw).is_err());
    }

    #[test]
    fn wal2json_timestamps_parse() {
        assert!(parse_wal2json_timestamp("2026-03-01 10:30:00.123456+00").is_some());
        assert!(parse_wal2json_timestamp("2026-03-01T10:30:00Z").is_some());
        assert!(parse_wal2json_timestamp("gibberish").is_none());
    }
}
