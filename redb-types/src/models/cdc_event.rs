use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;

/// A row expressed as JSON field values, keyed by column name.
pub type JsonRow = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CdcOperation {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl CdcOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            CdcOperation::Insert => "INSERT",
            CdcOperation::Update => "UPDATE",
            CdcOperation::Delete => "DELETE",
            CdcOperation::Truncate => "TRUNCATE",
        }
    }
}

impl Display for CdcOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The universal on-wire change record.
///
/// Producers emit `timestamp` in RFC 3339 with a UTC offset; any valid offset
/// is accepted on the way in. `lsn` is an adapter-defined position string the
/// rest of the system treats as opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdcEvent {
    pub operation: CdcOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonRow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_data: Option<JsonRow>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "JsonRow::is_empty")]
    pub metadata: JsonRow,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<u64>,
}

impl CdcEvent {
    fn new(operation: CdcOperation, table_name: impl Into<String>) -> Self {
        Self {
            operation,
            schema_name: None,
            table_name: table_name.into(),
            data: None,
            old_data: None,
            timestamp: Utc::now(),
            lsn: None,
            transaction_id: None,
            metadata: JsonRow::new(),
            source_node: None,
            target_node: None,
        }
    }

    pub fn insert(table_name: impl Into<String>, data: JsonRow) -> Self {
        Self {
            data: Some(data),
            ..Self::new(CdcOperation::Insert, table_name)
        }
    }

    pub fn update(table_name: impl Into<String>, data: JsonRow, old_data: Option<JsonRow>) -> Self {
        Self {
            data: Some(data),
            old_data,
            ..Self::new(CdcOperation::Update, table_name)
        }
    }

    pub fn delete(table_name: impl Into<String>, old_data: JsonRow) -> Self {
        Self {
            old_data: Some(old_data),
            ..Self::new(CdcOperation::Delete, table_name)
        }
    }

    pub fn truncate(table_name: impl Into<String>) -> Self {
        Self::new(CdcOperation::Truncate, table_name)
    }

    pub fn with_position(mut self, lsn: impl Into<String>) -> Self {
        self.lsn = Some(lsn.into());
        self
    }

    /// Enforces the operation-specific payload requirements: INSERT and UPDATE
    /// carry non-empty `data`, DELETE carries non-empty `old_data`, TRUNCATE
    /// needs neither.
    pub fn validate(&self) -> Result<(), ErrorKind> {
        if self.table_name.is_empty() {
            return Err(ErrorKind::InvalidQuery(
                "cdc event is missing a table name".to_string(),
            ));
        }
        match self.operation {
            CdcOperation::Insert | CdcOperation::Update => {
                if self.data.as_ref().map_or(true, JsonRow::is_empty) {
                    return Err(ErrorKind::InvalidQuery(format!(
                        "{} on `{}` carries no data",
                        self.operation, self.table_name
                    )));
                }
            }
            CdcOperation::Delete => {
                if self.old_data.as_ref().map_or(true, JsonRow::is_empty) {
                    return Err(ErrorKind::InvalidQuery(format!(
                        "DELETE on `{}` carries no old data",
                        self.table_name
                    )));
                }
            }
            CdcOperation::Truncate => {}
        }
        Ok(())
    }

    /// Approximate wire size, used for byte counters.
    pub fn payload_bytes(&self) -> u64 {
        serde_json::to_string(self).map(|s| s.len() as u64).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, serde_json::Value)]) -> JsonRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn insert_requires_data() {
        let mut event = CdcEvent::insert("users", row(&[("id", json!(1))]));
        assert!(event.validate().is_ok());

        event.data = None;
        assert!(matches!(
            event.validate(),
            Err(ErrorKind::InvalidQuery(_))
        ));

        event.data = Some(JsonRow::new());
        assert!(event.validate().is_err());
    }

    #[test]
    fn delete_requires_old_data() {
        let event = CdcEvent::delete("users", row(&[("id", json!(2))]));
        assert!(event.validate().is_ok());

        let mut stripped = event;
        stripped.old_data = None;
        assert!(stripped.validate().is_err());
    }

    #[test]
    fn truncate_requires_neither() {
        assert!(CdcEvent::truncate("users").validate().is_ok());
    }

    #[test]
    fn empty_table_name_rejected() {
        let event = CdcEvent::insert("", row(&[("id", json!(1))]));
        assert!(event.validate().is_err());
    }

    #[test]
    fn serde_round_trip_preserves_event() {
        let mut event = CdcEvent::update(
            "accounts",
            row(&[
                ("id", json!(7)),
                ("balance", json!(1234.5678)),
                ("note", json!("moved")),
            ]),
            Some(row(&[("id", json!(7)), ("balance", json!(99.5))])),
        )
        .with_position("0/16B3748");
        event.schema_name = Some("public".to_string());
        event.transaction_id = Some("tx-42".to_string());
        event
            .metadata
            .insert("origin".to_string(), json!("unit-test"));
        event.source_node = Some(11);
        event.target_node = Some(12);

        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: CdcEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn timestamp_accepts_any_utc_offset() {
        let encoded = json!({
            "operation": "INSERT",
            "table_name": "users",
            "data": {"id": 1},
            "timestamp": "2026-03-01T10:30:00+02:00",
        });
        let decoded: CdcEvent = serde_json::from_value(encoded).unwrap();
        assert_eq!(
            decoded.timestamp,
            "2026-03-01T08:30:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn unknown_operation_rejected() {
        let encoded = json!({
            "operation": "MERGE",
            "table_name": "users",
            "timestamp": "2026-03-01T08:30:00Z",
        });
        assert!(serde_json::from_value::<CdcEvent>(encoded).is_err());
    }
}
