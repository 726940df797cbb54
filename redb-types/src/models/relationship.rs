use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    Replication,
    Migration,
    MultiMaster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipPhase {
    Created,
    InitialCopy,
    Active,
    Paused,
    Error,
    Removed,
}

impl RelationshipPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipPhase::Created => "created",
            RelationshipPhase::InitialCopy => "initial_copy",
            RelationshipPhase::Active => "active",
            RelationshipPhase::Paused => "paused",
            RelationshipPhase::Error => "error",
            RelationshipPhase::Removed => "removed",
        }
    }
}

impl Display for RelationshipPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CdcStatus {
    #[default]
    Inactive,
    Running,
    Stopped,
    Errored,
}

/// What the pipeline does with a raw event `parse_event` rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParsePolicy {
    /// Count the failure and keep going (at-least-once mode).
    #[default]
    DropMalformed,
    /// Halt the pipeline and move the relationship to the error phase.
    Halt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationshipOptions {
    pub batch_size: usize,
    pub parallel_workers: usize,
    /// Bound on parsed-but-not-applied events; the source stalls when full.
    pub window_size: usize,
    pub checkpoint_interval_secs: u64,
    pub parse_policy: ParsePolicy,
    pub max_apply_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for RelationshipOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            parallel_workers: 1,
            window_size: 1024,
            checkpoint_interval_secs: 10,
            parse_policy: ParsePolicy::default(),
            max_apply_retries: 5,
            retry_base_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEndpoint {
    pub database_id: String,
    pub table: String,
}

/// A configured data movement binding a mapping to a concrete source/target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub mapping_id: String,
    pub relationship_type: RelationshipType,
    pub source: TableEndpoint,
    pub target: TableEndpoint,
    pub phase: RelationshipPhase,
    #[serde(default)]
    pub cdc_status: CdcStatus,
    /// Opaque adapter position; never parsed by the engine, never shared
    /// across relationships.
    #[serde(default)]
    pub saved_position: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub options: RelationshipOptions,
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.phase = RelationshipPhase::Error;
        self.cdc_status = CdcStatus::Errored;
        self.errors.push(message.into());
    }
}
