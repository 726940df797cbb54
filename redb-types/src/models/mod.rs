use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod cdc_event;
pub mod connection;
pub mod mapping;
pub mod mesh;
pub mod relationship;
pub mod statistics;
pub mod unified_model;

pub use cdc_event::{CdcEvent, CdcOperation, JsonRow};
pub use connection::{ConnectionConfig, InstanceConfig, SslConfig, SslMode};
pub use mapping::{
    Mapping, MappingEndpoint, MappingType, TransformationRule, TransformationType,
};
pub use mesh::{
    ConnectionInfo, ConnectionStatus, JoinStrategy, MeshInfo, MeshStatus, NodeInfo, NodeStatus,
};
pub use relationship::{
    CdcStatus, ParsePolicy, Relationship, RelationshipOptions, RelationshipPhase,
    RelationshipType, TableEndpoint,
};
pub use statistics::CdcStatistics;
pub use unified_model::{
    Column, Constraint, EnumType, Extension, Index, ModelError, Procedure, SchemaInfo,
    SemanticType, Sequence, Table, Trigger, UnifiedModel, View,
};

/// Canonical identifiers of the database technologies the platform knows.
///
/// Aliases ("postgresql", "pg", ...) are resolved by the capability catalog in
/// the adapters crate; this type only accepts canonical names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Postgres,
    Mysql,
    Memory,
}

impl DatabaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Postgres => "postgres",
            DatabaseType::Mysql => "mysql",
            DatabaseType::Memory => "memory",
        }
    }

    pub fn all() -> &'static [DatabaseType] {
        &[
            DatabaseType::Postgres,
            DatabaseType::Mysql,
            DatabaseType::Memory,
        ]
    }
}

impl Display for DatabaseType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseType {
    type Err = crate::errors::ErrorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DatabaseType::all()
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| {
                crate::errors::ErrorKind::InvalidConfiguration(format!(
                    "unknown database type `{s}`"
                ))
            })
    }
}
