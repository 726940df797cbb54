use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformationType {
    Direct,
    Cast,
    Uppercase,
    Lowercase,
    Function,
    Expression,
    Default,
}

/// One ordered field-mapping rule. Rules are applied in the order supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationRule {
    pub source_column: String,
    #[serde(default)]
    pub source_table: Option<String>,
    pub target_column: String,
    #[serde(default)]
    pub target_table: Option<String>,
    pub transformation_type: TransformationType,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl TransformationRule {
    pub fn direct(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::unary(TransformationType::Direct, source, target)
    }

    pub fn unary(
        transformation_type: TransformationType,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            source_column: source.into(),
            source_table: None,
            target_column: target.into(),
            target_table: None,
            transformation_type,
            function: None,
            parameters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingType {
    DatabaseToDatabase,
    TableToTable,
    StreamToTable,
    TableToStream,
    StreamToStream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MappingEndpoint {
    Database { database_id: String },
    Table { database_id: String, table: String },
    Stream { topic: String },
}

impl MappingEndpoint {
    pub fn database_id(&self) -> Option<&str> {
        match self {
            MappingEndpoint::Database { database_id }
            | MappingEndpoint::Table { database_id, .. } => Some(database_id),
            MappingEndpoint::Stream { .. } => None,
        }
    }

    pub fn table(&self) -> Option<&str> {
        match self {
            MappingEndpoint::Table { table, .. } => Some(table),
            _ => None,
        }
    }
}

/// A user-authored, named, ordered set of transformation rules binding a
/// source entity to a target entity. Immutable from the pipeline's point of
/// view; edits create a new version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub mapping_type: MappingType,
    pub source: MappingEndpoint,
    pub target: MappingEndpoint,
    #[serde(default)]
    pub rules: Vec<TransformationRule>,
    #[serde(default = "initial_version")]
    pub version: u32,
    #[serde(default)]
    pub policy_id: Option<String>,
}

fn initial_version() -> u32 {
    1
}

impl Mapping {
    /// The mapping type implied by a source/target endpoint pair.
    pub fn type_for(source: &MappingEndpoint, target: &MappingEndpoint) -> MappingType {
        use MappingEndpoint::{Database, Stream, Table};
        match (source, target) {
            (Database { .. }, _) | (_, Database { .. }) => MappingType::DatabaseToDatabase,
            (Table { .. }, Table { .. }) => MappingType::TableToTable,
            (Stream { .. }, Table { .. }) => MappingType::StreamToTable,
            (Table { .. }, Stream { .. }) => MappingType::TableToStream,
            (Stream { .. }, Stream { .. }) => MappingType::StreamToStream,
        }
    }

    pub fn validate(&self) -> Result<(), ErrorKind> {
        if self.name.is_empty() {
            return Err(ErrorKind::InvalidConfiguration(
                "mapping name must not be empty".to_string(),
            ));
        }
        let implied = Self::type_for(&self.source, &self.target);
        if implied != self.mapping_type {
            return Err(ErrorKind::InvalidConfiguration(format!(
                "mapping `{}` declares {:?} but its endpoints imply {:?}",
                self.name, self.mapping_type, implied
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_pair_implies_type() {
        let table = |db: &str, t: &str| MappingEndpoint::Table {
            database_id: db.to_string(),
            table: t.to_string(),
        };
        let stream = |topic: &str| MappingEndpoint::Stream {
            topic: topic.to_string(),
        };

        assert_eq!(
            Mapping::type_for(&table("db1", "users"), &table("db2", "users")),
            MappingType::TableToTable
        );
        assert_eq!(
            Mapping::type_for(&stream("events"), &table("db2", "events")),
            MappingType::StreamToTable
        );
        assert_eq!(
            Mapping::type_for(&stream("in"), &stream("out")),
            MappingType::StreamToStream
        );
    }

    #[test]
    fn mismatched_type_rejected() {
        let mapping = Mapping {
            id: "map_1".to_string(),
            name: "users".to_string(),
            description: None,
            mapping_type: MappingType::StreamToStream,
            source: MappingEndpoint::Table {
                database_id: "db1".to_string(),
                table: "users".to_string(),
            },
            target: MappingEndpoint::Table {
                database_id: "db2".to_string(),
                table: "users".to_string(),
            },
            rules: vec![],
            version: 1,
            policy_id: None,
        };
        assert!(mapping.validate().is_err());
    }
}
