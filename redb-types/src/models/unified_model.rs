use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The normalized cross-database schema representation produced by
/// `discover_schema` and consumed by `create_structure`.
///
/// Adapters emit collections in a deterministic order (sorted by name) so
/// that discovery against an unchanged database is byte-identical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedModel {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schemas: Vec<SchemaInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<Table>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub views: Vec<View>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub procedures: Vec<Procedure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<Trigger>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enums: Vec<EnumType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequences: Vec<Sequence>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<Extension>,
}

impl UnifiedModel {
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Checks referential integrity of the model itself: every constraint
    /// names existing local columns, and every foreign key points at a table
    /// and columns present in this model.
    pub fn validate(&self) -> Result<(), ModelError> {
        for window in self.tables.windows(2) {
            if window[0].name == window[1].name && window[0].schema == window[1].schema {
                return Err(ModelError::DuplicateTable(window[0].name.clone()));
            }
        }
        for table in &self.tables {
            for constraint in &table.constraints {
                for column in constraint.local_columns() {
                    if table.column(column).is_none() {
                        return Err(ModelError::UnknownLocalColumn {
                            table: table.name.clone(),
                            column: column.to_string(),
                        });
                    }
                }
                if let Constraint::ForeignKey {
                    referenced_table,
                    referenced_columns,
                    ..
                } = constraint
                {
                    let Some(referenced) = self.table(referenced_table) else {
                        return Err(ModelError::UnknownReferencedTable {
                            table: table.name.clone(),
                            referenced: referenced_table.clone(),
                        });
                    };
                    for column in referenced_columns {
                        if referenced.column(column).is_none() {
                            return Err(ModelError::UnknownReferencedColumn {
                                table: table.name.clone(),
                                referenced: referenced_table.clone(),
                                column: column.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ModelError {
    #[error("duplicate table `{0}`")]
    DuplicateTable(String),
    #[error("constraint on table `{table}` names unknown local column `{column}`")]
    UnknownLocalColumn { table: String, column: String },
    #[error("table `{table}` references unknown table `{referenced}`")]
    UnknownReferencedTable { table: String, referenced: String },
    #[error("table `{table}` references unknown column `{referenced}.{column}`")]
    UnknownReferencedColumn {
        table: String,
        referenced: String,
        column: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub name: String,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    #[serde(default)]
    pub schema: Option<String>,
    pub name: String,
    pub columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<Index>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Constraint>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub semantic_type: SemanticType,
    #[serde(default = "nullable_default")]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub auto_increment: bool,
    /// Vendor type the semantic type was derived from, as a hint for
    /// round-tripping DDL.
    #[serde(default)]
    pub native_type: Option<String>,
}

fn nullable_default() -> bool {
    true
}

impl Column {
    pub fn new(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic_type,
            nullable: true,
            default: None,
            primary_key: false,
            auto_increment: false,
            native_type: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Boolean,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Decimal,
    String,
    Text,
    Binary,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
    Enum(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    PrimaryKey {
        #[serde(default)]
        name: Option<String>,
        columns: Vec<String>,
    },
    Unique {
        #[serde(default)]
        name: Option<String>,
        columns: Vec<String>,
    },
    ForeignKey {
        #[serde(default)]
        name: Option<String>,
        columns: Vec<String>,
        referenced_table: String,
        referenced_columns: Vec<String>,
    },
    Check {
        #[serde(default)]
        name: Option<String>,
        expression: String,
    },
}

impl Constraint {
    fn local_columns(&self) -> &[String] {
        match self {
            Constraint::PrimaryKey { columns, .. }
            | Constraint::Unique { columns, .. }
            | Constraint::ForeignKey { columns, .. } => columns,
            Constraint::Check { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    #[serde(default)]
    pub schema: Option<String>,
    pub name: String,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Procedure {
    #[serde(default)]
    pub schema: Option<String>,
    pub name: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub definition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub name: String,
    pub table: String,
    pub event: String,
    pub timing: String,
    #[serde(default)]
    pub definition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumType {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    pub name: String,
    pub start: i64,
    pub increment: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_orders_model() -> UnifiedModel {
        UnifiedModel {
            tables: vec![
                Table {
                    schema: Some("public".to_string()),
                    name: "users".to_string(),
                    columns: vec![
                        Column::new("id", SemanticType::Int32).primary_key(),
                        Column::new("name", SemanticType::Text),
                    ],
                    indexes: vec![],
                    constraints: vec![Constraint::PrimaryKey {
                        name: Some("users_pkey".to_string()),
                        columns: vec!["id".to_string()],
                    }],
                },
                Table {
                    schema: Some("public".to_string()),
                    name: "orders".to_string(),
                    columns: vec![
                        Column::new("id", SemanticType::Int64).primary_key(),
                        Column::new("user_id", SemanticType::Int32).not_null(),
                    ],
                    indexes: vec![],
                    constraints: vec![Constraint::ForeignKey {
                        name: Some("orders_user_id_fkey".to_string()),
                        columns: vec!["user_id".to_string()],
                        referenced_table: "users".to_string(),
                        referenced_columns: vec!["id".to_string()],
                    }],
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn valid_foreign_keys_pass() {
        assert_eq!(users_orders_model().validate(), Ok(()));
    }

    #[test]
    fn foreign_key_to_missing_table_fails() {
        let mut model = users_orders_model();
        model.tables.remove(0);
        assert!(matches!(
            model.validate(),
            Err(ModelError::UnknownReferencedTable { .. })
        ));
    }

    #[test]
    fn foreign_key_to_missing_column_fails() {
        let mut model = users_orders_model();
        model.tables[0].columns.retain(|c| c.name != "id");
        let err = model.validate().unwrap_err();
        assert!(matches!(err, ModelError::UnknownLocalColumn { .. }));
    }

    #[test]
    fn model_round_trips_through_json() {
        let model = users_orders_model();
        let encoded = serde_json::to_string(&model).unwrap();
        let decoded: UnifiedModel = serde_json::from_str(&encoded).unwrap();
        assert_eq!(model, decoded);
    }
}
