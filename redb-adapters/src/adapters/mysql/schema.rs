use std::collections::BTreeMap;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::Pool;
use redb_types::errors::{DatabaseError, ErrorKind, ResourceKind};
use redb_types::models::{
    Column, Constraint, Index, SemanticType, Table, Trigger, UnifiedModel, View,
};

use crate::interface::{SchemaOperator, TableIdentifier};

use super::{query_error, quote_ident, TYPE};

#[derive(Debug)]
pub struct MysqlSchema {
    pool: Pool,
}

impl MysqlSchema {
    pub(super) fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self, operation: &str) -> Result<mysql_async::Conn, DatabaseError> {
        self.pool
            .get_conn()
            .await
            .map_err(|e| query_error(operation, e))
    }

    async fn table_schema(&self, name: &str) -> Result<Table, DatabaseError> {
        let operation = "get_table_schema";
        let mut conn = self.conn(operation).await?;

        let columns: Vec<(String, String, String, Option<String>, String, String, String)> = conn
            .exec(
                "SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE, COLUMN_DEFAULT, \
                        COLUMN_KEY, EXTRA, COLUMN_TYPE \
                 FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (name,),
            )
            .await
            .map_err(|e| query_error(operation, e))?;
        if columns.is_empty() {
            return Err(DatabaseError::new(
                TYPE.as_str(),
                operation,
                ErrorKind::NotFound(ResourceKind::Table, name.to_string()),
            ));
        }

        let mut model_columns = Vec::with_capacity(columns.len());
        let mut primary_key = Vec::new();
        for (column_name, data_type, is_nullable, default, column_key, extra, column_type) in
            columns
        {
            let primary = column_key == "PRI";
            if primary {
                primary_key.push(column_name.clone());
            }
            model_columns.push(Column {
                name: column_name,
                semantic_type: semantic_type_of(&data_type, &column_type),
                nullable: is_nullable == "YES" && !primary,
                default,
                primary_key: primary,
                auto_increment: extra.contains("auto_increment"),
                native_type: Some(column_type),
            });
        }

        let mut constraints = Vec::new();
        if !primary_key.is_empty() {
            constraints.push(Constraint::PrimaryKey {
                name: Some("PRIMARY".to_string()),
                columns: primary_key,
            });
        }

        let foreign_keys: Vec<(String, String, String, String)> = conn
            .exec(
                "SELECT CONSTRAINT_NAME, COLUMN_NAME, REFERENCED_TABLE_NAME, \
                        REFERENCED_COLUMN_NAME \
                 FROM information_schema.KEY_COLUMN_USAGE \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
                 AND REFERENCED_TABLE_NAME IS NOT NULL \
                 ORDER BY CONSTRAINT_NAME, ORDINAL_POSITION",
                (name,),
            )
            .await
            .map_err(|e| query_error(operation, e))?;
        let mut grouped: BTreeMap<String, (Vec<String>, String, Vec<String>)> = BTreeMap::new();
        for (constraint, column, referenced_table, referenced_column) in foreign_keys {
            let entry = grouped
                .entry(constraint)
                .or_insert_with(|| (vec![], referenced_table.clone(), vec![]));
            entry.0.push(column);
            entry.2.push(referenced_column);
        }
        constraints.extend(grouped.into_iter().map(
            |(constraint, (columns, referenced_table, referenced_columns))| {
                Constraint::ForeignKey {
                    name: Some(constraint),
                    columns,
                    referenced_table,
                    referenced_columns,
                }
            },
        ));

        let index_rows: Vec<(String, String, i64)> = conn
            .exec(
                "SELECT INDEX_NAME, COLUMN_NAME, NON_UNIQUE \
                 FROM information_schema.STATISTICS \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
                 ORDER BY INDEX_NAME, SEQ_IN_INDEX",
                (name,),
            )
            .await
            .map_err(|e| query_error(operation, e))?;
        let mut indexes: BTreeMap<String, Index> = BTreeMap::new();
        for (index_name, column, non_unique) in index_rows {
            let entry = indexes.entry(index_name.clone()).or_insert_with(|| Index {
                name: index_name,
                columns: vec![],
                unique: non_unique == 0,
            });
            entry.columns.push(column);
        }

        Ok(Table {
            schema: None,
            name: name.to_string(),
            columns: model_columns,
            indexes: indexes.into_values().collect(),
            constraints,
        })
    }
}

fn semantic_type_of(data_type: &str, column_type: &str) -> SemanticType {
    match data_type {
        "tinyint" if column_type == "tinyint(1)" => SemanticType::Boolean,
        "tinyint" | "smallint" => SemanticType::Int16,
        "int" | "mediumint" => SemanticType::Int32,
        "bigint" => SemanticType::Int64,
        "float" => SemanticType::Float32,
        "double" => SemanticType::Float64,
        "decimal" => SemanticType::Decimal,
        "char" | "varchar" => SemanticType::String,
        "text" | "tinytext" | "mediumtext" | "longtext" => SemanticType::Text,
        "binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob" => {
            SemanticType::Binary
        }
        "date" => SemanticType::Date,
        "time" => SemanticType::Time,
        "datetime" | "timestamp" => SemanticType::Timestamp,
        "json" => SemanticType::Json,
        "enum" => SemanticType::Enum(column_type.to_string()),
        _ => SemanticType::Text,
    }
}

fn ddl_type(column: &Column) -> String {
    match &column.semantic_type {
        SemanticType::Boolean => "TINYINT(1)".to_string(),
        SemanticType::Int16 => "SMALLINT".to_string(),
        SemanticType::Int32 => "INT".to_string(),
        SemanticType::Int64 => "BIGINT".to_string(),
        SemanticType::Float32 => "FLOAT".to_string(),
        SemanticType::Float64 => "DOUBLE".to_string(),
        SemanticType::Decimal => "DECIMAL(38, 10)".to_string(),
        SemanticType::String => "VARCHAR(255)".to_string(),
        SemanticType::Text => "TEXT".to_string(),
        SemanticType::Binary => "BLOB".to_string(),
        SemanticType::Date => "DATE".to_string(),
        SemanticType::Time => "TIME".to_string(),
        SemanticType::Timestamp => "DATETIME(6)".to_string(),
        SemanticType::TimestampTz => "TIMESTAMP(6)".to_string(),
        SemanticType::Uuid => "CHAR(36)".to_string(),
        SemanticType::Json => "JSON".to_string(),
        SemanticType::Enum(definition) => definition.clone(),
    }
}

#[async_trait]
impl SchemaOperator for MysqlSchema {
    async fn discover_schema(&self) -> Result<UnifiedModel, DatabaseError> {
        let operation = "discover_schema";
        let mut conn = self.conn(operation).await?;

        let tables: Vec<String> = conn
            .query(
                "SELECT TABLE_NAME FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' \
                 ORDER BY TABLE_NAME",
            )
            .await
            .map_err(|e| query_error(operation, e))?;
        drop(conn);

        let mut model = UnifiedModel::default();
        for table in tables {
            model.tables.push(self.table_schema(&table).await?);
        }

        let mut conn = self.conn(operation).await?;
        let views: Vec<(String, Option<String>)> = conn
            .query(
                "SELECT TABLE_NAME, VIEW_DEFINITION FROM information_schema.VIEWS \
                 WHERE TABLE_SCHEMA = DATABASE() ORDER BY TABLE_NAME",
            )
            .await
            .map_err(|e| query_error(operation, e))?;
        model.views = views
            .into_iter()
            .map(|(name, definition)| View {
                schema: None,
                name,
                definition: definition.unwrap_or_default(),
            })
            .collect();

        let triggers: Vec<(String, String, String, String)> = conn
            .query(
                "SELECT TRIGGER_NAME, EVENT_OBJECT_TABLE, EVENT_MANIPULATION, ACTION_TIMING \
                 FROM information_schema.TRIGGERS \
                 WHERE TRIGGER_SCHEMA = DATABASE() ORDER BY TRIGGER_NAME",
            )
            .await
            .map_err(|e| query_error(operation, e))?;
        model.triggers = triggers
            .into_iter()
            .map(|(name, table, event, timing)| Trigger {
                name,
                table,
                event,
                timing,
                definition: None,
            })
            .collect();

        Ok(model)
    }

    async fn create_structure(&self, model: &UnifiedModel) -> Result<(), DatabaseError> {
        let operation = "create_structure";
        model.validate().map_err(|e| {
            DatabaseError::new(
                TYPE.as_str(),
                operation,
                ErrorKind::InvalidConfiguration(e.to_string()),
            )
        })?;

        let mut conn = self.conn(operation).await?;
        for table in &model.tables {
            let mut definitions: Vec<String> = table
                .columns
                .iter()
                .map(|column| {
                    let mut definition =
                        format!("{} {}", quote_ident(&column.name), ddl_type(column));
                    if !column.nullable {
                        definition.push_str(" NOT NULL");
                    }
                    if column.auto_increment {
                        definition.push_str(" AUTO_INCREMENT");
                    } else if let Some(default) = &column.default {
                        definition.push_str(&format!(" DEFAULT {default}"));
                    }
                    definition
                })
                .collect();
            let primary_key = table.primary_key_columns();
            if !primary_key.is_empty() {
                let columns: Vec<String> =
                    primary_key.iter().map(|c| quote_ident(c)).collect();
                definitions.push(format!("PRIMARY KEY ({})", columns.join(", ")));
            }
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                quote_ident(&table.name),
                definitions.join(", ")
            );
            conn.query_drop(sql)
                .await
                .map_err(|e| query_error(operation, e))?;
        }
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<TableIdentifier>, DatabaseError> {
        let mut conn = self.conn("list_tables").await?;
        let tables: Vec<String> = conn
            .query(
                "SELECT TABLE_NAME FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' \
                 ORDER BY TABLE_NAME",
            )
            .await
            .map_err(|e| query_error("list_tables", e))?;
        Ok(tables.into_iter().map(TableIdentifier::new).collect())
    }

    async fn get_table_schema(&self, table: &TableIdentifier) -> Result<Table, DatabaseError> {
        self.table_schema(&table.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boolean_detection_uses_column_type() {
        assert_eq!(
            semantic_type_of("tinyint", "tinyint(1)"),
            SemanticType::Boolean
        );
        assert_eq!(
            semantic_type_of("tinyint", "tinyint(4)"),
            SemanticType::Int16
        );
        assert_eq!(semantic_type_of("bigint", "bigint"), SemanticType::Int64);
        assert_eq!(
            semantic_type_of("enum", "enum('a','b')"),
            SemanticType::Enum("enum('a','b')".to_string())
        );
    }
}
