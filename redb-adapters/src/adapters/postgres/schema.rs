use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use redb_types::errors::{DatabaseError, ErrorKind, ResourceKind};
use redb_types::models::{
    Column, Constraint, EnumType, Extension, Index, Procedure, SchemaInfo, SemanticType,
    Sequence, Table, Trigger, UnifiedModel, View,
};
use tokio_postgres::Client;

use super::connection::{qualify, query_error, quote_ident};
use super::TYPE;

#[derive(Debug)]
pub struct PostgresSchema {
    client: Arc<Client>,
    schema_filter: Option<String>,
}

impl PostgresSchema {
    pub(super) fn new(client: Arc<Client>, schema_filter: Option<String>) -> Self {
        Self {
            client,
            schema_filter,
        }
    }

    async fn table_names(&self) -> Result<Vec<(String, String)>, DatabaseError> {
        let sql = "SELECT table_schema, table_name FROM information_schema.tables \
                   WHERE table_type = 'BASE TABLE' \
                   AND table_schema NOT IN ('pg_catalog', 'information_schema') \
                   AND ($1::text IS NULL OR table_schema = $1) \
                   ORDER BY table_schema, table_name";
        let rows = self
            .client
            .query(sql, &[&self.schema_filter])
            .await
            .map_err(|e| query_error("list_tables", e))?;
        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    async fn table_schema(&self, schema: &str, name: &str) -> Result<Table, DatabaseError> {
        let operation = "get_table_schema";

        let sql = "SELECT column_name, udt_name, is_nullable, column_default, \
                          is_identity, data_type \
                   FROM information_schema.columns \
                   WHERE table_schema = $1 AND table_name = $2 \
                   ORDER BY ordinal_position";
        let rows = self
            .client
            .query(sql, &[&schema, &name])
            .await
            .map_err(|e| query_error(operation, e))?;
        if rows.is_empty() {
            return Err(DatabaseError::new(
                TYPE.as_str(),
                operation,
                ErrorKind::NotFound(ResourceKind::Table, format!("{schema}.{name}")),
            ));
        }

        let primary_key = self.primary_key_columns(schema, name).await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let column_name: String = row.get(0);
            let udt_name: String = row.get(1);
            let is_nullable: String = row.get(2);
            let default: Option<String> = row.get(3);
            let is_identity: String = row.get(4);

            let serial_default = default
                .as_deref()
                .map(|d| d.starts_with("nextval("))
                .unwrap_or(false);
            let primary = primary_key.contains(&column_name);
            columns.push(Column {
                name: column_name,
                semantic_type: semantic_type_of(&udt_name),
                nullable: is_nullable == "YES" && !primary,
                default,
                primary_key: primary,
                auto_increment: is_identity == "YES" || serial_default,
                native_type: Some(udt_name),
            });
        }

        let mut constraints = Vec::new();
        if !primary_key.is_empty() {
            constraints.push(Constraint::PrimaryKey {
                name: Some(format!("{name}_pkey")),
                columns: primary_key,
            });
        }
        constraints.extend(self.foreign_keys(schema, name).await?);

        Ok(Table {
            schema: Some(schema.to_string()),
            name: name.to_string(),
            columns,
            indexes: self.indexes(schema, name).await?,
            constraints,
        })
    }

    async fn primary_key_columns(
        &self,
        schema: &str,
        name: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let sql = "SELECT a.attname \
                   FROM pg_index i \
                   JOIN pg_class c ON c.oid = i.indrelid \
                   JOIN pg_namespace n ON n.oid = c.relnamespace \
                   JOIN pg_attribute a ON a.attrelid = i.indrelid \
                        AND a.attnum = ANY(i.indkey) \
                   WHERE i.indisprimary AND n.nspname = $1 AND c.relname = $2 \
                   ORDER BY a.attnum";
        let rows = self
            .client
            .query(sql, &[&schema, &name])
            .await
            .map_err(|e| query_error("get_table_schema", e))?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn foreign_keys(
        &self,
        schema: &str,
        name: &str,
    ) -> Result<Vec<Constraint>, DatabaseError> {
        let sql = "SELECT tc.constraint_name, kcu.column_name, \
                          ccu.table_name, ccu.column_name \
                   FROM information_schema.table_constraints tc \
                   JOIN information_schema.key_column_usage kcu \
                        ON tc.constraint_name = kcu.constraint_name \
                        AND tc.table_schema = kcu.table_schema \
                   JOIN information_schema.constraint_column_usage ccu \
                        ON ccu.constraint_name = tc.constraint_name \
                        AND ccu.table_schema = tc.table_schema \
                   WHERE tc.constraint_type = 'FOREIGN KEY' \
                   AND tc.table_schema = $1 AND tc.table_name = $2 \
                   ORDER BY tc.constraint_name, kcu.ordinal_position";
        let rows = self
            .client
            .query(sql, &[&schema, &name])
            .await
            .map_err(|e| query_error("get_table_schema", e))?;

        let mut grouped: BTreeMap<String, (Vec<String>, String, Vec<String>)> = BTreeMap::new();
        for row in &rows {
            let constraint: String = row.get(0);
            let column: String = row.get(1);
            let referenced_table: String = row.get(2);
            let referenced_column: String = row.get(3);
            let entry = grouped
                .entry(constraint)
                .or_insert_with(|| (vec![], referenced_table.clone(), vec![]));
            entry.0.push(column);
            entry.2.push(referenced_column);
        }
        Ok(grouped
            .into_iter()
            .map(
                |(constraint, (columns, referenced_table, referenced_columns))| {
                    Constraint::ForeignKey {
                        name: Some(constraint),
                        columns,
                        referenced_table,
                        referenced_columns,
                    }
                },
            )
            .collect())
    }

    async fn indexes(&self, schema: &str, name: &str) -> Result<Vec<Index>, DatabaseError> {
        let sql = "SELECT indexname, indexdef FROM pg_indexes \
                   WHERE schemaname = $1 AND tablename = $2 \
                   ORDER BY indexname";
        let rows = self
            .client
            .query(sql, &[&schema, &name])
            .await
            .map_err(|e| query_error("get_table_schema", e))?;
        Ok(rows
            .iter()
            .map(|row| {
                let index_name: String = row.get(0);
                let definition: String = row.get(1);
                Index {
                    unique: definition.starts_with("CREATE UNIQUE"),
                    columns: index_columns(&definition),
                    name: index_name,
                }
            })
            .collect())
    }
}

/// Column list from a `CREATE INDEX ... (a, b)` definition.
fn index_columns(definition: &str) -> Vec<String> {
    let Some(open) = definition.find('(') else {
        return vec![];
    };
    let Some(close) = definition.rfind(')') else {
        return vec![];
    };
    definition[open + 1..close]
        .split(',')
        .map(|c| c.trim().trim_matches('"').to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

fn semantic_type_of(udt_name: &str) -> SemanticType {
    match udt_name {
        "bool" => SemanticType::Boolean,
        "int2" => SemanticType::Int16,
        "int4" => SemanticType::Int32,
        "int8" => SemanticType::Int64,
        "float4" => SemanticType::Float32,
        "float8" => SemanticType::Float64,
        "numeric" => SemanticType::Decimal,
        "varchar" | "bpchar" | "name" => SemanticType::String,
        "text" => SemanticType::Text,
        "bytea" => SemanticType::Binary,
        "date" => SemanticType::Date,
        "time" | "timetz" => SemanticType::Time,
        "timestamp" => SemanticType::Timestamp,
        "timestamptz" => SemanticType::TimestampTz,
        "uuid" => SemanticType::Uuid,
        "json" | "jsonb" => SemanticType::Json,
        other => SemanticType::Enum(other.to_string()),
    }
}

fn ddl_type(column: &Column) -> String {
    if let Some(native) = &column.native_type {
        if !native.is_empty() {
            return native.clone();
        }
    }
    match &column.semantic_type {
        SemanticType::Boolean => "boolean".to_string(),
        SemanticType::Int16 => "smallint".to_string(),
        SemanticType::Int32 => "integer".to_string(),
        SemanticType::Int64 => "bigint".to_string(),
        SemanticType::Float32 => "real".to_string(),
        SemanticType::Float64 => "double precision".to_string(),
        SemanticType::Decimal => "numeric".to_string(),
        SemanticType::String => "varchar".to_string(),
        SemanticType::Text => "text".to_string(),
        SemanticType::Binary => "bytea".to_string(),
        SemanticType::Date => "date".to_string(),
        SemanticType::Time => "time".to_string(),
        SemanticType::Timestamp => "timestamp".to_string(),
        SemanticType::TimestampTz => "timestamptz".to_string(),
        SemanticType::Uuid => "uuid".to_string(),
        SemanticType::Json => "jsonb".to_string(),
        SemanticType::Enum(name) => quote_ident(name),
    }
}

#[async_trait]
impl crate::interface::SchemaOperator for PostgresSchema {
    async fn discover_schema(&self) -> Result<UnifiedModel, DatabaseError> {
        let operation = "discover_schema";
        let mut model = UnifiedModel::default();

        let sql = "SELECT schema_name FROM information_schema.schemata \
                   WHERE schema_name NOT IN ('pg_catalog', 'information_schema') \
                   AND schema_name NOT LIKE 'pg_%' \
                   AND ($1::text IS NULL OR schema_name = $1) \
                   ORDER BY schema_name";
        let rows = self
            .client
            .query(sql, &[&self.schema_filter])
            .await
            .map_err(|e| query_error(operation, e))?;
        model.schemas = rows
            .iter()
            .map(|r| SchemaInfo {
                name: r.get(0),
                comment: None,
            })
            .collect();

        for (schema, name) in self.table_names().await? {
            model.tables.push(self.table_schema(&schema, &name).await?);
        }

        let sql = "SELECT table_schema, table_name, view_definition \
                   FROM information_schema.views \
                   WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
                   AND ($1::text IS NULL OR table_schema = $1) \
                   ORDER BY table_schema, table_name";
        let rows = self
            .client
            .query(sql, &[&self.schema_filter])
            .await
            .map_err(|e| query_error(operation, e))?;
        model.views = rows
            .iter()
            .map(|r| View {
                schema: Some(r.get(0)),
                name: r.get(1),
                definition: r.get::<_, Option<String>>(2).unwrap_or_default(),
            })
            .collect();

        let sql = "SELECT t.typname, e.enumlabel \
                   FROM pg_type t JOIN pg_enum e ON t.oid = e.enumtypid \
                   ORDER BY t.typname, e.enumsortorder";
        let rows = self
            .client
            .query(sql, &[])
            .await
            .map_err(|e| query_error(operation, e))?;
        let mut enums: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in &rows {
            enums
                .entry(row.get(0))
                .or_default()
                .push(row.get(1));
        }
        model.enums = enums
            .into_iter()
            .map(|(name, values)| EnumType { name, values })
            .collect();

        let sql = "SELECT sequence_name, start_value, increment \
                   FROM information_schema.sequences \
                   WHERE sequence_schema NOT IN ('pg_catalog', 'information_schema') \
                   ORDER BY sequence_name";
        let rows = self
            .client
            .query(sql, &[])
            .await
            .map_err(|e| query_error(operation, e))?;
        model.sequences = rows
            .iter()
            .map(|r| Sequence {
                name: r.get(0),
                start: r
                    .get::<_, Option<String>>(1)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1),
                increment: r
                    .get::<_, Option<String>>(2)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1),
            })
            .collect();

        let sql = "SELECT extname, extversion FROM pg_extension ORDER BY extname";
        let rows = self
            .client
            .query(sql, &[])
            .await
            .map_err(|e| query_error(operation, e))?;
        model.extensions = rows
            .iter()
            .map(|r| Extension {
                name: r.get(0),
                version: r.get(1),
            })
            .collect();

        let sql = "SELECT DISTINCT trigger_name, event_object_table, \
                          event_manipulation, action_timing \
                   FROM information_schema.triggers \
                   ORDER BY trigger_name";
        let rows = self
            .client
            .query(sql, &[])
            .await
            .map_err(|e| query_error(operation, e))?;
        model.triggers = rows
            .iter()
            .map(|r| Trigger {
                name: r.get(0),
                table: r.get(1),
                event: r.get(2),
                timing: r.get(3),
                definition: None,
            })
            .collect();

        let sql = "SELECT n.nspname, p.proname, l.lanname \
                   FROM pg_proc p \
                   JOIN pg_namespace n ON p.pronamespace = n.oid \
                   JOIN pg_language l ON p.prolang = l.oid \
                   WHERE n.nspname NOT IN ('pg_catalog', 'information_schema') \
                   ORDER BY n.nspname, p.proname";
        let rows = self
            .client
            .query(sql, &[])
            .await
            .map_err(|e| query_error(operation, e))?;
        model.procedures = rows
            .iter()
            .map(|r| Procedure {
                schema: Some(r.get(0)),
                name: r.get(1),
                language: r.get(2),
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

        for enum_type in &model.enums {
            let exists = self
                .client
                .query_opt("SELECT 1 FROM pg_type WHERE typname = $1", &[&enum_type.name])
                .await
                .map_err(|e| query_error(operation, e))?;
            if exists.is_none() {
                let values: Vec<String> = enum_type
                    .values
                    .iter()
                    .map(|v| format!("'{}'", v.replace('\'', "''")))
                    .collect();
                let sql = format!(
                    "CREATE TYPE {} AS ENUM ({})",
                    quote_ident(&enum_type.name),
                    values.join(", ")
                );
                self.client
                    .batch_execute(&sql)
                    .await
                    .map_err(|e| query_error(operation, e))?;
            }
        }

        for table in &model.tables {
            let mut definitions: Vec<String> = table
                .columns
                .iter()
                .map(|column| {
                    let mut definition =
                        format!("{} {}", quote_ident(&column.name), ddl_type(column));
                    if column.auto_increment {
                        definition.push_str(" GENERATED BY DEFAULT AS IDENTITY");
                    } else if let Some(default) = &column.default {
                        definition.push_str(&format!(" DEFAULT {default}"));
                    }
                    if !column.nullable {
                        definition.push_str(" NOT NULL");
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
            let identifier = crate::interface::TableIdentifier {
                schema: table.schema.clone(),
                name: table.name.clone(),
            };
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                qualify(&identifier),
                definitions.join(", ")
            );
            self.client
                .batch_execute(&sql)
                .await
                .map_err(|e| query_error(operation, e))?;

            for index in &table.indexes {
                if index.columns.is_empty() || index.name.ends_with("_pkey") {
                    continue;
                }
                let columns: Vec<String> =
                    index.columns.iter().map(|c| quote_ident(c)).collect();
                let sql = format!(
                    "CREATE {} INDEX IF NOT EXISTS {} ON {} ({})",
                    if index.unique { "UNIQUE" } else { "" },
                    quote_ident(&index.name),
                    qualify(&identifier),
                    columns.join(", ")
                );
                self.client
                    .batch_execute(&sql)
                    .await
                    .map_err(|e| query_error(operation, e))?;
            }
        }

        // Foreign keys last, once every referenced table exists.
        for table in &model.tables {
            for constraint in &table.constraints {
                let Constraint::ForeignKey {
                    name,
                    columns,
                    referenced_table,
                    referenced_columns,
                } = constraint
                else {
                    continue;
                };
                let constraint_name = name
                    .clone()
                    .unwrap_or_else(|| format!("{}_{}_fkey", table.name, columns.join("_")));
                let exists = self
                    .client
                    .query_opt(
                        "SELECT 1 FROM pg_constraint WHERE conname = $1",
                        &[&constraint_name],
                    )
                    .await
                    .map_err(|e| query_error(operation, e))?;
                if exists.is_some() {
                    continue;
                }
                let identifier = crate::interface::TableIdentifier {
                    schema: table.schema.clone(),
                    name: table.name.clone(),
                };
                let local: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
                let remote: Vec<String> =
                    referenced_columns.iter().map(|c| quote_ident(c)).collect();
                let sql = format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                    qualify(&identifier),
                    quote_ident(&constraint_name),
                    local.join(", "),
                    quote_ident(referenced_table),
                    remote.join(", ")
                );
                self.client
                    .batch_execute(&sql)
                    .await
                    .map_err(|e| query_error(operation, e))?;
            }
        }

        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<crate::interface::TableIdentifier>, DatabaseError> {
        Ok(self
            .table_names()
            .await?
            .into_iter()
            .map(|(schema, name)| crate::interface::TableIdentifier::with_schema(schema, name))
            .collect())
    }

    async fn get_table_schema(
        &self,
        table: &crate::interface::TableIdentifier,
    ) -> Result<Table, DatabaseError> {
        let schema = table.schema.as_deref().unwrap_or("public");
        self.table_schema(schema, &table.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udt_names_map_to_semantic_types() {
        assert_eq!(semantic_type_of("int4"), SemanticType::Int32);
        assert_eq!(semantic_type_of("timestamptz"), SemanticType::TimestampTz);
        assert_eq!(semantic_type_of("varchar"), SemanticType::String);
        assert_eq!(
            semantic_type_of("mood"),
            SemanticType::Enum("mood".to_string())
        );
    }

    #[test]
    fn index_definition_columns_are_extracted() {
        let definition = "CREATE UNIQUE INDEX users_email_key ON public.users \
                          USING btree (email, \"tenantId\")";
        assert_eq!(index_columns(definition), vec!["email", "tenantId"]);
    }
}
