use std::sync::Arc;

use async_trait::async_trait;
use postgres_types::ToSql;
use redb_types::errors::{DatabaseError, ErrorKind};
use redb_types::models::JsonRow;
use redb_types::serde_json::Value;
use tokio_postgres::Client;

use crate::interface::{DataOperator, StreamParams, StreamResult, TableIdentifier};

use super::connection::{qualify, query_error, quote_ident};
use super::types::{rows_to_json, JsonParam};
use super::TYPE;

const INSERT_CHUNK: usize = 100;
const NULL: Value = Value::Null;

#[derive(Debug)]
pub struct PostgresData {
    client: Arc<Client>,
    schema_filter: Option<String>,
}

impl PostgresData {
    pub(super) fn new(client: Arc<Client>, schema_filter: Option<String>) -> Self {
        Self {
            client,
            schema_filter,
        }
    }

    fn conversion_error(operation: &str, e: Box<dyn std::error::Error + Sync + Send>) -> DatabaseError {
        DatabaseError::new(TYPE.as_str(), operation, ErrorKind::InvalidQuery(e.to_string()))
    }

    async fn select(
        &self,
        operation: &str,
        table: &TableIdentifier,
        column_list: &str,
        limit: Option<usize>,
    ) -> Result<Vec<JsonRow>, DatabaseError> {
        let mut sql = format!("SELECT {column_list} FROM {}", qualify(table));
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let rows = self
            .client
            .query(&sql, &[])
            .await
            .map_err(|e| query_error(operation, e))?;
        rows_to_json(&rows).map_err(|e| Self::conversion_error(operation, e))
    }

    /// `WHERE` clause with one predicate per filter field; JSON nulls become
    /// `IS NULL` so they never bind as parameters.
    fn where_clause(filter: &JsonRow, first_param: usize) -> (String, Vec<&Value>) {
        let mut predicates = Vec::new();
        let mut params = Vec::new();
        let mut index = first_param;
        for (column, value) in filter {
            if value.is_null() {
                predicates.push(format!("{} IS NULL", quote_ident(column)));
            } else {
                predicates.push(format!("{} = ${index}", quote_ident(column)));
                params.push(value);
                index += 1;
            }
        }
        let clause = if predicates.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", predicates.join(" AND "))
        };
        (clause, params)
    }
}

fn as_params<'a>(values: &'a [JsonParam<'a>]) -> Vec<&'a (dyn ToSql + Sync)> {
    values.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

#[async_trait]
impl DataOperator for PostgresData {
    async fn fetch(
        &self,
        table: &TableIdentifier,
        limit: Option<usize>,
    ) -> Result<Vec<JsonRow>, DatabaseError> {
        self.select("fetch", table, "*", limit).await
    }

    async fn fetch_with_columns(
        &self,
        table: &TableIdentifier,
        columns: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<JsonRow>, DatabaseError> {
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        self.select("fetch_with_columns", table, &column_list, limit)
            .await
    }

    async fn insert(
        &self,
        table: &TableIdentifier,
        rows: &[JsonRow],
    ) -> Result<u64, DatabaseError> {
        let Some(first) = rows.first() else {
            return Ok(0);
        };
        let columns: Vec<&String> = first.keys().collect();
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        let mut affected = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut placeholders = Vec::with_capacity(chunk.len());
            let mut values = Vec::with_capacity(chunk.len() * columns.len());
            for (r, row) in chunk.iter().enumerate() {
                let base = r * columns.len();
                let row_placeholders: Vec<String> = (0..columns.len())
                    .map(|c| format!("${}", base + c + 1))
                    .collect();
                placeholders.push(format!("({})", row_placeholders.join(", ")));
                for column in &columns {
                    values.push(JsonParam(row.get(*column).unwrap_or(&NULL)));
                }
            }
            let sql = format!(
                "INSERT INTO {} ({column_list}) VALUES {}",
                qualify(table),
                placeholders.join(", ")
            );
            affected += self
                .client
                .execute(&sql, &as_params(&values))
                .await
                .map_err(|e| query_error("insert", e))?;
        }
        Ok(affected)
    }

    async fn update(
        &self,
        table: &TableIdentifier,
        assignments: &JsonRow,
        filter: &JsonRow,
    ) -> Result<u64, DatabaseError> {
        if assignments.is_empty() {
            return Ok(0);
        }
        let mut sets = Vec::with_capacity(assignments.len());
        let mut values: Vec<&Value> = Vec::with_capacity(assignments.len());
        for (index, (column, value)) in assignments.iter().enumerate() {
            sets.push(format!("{} = ${}", quote_ident(column), index + 1));
            values.push(value);
        }
        let (clause, filter_values) = Self::where_clause(filter, values.len() + 1);
        values.extend(filter_values);

        let sql = format!(
            "UPDATE {} SET {}{clause}",
            qualify(table),
            sets.join(", ")
        );
        let params: Vec<JsonParam> = values.into_iter().map(JsonParam).collect();
        self.client
            .execute(&sql, &as_params(&params))
            .await
            .map_err(|e| query_error("update", e))
    }

    async fn upsert(
        &self,
        table: &TableIdentifier,
        key_columns: &[String],
        rows: &[JsonRow],
    ) -> Result<u64, DatabaseError> {
        let Some(first) = rows.first() else {
            return Ok(0);
        };
        if key_columns.is_empty() {
            return Err(DatabaseError::new(
                TYPE.as_str(),
                "upsert",
                ErrorKind::InvalidQuery("upsert needs at least one key column".to_string()),
            ));
        }
        let columns: Vec<&String> = first.keys().collect();
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let conflict_list = key_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !key_columns.contains(**c))
            .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
            .collect();
        let action = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };

        let mut affected = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut placeholders = Vec::with_capacity(chunk.len());
            let mut values = Vec::with_capacity(chunk.len() * columns.len());
            for (r, row) in chunk.iter().enumerate() {
                let base = r * columns.len();
                let row_placeholders: Vec<String> = (0..columns.len())
                    .map(|c| format!("${}", base + c + 1))
                    .collect();
                placeholders.push(format!("({})", row_placeholders.join(", ")));
                for column in &columns {
                    values.push(JsonParam(row.get(*column).unwrap_or(&NULL)));
                }
            }
            let sql = format!(
                "INSERT INTO {} ({column_list}) VALUES {} ON CONFLICT ({conflict_list}) {action}",
                qualify(table),
                placeholders.join(", ")
            );
            affected += self
                .client
                .execute(&sql, &as_params(&values))
                .await
                .map_err(|e| query_error("upsert", e))?;
        }
        Ok(affected)
    }

    async fn delete(
        &self,
        table: &TableIdentifier,
        filter: &JsonRow,
    ) -> Result<u64, DatabaseError> {
        let (clause, values) = Self::where_clause(filter, 1);
        let sql = format!("DELETE FROM {}{clause}", qualify(table));
        let params: Vec<JsonParam> = values.into_iter().map(JsonParam).collect();
        self.client
            .execute(&sql, &as_params(&params))
            .await
            .map_err(|e| query_error("delete", e))
    }

    async fn stream(&self, params: &StreamParams) -> Result<StreamResult, DatabaseError> {
        let offset: usize = match &params.cursor {
            Some(cursor) => cursor.parse().map_err(|_| {
                DatabaseError::new(
                    TYPE.as_str(),
                    "stream",
                    ErrorKind::InvalidQuery(format!("malformed stream cursor `{cursor}`")),
                )
            })?,
            None => 0,
        };
        let column_list = match &params.columns {
            Some(columns) => columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            None => "*".to_string(),
        };
        // Ordering by the first column keeps the scan deterministic across
        // restarts; the cursor is the row offset into that order.
        let sql = format!(
            "SELECT {column_list} FROM {} ORDER BY 1 OFFSET {offset} LIMIT {}",
            qualify(&params.table),
            params.batch_size + 1
        );
        let rows = self
            .client
            .query(&sql, &[])
            .await
            .map_err(|e| query_error("stream", e))?;

        let has_more = rows.len() > params.batch_size;
        let batch = rows_to_json(&rows[..rows.len().min(params.batch_size)])
            .map_err(|e| Self::conversion_error("stream", e))?;
        let next_cursor = has_more.then(|| (offset + batch.len()).to_string());
        Ok(StreamResult {
            batch,
            has_more,
            next_cursor,
        })
    }

    async fn execute_query(&self, query: &str) -> Result<Vec<JsonRow>, DatabaseError> {
        let rows = self
            .client
            .query(query, &[])
            .await
            .map_err(|e| query_error("execute_query", e))?;
        rows_to_json(&rows).map_err(|e| Self::conversion_error("execute_query", e))
    }

    async fn execute_count_query(&self, query: &str) -> Result<u64, DatabaseError> {
        let row = self
            .client
            .query_one(query, &[])
            .await
            .map_err(|e| query_error("execute_count_query", e))?;
        let count: i64 = row
            .try_get(0)
            .map_err(|e| query_error("execute_count_query", e))?;
        Ok(count.max(0) as u64)
    }

    async fn get_row_count(
        &self,
        table: &TableIdentifier,
        filter: Option<&str>,
    ) -> Result<u64, DatabaseError> {
        let mut sql = format!("SELECT COUNT(*) FROM {}", qualify(table));
        if let Some(filter) = filter {
            sql.push_str(&format!(" WHERE {filter}"));
        }
        self.execute_count_query(&sql).await
    }

    async fn wipe(&self) -> Result<(), DatabaseError> {
        let sql = "SELECT table_schema, table_name FROM information_schema.tables \
                   WHERE table_type = 'BASE TABLE' \
                   AND table_schema NOT IN ('pg_catalog', 'information_schema') \
                   AND ($1::text IS NULL OR table_schema = $1) \
                   ORDER BY table_schema, table_name";
        let rows = self
            .client
            .query(sql, &[&self.schema_filter])
            .await
            .map_err(|e| query_error("wipe", e))?;
        if rows.is_empty() {
            return Ok(());
        }
        let tables: Vec<String> = rows
            .iter()
            .map(|row| {
                let schema: String = row.get(0);
                let name: String = row.get(1);
                format!("{}.{}", quote_ident(&schema), quote_ident(&name))
            })
            .collect();
        let sql = format!("TRUNCATE TABLE {} RESTART IDENTITY CASCADE", tables.join(", "));
        self.client
            .batch_execute(&sql)
            .await
            .map_err(|e| query_error("wipe", e))?;
        Ok(())
    }
}
