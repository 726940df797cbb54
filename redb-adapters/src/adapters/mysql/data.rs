use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Params, Pool};
use redb_types::errors::{DatabaseError, ErrorKind};
use redb_types::models::JsonRow;

use crate::interface::{DataOperator, StreamParams, StreamResult, TableIdentifier};

use super::{json_to_mysql, query_error, quote_ident, row_to_json, TYPE};

const INSERT_CHUNK: usize = 100;

#[derive(Debug)]
pub struct MysqlData {
    pool: Pool,
}

impl MysqlData {
    pub(super) fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self, operation: &str) -> Result<mysql_async::Conn, DatabaseError> {
        self.pool
            .get_conn()
            .await
            .map_err(|e| query_error(operation, e))
    }

    fn where_clause(filter: &JsonRow) -> (String, Vec<mysql_async::Value>) {
        let mut predicates = Vec::new();
        let mut params = Vec::new();
        for (column, value) in filter {
            if value.is_null() {
                predicates.push(format!("{} IS NULL", quote_ident(column)));
            } else {
                predicates.push(format!("{} = ?", quote_ident(column)));
                params.push(json_to_mysql(value));
            }
        }
        let clause = if predicates.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", predicates.join(" AND "))
        };
        (clause, params)
    }

    async fn write(
        &self,
        operation: &str,
        sql: &str,
        params: Vec<mysql_async::Value>,
    ) -> Result<u64, DatabaseError> {
        let mut conn = self.conn(operation).await?;
        let result = conn
            .exec_iter(sql, Params::Positional(params))
            .await
            .map_err(|e| query_error(operation, e))?;
        Ok(result.affected_rows())
    }

    async fn multi_row_write(
        &self,
        operation: &str,
        table: &TableIdentifier,
        rows: &[JsonRow],
        suffix: impl Fn(&[&String]) -> String,
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
        let row_placeholder = format!(
            "({})",
            vec!["?"; columns.len()].join(", ")
        );

        let mut affected = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let placeholders = vec![row_placeholder.clone(); chunk.len()].join(", ");
            let mut params = Vec::with_capacity(chunk.len() * columns.len());
            for row in chunk {
                for column in &columns {
                    params.push(
                        row.get(*column)
                            .map(json_to_mysql)
                            .unwrap_or(mysql_async::Value::NULL),
                    );
                }
            }
            let sql = format!(
                "INSERT INTO {} ({column_list}) VALUES {placeholders}{}",
                quote_ident(&table.name),
                suffix(&columns)
            );
            affected += self.write(operation, &sql, params).await?;
        }
        Ok(affected)
    }
}

#[async_trait]
impl DataOperator for MysqlData {
    async fn fetch(
        &self,
        table: &TableIdentifier,
        limit: Option<usize>,
    ) -> Result<Vec<JsonRow>, DatabaseError> {
        let mut sql = format!("SELECT * FROM {}", quote_ident(&table.name));
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let mut conn = self.conn("fetch").await?;
        let rows: Vec<mysql_async::Row> = conn
            .query(sql)
            .await
            .map_err(|e| query_error("fetch", e))?;
        Ok(rows.iter().map(row_to_json).collect())
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
        let mut sql = format!(
            "SELECT {column_list} FROM {}",
            quote_ident(&table.name)
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let mut conn = self.conn("fetch_with_columns").await?;
        let rows: Vec<mysql_async::Row> = conn
            .query(sql)
            .await
            .map_err(|e| query_error("fetch_with_columns", e))?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn insert(
        &self,
        table: &TableIdentifier,
        rows: &[JsonRow],
    ) -> Result<u64, DatabaseError> {
        self.multi_row_write("insert", table, rows, |_| String::new())
            .await
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
        let mut params = Vec::with_capacity(assignments.len());
        for (column, value) in assignments {
            sets.push(format!("{} = ?", quote_ident(column)));
            params.push(json_to_mysql(value));
        }
        let (clause, filter_params) = Self::where_clause(filter);
        params.extend(filter_params);
        let sql = format!(
            "UPDATE {} SET {}{clause}",
            quote_ident(&table.name),
            sets.join(", ")
        );
        self.write("update", &sql, params).await
    }

    async fn upsert(
        &self,
        table: &TableIdentifier,
        key_columns: &[String],
        rows: &[JsonRow],
    ) -> Result<u64, DatabaseError> {
        if key_columns.is_empty() {
            return Err(DatabaseError::new(
                TYPE.as_str(),
                "upsert",
                ErrorKind::InvalidQuery("upsert needs at least one key column".to_string()),
            ));
        }
        self.multi_row_write("upsert", table, rows, |columns| {
            let updates: Vec<String> = columns
                .iter()
                .filter(|c| !key_columns.contains(**c))
                .map(|c| format!("{0} = VALUES({0})", quote_ident(c)))
                .collect();
            match key_columns.first() {
                // Nothing beyond the key: keep the statement a no-op update.
                Some(key) if updates.is_empty() => {
                    let key = quote_ident(key);
                    format!(" ON DUPLICATE KEY UPDATE {key} = {key}")
                }
                _ => format!(" ON DUPLICATE KEY UPDATE {}", updates.join(", ")),
            }
        })
        .await
    }

    async fn delete(
        &self,
        table: &TableIdentifier,
        filter: &JsonRow,
    ) -> Result<u64, DatabaseError> {
        let (clause, params) = Self::where_clause(filter);
        let sql = format!("DELETE FROM {}{clause}", quote_ident(&table.name));
        self.write("delete", &sql, params).await
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
        let sql = format!(
            "SELECT {column_list} FROM {} ORDER BY 1 LIMIT {offset}, {}",
            quote_ident(&params.table.name),
            params.batch_size + 1
        );
        let mut conn = self.conn("stream").await?;
        let rows: Vec<mysql_async::Row> = conn
            .query(sql)
            .await
            .map_err(|e| query_error("stream", e))?;

        let has_more = rows.len() > params.batch_size;
        let batch: Vec<JsonRow> = rows[..rows.len().min(params.batch_size)]
            .iter()
            .map(row_to_json)
            .collect();
        let next_cursor = has_more.then(|| (offset + batch.len()).to_string());
        Ok(StreamResult {
            batch,
            has_more,
            next_cursor,
        })
    }

    async fn execute_query(&self, query: &str) -> Result<Vec<JsonRow>, DatabaseError> {
        let mut conn = self.conn("execute_query").await?;
        let rows: Vec<mysql_async::Row> = conn
            .query(query)
            .await
            .map_err(|e| query_error("execute_query", e))?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn execute_count_query(&self, query: &str) -> Result<u64, DatabaseError> {
        let mut conn = self.conn("execute_count_query").await?;
        let count: Option<u64> = conn
            .query_first(query)
            .await
            .map_err(|e| query_error("execute_count_query", e))?;
        Ok(count.unwrap_or(0))
    }

    async fn get_row_count(
        &self,
        table: &TableIdentifier,
        filter: Option<&str>,
    ) -> Result<u64, DatabaseError> {
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&table.name));
        if let Some(filter) = filter {
            sql.push_str(&format!(" WHERE {filter}"));
        }
        self.execute_count_query(&sql).await
    }

    async fn wipe(&self) -> Result<(), DatabaseError> {
        let mut conn = self.conn("wipe").await?;
        let tables: Vec<String> = conn
            .query(
                "SELECT TABLE_NAME FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' \
                 ORDER BY TABLE_NAME",
            )
            .await
            .map_err(|e| query_error("wipe", e))?;
        for table in tables {
            let sql = format!("DELETE FROM {}", quote_ident(&table));
            conn.query_drop(sql)
                .await
                .map_err(|e| query_error("wipe", e))?;
        }
        Ok(())
    }
}
