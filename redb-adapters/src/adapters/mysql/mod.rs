//! MySQL adapter: schema, data and metadata groups over `mysql_async`.
//!
//! Replication is reported unsupported in this revision; callers observe
//! that through the capability catalog and the null replication operator.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use mysql_async::{Opts, OptsBuilder, Pool};
use redb_types::errors::{DatabaseError, ErrorKind, ResourceKind};
use redb_types::models::{ConnectionConfig, DatabaseType, InstanceConfig, JsonRow};
use redb_types::serde_json::{self, Number, Value};

use crate::interface::unsupported::UnsupportedReplication;
use crate::interface::{Connection, DatabaseAdapter, InstanceConnection};

mod data;
mod instance;
mod metadata;
mod schema;

pub use data::MysqlData;
pub use metadata::MysqlMetadata;
pub use schema::MysqlSchema;

pub(crate) const TYPE: DatabaseType = DatabaseType::Mysql;

// Error 1045: access denied, 1146: unknown table, 1064: parse error,
// 1049: unknown database, 1142: command denied.
pub(super) fn query_error(operation: &str, e: mysql_async::Error) -> DatabaseError {
    let kind = match &e {
        mysql_async::Error::Server(server) => match server.code {
            1045 => ErrorKind::AuthenticationFailed(server.message.clone()),
            1049 => ErrorKind::NotFound(ResourceKind::Database, server.message.clone()),
            1146 => ErrorKind::NotFound(ResourceKind::Table, server.message.clone()),
            1064 => ErrorKind::InvalidQuery(server.message.clone()),
            1142 => ErrorKind::PermissionDenied(server.message.clone()),
            _ => ErrorKind::TransactionFailed(Box::new(e)),
        },
        mysql_async::Error::Io(_) | mysql_async::Error::Driver(_) => {
            ErrorKind::ConnectionFailed(Box::new(e))
        }
        _ => ErrorKind::TransactionFailed(Box::new(e)),
    };
    DatabaseError::new(TYPE.as_str(), operation, kind)
}

pub(super) fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

pub(super) fn json_to_mysql(value: &Value) -> mysql_async::Value {
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Bool(b) => mysql_async::Value::Int(i64::from(*b)),
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                mysql_async::Value::Int(v)
            } else if let Some(v) = n.as_u64() {
                mysql_async::Value::UInt(v)
            } else {
                mysql_async::Value::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => mysql_async::Value::Bytes(s.clone().into_bytes()),
        other => mysql_async::Value::Bytes(other.to_string().into_bytes()),
    }
}

pub(super) fn row_to_json(row: &mysql_async::Row) -> JsonRow {
    use mysql_async::consts::ColumnType;

    let mut out = JsonRow::new();
    let columns = row.columns_ref().to_vec();
    for (i, column) in columns.iter().enumerate() {
        let value = row.as_ref(i).cloned().unwrap_or(mysql_async::Value::NULL);
        let json = match value {
            mysql_async::Value::NULL => Value::Null,
            mysql_async::Value::Int(v) => Value::Number(v.into()),
            mysql_async::Value::UInt(v) => Value::Number(v.into()),
            mysql_async::Value::Float(v) => Number::from_f64(f64::from(v))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            mysql_async::Value::Double(v) => Number::from_f64(v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            mysql_async::Value::Date(year, month, day, hour, minute, second, micros) => {
                if column.column_type() == ColumnType::MYSQL_TYPE_DATE {
                    Value::String(format!("{year:04}-{month:02}-{day:02}"))
                } else {
                    Value::String(format!(
                        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{micros:06}"
                    ))
                }
            }
            mysql_async::Value::Time(negative, days, hours, minutes, seconds, micros) => {
                let sign = if negative { "-" } else { "" };
                let hours = u32::from(hours) + days * 24;
                Value::String(format!(
                    "{sign}{hours:02}:{minutes:02}:{seconds:02}.{micros:06}"
                ))
            }
            mysql_async::Value::Bytes(bytes) => match column.column_type() {
                ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => {
                    String::from_utf8(bytes)
                        .ok()
                        .and_then(|s| serde_json::from_str::<Number>(&s).ok())
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
                ColumnType::MYSQL_TYPE_JSON => String::from_utf8(bytes)
                    .ok()
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or(Value::Null),
                ColumnType::MYSQL_TYPE_BLOB
                | ColumnType::MYSQL_TYPE_TINY_BLOB
                | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
                | ColumnType::MYSQL_TYPE_LONG_BLOB
                    if column.flags().contains(
                        mysql_async::consts::ColumnFlags::BINARY_FLAG,
                    ) =>
                {
                    Value::String(BASE64.encode(&bytes))
                }
                _ => match String::from_utf8(bytes) {
                    Ok(text) => Value::String(text),
                    Err(raw) => Value::String(BASE64.encode(raw.as_bytes())),
                },
            },
        };
        out.insert(column.name_str().to_string(), json);
    }
    out
}

#[derive(Debug, Clone, Copy)]
pub struct MysqlAdapter;

fn build_pool(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    database: Option<&str>,
) -> Pool {
    let mut builder = OptsBuilder::default()
        .ip_or_hostname(host)
        .tcp_port(port)
        .user(Some(username));
    if !password.is_empty() {
        builder = builder.pass(Some(password));
    }
    if let Some(database) = database {
        builder = builder.db_name(Some(database));
    }
    Pool::new(Opts::from(builder))
}

#[async_trait]
impl DatabaseAdapter for MysqlAdapter {
    fn database_type(&self) -> DatabaseType {
        TYPE
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Connection, DatabaseError> {
        if config.database.is_empty() {
            return Err(DatabaseError::new(
                TYPE.as_str(),
                "connect",
                ErrorKind::InvalidConfiguration("database name must not be empty".to_string()),
            ));
        }
        let pool = build_pool(
            &config.host,
            config.port,
            &config.username,
            &config.password,
            Some(&config.database),
        );
        // Fail fast instead of at the first operator call.
        pool.get_conn().await.map_err(|e| query_error("connect", e))?;

        Ok(Connection::new(
            TYPE,
            config.clone(),
            Arc::new(MysqlSchema::new(pool.clone())),
            Arc::new(MysqlData::new(pool.clone())),
            Arc::new(UnsupportedReplication(TYPE)),
            Arc::new(MysqlMetadata::new(pool)),
        ))
    }

    async fn connect_instance(
        &self,
        config: &InstanceConfig,
    ) -> Result<InstanceConnection, DatabaseError> {
        let pool = build_pool(
            &config.host,
            config.port,
            &config.username,
            &config.password,
            None,
        );
        Ok(InstanceConnection {
            database_type: TYPE,
            config: config.clone(),
            instance: Arc::new(instance::MysqlInstance::new(pool)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idents_are_quoted() {
        assert_eq!(quote_ident("users"), "`users`");
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn json_values_map_to_mysql_values() {
        assert_eq!(json_to_mysql(&Value::Null), mysql_async::Value::NULL);
        assert_eq!(
            json_to_mysql(&Value::Bool(true)),
            mysql_async::Value::Int(1)
        );
        assert_eq!(
            json_to_mysql(&Value::String("x".to_string())),
            mysql_async::Value::Bytes(b"x".to_vec())
        );
    }
}
