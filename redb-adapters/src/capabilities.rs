use redb_types::errors::ErrorKind;
use redb_types::models::DatabaseType;
use redb_types::serde::{Deserialize, Serialize};

use crate::interface::ReplicationMechanism;

/// Boolean capability advertisement for one database technology.
///
/// Callers consult these before invoking an operator group; adapters also
/// ship null-object operators so unsupported calls fail with a classified
/// error instead of a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(crate = "redb_types::serde")]
pub struct Capabilities {
    pub schema_discovery: bool,
    pub schema_creation: bool,
    pub data_read: bool,
    pub data_write: bool,
    pub streaming: bool,
    pub transactions: bool,
    pub replication: bool,
    /// Target offers a batched apply path; the pipeline may coalesce
    /// adjacent inserts when set.
    pub batch_apply: bool,
    /// Target deduplicates re-applied events by transaction id. When false,
    /// delivery is at-least-once and correctness relies on upstream
    /// checkpointing.
    pub transaction_dedupe: bool,
}

/// The static capability catalog, one entry per known technology.
pub fn capabilities_for(database_type: DatabaseType) -> Capabilities {
    match database_type {
        DatabaseType::Postgres => Capabilities {
            schema_discovery: true,
            schema_creation: true,
            data_read: true,
            data_write: true,
            streaming: true,
            transactions: true,
            replication: true,
            batch_apply: true,
            transaction_dedupe: false,
        },
        DatabaseType::Mysql => Capabilities {
            schema_discovery: true,
            schema_creation: true,
            data_read: true,
            data_write: true,
            streaming: true,
            transactions: true,
            replication: false,
            batch_apply: true,
            transaction_dedupe: false,
        },
        DatabaseType::Memory => Capabilities {
            schema_discovery: true,
            schema_creation: true,
            data_read: true,
            data_write: true,
            streaming: true,
            transactions: false,
            replication: true,
            batch_apply: true,
            transaction_dedupe: false,
        },
    }
}

pub fn mechanisms_for(database_type: DatabaseType) -> &'static [ReplicationMechanism] {
    match database_type {
        DatabaseType::Postgres => &[ReplicationMechanism::WalLogical],
        DatabaseType::Mysql => &[],
        DatabaseType::Memory => &[ReplicationMechanism::EventLog],
    }
}

/// Static alias table, part of the capability catalog. Accepts canonical
/// names and the aliases in common use.
pub fn resolve_database_type(name: &str) -> Result<DatabaseType, ErrorKind> {
    match name.to_ascii_lowercase().as_str() {
        "postgres" | "postgresql" | "pg" | "pgsql" => Ok(DatabaseType::Postgres),
        "mysql" | "mariadb" | "maria" => Ok(DatabaseType::Mysql),
        "memory" | "mem" | "inmemory" => Ok(DatabaseType::Memory),
        other => Err(ErrorKind::InvalidConfiguration(format!(
            "unknown database type `{other}`"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_to_canonical_types() {
        assert_eq!(
            resolve_database_type("PostgreSQL").unwrap(),
            DatabaseType::Postgres
        );
        assert_eq!(resolve_database_type("pg").unwrap(), DatabaseType::Postgres);
        assert_eq!(
            resolve_database_type("mariadb").unwrap(),
            DatabaseType::Mysql
        );
        assert_eq!(
            resolve_database_type("memory").unwrap(),
            DatabaseType::Memory
        );
        assert!(resolve_database_type("oracle").is_err());
    }

    #[test]
    fn mysql_reports_no_replication() {
        assert!(!capabilities_for(DatabaseType::Mysql).replication);
        assert!(mechanisms_for(DatabaseType::Mysql).is_empty());
    }
}
