use std::collections::HashMap;
use std::sync::Arc;

use redb_types::errors::{DatabaseError, ErrorKind, ResourceKind};
use redb_types::models::{ConnectionConfig, DatabaseType, InstanceConfig};
use redb_types::parking_lot::RwLock;

use crate::adapters::memory::MemoryAdapter;
use crate::adapters::mysql::MysqlAdapter;
use crate::adapters::postgres::PostgresAdapter;
use crate::capabilities::{resolve_database_type, Capabilities};
use crate::interface::{Connection, DatabaseAdapter, InstanceConnection};

/// Process-wide mapping from database type to adapter instance.
///
/// `get`/`list` are hot paths behind the read side of the lock; `register`
/// replaces any existing adapter of the same type. Handles are cloned out
/// before any I/O, so a connect in flight always completes against the
/// adapter it resolved.
#[derive(Debug, Default)]
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<DatabaseType, Arc<dyn DatabaseAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with every adapter this build ships.
    pub fn with_default_adapters() -> Arc<Self> {
        let registry = Self::new();
        registry.register(Arc::new(PostgresAdapter));
        registry.register(Arc::new(MysqlAdapter));
        registry.register(Arc::new(MemoryAdapter::new()));
        Arc::new(registry)
    }

    pub fn register(&self, adapter: Arc<dyn DatabaseAdapter>) {
        self.adapters
            .write()
            .insert(adapter.database_type(), adapter);
    }

    pub fn get(&self, database_type: DatabaseType) -> Result<Arc<dyn DatabaseAdapter>, DatabaseError> {
        self.adapters
            .read()
            .get(&database_type)
            .cloned()
            .ok_or_else(|| {
                DatabaseError::new(
                    database_type.as_str(),
                    "get",
                    ErrorKind::NotFound(ResourceKind::Adapter, database_type.to_string()),
                )
            })
    }

    /// Resolves `name` through the capability catalog's alias table first.
    pub fn get_by_name(&self, name: &str) -> Result<Arc<dyn DatabaseAdapter>, DatabaseError> {
        let database_type = resolve_database_type(name)
            .map_err(|kind| DatabaseError::new(name, "get_by_name", kind))?;
        self.get(database_type)
    }

    pub fn list_registered(&self) -> Vec<DatabaseType> {
        let mut types: Vec<_> = self.adapters.read().keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    pub fn get_capabilities(&self, database_type: DatabaseType) -> Result<Capabilities, DatabaseError> {
        Ok(self.get(database_type)?.capabilities())
    }

    /// Parses `config.connection_type`, resolves the adapter and delegates.
    pub async fn connect(&self, config: &ConnectionConfig) -> Result<Connection, DatabaseError> {
        let database_type = resolve_database_type(&config.connection_type)
            .map_err(|kind| DatabaseError::new(config.connection_type.clone(), "connect", kind))?;
        let adapter = self.get(database_type)?;
        adapter.connect(config).await
    }

    pub async fn connect_instance(
        &self,
        config: &InstanceConfig,
    ) -> Result<InstanceConnection, DatabaseError> {
        let database_type = resolve_database_type(&config.connection_type).map_err(|kind| {
            DatabaseError::new(config.connection_type.clone(), "connect_instance", kind)
        })?;
        let adapter = self.get(database_type)?;
        adapter.connect_instance(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct TaggedAdapter {
        tag: &'static str,
    }

    #[async_trait]
    impl DatabaseAdapter for TaggedAdapter {
        fn database_type(&self) -> DatabaseType {
            DatabaseType::Memory
        }

        async fn connect(&self, _config: &ConnectionConfig) -> Result<Connection, DatabaseError> {
            Err(DatabaseError::new(self.tag, "connect", ErrorKind::OperationNotSupported))
        }

        async fn connect_instance(
            &self,
            _config: &InstanceConfig,
        ) -> Result<InstanceConnection, DatabaseError> {
            Err(DatabaseError::new(
                self.tag,
                "connect_instance",
                ErrorKind::OperationNotSupported,
            ))
        }
    }

    #[test]
    fn last_registration_wins() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(TaggedAdapter { tag: "first" }));
        registry.register(Arc::new(TaggedAdapter { tag: "second" }));

        assert_eq!(registry.list_registered(), vec![DatabaseType::Memory]);
        let adapter = registry.get(DatabaseType::Memory).unwrap();
        let debug = format!("{adapter:?}");
        assert!(debug.contains("second"), "{debug}");
    }

    #[test]
    fn unknown_adapter_is_not_found() {
        let registry = AdapterRegistry::new();
        let err = registry.get(DatabaseType::Postgres).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::NotFound(ResourceKind::Adapter, _)));
    }

    #[test]
    fn aliases_reach_the_same_adapter() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(TaggedAdapter { tag: "mem" }));
        assert!(registry.get_by_name("inmemory").is_ok());
        assert!(registry.get_by_name("mem").is_ok());
        assert!(registry.get_by_name("no-such-db").is_err());
    }

    #[test]
    fn default_registry_covers_the_catalog() {
        let registry = AdapterRegistry::with_default_adapters();
        assert_eq!(
            registry.list_registered(),
            vec![DatabaseType::Memory, DatabaseType::Mysql, DatabaseType::Postgres]
        );
        assert!(registry
            .get_capabilities(DatabaseType::Postgres)
            .unwrap()
            .replication);
        assert!(!registry
            .get_capabilities(DatabaseType::Mysql)
            .unwrap()
            .replication);
    }
}
