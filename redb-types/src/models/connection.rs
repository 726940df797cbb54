use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Configuration for a session against one logical database.
///
/// Credentials are injected by the keyring collaborator right before use;
/// the metadata store never persists `password`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub id: String,
    pub name: String,
    /// Database technology, canonical name or a catalog alias.
    pub connection_type: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    pub database: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub ssl: SslConfig,
    /// Vendor-specific settings (cloud endpoints, object-store buckets, ...).
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl ConnectionConfig {
    /// Server-level view of this config, for instance operations.
    pub fn instance(&self) -> InstanceConfig {
        InstanceConfig {
            id: self.id.clone(),
            name: self.name.clone(),
            connection_type: self.connection_type.clone(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            ssl: self.ssl.clone(),
            options: self.options.clone(),
        }
    }
}

/// Server-level connection configuration (no database selected), used for
/// listing, creating and dropping databases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    pub name: String,
    pub connection_type: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub ssl: SslConfig,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslConfig {
    #[serde(default)]
    pub mode: SslMode,
    #[serde(default)]
    pub ca_certificate: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    #[default]
    Disable,
    Prefer,
    Require,
}
