//! Connection helpers: config mapping, TLS setup and error classification.

use std::sync::Arc;
use std::time::SystemTime;

use redb_types::errors::{DatabaseError, ErrorKind, ResourceKind};
use redb_types::log::error;
use redb_types::models::{ConnectionConfig, InstanceConfig, SslMode};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ServerName};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;

use super::TYPE;

pub fn map_connection_config(config: &ConnectionConfig) -> Config {
    let mut pg = Config::new();
    pg.host(&config.host)
        .port(config.port)
        .user(&config.username)
        .dbname(&config.database);
    if !config.password.is_empty() {
        pg.password(&config.password);
    }
    if let Some(schema) = &config.schema {
        pg.options(format!("-c search_path={schema}").as_str());
    }
    pg.ssl_mode(match config.ssl.mode {
        SslMode::Disable => tokio_postgres::config::SslMode::Disable,
        SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
        SslMode::Require => tokio_postgres::config::SslMode::Require,
    });
    pg
}

pub async fn connect(config: &ConnectionConfig) -> Result<Client, DatabaseError> {
    connect_with(map_connection_config(config), config.ssl.mode).await
}

pub async fn connect_instance(config: &InstanceConfig) -> Result<Client, DatabaseError> {
    let mut pg = Config::new();
    // The maintenance database; instance operations are server-level.
    pg.host(&config.host)
        .port(config.port)
        .user(&config.username)
        .dbname("postgres");
    if !config.password.is_empty() {
        pg.password(&config.password);
    }
    connect_with(pg, config.ssl.mode).await
}

async fn connect_with(pg: Config, ssl_mode: SslMode) -> Result<Client, DatabaseError> {
    match ssl_mode {
        SslMode::Disable => {
            let (client, connection) = pg.connect(NoTls).await.map_err(connect_error)?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("postgres connection closed: {e}");
                }
            });
            Ok(client)
        }
        SslMode::Prefer | SslMode::Require => {
            let tls = MakeRustlsConnect::new(tls_config());
            let (client, connection) = pg.connect(tls).await.map_err(connect_error)?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("postgres connection closed: {e}");
                }
            });
            Ok(client)
        }
    }
}

fn tls_config() -> ClientConfig {
    ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier))
        .with_no_client_auth()
}

/// Server certificates are not validated; peers are expected to sit on a
/// private network or behind their own trust setup.
struct AcceptAllVerifier;

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn connect_error(e: tokio_postgres::Error) -> DatabaseError {
    let kind = match e.code() {
        Some(code) if code.code().starts_with("28") => {
            ErrorKind::AuthenticationFailed(e.to_string())
        }
        Some(code) if *code == SqlState::UNDEFINED_DATABASE => {
            ErrorKind::NotFound(ResourceKind::Database, e.to_string())
        }
        _ => ErrorKind::ConnectionFailed(Box::new(e)),
    };
    DatabaseError::new(TYPE.as_str(), "connect", kind)
}

/// Classification for statement-level failures.
pub(super) fn query_error(operation: &str, e: tokio_postgres::Error) -> DatabaseError {
    let code = e.code().cloned();
    let kind = match code {
        Some(ref c) if c.code().starts_with("28") => {
            ErrorKind::AuthenticationFailed(e.to_string())
        }
        Some(c) if c == SqlState::UNDEFINED_TABLE => {
            ErrorKind::NotFound(ResourceKind::Table, e.to_string())
        }
        Some(c) if c == SqlState::UNDEFINED_OBJECT => {
            ErrorKind::NotFound(ResourceKind::Slot, e.to_string())
        }
        Some(c) if c == SqlState::SYNTAX_ERROR => ErrorKind::InvalidQuery(e.to_string()),
        Some(c) if c == SqlState::INSUFFICIENT_PRIVILEGE => {
            ErrorKind::PermissionDenied(e.to_string())
        }
        _ if e.is_closed() => ErrorKind::ConnectionFailed(Box::new(e)),
        _ => ErrorKind::TransactionFailed(Box::new(e)),
    };
    DatabaseError::new(TYPE.as_str(), operation, kind)
}

pub(super) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub(super) fn qualify(table: &crate::interface::TableIdentifier) -> String {
    match &table.schema {
        Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&table.name)),
        None => quote_ident(&table.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idents_are_quoted() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn qualified_names_include_schema() {
        let table = crate::interface::TableIdentifier::with_schema("public", "users");
        assert_eq!(qualify(&table), "\"public\".\"users\"");
    }
}
