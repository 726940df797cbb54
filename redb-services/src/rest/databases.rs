use actix_web::{web, HttpResponse};
use redb_adapters::capabilities_for;
use redb_adapters::interface::{InstanceOperator, SchemaOperator};
use redb_types::errors::ResourceKind;
use redb_types::models::ConnectionConfig;
use redb_types::serde::Deserialize;
use redb_types::serde_json::json;

use crate::errors::ApiError;
use crate::state::AppState;

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/databases")
            .route("/connect", web::post().to(connect_database))
            .route("/{id}/disconnect", web::post().to(disconnect_database))
            .route("/{id}/schema", web::get().to(get_database_schema))
            .route("", web::get().to(list_databases)),
    );
}

/// Validates the config by opening a connection, then persists it. The
/// password travels to the keyring collaborator and is never serialized
/// back out.
async fn connect_database(
    state: web::Data<AppState>,
    body: web::Json<ConnectionConfig>,
) -> Result<HttpResponse, ApiError> {
    let mut config = body.into_inner();
    if config.id.is_empty() {
        config.id = format!("db_{}", uuid::Uuid::new_v4().simple());
    }
    let connection = state.registry.connect(&config).await?;
    state.store.save_connection_config(&config).await?;
    Ok(HttpResponse::Ok().json(json!({
        "id": config.id,
        "database_type": connection.database_type(),
        "capabilities": capabilities_for(connection.database_type()),
    })))
}

#[derive(Debug, Deserialize, Default)]
#[serde(crate = "redb_types::serde")]
struct DisconnectRequest {
    #[serde(default)]
    delete_database_object: bool,
    #[serde(default)]
    disconnect_instance: bool,
    // Branch/repo lifecycles belong to the external repo service; the flags
    // are accepted for interface compatibility.
    #[serde(default)]
    delete_branch: bool,
    #[serde(default)]
    delete_repo: bool,
}

async fn disconnect_database(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: Option<web::Json<DisconnectRequest>>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let request = body.map(|b| b.into_inner()).unwrap_or_default();
    let config = state
        .store
        .get_connection_config(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(ResourceKind::Database, id.clone()))?;

    if request.delete_database_object {
        let instance = state.registry.connect_instance(&config.instance()).await?;
        instance.instance.drop_database(&config.database).await?;
    }
    let _ = (request.disconnect_instance, request.delete_branch, request.delete_repo);

    state.store.delete_connection_config(&id).await?;
    Ok(HttpResponse::Ok().json(json!({"id": id, "status": "disconnected"})))
}

async fn list_databases(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let configs = state.store.list_connection_configs().await?;
    Ok(HttpResponse::Ok().json(configs))
}

async fn get_database_schema(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let config = state
        .store
        .get_connection_config(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(ResourceKind::Database, id.clone()))?;
    let connection = state.registry.connect(&config).await?;
    let model = connection.schema().discover_schema().await?;
    Ok(HttpResponse::Ok().json(model))
}
