use actix_web::{web, HttpResponse};
use redb_types::errors::ResourceKind;
use redb_types::models::{Mapping, MappingEndpoint, TransformationRule};
use redb_types::resource::parse_resource_uri;
use redb_types::serde::Deserialize;

use crate::errors::{bad_request, from_kind, ApiError};
use crate::state::AppState;

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/mappings")
            .route("", web::post().to(create_mapping))
            .route("", web::get().to(list_mappings))
            .route("/stream-to-table", web::post().to(create_stream_to_table))
            .route("/table-to-stream", web::post().to(create_table_to_stream))
            .route("/stream-to-stream", web::post().to(create_stream_to_stream))
            .route("/{name}", web::get().to(show_mapping)),
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(crate = "redb_types::serde", rename_all = "snake_case")]
enum MappingScope {
    Database,
    Table,
}

#[derive(Debug, Deserialize)]
#[serde(crate = "redb_types::serde")]
struct CreateMappingRequest {
    scope: MappingScope,
    /// Database id for database scope, a `redb:/` column URI for table
    /// scope.
    source: String,
    target: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    policy_id: Option<String>,
}

async fn create_mapping(
    state: web::Data<AppState>,
    body: web::Json<CreateMappingRequest>,
) -> Result<HttpResponse, ApiError> {
    let request = body.into_inner();
    let (source, target, rules, default_name) = match request.scope {
        MappingScope::Database => {
            let source = MappingEndpoint::Database {
                database_id: request.source.clone(),
            };
            let target = MappingEndpoint::Database {
                database_id: request.target.clone(),
            };
            let name = format!("{}_to_{}", request.source, request.target);
            (source, target, vec![], name)
        }
        MappingScope::Table => {
            let source_path = parse_resource_uri(&request.source).map_err(from_kind)?;
            let target_path = parse_resource_uri(&request.target).map_err(from_kind)?;
            let rule =
                TransformationRule::direct(source_path.column.clone(), target_path.column.clone());
            let name = format!("{}_to_{}", source_path.table, target_path.table);
            (
                MappingEndpoint::Table {
                    database_id: source_path.database_id,
                    table: source_path.table,
                },
                MappingEndpoint::Table {
                    database_id: target_path.database_id,
                    table: target_path.table,
                },
                vec![rule],
                name,
            )
        }
    };

    save_mapping(
        &state,
        request.name.unwrap_or(default_name),
        request.description,
        request.policy_id,
        source,
        target,
        rules,
    )
    .await
}

#[derive(Debug, Deserialize)]
#[serde(crate = "redb_types::serde")]
struct StreamToTableRequest {
    topic: String,
    /// `redb:/` column URI.
    target: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

async fn create_stream_to_table(
    state: web::Data<AppState>,
    body: web::Json<StreamToTableRequest>,
) -> Result<HttpResponse, ApiError> {
    let request = body.into_inner();
    let target_path = parse_resource_uri(&request.target).map_err(from_kind)?;
    let name = request
        .name
        .unwrap_or_else(|| format!("{}_to_{}", request.topic, target_path.table));
    save_mapping(
        &state,
        name,
        request.description,
        None,
        MappingEndpoint::Stream {
            topic: request.topic,
        },
        MappingEndpoint::Table {
            database_id: target_path.database_id,
            table: target_path.table,
        },
        vec![],
    )
    .await
}

#[derive(Debug, Deserialize)]
#[serde(crate = "redb_types::serde")]
struct TableToStreamRequest {
    /// `redb:/` column URI.
    source: String,
    topic: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

async fn create_table_to_stream(
    state: web::Data<AppState>,
    body: web::Json<TableToStreamRequest>,
) -> Result<HttpResponse, ApiError> {
    let request = body.into_inner();
    let source_path = parse_resource_uri(&request.source).map_err(from_kind)?;
    let name = request
        .name
        .unwrap_or_else(|| format!("{}_to_{}", source_path.table, request.topic));
    save_mapping(
        &state,
        name,
        request.description,
        None,
        MappingEndpoint::Table {
            database_id: source_path.database_id,
            table: source_path.table,
        },
        MappingEndpoint::Stream {
            topic: request.topic,
        },
        vec![],
    )
    .await
}

#[derive(Debug, Deserialize)]
#[serde(crate = "redb_types::serde")]
struct StreamToStreamRequest {
    source_topic: String,
    target_topic: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

async fn create_stream_to_stream(
    state: web::Data<AppState>,
    body: web::Json<StreamToStreamRequest>,
) -> Result<HttpResponse, ApiError> {
    let request = body.into_inner();
    let name = request
        .name
        .unwrap_or_else(|| format!("{}_to_{}", request.source_topic, request.target_topic));
    save_mapping(
        &state,
        name,
        request.description,
        None,
        MappingEndpoint::Stream {
            topic: request.source_topic,
        },
        MappingEndpoint::Stream {
            topic: request.target_topic,
        },
        vec![],
    )
    .await
}

async fn save_mapping(
    state: &AppState,
    name: String,
    description: Option<String>,
    policy_id: Option<String>,
    source: MappingEndpoint,
    target: MappingEndpoint,
    rules: Vec<TransformationRule>,
) -> Result<HttpResponse, ApiError> {
    if state.store.get_mapping_by_name(&name).await?.is_some() {
        return Err(bad_request(format!(
            "mapping `{name}` already exists; edits create a new version"
        )));
    }
    let mapping = Mapping {
        id: format!("map_{}", uuid::Uuid::new_v4().simple()),
        name,
        description,
        mapping_type: Mapping::type_for(&source, &target),
        source,
        target,
        rules,
        version: 1,
        policy_id,
    };
    mapping.validate().map_err(from_kind)?;
    state.store.save_mapping(&mapping).await?;
    Ok(HttpResponse::Ok().json(mapping))
}

async fn list_mappings(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(state.store.list_mappings().await?))
}

async fn show_mapping(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let name = path.into_inner();
    let mapping = state
        .store
        .get_mapping_by_name(&name)
        .await?
        .ok_or_else(|| ApiError::NotFound(ResourceKind::Mapping, name.clone()))?;
    Ok(HttpResponse::Ok().json(mapping))
}
