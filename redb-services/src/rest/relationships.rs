use actix_web::{web, HttpResponse};
use futures_util::StreamExt;
use redb_engine::ProgressEvent;
use redb_types::models::RelationshipType;
use redb_types::serde::Deserialize;
use redb_types::serde_json::{self, json};
use tokio_stream::wrappers::ReceiverStream;

use crate::errors::ApiError;
use crate::state::AppState;

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/relationships")
            .route("", web::post().to(add_relationship))
            .route("", web::get().to(list_relationships))
            .route("/{id}/start", web::post().to(start_relationship))
            .route("/{id}/stop", web::post().to(stop_relationship))
            .route("/{id}/resume", web::post().to(resume_relationship))
            .route("/{id}", web::delete().to(remove_relationship))
            .route("/{id}", web::get().to(show_relationship)),
    );
}

#[derive(Debug, Deserialize)]
#[serde(crate = "redb_types::serde")]
struct AddRelationshipRequest {
    mapping_name: String,
    #[serde(default = "default_relationship_type", rename = "type")]
    relationship_type: RelationshipType,
}

fn default_relationship_type() -> RelationshipType {
    RelationshipType::Replication
}

async fn add_relationship(
    state: web::Data<AppState>,
    body: web::Json<AddRelationshipRequest>,
) -> Result<HttpResponse, ApiError> {
    let relationship = state
        .engine
        .add_relationship(&body.mapping_name, body.relationship_type)
        .await?;
    Ok(HttpResponse::Ok().json(relationship))
}

#[derive(Debug, Deserialize, Default)]
#[serde(crate = "redb_types::serde")]
struct StartRequest {
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default)]
    parallel_workers: Option<usize>,
}

/// Streams line-delimited JSON progress events, terminating with a
/// `{"phase": "active"}` or `{"phase": "error"}` record.
async fn start_relationship(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: Option<web::Json<StartRequest>>,
) -> Result<HttpResponse, ApiError> {
    let request = body.map(|b| b.into_inner()).unwrap_or_default();
    let stream = state
        .engine
        .start(&path, request.batch_size, request.parallel_workers)
        .await?;
    Ok(ndjson_response(stream))
}

async fn stop_relationship(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    state.engine.pause(&path).await?;
    Ok(HttpResponse::Ok().json(json!({"phase": "paused"})))
}

#[derive(Debug, Deserialize, Default)]
#[serde(crate = "redb_types::serde")]
struct ResumeRequest {
    #[serde(default)]
    skip_data_sync: bool,
}

async fn resume_relationship(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: Option<web::Json<ResumeRequest>>,
) -> Result<HttpResponse, ApiError> {
    let skip_data_sync = body.map(|b| b.skip_data_sync).unwrap_or(false);
    let stream = state.engine.resume(&path, skip_data_sync).await?;
    Ok(ndjson_response(stream))
}

#[derive(Debug, Deserialize, Default)]
#[serde(crate = "redb_types::serde")]
struct RemoveQuery {
    #[serde(default)]
    force: bool,
}

async fn remove_relationship(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<RemoveQuery>,
) -> Result<HttpResponse, ApiError> {
    state.engine.remove(&path, query.force).await?;
    Ok(HttpResponse::Ok().json(json!({"phase": "removed"})))
}

async fn list_relationships(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(state.engine.list().await?))
}

async fn show_relationship(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(state.engine.show(&path).await?))
}

fn ndjson_response(stream: ReceiverStream<ProgressEvent>) -> HttpResponse {
    let body = stream.map(|event| {
        let mut line = serde_json::to_vec(&event).unwrap_or_default();
        line.push(b'\n');
        Ok::<_, actix_web::Error>(web::Bytes::from(line))
    });
    HttpResponse::Ok()
        .content_type("application/x-ndjson")
        .streaming(body)
}
