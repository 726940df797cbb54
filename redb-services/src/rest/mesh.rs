use std::time::Duration;

use actix_web::{web, HttpResponse};
use redb_types::errors::ResourceKind;
use redb_types::models::JoinStrategy;
use redb_types::serde::Deserialize;
use redb_types::serde_json::json;

use crate::errors::{bad_request, ApiError};
use crate::state::AppState;

const DEFAULT_OP_TIMEOUT_SECS: u64 = 30;

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/mesh")
            .route("/seed", web::post().to(seed_mesh))
            .route("/join", web::post().to(join_mesh))
            .route("/extend", web::post().to(extend_mesh))
            .route("/leave", web::post().to(leave_mesh))
            .route("/evict", web::post().to(evict_node))
            .route("/connections", web::post().to(add_connection))
            .route("/connections", web::get().to(list_connections))
            .route(
                "/connections/{peer_node_id}",
                web::delete().to(drop_connection),
            )
            .route("", web::get().to(show_mesh)),
    )
    .route("/nodes", web::get().to(list_nodes))
    .route("/nodes/{node_id}", web::get().to(show_node))
    .route("/node/status", web::get().to(node_status));
}

#[derive(Debug, Deserialize)]
#[serde(crate = "redb_types::serde")]
struct SeedRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

async fn seed_mesh(
    state: web::Data<AppState>,
    body: web::Json<SeedRequest>,
) -> Result<HttpResponse, ApiError> {
    let mesh = state
        .mesh
        .seed(&body.name, body.description.clone())
        .await?;
    Ok(HttpResponse::Ok().json(mesh))
}

#[derive(Debug, Deserialize)]
#[serde(crate = "redb_types::serde")]
struct PeeringRequest {
    address: String,
    #[serde(default)]
    strategy: JoinStrategy,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

impl PeeringRequest {
    fn parsed(&self) -> Result<(std::net::SocketAddr, Duration), ApiError> {
        let address = self
            .address
            .parse()
            .map_err(|_| bad_request(format!("malformed address `{}`", self.address)))?;
        let timeout = Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_OP_TIMEOUT_SECS));
        Ok((address, timeout))
    }
}

async fn join_mesh(
    state: web::Data<AppState>,
    body: web::Json<PeeringRequest>,
) -> Result<HttpResponse, ApiError> {
    let (address, timeout) = body.parsed()?;
    let mesh = state.mesh.join(address, body.strategy, timeout).await?;
    Ok(HttpResponse::Ok().json(mesh))
}

async fn extend_mesh(
    state: web::Data<AppState>,
    body: web::Json<PeeringRequest>,
) -> Result<HttpResponse, ApiError> {
    let (address, timeout) = body.parsed()?;
    let node = state.mesh.extend(address, body.strategy, timeout).await?;
    Ok(HttpResponse::Ok().json(node))
}

#[derive(Debug, Deserialize, Default)]
#[serde(crate = "redb_types::serde")]
struct LeaveRequest {
    #[serde(default)]
    force: bool,
}

async fn leave_mesh(
    state: web::Data<AppState>,
    body: Option<web::Json<LeaveRequest>>,
) -> Result<HttpResponse, ApiError> {
    let force = body.map(|b| b.force).unwrap_or(false);
    state.mesh.leave(force).await?;
    Ok(HttpResponse::Ok().json(json!({"status": "clean"})))
}

#[derive(Debug, Deserialize)]
#[serde(crate = "redb_types::serde")]
struct EvictRequest {
    node_id: u64,
    #[serde(default)]
    clean_target: bool,
}

async fn evict_node(
    state: web::Data<AppState>,
    body: web::Json<EvictRequest>,
) -> Result<HttpResponse, ApiError> {
    state.mesh.evict(body.node_id, body.clean_target).await?;
    Ok(HttpResponse::Ok().json(json!({"evicted": body.node_id})))
}

#[derive(Debug, Deserialize)]
#[serde(crate = "redb_types::serde")]
struct AddConnectionRequest {
    peer_node_id: u64,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

async fn add_connection(
    state: web::Data<AppState>,
    body: web::Json<AddConnectionRequest>,
) -> Result<HttpResponse, ApiError> {
    let timeout = Duration::from_secs(body.timeout_secs.unwrap_or(DEFAULT_OP_TIMEOUT_SECS));
    let info = state.mesh.add_connection(body.peer_node_id, timeout).await?;
    Ok(HttpResponse::Ok().json(info))
}

async fn drop_connection(
    state: web::Data<AppState>,
    path: web::Path<u64>,
) -> Result<HttpResponse, ApiError> {
    state.mesh.drop_connection(path.into_inner())?;
    Ok(HttpResponse::NoContent().finish())
}

async fn list_connections(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(state.mesh.list_connections()))
}

async fn show_mesh(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let mesh = state
        .mesh
        .mesh()
        .ok_or_else(|| ApiError::NotFound(ResourceKind::Mesh, "local".to_string()))?;
    Ok(HttpResponse::Ok().json(mesh))
}

async fn list_nodes(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let mut nodes = state.mesh.list_nodes();
    if nodes.is_empty() {
        nodes.push(state.mesh.info());
    }
    Ok(HttpResponse::Ok().json(nodes))
}

async fn show_node(
    state: web::Data<AppState>,
    path: web::Path<u64>,
) -> Result<HttpResponse, ApiError> {
    let node_id = path.into_inner();
    let node = state
        .mesh
        .show_node(node_id)
        .ok_or_else(|| ApiError::NotFound(ResourceKind::Node, node_id.to_string()))?;
    Ok(HttpResponse::Ok().json(node))
}

async fn node_status(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let info = state.mesh.info();
    Ok(HttpResponse::Ok().json(json!({
        "node_id": info.node_id,
        "status": info.status,
        "mesh_id": info.mesh_id,
    })))
}
