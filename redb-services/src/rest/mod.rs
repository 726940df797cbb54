use actix_web::web;

pub mod databases;
pub mod mappings;
pub mod mesh;
pub mod relationships;

#[cfg(test)]
mod tests;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/v1")
            .configure(mesh::routes)
            .configure(databases::routes)
            .configure(mappings::routes)
            .configure(relationships::routes),
    );
}
