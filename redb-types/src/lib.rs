pub mod errors;
pub mod models;
pub mod resource;
pub mod storage;

// Re-exported so every crate in the workspace pins the same versions.
pub use async_trait;
pub use chrono;
pub use indexmap;
pub use log;
pub use parking_lot;
pub use serde;
pub use serde_json;
pub use thiserror;
pub use tracing;
