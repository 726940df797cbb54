pub mod errors;
pub mod rest;
pub mod state;

pub use errors::ApiError;
pub use state::AppState;
