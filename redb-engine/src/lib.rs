pub mod errors;
pub mod pipeline;
pub mod relationship;

#[cfg(test)]
mod tests;

pub use errors::EngineError;
pub use pipeline::{ApplyTarget, CdcEventRouter, CdcPipeline, PipelineOptions};
pub use relationship::{ProgressEvent, RelationshipEngine};
