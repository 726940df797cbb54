pub mod adapters;
pub mod capabilities;
pub mod interface;
pub mod registry;
pub mod transform;

pub use capabilities::{capabilities_for, resolve_database_type, Capabilities};
pub use interface::{
    Connection, DatabaseAdapter, DataOperator, InstanceConnection, InstanceOperator,
    MetadataOperator, RawEvent, ReplicationConfig, ReplicationMechanism, ReplicationOperator,
    ReplicationSlot, ReplicationSource, ReplicationStatus, Publication, SchemaOperator,
    StreamParams, StreamResult, TableIdentifier,
};
pub use registry::AdapterRegistry;
pub use transform::TransformationClient;
