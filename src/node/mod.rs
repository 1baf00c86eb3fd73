//! Node access
//!
//! Everything below the replication protocol: node descriptors, sessions,
//! the MySQL backend, an in-process engine, and the registry that routes
//! reads across Central and the fragments.

mod config;
mod errors;
mod isolation;
mod memory;
mod mutation;
mod mysql;
mod registry;
mod session;

pub use config::{ConnectionSettings, NodeConfig, NodeId, NodeRole};
pub use errors::{NodeError, NodeErrorKind, NodeResult};
pub use isolation::IsolationLevel;
pub use memory::{MemoryConnector, MemoryNode, MemorySession};
pub use mutation::{Mutation, Operation, SqlValue, Statement};
pub use mysql::{MySqlConnector, MySqlSession};
pub use registry::{NodeHealth, NodeRegistry};
pub use session::{Connector, LogQuery, NodeSession, ReadMode};
