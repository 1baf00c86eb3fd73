//! Replication across the fragment nodes and Central
//!
//! - `PartitionMap` routes a title type to its owning fragment
//! - `WriteState` is the per-write state machine
//! - `ReplicationCoordinator` drives it against live nodes
//!
//! A write is reported successful once one copy holds it; the other copy
//! is then owed through the recovery queue.

mod config;
mod coordinator;
mod errors;
mod outcome;
mod partition;
mod state;

pub use config::ReplicationConfig;
pub use coordinator::{replica_copy, Prepared, PreparedWrite, ReplicationCoordinator};
pub use errors::{ReplicationError, ReplicationErrorKind, ReplicationResult};
pub use outcome::WriteOutcome;
pub use partition::PartitionMap;
pub use state::{Resolution, Side, StepEvent, WriteState};
