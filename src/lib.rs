//! fragdb - replicated title store over horizontally fragmented MySQL nodes
//!
//! Titles are partitioned by type across fragment nodes, and Central holds
//! a full copy. Every write goes to the owning fragment and to Central; a
//! copy that cannot be written is logged and replayed once its node
//! returns.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod harness;
pub mod model;
pub mod node;
pub mod observability;
pub mod recovery;
pub mod replication;
pub mod txlog;

pub use cluster::Cluster;
pub use config::{Config, ConfigError};
