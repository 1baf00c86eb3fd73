//! Recovery of pending replications
//!
//! - One in-memory FIFO of obligations, owned by one `RecoveryHandler`
//! - Replay in original order, per target node
//! - At most one sweep per node at a time
//! - Replay failures consume retry budget; an unreachable node does not
//!
//! The queue is not durable. After a restart `rehydrate` reloads PENDING
//! entries from the transaction logs.

mod auto;
mod handler;
mod queue;

pub use auto::AutoRecovery;
pub use handler::{RecoveryHandler, RecoveryReport};
pub use queue::{PendingQueue, PendingReplication};
