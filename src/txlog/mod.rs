//! Transaction log
//!
//! Every replication attempt is recorded in the `transaction_log` table of
//! the node that accepted the write. Entries are appended, moved from
//! PENDING to SUCCESS or FAILED by recovery, and never deleted here.

mod entry;
mod logger;

pub use entry::{TransactionId, TransactionLogEntry, TxStatus};
pub use logger::{TransactionLogger, TransactionReceipt};
