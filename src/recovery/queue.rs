use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::model::TitleId;
use crate::node::{Mutation, NodeId, Operation};
use crate::txlog::{TransactionId, TransactionLogEntry, TransactionReceipt};

/// A write applied on `source` and still owed to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingReplication {
    pub transaction_id: TransactionId,
    pub source: NodeId,
    pub target: NodeId,
    /// Node whose `transaction_log` holds the entry, if it was stored.
    pub log_node: Option<NodeId>,
    /// Copy carrying the accepting node's `last_updated`.
    pub mutation: Mutation,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingReplication {
    pub fn new(
        receipt: &TransactionReceipt,
        source: NodeId,
        target: NodeId,
        mutation: Mutation,
    ) -> Self {
        Self {
            transaction_id: receipt.transaction_id,
            source,
            target,
            log_node: receipt.stored_on.clone(),
            mutation,
            retry_count: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// Rebuilds an obligation from a stored log entry.
    pub fn from_log(entry: &TransactionLogEntry, log_node: NodeId) -> Self {
        Self {
            transaction_id: entry.transaction_id,
            source: entry.source_node.clone(),
            target: entry.target_node.clone(),
            log_node: Some(log_node),
            mutation: entry.payload.clone(),
            retry_count: entry.retry_count,
            enqueued_at: entry.created_at,
        }
    }

    pub fn record_id(&self) -> &TitleId {
        self.mutation.record_id()
    }

    pub fn operation(&self) -> Operation {
        self.mutation.operation()
    }
}

/// Unbounded FIFO of pending replications shared by every writer.
///
/// Entries taken by a recovery sweep stay visible as in flight until the
/// sweep settles or returns them, so the ordering guard and id allocation
/// still see them while they replay.
#[derive(Debug, Default)]
pub struct PendingQueue {
    slots: Mutex<Slots>,
}

#[derive(Debug, Default)]
struct Slots {
    queued: VecDeque<PendingReplication>,
    in_flight: Vec<PendingReplication>,
}

impl Slots {
    fn iter(&self) -> impl Iterator<Item = &PendingReplication> {
        self.in_flight.iter().chain(self.queued.iter())
    }

    fn release(&mut self, id: &TransactionId) {
        self.in_flight.retain(|e| e.transaction_id != *id);
    }
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: PendingReplication) {
        self.slots.lock().queued.push_back(item);
    }

    /// Returns every queued entry addressed to `target`, oldest first, and
    /// marks them in flight. Entries for other nodes keep their order.
    pub fn take_for(&self, target: &NodeId) -> Vec<PendingReplication> {
        let mut slots = self.slots.lock();
        let (taken, kept): (VecDeque<_>, VecDeque<_>) =
            slots.queued.drain(..).partition(|e| e.target == *target);
        slots.queued = kept;
        slots.in_flight.extend(taken.iter().cloned());
        taken.into()
    }

    /// Drops an in-flight entry that was applied or given up on.
    pub fn settle(&self, id: &TransactionId) {
        self.slots.lock().release(id);
    }

    /// Moves an in-flight entry to the back of the queue.
    pub fn requeue(&self, item: PendingReplication) {
        let mut slots = self.slots.lock();
        slots.release(&item.transaction_id);
        slots.queued.push_back(item);
    }

    /// Puts entries back at the head, preserving their order.
    pub fn restore(&self, items: Vec<PendingReplication>) {
        let mut slots = self.slots.lock();
        for item in items.into_iter().rev() {
            slots.release(&item.transaction_id);
            slots.queued.push_front(item);
        }
    }

    /// Queued plus in-flight entries.
    pub fn len(&self) -> usize {
        let slots = self.slots.lock();
        slots.queued.len() + slots.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.slots.lock().in_flight.len()
    }

    pub fn count_for(&self, target: &NodeId) -> usize {
        self.slots.lock().iter().filter(|e| e.target == *target).count()
    }

    /// Entries still waiting for a sweep toward `target`.
    pub fn queued_for(&self, target: &NodeId) -> usize {
        self.slots
            .lock()
            .queued
            .iter()
            .filter(|e| e.target == *target)
            .count()
    }

    /// True when an entry for `key` is still owed to `target`, queued or
    /// replaying.
    pub fn has_pending(&self, target: &NodeId, key: &TitleId) -> bool {
        self.slots
            .lock()
            .iter()
            .any(|e| e.target == *target && e.record_id() == key)
    }

    pub fn contains(&self, id: &TransactionId) -> bool {
        self.slots.lock().iter().any(|e| e.transaction_id == *id)
    }

    /// In-flight entries first, then the queue in order.
    pub fn snapshot(&self) -> Vec<PendingReplication> {
        self.slots.lock().iter().cloned().collect()
    }

    /// Highest key among queued or replaying inserts. Id allocation must not
    /// reuse a key that so far exists only on the accepting node.
    pub fn max_pending_insert_number(&self) -> Option<u64> {
        self.slots
            .lock()
            .iter()
            .filter(|e| e.operation() == Operation::Insert)
            .filter_map(|e| e.record_id().number())
            .max()
    }
}
