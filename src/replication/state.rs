//! Per-write state machine
//!
//! ```text
//! TryPrimary --Applied--> Replicate --Applied--> Done(Replicated)
//!     |                       |
//!   Failed                  Failed
//!     v                       v
//! TryCentral --Applied--> Queued --Logged--> Done(Pending)
//!     |
//!   Failed
//!     v
//! Done(Unreachable)
//! ```
//!
//! Transitions are pure; the coordinator performs the side effect attached
//! to each state and feeds back the resulting event.

use super::errors::{ReplicationError, ReplicationResult};
use crate::txlog::TransactionId;

/// Which copy of the record a step writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Primary,
    Central,
}

impl Side {
    pub fn other(&self) -> Side {
        match self {
            Side::Primary => Side::Central,
            Side::Central => Side::Primary,
        }
    }
}

/// Terminal result of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Replicated,
    Pending {
        accepted_on: Side,
        transaction_id: TransactionId,
    },
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// Apply on the owning fragment.
    TryPrimary,
    /// Apply on Central instead.
    TryCentral,
    /// Primary applied; copy to Central.
    Replicate,
    /// One copy applied; log PENDING and queue toward the other.
    Queued { accepted_on: Side },
    Done(Resolution),
}

/// Outcome of a state's side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    Applied,
    Failed,
    Logged(TransactionId),
}

impl WriteState {
    pub fn next(self, event: StepEvent) -> ReplicationResult<Self> {
        match (self, event) {
            (WriteState::TryPrimary, StepEvent::Applied) => Ok(WriteState::Replicate),
            (WriteState::TryPrimary, StepEvent::Failed) => Ok(WriteState::TryCentral),
            (WriteState::TryCentral, StepEvent::Applied) => Ok(WriteState::Queued {
                accepted_on: Side::Central,
            }),
            (WriteState::TryCentral, StepEvent::Failed) => {
                Ok(WriteState::Done(Resolution::Unreachable))
            }
            (WriteState::Replicate, StepEvent::Applied) => {
                Ok(WriteState::Done(Resolution::Replicated))
            }
            (WriteState::Replicate, StepEvent::Failed) => Ok(WriteState::Queued {
                accepted_on: Side::Primary,
            }),
            (WriteState::Queued { accepted_on }, StepEvent::Logged(transaction_id)) => {
                Ok(WriteState::Done(Resolution::Pending {
                    accepted_on,
                    transaction_id,
                }))
            }
            (state, event) => Err(ReplicationError::illegal_transition(format!(
                "{:?} does not accept {:?}",
                state, event
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(start: WriteState, events: &[StepEvent]) -> ReplicationResult<WriteState> {
        events.iter().try_fold(start, |state, event| state.next(*event))
    }

    #[test]
    fn test_happy_path() {
        let end = run(WriteState::TryPrimary, &[StepEvent::Applied, StepEvent::Applied]).unwrap();
        assert_eq!(end, WriteState::Done(Resolution::Replicated));
    }

    #[test]
    fn test_replica_failure_queues_toward_central() {
        let tx = TransactionId::new();
        let state = run(WriteState::TryPrimary, &[StepEvent::Applied, StepEvent::Failed]).unwrap();
        assert_eq!(
            state,
            WriteState::Queued {
                accepted_on: Side::Primary
            }
        );
        let end = state.next(StepEvent::Logged(tx)).unwrap();
        assert_eq!(
            end,
            WriteState::Done(Resolution::Pending {
                accepted_on: Side::Primary,
                transaction_id: tx
            })
        );
    }

    #[test]
    fn test_primary_failure_falls_back_to_central() {
        let state = run(WriteState::TryPrimary, &[StepEvent::Failed, StepEvent::Applied]).unwrap();
        assert_eq!(
            state,
            WriteState::Queued {
                accepted_on: Side::Central
            }
        );
    }

    #[test]
    fn test_primary_down_starts_on_central() {
        let end = run(WriteState::TryCentral, &[StepEvent::Failed]).unwrap();
        assert_eq!(end, WriteState::Done(Resolution::Unreachable));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(WriteState::TryPrimary.next(StepEvent::Logged(TransactionId::new())).is_err());
        assert!(WriteState::Queued {
            accepted_on: Side::Central
        }
        .next(StepEvent::Applied)
        .is_err());
        assert!(WriteState::Done(Resolution::Replicated)
            .next(StepEvent::Applied)
            .is_err());
    }

    #[test]
    fn test_side_other() {
        assert_eq!(Side::Primary.other(), Side::Central);
        assert_eq!(Side::Central.other(), Side::Primary);
    }
}
