//! Concurrency experiments
//!
//! Each experiment spawns one task per participant. A participant opens
//! its own session, then waits on a shared barrier, so all participants
//! start together whether or not their connect succeeded. Tasks are joined
//! before anything is aggregated; a failed participant shows up in the
//! report and never aborts the others.
//!
//! The harness observes what the engine does at an isolation level. It
//! imposes no ordering of its own.

mod config;
mod conflict;
mod errors;
mod reads;
mod report;
mod writes;

use std::sync::Arc;

use tokio::time::Instant;
use tracing::info;

use crate::model::{Title, TitleChanges, TitleId};
use crate::node::{IsolationLevel, NodeError, NodeId, NodeRegistry, NodeSession, ReadMode};
use crate::replication::{Prepared, PreparedWrite, ReplicationCoordinator};

pub use config::HarnessSettings;
pub use errors::{HarnessError, HarnessResult};
pub use report::{
    ConflictReader, ConflictReport, ConflictWriter, Convergence, ExperimentKind, ExperimentReport,
    ReadReport, ReaderResult, WriteClass, WriteContentionReport, WriterResult,
};

pub struct ConcurrencyHarness {
    coordinator: Arc<ReplicationCoordinator>,
    settings: HarnessSettings,
}

impl ConcurrencyHarness {
    pub fn new(coordinator: Arc<ReplicationCoordinator>, settings: HarnessSettings) -> Self {
        Self {
            coordinator,
            settings,
        }
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    fn registry(&self) -> &Arc<NodeRegistry> {
        self.coordinator.registry()
    }

    /// Owning fragment of an existing key.
    async fn locate(&self, key: &TitleId) -> HarnessResult<NodeId> {
        match self.registry().get_by_key(key).await? {
            Some(title) => Ok(self.registry().primary(title.title_type).clone()),
            None => Err(HarnessError::NotFound(key.clone())),
        }
    }

    /// One prepared update per change set, in order.
    async fn prepare_all(
        &self,
        key: &TitleId,
        change_sets: &[TitleChanges],
    ) -> HarnessResult<Vec<PreparedWrite>> {
        let mut prepared = Vec::with_capacity(change_sets.len());
        for changes in change_sets {
            match self.coordinator.prepare_update(key, changes.clone()).await? {
                Prepared::Ready(write) => prepared.push(write),
                Prepared::NotFound => return Err(HarnessError::NotFound(key.clone())),
                Prepared::Unreachable => {
                    return Err(HarnessError::Node(NodeError::unavailable(
                        self.registry().central(),
                        "no node reachable for lookup",
                    )))
                }
            }
        }
        Ok(prepared)
    }

    /// Runs one experiment kind at every isolation level, weakest first.
    pub async fn sweep(
        &self,
        kind: ExperimentKind,
        key: &TitleId,
        change_sets: Vec<TitleChanges>,
    ) -> HarnessResult<Vec<ExperimentReport>> {
        let mut reports = Vec::with_capacity(IsolationLevel::ALL.len());
        for isolation in IsolationLevel::ALL {
            info!(experiment = kind.as_str(), isolation = %isolation, key = %key, "isolation sweep step");
            let report = match kind {
                ExperimentKind::Reads => {
                    ExperimentReport::Reads(self.run_concurrent_reads(key, isolation).await?)
                }
                ExperimentKind::Conflict => ExperimentReport::Conflict(
                    self.run_read_write_conflict(key, change_sets.clone(), isolation)
                        .await?,
                ),
                ExperimentKind::Writes => ExperimentReport::Writes(
                    self.run_concurrent_writes(key, change_sets.clone(), isolation)
                        .await?,
                ),
            };
            reports.push(report);
        }
        Ok(reports)
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Two reads of the same key in one transaction.
struct DoubleRead {
    first: Option<Title>,
    first_at: Instant,
    second: Option<Title>,
    second_at: Instant,
}

async fn double_read(
    session: &mut dyn NodeSession,
    key: &TitleId,
    gap: std::time::Duration,
) -> Result<DoubleRead, NodeError> {
    session.begin().await?;
    let reads = async {
        let first = session.fetch_title(key, ReadMode::Plain).await?;
        let first_at = Instant::now();
        tokio::time::sleep(gap).await;
        let second = session.fetch_title(key, ReadMode::Plain).await?;
        let second_at = Instant::now();
        Ok::<_, NodeError>(DoubleRead {
            first,
            first_at,
            second,
            second_at,
        })
    }
    .await;
    match reads {
        Ok(read) => {
            session.commit().await?;
            Ok(read)
        }
        Err(err) => {
            let _ = session.rollback().await;
            Err(err)
        }
    }
}
