use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Barrier;
use tokio::time::{sleep, Instant};
use tracing::info;

use super::report::{WriteClass, WriteContentionReport, WriterResult};
use super::{elapsed_ms, ConcurrencyHarness, HarnessError, HarnessResult};
use crate::model::{TitleChanges, TitleId};
use crate::node::{IsolationLevel, NodeError, NodeErrorKind, ReadMode};
use crate::replication::replica_copy;

impl ConcurrencyHarness {
    /// One writer per change set, all on the same key. Each writer locks
    /// the row, simulates work, updates, commits, then replicates.
    pub async fn run_concurrent_writes(
        &self,
        key: &TitleId,
        value_sets: Vec<TitleChanges>,
        isolation: IsolationLevel,
    ) -> HarnessResult<WriteContentionReport> {
        if value_sets.is_empty() {
            return Err(HarnessError::invalid_input("at least one change set is required"));
        }
        let prepared = self.prepare_all(key, &value_sets).await?;
        let primary = prepared[0].primary.clone();
        let barrier = Arc::new(Barrier::new(prepared.len()));
        let processing = self.settings.processing_delay();
        let threshold = self.settings.lock_wait_threshold();

        let tasks = prepared
            .into_iter()
            .zip(value_sets.iter().cloned())
            .enumerate()
            .map(|(writer, (prepared, changes))| {
                let coordinator = Arc::clone(&self.coordinator);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    let node = prepared.primary.clone();
                    let session = coordinator.registry().connect(&node, isolation).await;
                    barrier.wait().await;
                    let started = Instant::now();
                    let mut session = match session {
                        Ok(session) => session,
                        Err(err) => return WriterResult::failed(writer, node, changes, err),
                    };

                    let mut lock_wait = std::time::Duration::ZERO;
                    let written = async {
                        session.begin().await?;
                        let lock_started = Instant::now();
                        session.fetch_title(&prepared.id, ReadMode::ForUpdate).await?;
                        lock_wait = lock_started.elapsed();
                        sleep(processing).await;
                        session.apply(&prepared.mutation).await?;
                        let copy = replica_copy(session.as_mut(), &prepared).await?;
                        session.commit().await?;
                        Ok::<_, NodeError>(copy)
                    }
                    .await;

                    match written {
                        Ok(copy) => {
                            let committed_at_ms = elapsed_ms(started);
                            let class = if lock_wait > threshold {
                                WriteClass::LockWaited
                            } else {
                                WriteClass::Succeeded
                            };
                            let (replication, error) = match coordinator
                                .replicate_accepted(&prepared, copy, isolation)
                                .await
                            {
                                Ok(outcome) => (Some(outcome.as_str()), None),
                                Err(err) => (None, Some(err.to_string())),
                            };
                            WriterResult {
                                writer,
                                node,
                                changes,
                                class,
                                duration_ms: elapsed_ms(started),
                                lock_wait_ms: lock_wait.as_millis() as u64,
                                committed_at_ms: Some(committed_at_ms),
                                replication,
                                error,
                            }
                        }
                        Err(err) => {
                            let _ = session.rollback().await;
                            let class = classify_failure(&err);
                            let mut failed = WriterResult::failed(writer, node, changes, err);
                            failed.class = class;
                            failed.duration_ms = elapsed_ms(started);
                            failed.lock_wait_ms = lock_wait.as_millis() as u64;
                            failed
                        }
                    }
                })
            });

        let writers: Vec<WriterResult> = join_all(tasks)
            .await
            .into_iter()
            .enumerate()
            .map(|(writer, joined)| {
                joined.unwrap_or_else(|err| {
                    WriterResult::failed(writer, primary.clone(), value_sets[writer].clone(), err)
                })
            })
            .collect();

        sleep(self.settings.drain_delay()).await;
        let final_value = self.registry().execute_read_one(&primary, key).await?;
        // Last committer among the writers whose changes the row carries.
        let winner = final_value.as_ref().and_then(|title| {
            writers
                .iter()
                .filter(|w| w.class.is_committed() && w.changes.matches(title))
                .max_by_key(|w| w.committed_at_ms)
                .map(|w| w.writer)
        });

        let report = WriteContentionReport {
            key: key.clone(),
            isolation,
            writers,
            final_value,
            winner,
        };
        info!(
            key = %key,
            isolation = %isolation,
            succeeded = report.count(WriteClass::Succeeded),
            lock_waited = report.count(WriteClass::LockWaited),
            deadlocks = report.count(WriteClass::Deadlock),
            lock_timeouts = report.count(WriteClass::LockTimeout),
            winner = ?report.winner,
            "concurrent write experiment finished"
        );
        Ok(report)
    }
}

fn classify_failure(err: &NodeError) -> WriteClass {
    match err.kind {
        NodeErrorKind::Deadlock => WriteClass::Deadlock,
        NodeErrorKind::LockTimeout => WriteClass::LockTimeout,
        _ => WriteClass::Error,
    }
}
