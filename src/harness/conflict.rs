use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Barrier;
use tokio::time::{sleep, Instant};
use tracing::info;

use super::report::{ConflictReader, ConflictReport, ConflictWriter, Convergence};
use super::{double_read, elapsed_ms, ConcurrencyHarness, HarnessError, HarnessResult};
use crate::model::{Title, TitleChanges, TitleId};
use crate::node::{IsolationLevel, NodeError, NodeId};
use crate::replication::replica_copy;

const WRITERS: usize = 2;
const READERS: usize = 2;

/// Read instants, kept until the first commit time is known.
type ReadTimes = Option<(Instant, Instant)>;

impl ConcurrencyHarness {
    /// Two writers hold an update open on the key's fragment while two
    /// readers read it twice. Writer `i` applies `new_values[i % len]`.
    pub async fn run_read_write_conflict(
        &self,
        key: &TitleId,
        new_values: Vec<TitleChanges>,
        isolation: IsolationLevel,
    ) -> HarnessResult<ConflictReport> {
        if new_values.is_empty() {
            return Err(HarnessError::invalid_input("at least one change set is required"));
        }
        let change_sets: Vec<TitleChanges> = (0..WRITERS)
            .map(|i| new_values[i % new_values.len()].clone())
            .collect();
        let prepared = self.prepare_all(key, &change_sets).await?;
        let primary = prepared[0].primary.clone();
        let central = self.registry().central().clone();
        let baseline = self.registry().execute_read_one(&primary, key).await?;

        let barrier = Arc::new(Barrier::new(WRITERS + READERS));
        // Earliest instant any writer started to commit.
        let first_commit: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let dwell = self.settings.writer_dwell();

        let writer_tasks = prepared
            .into_iter()
            .zip(change_sets.iter().cloned())
            .enumerate()
            .map(|(writer, (prepared, changes))| {
            let coordinator = Arc::clone(&self.coordinator);
            let barrier = Arc::clone(&barrier);
            let first_commit = Arc::clone(&first_commit);
            tokio::spawn(async move {
                let node = prepared.primary.clone();
                let session = coordinator.registry().connect(&node, isolation).await;
                barrier.wait().await;
                let started = Instant::now();
                let mut session = match session {
                    Ok(session) => session,
                    Err(err) => return ConflictWriter::failed(writer, node, changes, err),
                };

                let written = async {
                    session.begin().await?;
                    session.apply(&prepared.mutation).await?;
                    let copy = replica_copy(session.as_mut(), &prepared).await?;
                    sleep(dwell).await;
                    {
                        let mut first = first_commit.lock();
                        let now = Instant::now();
                        if first.map_or(true, |at| now < at) {
                            *first = Some(now);
                        }
                    }
                    session.commit().await?;
                    Ok::<_, NodeError>(copy)
                }
                .await;

                match written {
                    Ok(copy) => {
                        let duration_ms = elapsed_ms(started);
                        let (replication, error) =
                            match coordinator.replicate_accepted(&prepared, copy, isolation).await {
                                Ok(outcome) => (Some(outcome.as_str()), None),
                                Err(err) => (None, Some(err.to_string())),
                            };
                        ConflictWriter {
                            writer,
                            node,
                            changes,
                            committed: true,
                            duration_ms,
                            replication,
                            error,
                        }
                    }
                    Err(err) => {
                        let _ = session.rollback().await;
                        let mut failed = ConflictWriter::failed(writer, node, changes, err);
                        failed.duration_ms = elapsed_ms(started);
                        failed
                    }
                }
            })
        });

        let stagger = self.settings.reader_stagger();
        let gap = self.settings.read_gap();
        let reader_tasks = (0..READERS).map(|reader| {
            let registry = Arc::clone(self.registry());
            let barrier = Arc::clone(&barrier);
            let node = primary.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let session = registry.connect(&node, isolation).await;
                barrier.wait().await;
                let mut session = match session {
                    Ok(session) => session,
                    Err(err) => return (ConflictReader::failed(reader, node, err), None),
                };
                sleep(stagger * reader as u32).await;
                let started = Instant::now();
                match double_read(session.as_mut(), &key, gap).await {
                    Ok(read) => {
                        let times = Some((read.first_at, read.second_at));
                        let observed = ConflictReader {
                            reader,
                            node,
                            non_repeatable: read.first != read.second,
                            first: read.first,
                            second: read.second,
                            duration_ms: elapsed_ms(started),
                            dirty_read: false,
                            blocked: false,
                            error: None,
                        };
                        (observed, times)
                    }
                    Err(err) => {
                        let mut failed = ConflictReader::failed(reader, node, err);
                        failed.duration_ms = elapsed_ms(started);
                        (failed, None)
                    }
                }
            })
        });

        let (writers, reads) = tokio::join!(join_all(writer_tasks), join_all(reader_tasks));

        let writers: Vec<ConflictWriter> = writers
            .into_iter()
            .enumerate()
            .map(|(writer, joined)| {
                joined.unwrap_or_else(|err| {
                    ConflictWriter::failed(writer, primary.clone(), change_sets[writer].clone(), err)
                })
            })
            .collect();

        let first_commit = *first_commit.lock();
        let readers: Vec<ConflictReader> = reads
            .into_iter()
            .enumerate()
            .map(|(reader, joined)| match joined {
                Ok((observed, times)) => {
                    classify_reader(observed, times, &baseline, first_commit, dwell.as_millis() as u64)
                }
                Err(err) => ConflictReader::failed(reader, primary.clone(), err),
            })
            .collect();

        sleep(self.settings.drain_delay()).await;
        let mut final_reads = Vec::with_capacity(2);
        for node in [&central, &primary] {
            final_reads.push((node.clone(), self.registry().execute_read_one(node, key).await));
        }
        let convergence = Convergence::from_reads(final_reads);

        let report = ConflictReport {
            key: key.clone(),
            isolation,
            baseline,
            writers,
            readers,
            convergence,
        };
        info!(
            key = %key,
            isolation = %isolation,
            dirty_reads = report.dirty_reads(),
            non_repeatable = report.non_repeatable_reads(),
            converged = report.convergence.converged,
            "read/write conflict experiment finished"
        );
        Ok(report)
    }
}

fn classify_reader(
    mut observed: ConflictReader,
    times: ReadTimes,
    baseline: &Option<Title>,
    first_commit: Option<Instant>,
    dwell_ms: u64,
) -> ConflictReader {
    let Some((first_at, second_at)) = times else {
        return observed;
    };
    // A changed row read before any commit started can only be uncommitted.
    let early = |at: Instant| first_commit.map_or(true, |commit| at < commit);
    observed.dirty_read = (observed.first != *baseline && early(first_at))
        || (observed.second != *baseline && early(second_at));
    observed.blocked = observed.duration_ms > dwell_ms;
    observed
}

impl ConflictReader {
    fn failed(reader: usize, node: NodeId, error: impl ToString) -> Self {
        Self {
            reader,
            node,
            first: None,
            second: None,
            duration_ms: 0,
            dirty_read: false,
            non_repeatable: false,
            blocked: false,
            error: Some(error.to_string()),
        }
    }
}

impl ConflictWriter {
    fn failed(writer: usize, node: NodeId, changes: TitleChanges, error: impl ToString) -> Self {
        Self {
            writer,
            node,
            changes,
            committed: false,
            duration_ms: 0,
            replication: None,
            error: Some(error.to_string()),
        }
    }
}
