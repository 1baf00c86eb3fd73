use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Barrier;
use tokio::time::Instant;
use tracing::info;

use super::report::{ReadReport, ReaderResult};
use super::{double_read, elapsed_ms, ConcurrencyHarness, HarnessResult};
use crate::model::TitleId;
use crate::node::IsolationLevel;

impl ConcurrencyHarness {
    /// Readers alternate between Central and the key's fragment. Each does
    /// two reads in one transaction.
    pub async fn run_concurrent_reads(
        &self,
        key: &TitleId,
        isolation: IsolationLevel,
    ) -> HarnessResult<ReadReport> {
        self.settings.validate()?;
        let primary = self.locate(key).await?;
        let nodes = [self.registry().central().clone(), primary];
        let count = self.settings.readers;
        let gap = self.settings.read_gap();
        let barrier = Arc::new(Barrier::new(count));

        let tasks = (0..count).map(|reader| {
            let node = nodes[reader % nodes.len()].clone();
            let registry = Arc::clone(self.registry());
            let barrier = Arc::clone(&barrier);
            let key = key.clone();
            tokio::spawn(async move {
                let session = registry.connect(&node, isolation).await;
                barrier.wait().await;
                let mut session = match session {
                    Ok(session) => session,
                    Err(err) => return ReaderResult::failed(reader, node, err),
                };
                let started = Instant::now();
                match double_read(session.as_mut(), &key, gap).await {
                    Ok(read) => ReaderResult {
                        reader,
                        node,
                        repeatable: read.first == read.second,
                        value: read.first,
                        duration_ms: elapsed_ms(started),
                        error: None,
                    },
                    Err(err) => ReaderResult::failed(reader, node, err),
                }
            })
        });

        let readers: Vec<ReaderResult> = join_all(tasks)
            .await
            .into_iter()
            .enumerate()
            .map(|(reader, joined)| {
                joined.unwrap_or_else(|err| {
                    ReaderResult::failed(reader, nodes[reader % nodes.len()].clone(), err)
                })
            })
            .collect();

        let mut seen = readers.iter().filter(|r| !r.is_error()).map(|r| &r.value);
        let consistent = match seen.next() {
            Some(first) => seen.all(|value| value == first),
            None => true,
        };

        info!(key = %key, isolation = %isolation, readers = readers.len(), consistent, "concurrent read experiment finished");
        Ok(ReadReport {
            key: key.clone(),
            isolation,
            readers,
            consistent,
        })
    }
}
