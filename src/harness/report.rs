use std::collections::BTreeMap;

use serde::Serialize;

use crate::model::{Title, TitleChanges, TitleId};
use crate::node::{IsolationLevel, NodeError, NodeId};

/// Experiment selector for the isolation sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentKind {
    Reads,
    Conflict,
    Writes,
}

impl ExperimentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentKind::Reads => "reads",
            ExperimentKind::Conflict => "conflict",
            ExperimentKind::Writes => "writes",
        }
    }
}

// ==================== Concurrent reads ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReaderResult {
    pub reader: usize,
    pub node: NodeId,
    /// First read; `None` when the row was absent.
    pub value: Option<Title>,
    pub duration_ms: u64,
    /// Both reads returned the same row.
    pub repeatable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReaderResult {
    pub(crate) fn failed(reader: usize, node: NodeId, error: impl ToString) -> Self {
        Self {
            reader,
            node,
            value: None,
            duration_ms: 0,
            repeatable: false,
            error: Some(error.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadReport {
    pub key: TitleId,
    pub isolation: IsolationLevel,
    pub readers: Vec<ReaderResult>,
    /// Every reader that did not fail saw the same row.
    pub consistent: bool,
}

// ==================== Read/write conflict ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictWriter {
    pub writer: usize,
    pub node: NodeId,
    pub changes: TitleChanges,
    pub committed: bool,
    pub duration_ms: u64,
    /// Outcome of replicating the committed write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictReader {
    pub reader: usize,
    pub node: NodeId,
    pub first: Option<Title>,
    pub second: Option<Title>,
    pub duration_ms: u64,
    /// Saw a changed row before any writer began to commit.
    pub dirty_read: bool,
    /// The two reads differ.
    pub non_repeatable: bool,
    /// Took longer than a writer holds its transaction.
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final row on each copy after the drain delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Convergence {
    pub values: BTreeMap<NodeId, Option<Title>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<NodeId, String>,
    /// Every copy was readable and all agree.
    pub converged: bool,
}

impl Convergence {
    pub(crate) fn from_reads(reads: Vec<(NodeId, Result<Option<Title>, NodeError>)>) -> Self {
        let mut values = BTreeMap::new();
        let mut errors = BTreeMap::new();
        for (node, read) in reads {
            match read {
                Ok(value) => {
                    values.insert(node, value);
                }
                Err(err) => {
                    errors.insert(node, err.to_string());
                }
            }
        }
        let mut distinct = values.values();
        let converged = errors.is_empty()
            && match distinct.next() {
                Some(first) => distinct.all(|v| v == first),
                None => false,
            };
        Self {
            values,
            errors,
            converged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictReport {
    pub key: TitleId,
    pub isolation: IsolationLevel,
    pub baseline: Option<Title>,
    pub writers: Vec<ConflictWriter>,
    pub readers: Vec<ConflictReader>,
    pub convergence: Convergence,
}

impl ConflictReport {
    pub fn dirty_reads(&self) -> usize {
        self.readers.iter().filter(|r| r.dirty_read).count()
    }

    pub fn non_repeatable_reads(&self) -> usize {
        self.readers.iter().filter(|r| r.non_repeatable).count()
    }
}

// ==================== Concurrent writes ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteClass {
    Succeeded,
    LockWaited,
    Deadlock,
    LockTimeout,
    Error,
}

impl WriteClass {
    pub fn is_committed(&self) -> bool {
        matches!(self, WriteClass::Succeeded | WriteClass::LockWaited)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriterResult {
    pub writer: usize,
    pub node: NodeId,
    pub changes: TitleChanges,
    pub class: WriteClass,
    pub duration_ms: u64,
    /// Time spent acquiring the row lock.
    pub lock_wait_ms: u64,
    /// Commit time, measured from release.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WriterResult {
    pub(crate) fn failed(writer: usize, node: NodeId, changes: TitleChanges, error: impl ToString) -> Self {
        Self {
            writer,
            node,
            changes,
            class: WriteClass::Error,
            duration_ms: 0,
            lock_wait_ms: 0,
            committed_at_ms: None,
            replication: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteContentionReport {
    pub key: TitleId,
    pub isolation: IsolationLevel,
    pub writers: Vec<WriterResult>,
    pub final_value: Option<Title>,
    /// Writer whose changes the final row carries.
    pub winner: Option<usize>,
}

impl WriteContentionReport {
    pub fn count(&self, class: WriteClass) -> usize {
        self.writers.iter().filter(|w| w.class == class).count()
    }
}

/// One report per experiment kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "experiment", rename_all = "snake_case")]
pub enum ExperimentReport {
    Reads(ReadReport),
    Conflict(ConflictReport),
    Writes(WriteContentionReport),
}

impl ExperimentReport {
    pub fn isolation(&self) -> IsolationLevel {
        match self {
            ExperimentReport::Reads(r) => r.isolation,
            ExperimentReport::Conflict(r) => r.isolation,
            ExperimentReport::Writes(r) => r.isolation,
        }
    }
}
