//! Concurrency experiments on the in-memory engine.

mod common;

use std::time::Duration;

use common::*;
use fragdb::harness::{ExperimentKind, ExperimentReport, HarnessError, WriteClass};
use fragdb::model::{TitleChanges, TitleId};
use fragdb::node::{IsolationLevel, MemoryConnector, MemoryNode};

fn runtimes(values: &[i32]) -> Vec<TitleChanges> {
    values.iter().map(|&v| TitleChanges::runtime(v)).collect()
}

// =============================================================================
// Concurrent reads
// =============================================================================

#[tokio::test]
async fn test_concurrent_reads_are_consistent() {
    let tc = TestCluster::new();
    let seeded = tc.seed(1, movie("Heat"));

    let report = tc
        .cluster
        .run_concurrent_reads(&seeded.id, IsolationLevel::ReadCommitted)
        .await
        .unwrap();

    assert_eq!(report.readers.len(), 3);
    assert!(report.consistent);
    assert!(report.readers.iter().all(|r| !r.is_error() && r.repeatable));
    assert!(report
        .readers
        .iter()
        .all(|r| r.value.as_ref() == Some(&seeded)));
    // Readers alternate between Central and the owning fragment.
    assert_eq!(report.readers[0].node, node_id(CENTRAL));
    assert_eq!(report.readers[1].node, node_id(MOVIES));
}

#[tokio::test]
async fn test_concurrent_reads_report_unreachable_reader() {
    let tc = TestCluster::new();
    let seeded = tc.seed(1, series("Fargo"));
    tc.set_online(CENTRAL, false);

    let report = tc
        .cluster
        .run_concurrent_reads(&seeded.id, IsolationLevel::ReadCommitted)
        .await
        .unwrap();

    assert!(report.readers[0].is_error());
    assert!(!report.readers[1].is_error());
    assert!(report.consistent);
}

#[tokio::test]
async fn test_experiment_on_unknown_key() {
    let tc = TestCluster::new();

    let err = tc
        .cluster
        .run_concurrent_reads(&TitleId::from_number(42), IsolationLevel::ReadCommitted)
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::NotFound(_)));
}

// =============================================================================
// Read/write conflict
// =============================================================================

#[tokio::test]
async fn test_conflict_at_read_committed() {
    let tc = TestCluster::new();
    let seeded = tc.seed(1, movie("Heat"));

    let report = tc
        .cluster
        .run_read_write_conflict(&seeded.id, runtimes(&[100, 200]), IsolationLevel::ReadCommitted)
        .await
        .unwrap();

    assert_eq!(report.baseline.as_ref(), Some(&seeded));
    assert_eq!(report.writers.len(), 2);
    assert!(report.writers.iter().all(|w| w.committed));
    assert!(report
        .writers
        .iter()
        .all(|w| w.replication == Some("replicated")));

    assert_eq!(report.readers.len(), 2);
    assert!(report.readers.iter().all(|r| r.error.is_none()));
    assert_eq!(report.dirty_reads(), 0);

    assert!(report.convergence.converged);
    let final_value = tc.node(CENTRAL).title(&seeded.id).unwrap();
    assert!(matches!(final_value.runtime_minutes, Some(100) | Some(200)));
    assert_eq!(Some(final_value), tc.node(MOVIES).title(&seeded.id));
}

#[tokio::test]
async fn test_conflict_requires_values() {
    let tc = TestCluster::new();
    let seeded = tc.seed(1, movie("Heat"));

    let err = tc
        .cluster
        .run_read_write_conflict(&seeded.id, Vec::new(), IsolationLevel::ReadCommitted)
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::InvalidInput(_)));
}

// =============================================================================
// Concurrent writes
// =============================================================================

#[tokio::test]
async fn test_concurrent_writes_serialize_on_row_lock() {
    let tc = TestCluster::new();
    let seeded = tc.seed(1, movie("Heat"));

    let report = tc
        .cluster
        .run_concurrent_writes(&seeded.id, runtimes(&[101, 102, 103]), IsolationLevel::ReadCommitted)
        .await
        .unwrap();

    assert_eq!(report.writers.len(), 3);
    assert!(report.writers.iter().all(|w| w.class.is_committed()));
    assert!(report.count(WriteClass::LockWaited) >= 2);

    let final_value = report.final_value.clone().unwrap();
    let winner = report.winner.unwrap();
    assert!(report.writers[winner].changes.matches(&final_value));
    assert_eq!(tc.node(CENTRAL).title(&seeded.id), Some(final_value));
}

#[tokio::test]
async fn test_concurrent_writes_serialize_at_serializable() {
    let tc = TestCluster::new();
    let seeded = tc.seed(1, movie("Heat"));

    let report = tc
        .cluster
        .run_concurrent_writes(&seeded.id, runtimes(&[111, 112, 113]), IsolationLevel::Serializable)
        .await
        .unwrap();

    assert_eq!(report.writers.len(), 3);
    assert!(report.writers.iter().all(|w| w.class.is_committed()));
    assert!(report.count(WriteClass::LockWaited) >= 2);
    assert_eq!(
        report.count(WriteClass::Succeeded) + report.count(WriteClass::LockWaited),
        3
    );

    let final_value = report.final_value.clone().unwrap();
    let winner = report.winner.unwrap();
    assert!(report.writers[winner].changes.matches(&final_value));
    assert_eq!(tc.node(CENTRAL).title(&seeded.id), Some(final_value.clone()));
    assert_eq!(tc.node(MOVIES).title(&seeded.id), Some(final_value));
}

#[tokio::test]
async fn test_concurrent_writes_time_out_waiting_for_lock() {
    let mut config = config();
    config.harness.processing_delay_ms = 100;
    let connector = MemoryConnector::new()
        .with_node(MemoryNode::new(CENTRAL))
        .with_node(MemoryNode::new(MOVIES).with_lock_wait_timeout(Duration::from_millis(30)))
        .with_node(MemoryNode::new(OTHERS));
    let tc = TestCluster::build(config, connector);
    let seeded = tc.seed(1, movie("Heat"));

    let report = tc
        .cluster
        .run_concurrent_writes(&seeded.id, runtimes(&[101, 102]), IsolationLevel::ReadCommitted)
        .await
        .unwrap();

    assert_eq!(report.count(WriteClass::Succeeded), 1);
    assert_eq!(report.count(WriteClass::LockTimeout), 1);
    let timed_out = report
        .writers
        .iter()
        .find(|w| w.class == WriteClass::LockTimeout)
        .unwrap();
    assert!(timed_out.error.is_some());
    assert_eq!(timed_out.committed_at_ms, None);

    let winner = report.winner.unwrap();
    assert_eq!(report.writers[winner].class, WriteClass::Succeeded);
}

#[tokio::test]
async fn test_concurrent_writes_require_values() {
    let tc = TestCluster::new();
    let seeded = tc.seed(1, movie("Heat"));

    let err = tc
        .cluster
        .run_concurrent_writes(&seeded.id, Vec::new(), IsolationLevel::ReadCommitted)
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::InvalidInput(_)));
}

// =============================================================================
// Isolation sweep
// =============================================================================

#[tokio::test]
async fn test_read_sweep_covers_every_level() {
    let tc = TestCluster::new();
    let seeded = tc.seed(1, movie("Heat"));

    let reports = tc
        .cluster
        .run_isolation_sweep(ExperimentKind::Reads, &seeded.id, Vec::new())
        .await
        .unwrap();

    let levels: Vec<_> = reports.iter().map(ExperimentReport::isolation).collect();
    assert_eq!(levels, IsolationLevel::ALL.to_vec());
    for report in &reports {
        match report {
            ExperimentReport::Reads(read) => assert!(read.consistent),
            other => panic!("unexpected report {:?}", other),
        }
    }
}
