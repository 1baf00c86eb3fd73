//! Key allocation for inserts.

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;
use common::*;
use fragdb::model::{TitleChanges, TitleId};
use fragdb::node::{Connector, IsolationLevel, ReadMode};
use fragdb::replication::ReplicationErrorKind;

#[tokio::test]
async fn test_keys_are_sequential_across_fragments() {
    let tc = TestCluster::new();

    let mut ids = Vec::new();
    for fields in [movie("Heat"), series("Fargo"), movie("Ronin"), series("Lost")] {
        let outcome = tc.cluster.insert(fields).await.unwrap();
        ids.push(outcome.id().cloned().unwrap());
    }

    let expected: Vec<_> = (1..=4).map(TitleId::from_number).collect();
    assert_eq!(ids, expected);
    assert_eq!(ids[0].as_str(), "tt0000001");
}

#[tokio::test]
async fn test_concurrent_inserts_get_distinct_keys() {
    let tc = TestCluster::new();

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let cluster = tc.cluster.clone();
            let fields = if i % 2 == 0 {
                movie(&format!("Movie {}", i))
            } else {
                series(&format!("Series {}", i))
            };
            tokio::spawn(async move { cluster.insert(fields).await })
        })
        .collect();

    let mut numbers = BTreeSet::new();
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert!(outcome.is_success());
        numbers.insert(outcome.id().and_then(TitleId::number).unwrap());
    }

    assert_eq!(numbers, (1..=10).collect::<BTreeSet<u64>>());
    assert_eq!(tc.node(CENTRAL).titles().len(), 10);
    assert_eq!(
        tc.node(MOVIES).titles().len() + tc.node(OTHERS).titles().len(),
        10
    );
}

#[tokio::test]
async fn test_allocation_uses_fragment_maxima_when_central_down() {
    let tc = TestCluster::new();
    tc.node(MOVIES)
        .seed(movie("Heat").into_title(TitleId::from_number(5), Utc::now()));
    tc.node(OTHERS)
        .seed(series("Fargo").into_title(TitleId::from_number(9), Utc::now()));
    tc.set_online(CENTRAL, false);

    let outcome = tc.cluster.insert(movie("Ronin")).await.unwrap();
    assert!(outcome.is_pending());
    assert_eq!(outcome.id(), Some(&TitleId::from_number(10)));
}

// A key that so far exists only in the queue is not handed out again.
#[tokio::test]
async fn test_allocation_skips_queued_insert_keys() {
    let tc = TestCluster::new();
    tc.set_online(MOVIES, false);
    let first = tc.cluster.insert(movie("Heat")).await.unwrap();
    assert_eq!(first.id(), Some(&TitleId::from_number(1)));

    tc.set_online(MOVIES, true);
    tc.set_online(CENTRAL, false);
    let second = tc.cluster.insert(series("Fargo")).await.unwrap();
    assert_eq!(second.id(), Some(&TitleId::from_number(2)));
    assert_eq!(tc.cluster.pending_count(), 2);
}

#[tokio::test]
async fn test_concurrent_inserts_with_central_down_get_distinct_keys() {
    let tc = TestCluster::new();
    tc.set_online(CENTRAL, false);

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let cluster = tc.cluster.clone();
            let fields = if i % 3 == 0 {
                series(&format!("Series {}", i))
            } else {
                movie(&format!("Movie {}", i))
            };
            tokio::spawn(async move { cluster.insert(fields).await })
        })
        .collect();

    let mut numbers = BTreeSet::new();
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert!(outcome.is_pending());
        numbers.insert(outcome.id().and_then(TitleId::number).unwrap());
    }

    assert_eq!(numbers, (1..=10).collect::<BTreeSet<u64>>());
    assert_eq!(tc.cluster.pending_count(), 10);
    assert!(tc.node(CENTRAL).titles().is_empty());
    assert_eq!(
        tc.node(MOVIES).titles().len() + tc.node(OTHERS).titles().len(),
        10
    );
}

// Keys held only by an entry that a sweep is replaying are still taken.
#[tokio::test]
async fn test_allocation_skips_keys_of_replaying_inserts() {
    let tc = TestCluster::new();
    let seeded = tc.seed(1, movie("Heat"));

    tc.set_online(MOVIES, false);
    tc.cluster
        .update(&seeded.id, TitleChanges::runtime(95), IsolationLevel::ReadCommitted)
        .await
        .unwrap();
    let orphan = tc.cluster.insert(movie("Orphan")).await.unwrap();
    assert!(orphan.is_pending());
    assert_eq!(orphan.id(), Some(&TitleId::from_number(2)));

    tc.set_online(MOVIES, true);
    tc.set_online(CENTRAL, false);

    // Stall the sweep toward the fragment on its first entry.
    let movies = tc.cluster.config().nodes[1].clone();
    let mut blocker = tc
        .connector
        .open(&movies, IsolationLevel::ReadCommitted)
        .await
        .unwrap();
    blocker.begin().await.unwrap();
    blocker.fetch_title(&seeded.id, ReadMode::ForUpdate).await.unwrap();

    let sweep = {
        let cluster = tc.cluster.clone();
        tokio::spawn(async move { cluster.recover(&node_id(MOVIES)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fresh = tc.cluster.insert(movie("Fresh")).await.unwrap();
    assert!(fresh.is_pending());
    assert_eq!(fresh.id(), Some(&TitleId::from_number(3)));
    assert_ne!(orphan.id(), fresh.id());

    blocker.rollback().await.unwrap();
    let report = sweep.await.unwrap().unwrap();
    assert_eq!(report.recovered, 2);

    let on_movies = tc.node(MOVIES);
    assert_eq!(on_movies.title(&TitleId::from_number(2)).unwrap().primary_title, "Orphan");
    assert_eq!(on_movies.title(&TitleId::from_number(3)).unwrap().primary_title, "Fresh");
}

#[tokio::test]
async fn test_allocation_fails_without_central_or_every_fragment() {
    let tc = TestCluster::new();
    tc.set_online(CENTRAL, false);
    tc.set_online(OTHERS, false);

    let err = tc.cluster.insert(movie("Heat")).await.unwrap_err();
    assert_eq!(err.kind, ReplicationErrorKind::IdGenerationFailure);
    assert!(tc.node(MOVIES).titles().is_empty());
    assert!(tc.node(MOVIES).log_entries().is_empty());
    assert_eq!(tc.cluster.pending_count(), 0);
}
