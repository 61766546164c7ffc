//! Coordinator lifecycle: capacity, checkpoints and shutdown

#[path = "testutils/mod.rs"]
mod testutils;

use std::sync::Arc;
use std::time::Duration;
use testutils::coordinator_fixture::{wait_for_status, CoordinatorFixture};
use txcoord::testing::MockResource;
use txcoord::{CoordinatorError, TransactionLog, TransactionStatus};

#[tokio::test]
async fn test_concurrent_transactions_commit_independently() {
    let fixture = CoordinatorFixture::new().await.expect("Failed to create fixture");
    let db1 = Arc::new(MockResource::new("db1"));
    let db2 = Arc::new(MockResource::new("db2"));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let coordinator = fixture.coordinator().clone();
        let (db1, db2) = (db1.clone(), db2.clone());
        tasks.push(tokio::spawn(async move {
            let txn = coordinator.begin(None)?;
            txn.enlist(db1).await?;
            txn.enlist(db2).await?;
            txn.commit().await?;
            Ok::<_, CoordinatorError>(txn.id())
        }));
    }

    for task in tasks {
        task.await.unwrap().expect("transaction should commit");
    }
    assert_eq!(db1.commit_count(), 16);
    assert_eq!(db2.commit_count(), 16);
    assert_eq!(fixture.coordinator().active_count(), 0);
    assert_eq!(fixture.coordinator().statistics().committed_transactions, 16);
}

#[tokio::test]
async fn test_checkpoint_compacts_closed_transactions() {
    let fixture = CoordinatorFixture::new().await.expect("Failed to create fixture");
    let coordinator = fixture.coordinator();
    let db1 = Arc::new(MockResource::new("db1"));
    let db2 = Arc::new(MockResource::new("db2"));

    for _ in 0..100 {
        let txn = coordinator.begin(None).unwrap();
        txn.enlist(db1.clone()).await.unwrap();
        txn.enlist(db2.clone()).await.unwrap();
        txn.commit().await.unwrap();
    }

    let report = coordinator.checkpoint().unwrap();
    assert_eq!(report.records_retained, 0);
    assert!(report.segments_removed > 0);
    assert!(TransactionLog::read_dir(fixture.log_dir()).unwrap().is_empty());
}

#[tokio::test]
async fn test_shutdown_leaves_decided_transactions_running() {
    let fixture = CoordinatorFixture::new().await.expect("Failed to create fixture");
    let coordinator = fixture.coordinator().clone();
    let slow = Arc::new(MockResource::new("slow").with_prepare_delay(Duration::from_millis(300)));
    let fast = Arc::new(MockResource::new("fast"));

    let busy = coordinator.begin(None).unwrap();
    busy.enlist(slow.clone()).await.unwrap();
    busy.enlist(fast.clone()).await.unwrap();
    let committer = busy.clone();
    let commit = tokio::spawn(async move { committer.commit().await });

    let idle = coordinator.begin(None).unwrap();
    idle.enlist(Arc::new(MockResource::new("idle"))).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = coordinator.shutdown().await;

    assert_eq!(report.rolled_back, vec![idle.id()]);
    assert_eq!(report.still_completing, vec![busy.id()]);
    assert!(report.failed.is_empty());

    commit.await.unwrap().expect("in-flight commit should finish");
    assert!(wait_for_status(&busy, TransactionStatus::Committed, Duration::from_millis(100)).await);
    assert_eq!(slow.commit_count(), 1);
}
