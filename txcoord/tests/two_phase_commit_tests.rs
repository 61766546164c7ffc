//! End-to-end commit and rollback through the coordinator

#[path = "testutils/mod.rs"]
mod testutils;

use std::sync::Arc;
use testutils::coordinator_fixture::CoordinatorFixture;
use txcoord::testing::{MockCall, MockResource};
use txcoord::{
    CoordinatorError, LogPhase, ResourceError, ResourceManager, RollbackCause, TransactionLog,
    TransactionStatus, Vote,
};

fn logged_phases(fixture: &CoordinatorFixture, id: txcoord::TransactionId) -> Vec<LogPhase> {
    TransactionLog::read_dir(fixture.log_dir())
        .expect("log should be readable")
        .into_iter()
        .filter(|record| record.transaction_id == id)
        .map(|record| record.phase)
        .collect()
}

#[tokio::test]
async fn test_three_participants_commit() {
    let fixture = CoordinatorFixture::new().await.expect("Failed to create fixture");
    let coordinator = fixture.coordinator();

    let resources: Vec<Arc<MockResource>> = ["orders", "billing", "audit"]
        .into_iter()
        .map(|id| Arc::new(MockResource::new(id)))
        .collect();

    let txn = coordinator.begin(None).expect("begin should succeed");
    for resource in &resources {
        txn.enlist(resource.clone()).await.expect("enlist should succeed");
    }
    assert_eq!(txn.participant_ids(), vec!["orders", "billing", "audit"]);

    txn.commit().await.expect("commit should succeed");
    assert_eq!(txn.status(), TransactionStatus::Committed);

    for resource in &resources {
        assert_eq!(
            resource.calls_for(txn.id()),
            vec![
                MockCall::Prepare(txn.id()),
                MockCall::Commit {
                    xid: txn.id(),
                    one_phase: false
                }
            ]
        );
    }

    assert_eq!(
        logged_phases(&fixture, txn.id()),
        vec![
            LogPhase::Preparing,
            LogPhase::Prepared,
            LogPhase::Committing,
            LogPhase::Committed
        ]
    );
}

#[tokio::test]
async fn test_single_participant_skips_prepare() {
    let fixture = CoordinatorFixture::new().await.expect("Failed to create fixture");
    let db = Arc::new(MockResource::new("db"));

    let txn = fixture.coordinator().begin(None).unwrap();
    txn.enlist(db.clone()).await.unwrap();
    txn.commit().await.unwrap();

    assert_eq!(db.prepare_count(), 0);
    assert_eq!(
        db.calls_for(txn.id()),
        vec![MockCall::Commit {
            xid: txn.id(),
            one_phase: true
        }]
    );
    assert_eq!(logged_phases(&fixture, txn.id()), vec![LogPhase::Committed]);
}

#[tokio::test]
async fn test_random_abort_vote_rolls_everyone_back() {
    let fixture = CoordinatorFixture::new().await.expect("Failed to create fixture");

    for _ in 0..5 {
        let count = fastrand::usize(2..6);
        let abort_at = fastrand::usize(..count);

        let resources: Vec<Arc<MockResource>> = (0..count)
            .map(|i| {
                let resource = MockResource::new(format!("rm{}", i));
                Arc::new(if i == abort_at {
                    resource.with_vote(Vote::Abort)
                } else {
                    resource
                })
            })
            .collect();

        let txn = fixture.coordinator().begin(None).unwrap();
        for resource in &resources {
            txn.enlist(resource.clone()).await.unwrap();
        }

        match txn.commit().await {
            Err(CoordinatorError::RolledBack {
                cause: RollbackCause::Vote { resource_id },
                ..
            }) => assert_eq!(resource_id, format!("rm{}", abort_at)),
            other => panic!("expected an abort vote rollback, got {:?}", other),
        }
        assert_eq!(txn.status(), TransactionStatus::RolledBack);

        for (i, resource) in resources.iter().enumerate() {
            assert_eq!(resource.commit_count(), 0, "rm{} must not commit", i);
            // Prepare stops at the first abort
            assert_eq!(resource.prepare_count(), usize::from(i <= abort_at));
            // The aborting participant already rolled itself back
            assert_eq!(resource.rollback_count(), usize::from(i != abort_at));
        }
        assert!(!logged_phases(&fixture, txn.id()).contains(&LogPhase::Committing));
    }
}

#[tokio::test]
async fn test_commit_failure_after_decision_is_heuristic() {
    let fixture = CoordinatorFixture::new().await.expect("Failed to create fixture");
    let good = Arc::new(MockResource::new("good"));
    let bad = Arc::new(
        MockResource::new("bad").failing_commit(ResourceError::Unavailable("disk full".to_string())),
    );

    let txn = fixture.coordinator().begin(None).unwrap();
    txn.enlist(good.clone()).await.unwrap();
    txn.enlist(bad.clone()).await.unwrap();

    let err = txn.commit().await.unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::Heuristic {
            status: TransactionStatus::HeuristicMixed,
            ..
        }
    ));
    assert_eq!(good.commit_count(), 1);
    assert_eq!(good.rollback_count() + bad.rollback_count(), 0);
    assert_eq!(
        logged_phases(&fixture, txn.id()).last(),
        Some(&LogPhase::HeuristicMixed)
    );

    let stats = fixture.coordinator().statistics();
    assert_eq!(stats.heuristic_transactions, 1);
}

#[tokio::test]
async fn test_rollback_only_blocks_commit() {
    let fixture = CoordinatorFixture::new().await.expect("Failed to create fixture");
    let db1 = Arc::new(MockResource::new("db1"));
    let db2 = Arc::new(MockResource::new("db2"));

    let txn = fixture.coordinator().begin(None).unwrap();
    let id = txn.id();
    fixture.coordinator().enlist(id, db1.clone()).await.unwrap();
    fixture.coordinator().enlist(id, db2.clone()).await.unwrap();
    fixture.coordinator().set_rollback_only(id).await.unwrap();

    assert!(matches!(
        fixture.coordinator().commit(id).await,
        Err(CoordinatorError::RolledBack {
            cause: RollbackCause::RollbackOnly,
            ..
        })
    ));
    assert_eq!(db1.prepare_count() + db2.prepare_count(), 0);
    assert_eq!(db1.rollback_count(), 1);
    assert_eq!(db2.rollback_count(), 1);
}

#[tokio::test]
async fn test_same_resource_identity_from_two_objects_conflicts() {
    let fixture = CoordinatorFixture::new().await.expect("Failed to create fixture");
    let first: Arc<dyn ResourceManager> = Arc::new(MockResource::new("shared"));
    let impostor: Arc<dyn ResourceManager> = Arc::new(MockResource::new("shared"));

    let txn = fixture.coordinator().begin(None).unwrap();
    txn.enlist(first.clone()).await.unwrap();
    assert_eq!(txn.enlist(first).await.unwrap(), txcoord::Enlistment::Joined);
    assert!(matches!(
        txn.enlist(impostor).await,
        Err(CoordinatorError::IllegalState(_))
    ));
    assert_eq!(txn.participant_ids(), vec!["shared"]);
}
