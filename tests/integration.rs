//! End-to-end scenarios (bootstrap, warmth reuse, timeout reaping,
//! capacity logging, invalidation fan-out, undo finish) against the
//! in-memory test fixtures.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use objectdb_coordinator::testutil::{TestConnectionFactory, TestStorage};
use objectdb_coordinator::{
    At, CoreError, Database, DatabaseConfig, DataManager, NullTransactionManager,
    PlaceholderRootSerializer, Tid,
};

fn registry() -> objectdb_coordinator::DatabaseRegistry {
    Arc::new(Mutex::new(HashSet::new()))
}

fn no_references() -> objectdb_coordinator::storage::ReferencesFn {
    Arc::new(|_pickle: &[u8]| Vec::new())
}

fn small_pool_config(pool_size: usize) -> DatabaseConfig {
    DatabaseConfig {
        pool_size,
        ..Default::default()
    }
}

#[tokio::test]
async fn bootstrap_creates_root_on_empty_storage() {
    let storage = TestStorage::new();
    assert!(storage.load_root().await.is_err());

    let db = Database::new(
        storage.clone(),
        TestConnectionFactory::default(),
        DatabaseConfig::default(),
        &PlaceholderRootSerializer,
        registry(),
        no_references(),
    )
    .await
    .unwrap();

    assert!(storage.load_root().await.is_ok());
    assert_eq!(storage.last_tid(), Tid([0, 0, 0, 0, 0, 0, 0, 1]));

    let _conn = db
        .open(NullTransactionManager::new(), None, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn duplicate_database_name_is_rejected() {
    let shared_registry = registry();
    let storage_a = TestStorage::new();
    let _db_a = Database::new(
        storage_a,
        TestConnectionFactory::default(),
        DatabaseConfig::default(),
        &PlaceholderRootSerializer,
        shared_registry.clone(),
        no_references(),
    )
    .await
    .unwrap();

    let storage_b = TestStorage::new();
    let err = Database::new(
        storage_b,
        TestConnectionFactory::default(),
        DatabaseConfig::default(),
        &PlaceholderRootSerializer,
        shared_registry,
        no_references(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, CoreError::Argument(_)));
}

#[tokio::test]
async fn warmth_reuse_orders_pops_by_non_ghost_count() {
    let storage = TestStorage::new();
    let db = Database::new(
        storage,
        TestConnectionFactory::default(),
        small_pool_config(3),
        &PlaceholderRootSerializer,
        registry(),
        no_references(),
    )
    .await
    .unwrap();

    let a = db.open(NullTransactionManager::new(), None, None).await.unwrap();
    let b = db.open(NullTransactionManager::new(), None, None).await.unwrap();
    let c = db.open(NullTransactionManager::new(), None, None).await.unwrap();

    a.cache().set_non_ghost_count(50);
    b.cache().set_non_ghost_count(10);
    c.cache().set_non_ghost_count(200);

    db.return_connection(a.clone());
    db.return_connection(b.clone());
    db.return_connection(c.clone());

    let first = db.open(NullTransactionManager::new(), None, None).await.unwrap();
    let second = db.open(NullTransactionManager::new(), None, None).await.unwrap();
    let third = db.open(NullTransactionManager::new(), None, None).await.unwrap();

    assert!(Arc::ptr_eq(&first, &c));
    assert!(Arc::ptr_eq(&second, &a));
    assert!(Arc::ptr_eq(&third, &b));
}

#[tokio::test]
async fn capacity_over_target_logs_but_does_not_fail() {
    let storage = TestStorage::new();
    let db = Database::new(
        storage,
        TestConnectionFactory::default(),
        small_pool_config(2),
        &PlaceholderRootSerializer,
        registry(),
        no_references(),
    )
    .await
    .unwrap();

    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(
            db.open(NullTransactionManager::new(), None, None)
                .await
                .unwrap(),
        );
    }
    assert_eq!(held.len(), 4);
}

#[tokio::test]
async fn historical_pool_reaps_after_timeout() {
    let storage = TestStorage::new();
    let mut config = DatabaseConfig::default();
    config.historical_timeout = Some(Duration::from_millis(20));
    config.historical_pool_size = 3;

    let db = Database::new(
        storage,
        TestConnectionFactory::default(),
        config,
        &PlaceholderRootSerializer,
        registry(),
        no_references(),
    )
    .await
    .unwrap();

    let last_tid = Tid([0, 0, 0, 0, 0, 0, 0, 1]);
    let h1 = db
        .open(NullTransactionManager::new(), None, Some(At::Tid(last_tid)))
        .await
        .unwrap();
    db.return_connection(h1.clone());

    tokio::time::delay_for(Duration::from_millis(40)).await;

    // Any subsequent open (even on the live pool) opportunistically GCs
    // every historical sub-pool, reaping the stale entry above.
    let _live = db
        .open(NullTransactionManager::new(), None, None)
        .await
        .unwrap();

    assert!(h1.release_called());
}

#[tokio::test]
async fn invalidate_skips_the_committer() {
    let storage = TestStorage::new();
    let db = Database::new(
        storage,
        TestConnectionFactory::default(),
        DatabaseConfig::default(),
        &PlaceholderRootSerializer,
        registry(),
        no_references(),
    )
    .await
    .unwrap();

    let a = db.open(NullTransactionManager::new(), None, None).await.unwrap();
    let b = db.open(NullTransactionManager::new(), None, None).await.unwrap();
    let c = db.open(NullTransactionManager::new(), None, None).await.unwrap();

    let tid = Tid([0, 0, 0, 0, 0, 0, 0, 42]);
    let oids: HashSet<objectdb_coordinator::Oid> = vec![
        objectdb_coordinator::Oid::from(7u64),
        objectdb_coordinator::Oid::from(9u64),
    ]
    .into_iter()
    .collect();

    db.invalidate(tid, oids.clone(), Some(&b));

    assert_eq!(a.invalidations().len(), 1);
    assert_eq!(c.invalidations().len(), 1);
    assert_eq!(b.invalidations().len(), 0);

    let a_invalidations = a.invalidations();
    let (got_tid, got_oids) = &a_invalidations[0];
    assert_eq!(*got_tid, tid);
    let mut expected: Vec<objectdb_coordinator::Oid> = oids.into_iter().collect();
    expected.sort();
    assert_eq!(got_oids, &expected);
}

#[tokio::test]
async fn undo_finish_invalidates_through_the_database() {
    let storage = TestStorage::new();
    let db = Database::new(
        storage.clone(),
        TestConnectionFactory::default(),
        DatabaseConfig::default(),
        &PlaceholderRootSerializer,
        registry(),
        no_references(),
    )
    .await
    .unwrap();

    let watcher = db.open(NullTransactionManager::new(), None, None).await.unwrap();

    let x = Tid([0, 0, 0, 0, 0, 0, 0, 10]);
    let y = Tid([0, 0, 0, 0, 0, 0, 0, 20]);
    let undo = db.start_undo(vec![x, y]).unwrap();

    undo.tpc_begin(&()).await.unwrap();
    undo.commit(&()).await.unwrap();
    undo.tpc_vote(&()).await.unwrap();
    undo.tpc_finish(&()).await.unwrap();

    assert_eq!(storage.undo_calls(), vec![x, y]);
    let watcher_invalidations = watcher.invalidations();
    assert_eq!(watcher_invalidations.len(), 1);
    let (_, oids) = &watcher_invalidations[0];
    assert!(oids.contains(&objectdb_coordinator::Oid::from(10u64)));
    assert!(oids.contains(&objectdb_coordinator::Oid::from(20u64)));
}

#[tokio::test]
async fn undo_on_storage_without_support_is_rejected() {
    let storage = TestStorage::new();
    let db = Database::new(
        storage,
        TestConnectionFactory::default(),
        DatabaseConfig::default(),
        &PlaceholderRootSerializer,
        registry(),
        no_references(),
    )
    .await
    .unwrap();

    db.storage().set_supports_undo(false);
    let err = db.start_undo(vec![]).unwrap_err();
    assert!(matches!(err, CoreError::NotSupported(_)));
}
