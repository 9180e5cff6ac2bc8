//! End-to-end scenarios over the public engine API.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use storesync_common::{
    EntityType, Error, Operation, OutboxStatus, Priority, QueueStatus, SessionStatus, StoreId,
};
use storesync_storage::{MemoryStore, OutboxQuery, SqliteStore, SyncStore};
use storesync_sync::{
    CycleTrigger, Outcome, QueueEvent, RecordingTransport, RetryManager, SyncConfig, SyncEngine,
};

fn device() -> EntityType {
    EntityType::new("device").unwrap()
}

fn sale() -> EntityType {
    EntityType::new("sale").unwrap()
}

#[tokio::test]
async fn scenario_a_conflict_lifecycle() {
    let engine = SyncEngine::builder(Arc::new(MemoryStore::new()))
        .build()
        .unwrap();

    let e1 = engine
        .enqueue(device(), "D1", Operation::Create, json!({"qty": 5}), None)
        .await
        .unwrap();
    assert_eq!((e1.version, e1.conflict_flag), (1, false));

    let e2 = engine
        .enqueue(device(), "D1", Operation::Update, json!({"qty": 7}), None)
        .await
        .unwrap();
    assert_eq!((e2.version, e2.conflict_flag), (2, true));

    let e3 = engine
        .enqueue(device(), "D1", Operation::Update, json!({"qty": 7}), None)
        .await
        .unwrap();
    assert_eq!((e3.version, e3.conflict_flag), (2, true));

    let e4 = engine
        .enqueue(device(), "D1", Operation::Update, json!({"qty": 9}), None)
        .await
        .unwrap();
    assert_eq!((e4.version, e4.conflict_flag), (3, true));

    let resolved = engine
        .resolve_latest(&device(), "D1", "ops@hq")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.id, e4.id);
    assert_eq!((resolved.version, resolved.conflict_flag), (4, false));
    assert_eq!(resolved.resolved_by.as_deref(), Some("ops@hq"));
    assert!(engine.conflicts().await.unwrap().is_empty());

    // Earlier rows are history and stay as written.
    assert_eq!(engine.get_entry(e2.id).await.unwrap(), e2);
}

#[tokio::test]
async fn scenario_b_scoped_cycle() {
    let store = Arc::new(MemoryStore::new());
    let engine = SyncEngine::builder(store.clone()).build().unwrap();

    let s42 = engine
        .enqueue(sale(), "S42", Operation::Create, json!({"store_id": 42}), None)
        .await
        .unwrap();
    let s99 = engine
        .enqueue(sale(), "S99", Operation::Create, json!({"store_id": "99"}), None)
        .await
        .unwrap();
    let global = engine
        .enqueue(
            EntityType::new("product").unwrap(),
            "P1",
            Operation::Update,
            json!({"sku": "A-1"}),
            None,
        )
        .await
        .unwrap();

    let report = engine
        .run_cycle(Some(StoreId(42)), CycleTrigger::manual("manager@42"))
        .await
        .unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.session.status, SessionStatus::Success);
    assert_eq!(report.session.triggered_by.as_deref(), Some("manager@42"));

    assert_eq!(engine.get_entry(s42.id).await.unwrap().status, OutboxStatus::Sent);
    assert_eq!(engine.get_entry(global.id).await.unwrap().status, OutboxStatus::Sent);

    let untouched = engine.get_entry(s99.id).await.unwrap();
    assert_eq!(untouched.status, OutboxStatus::Pending);
    assert_eq!(untouched.attempt_count, 0);
}

#[tokio::test]
async fn scenario_c_requeue_window() {
    let store = Arc::new(MemoryStore::new());
    let engine = SyncEngine::builder(store.clone()).build().unwrap();
    let now = Utc::now();

    let old = engine
        .enqueue(sale(), "S1", Operation::Create, json!({}), None)
        .await
        .unwrap();
    let fresh = engine
        .enqueue(sale(), "S2", Operation::Create, json!({}), None)
        .await
        .unwrap();

    let mut old_failed = old.clone();
    old_failed.mark_failed("hq down", now - chrono::Duration::hours(2));
    let mut fresh_failed = fresh.clone();
    fresh_failed.mark_failed("hq down", now - chrono::Duration::minutes(10));
    store
        .update_outbox_batch(&[old_failed, fresh_failed])
        .await
        .unwrap();

    let requeued = RetryManager::new(store.clone())
        .requeue_failed_at(now, Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(requeued.len(), 1);

    let old = engine.get_entry(old.id).await.unwrap();
    assert_eq!((old.status, old.attempt_count), (OutboxStatus::Pending, 0));
    let fresh = engine.get_entry(fresh.id).await.unwrap();
    assert_eq!((fresh.status, fresh.attempt_count), (OutboxStatus::Failed, 1));
}

#[tokio::test]
async fn failed_delivery_recovers_on_later_tick() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(
        RecordingTransport::new().with_outcome("sale", Outcome::Reject("hq offline".to_string())),
    );
    let engine = SyncEngine::builder(store.clone())
        .transport(transport.clone())
        .build()
        .unwrap();

    let entry = engine
        .enqueue(sale(), "S1", Operation::Create, json!({"total": 20}), None)
        .await
        .unwrap();
    let first = engine.tick(None, CycleTrigger::automatic()).await.unwrap();
    assert_eq!(first.cycle.failed, 1);

    let failed = engine.get_entry(entry.id).await.unwrap();
    assert_eq!(failed.error_message.as_deref(), Some("hq offline"));

    // Back online, and the retry interval has passed.
    transport.script("sale", Outcome::Accept);
    RetryManager::new(store.clone())
        .requeue_failed_at(Utc::now() + chrono::Duration::hours(2), Duration::from_secs(3600))
        .await
        .unwrap();
    let second = engine.tick(None, CycleTrigger::automatic()).await.unwrap();
    assert_eq!(second.cycle.sent, 1);
    assert_eq!(transport.delivered().len(), 1);
}

#[tokio::test]
async fn sqlite_backed_engine_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let engine = SyncEngine::builder(store)
            .config(SyncConfig::default())
            .build()
            .unwrap();
        engine
            .enqueue(device(), "D1", Operation::Create, json!({"qty": 5}), None)
            .await
            .unwrap();
        engine
            .enqueue(device(), "D1", Operation::Update, json!({"qty": 6}), None)
            .await
            .unwrap();
        let outcome = engine
            .enqueue_events(vec![QueueEvent::new("sale", json!({})).with_key("sale-1")])
            .await
            .unwrap();
        assert_eq!(outcome.queued.len(), 1);
    }

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let engine = SyncEngine::builder(store.clone()).build().unwrap();

    let conflicts = engine.conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].version, 2);

    let again = engine
        .enqueue_events(vec![QueueEvent::new("sale", json!({})).with_key("sale-1")])
        .await
        .unwrap();
    assert!(again.queued.is_empty());
    assert_eq!(again.reused.len(), 1);

    let report = engine.tick(None, CycleTrigger::manual("ops")).await.unwrap();
    assert_eq!(report.cycle.sent, 2);
    assert_eq!(report.queue.sent, 1);

    let page = engine
        .list_entries(&OutboxQuery::with_status(OutboxStatus::Sent))
        .await
        .unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(store.list_sessions(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn review_during_cycle_survives_delivery_commit() {
    let transport = Arc::new(
        RecordingTransport::new().with_outcome("device", Outcome::Stall(Duration::from_millis(200))),
    );
    let engine = SyncEngine::builder(Arc::new(MemoryStore::new()))
        .transport(transport)
        .build()
        .unwrap();

    engine
        .enqueue(device(), "D1", Operation::Create, json!({"qty": 5}), None)
        .await
        .unwrap();
    let flagged = engine
        .enqueue(device(), "D1", Operation::Update, json!({"qty": 7}), None)
        .await
        .unwrap();
    assert_eq!((flagged.version, flagged.conflict_flag), (2, true));

    // Resolve and re-prioritize while both deliveries are in flight.
    let (cycle, review) = tokio::join!(
        engine.run_cycle(None, CycleTrigger::manual("ops")),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            engine.resolve(&[flagged.id], "alice").await?;
            engine.set_priority(flagged.id, Priority::High).await
        }
    );
    assert_eq!(cycle.unwrap().sent, 2);
    review.unwrap();

    let stored = engine.get_entry(flagged.id).await.unwrap();
    assert_eq!((stored.version, stored.conflict_flag), (3, false));
    assert_eq!(stored.resolved_by.as_deref(), Some("alice"));
    assert_eq!(stored.priority, Priority::High);
    assert_eq!((stored.status, stored.attempt_count), (OutboxStatus::Sent, 1));
    assert!(engine.conflicts().await.unwrap().is_empty());
}

#[tokio::test]
async fn shutdown_lets_running_tick_finish() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(
        RecordingTransport::new().with_outcome("sale", Outcome::Stall(Duration::from_millis(200))),
    );
    let mut engine = SyncEngine::builder(store.clone())
        .transport(transport.clone())
        .build()
        .unwrap();
    let entry = engine
        .enqueue(sale(), "S1", Operation::Create, json!({"total": 9}), None)
        .await
        .unwrap();

    let handle = engine.init_scheduler();
    let engine = Arc::new(engine);
    let runner = {
        let engine = engine.clone();
        tokio::spawn(handle.run(move |request| {
            let engine = engine.clone();
            async move { engine.process_request(request).await }
        }))
    };

    let requested = {
        let engine = engine.clone();
        tokio::spawn(async move {
            match engine.scheduler() {
                Some(scheduler) => scheduler.request_sync(None, "ops").await,
                None => Err(Error::Scheduler("not initialized".to_string())),
            }
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.scheduler().unwrap().shutdown().await;

    let report = requested.await.unwrap().unwrap();
    assert_eq!(report.cycle.sent, 1);
    runner.await.unwrap();

    let stored = engine.get_entry(entry.id).await.unwrap();
    assert_eq!(stored.status, OutboxStatus::Sent);
    assert_eq!(transport.delivered().len(), 1);
    assert!(matches!(
        engine.scheduler().unwrap().request_sync(None, "ops").await,
        Err(Error::Scheduler(_))
    ));
}

#[tokio::test]
async fn sqlite_concurrent_duplicate_keys_store_one_row() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("sync.db")).unwrap());
    let engine = SyncEngine::builder(store.clone()).build().unwrap();

    let event = || QueueEvent::new("sale", json!({"total": 4})).with_key("sale-77");
    let (first, second) = tokio::join!(
        engine.enqueue_events(vec![event()]),
        engine.enqueue_events(vec![event()])
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.queued.len() + second.queued.len(), 1);
    assert_eq!(first.reused.len() + second.reused.len(), 1);
    let rows = store.list_queue(&[QueueStatus::Queued]).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].idempotency_key.as_deref(), Some("sale-77"));
}

#[tokio::test]
async fn queue_budget_comes_from_configuration() {
    let mut config = SyncConfig {
        queue_max_attempts: 2,
        ..SyncConfig::default()
    };
    config.queue_backoff.initial_delay_secs = 0;
    config.queue_backoff.jitter = false;
    let transport = Arc::new(
        RecordingTransport::new().with_outcome("sale", Outcome::Reject("hq down".to_string())),
    );
    let store = Arc::new(MemoryStore::new());
    let engine = SyncEngine::builder(store.clone())
        .config(config)
        .transport(transport)
        .build()
        .unwrap();
    engine
        .enqueue_events(vec![QueueEvent::new("sale", json!({"total": 1}))])
        .await
        .unwrap();

    let first = engine.dispatch_queue().await.unwrap();
    assert_eq!((first.retried, first.failed), (1, 0));
    let second = engine.dispatch_queue().await.unwrap();
    assert_eq!((second.retried, second.failed), (0, 1));

    let failed = store.list_queue(&[QueueStatus::Failed]).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 2);
}
