//! PostgreSQL backend tests.
//!
//! Require a database at `DATABASE_URL`:
//!
//! ```text
//! DATABASE_URL=postgres://... cargo test --test postgres_integration -- --ignored
//! ```

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::time::sleep;
use tokio_test::assert_ok;

use reliable_queue::circuit_breaker::{CircuitBreaker, Substrate};
use reliable_queue::config::{OrphanSettings, QueueBackendKind, QueueSettings};
use reliable_queue::postgres::PostgresPool;
use reliable_queue::queue::{
    create_queue_engine, Message, PostgresLessLockingBackend, PostgresQueueBackend, QueueConfig,
    QueueEngine,
};

use common::{create_less_locking_schema, create_two_table_schema, fast_config, pg_pool};

async fn two_table_engine(pool: &PgPool, table: &str, config: QueueConfig) -> QueueEngine<i64> {
    let ephemeral = format!("{table}_ephemeral");
    create_two_table_schema(pool, table, &ephemeral).await;
    let backend = PostgresQueueBackend::new(config, pool.clone(), table, ephemeral).unwrap();
    QueueEngine::<i64>::new(Arc::new(backend)).unwrap()
}

async fn less_locking_engine(pool: &PgPool, table: &str, config: QueueConfig) -> QueueEngine<i64> {
    create_less_locking_schema(pool, table).await;
    let backend = PostgresLessLockingBackend::new(config, pool.clone(), table, false).unwrap();
    QueueEngine::<i64>::new(Arc::new(backend)).unwrap()
}

/// Queue, take, requeue, take, finish; then the orphan listing.
async fn lifecycle(engine: &QueueEngine<i64>) {
    assert!(assert_ok!(engine.queue(&Message::new("a").partition_key("p1")).await));
    assert!(assert_ok!(engine.queue(&Message::new("b")).await));
    assert_eq!(engine.queue_size().await.unwrap(), Some(2));

    let first = engine.take().await.unwrap().unwrap();
    assert_eq!(first.payload_str(), Some("a"));
    assert_eq!(first.partition_key.as_deref(), Some("p1"));
    assert_eq!(engine.ephemeral_size().await.unwrap(), Some(1));

    sleep(Duration::from_millis(5)).await;
    let orphans = engine.get_orphan_messages(Duration::ZERO).await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].id, first.id);

    assert!(engine.requeue(&first).await.unwrap());
    assert!(!engine.requeue(&first).await.unwrap());
    assert_eq!(engine.ephemeral_size().await.unwrap(), Some(0));

    let mut seen = Vec::new();
    while let Some(msg) = engine.take().await.unwrap() {
        engine.finish(&msg).await.unwrap();
        engine.finish(&msg).await.unwrap();
        seen.push(msg);
    }

    assert_eq!(seen.len(), 2);
    let requeued = seen.iter().find(|m| m.id == first.id).unwrap();
    assert_eq!(requeued.num_requeues, 1);
    assert_eq!(requeued.original_timestamp, first.original_timestamp);
    assert!(requeued.queue_timestamp > first.queue_timestamp);

    assert_eq!(engine.queue_size().await.unwrap(), Some(0));
    assert_eq!(engine.ephemeral_size().await.unwrap(), Some(0));
}

/// Concurrent takes never hand the same row to two consumers.
async fn concurrent_takes(engine: Arc<QueueEngine<i64>>, count: usize) {
    for i in 0..count {
        engine.queue(&Message::new(format!("m{i}"))).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Some(msg) = engine.take().await.unwrap() {
                ids.push(msg.id.unwrap());
            }
            ids
        }));
    }

    let mut all = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(all.insert(id), "id {id} claimed twice");
        }
    }
    assert_eq!(all.len(), count);
    assert_eq!(engine.ephemeral_size().await.unwrap(), Some(count));
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_two_table_lifecycle() {
    let pool = pg_pool().await;
    let engine = two_table_engine(&pool, "rq_it_two_lifecycle", fast_config("two")).await;
    lifecycle(&engine).await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_less_locking_lifecycle() {
    let pool = pg_pool().await;
    let engine = less_locking_engine(&pool, "rq_it_ll_lifecycle", fast_config("ll")).await;
    lifecycle(&engine).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL"]
async fn test_two_table_concurrent_takes() {
    let pool = pg_pool().await;
    let engine = two_table_engine(&pool, "rq_it_two_concurrent", fast_config("two-c")).await;
    concurrent_takes(Arc::new(engine), 200).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL"]
async fn test_less_locking_concurrent_takes() {
    let pool = pg_pool().await;
    let engine = less_locking_engine(&pool, "rq_it_ll_concurrent", fast_config("ll-c")).await;
    concurrent_takes(Arc::new(engine), 200).await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_two_table_rejects_id_held_in_ephemeral() {
    let pool = pg_pool().await;
    let engine = two_table_engine(&pool, "rq_it_two_dup", fast_config("two-dup")).await;

    engine.queue(&Message::with_id(1_000_000, "held")).await.unwrap();
    let taken = engine.take().await.unwrap().unwrap();

    // Duplicate queue succeeds without creating a second row
    assert!(engine.queue(&Message::with_id(1_000_000, "again")).await.unwrap());
    assert_eq!(engine.queue_size().await.unwrap(), Some(0));
    assert_eq!(engine.metrics().duplicate_count(), 1);

    engine.finish(&taken).await.unwrap();
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_untracked_take_deletes_row() {
    let pool = pg_pool().await;
    let config = QueueConfig {
        ephemeral_enabled: false,
        ..fast_config("untracked")
    };
    let engine = two_table_engine(&pool, "rq_it_two_untracked", config).await;

    engine.queue(&Message::new("x")).await.unwrap();
    let msg = engine.take().await.unwrap().unwrap();
    assert_eq!(engine.queue_size().await.unwrap(), Some(0));
    assert_eq!(engine.ephemeral_size().await.unwrap(), Some(0));

    assert!(engine.requeue(&msg).await.unwrap());
    let back = engine.take().await.unwrap().unwrap();
    assert_eq!(back.id, msg.id);
    assert_eq!(back.num_requeues, 1);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_scoped_queues_share_one_table() {
    let pool = pg_pool().await;
    let table = "rq_it_ll_scoped";
    create_less_locking_schema(&pool, table).await;

    let scoped = |name: &str| {
        let backend =
            PostgresLessLockingBackend::new(fast_config(name), pool.clone(), table, true).unwrap();
        QueueEngine::<i64>::new(Arc::new(backend)).unwrap()
    };
    let orders = scoped("orders");
    let emails = scoped("emails");

    orders.queue(&Message::new("order-1")).await.unwrap();
    emails.queue(&Message::new("email-1")).await.unwrap();
    emails.queue(&Message::new("email-2")).await.unwrap();

    assert_eq!(orders.queue_size().await.unwrap(), Some(1));
    assert_eq!(emails.queue_size().await.unwrap(), Some(2));

    let order = orders.take().await.unwrap().unwrap();
    assert_eq!(order.payload_str(), Some("order-1"));
    assert!(orders.take().await.unwrap().is_none());

    // Another queue cannot finish a message it does not own
    emails.finish(&order).await.unwrap();
    assert_eq!(orders.ephemeral_size().await.unwrap(), Some(1));
    orders.finish(&order).await.unwrap();
    assert_eq!(orders.ephemeral_size().await.unwrap(), Some(0));
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_factory_builds_less_locking_engine() {
    let pool = pg_pool().await;
    let table = "rq_it_factory";
    create_less_locking_schema(&pool, table).await;

    let postgres = PostgresPool::from_pool(
        pool,
        Arc::new(CircuitBreaker::new(Substrate::Postgres)),
        &common::database_url(),
    );
    assert!(postgres.table_exists(table).await.unwrap());

    let settings = QueueSettings {
        backend: QueueBackendKind::PostgresLessLocking,
        name: "factory".into(),
        table_name: table.into(),
        ..QueueSettings::default()
    };
    let engine =
        create_queue_engine(&settings, &OrphanSettings::default(), None, Some(Arc::new(postgres)))
            .unwrap();

    assert_eq!(engine.backend_type(), "postgres_less_locking");
    engine.queue(&Message::new("via factory")).await.unwrap();
    let msg = engine.take().await.unwrap().unwrap();
    engine.finish(&msg).await.unwrap();
}
