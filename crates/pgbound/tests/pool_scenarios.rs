//! Connection pool behaviour under contention, failure and expiry.
//!
//! The stack under test: `ConnectionPool` → `ConnectionInfo` →
//! `BoundedConnector` → `HandshakeOperation` → `ScriptedConnection`.

use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;

use pgbound::testkit::{Event, Script, ScriptedFactory, scripted_source};
use pgbound::{Connection, ConnectionInfo, ConnectionPool, Error, PoolConfig, PoolTimeouts};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

type TestPool = ConnectionPool<ConnectionInfo<Arc<ScriptedFactory>>>;

fn make_pool(capacity: usize, queue_capacity: usize, factory: &Arc<ScriptedFactory>) -> TestPool {
    init_tracing();
    ConnectionPool::new(
        scripted_source(factory),
        PoolConfig {
            capacity,
            queue_capacity,
            idle_timeout: Duration::from_secs(60),
        },
    )
}

fn timeouts() -> PoolTimeouts {
    PoolTimeouts::default()
}

/// Yield until `cond` holds for the pool's stats.
async fn until(pool: &TestPool, cond: impl Fn(&pgbound::PoolStats) -> bool) {
    while !cond(&pool.stats()) {
        tokio::task::yield_now().await;
    }
}

// ── Queue bound ─────────────────────────────────────────────────────

#[tokio::test]
async fn overflow_without_queue_while_handshake_pending() {
    let factory = Arc::new(ScriptedFactory::with_fallback(Script::new().stall()));
    let pool = make_pool(1, 0, &factory);
    let io = Handle::current();

    let first = {
        let pool = pool.clone();
        let io = io.clone();
        tokio::spawn(async move { pool.acquire(&io, timeouts()).await.map(|c| c.id()) })
    };
    until(&pool, |s| s.live == 1).await;

    let err = tokio::time::timeout(Duration::ZERO, pool.acquire(&io, timeouts()))
        .await
        .expect("overflow must not suspend")
        .unwrap_err();
    assert!(matches!(err.error(), Error::PoolOverflow));
    assert!(err.connection().is_none());
    assert_eq!(pool.stats().overflows, 1);

    first.abort();
    until(&pool, |s| s.live == 0).await;
}

#[tokio::test]
async fn overflow_when_queue_is_full() {
    let factory = Arc::new(ScriptedFactory::new());
    let pool = make_pool(1, 1, &factory);
    let io = Handle::current();

    let held = pool.acquire(&io, timeouts()).await.unwrap();
    let waiter = {
        let pool = pool.clone();
        let io = io.clone();
        tokio::spawn(async move { pool.acquire(&io, timeouts()).await.map(|c| c.id()) })
    };
    until(&pool, |s| s.waiting == 1).await;

    let err = pool.acquire(&io, timeouts()).await.unwrap_err();
    assert!(matches!(err.error(), Error::PoolOverflow));

    drop(held);
    assert_eq!(waiter.await.unwrap().unwrap(), 1);
}

// ── Idle reuse ──────────────────────────────────────────────────────

#[tokio::test]
async fn idle_connection_is_returned_without_suspending() {
    let factory = Arc::new(ScriptedFactory::new());
    let pool = make_pool(2, 4, &factory);
    let io = Handle::current();

    drop(pool.acquire(&io, timeouts()).await.unwrap());
    assert_eq!(pool.stats().idle, 1);

    let conn = tokio::time::timeout(Duration::ZERO, pool.acquire(&io, timeouts()))
        .await
        .expect("idle checkout must complete on first poll")
        .unwrap();
    assert_eq!(conn.id(), 1);
    assert_eq!(factory.created(), 1);

    let probe = factory.probe(0).unwrap();
    let starts = probe
        .events()
        .iter()
        .filter(|e| matches!(e, Event::Start(_)))
        .count();
    assert_eq!(starts, 1);
}

// ── FIFO fairness ───────────────────────────────────────────────────

#[tokio::test]
async fn waiters_are_served_in_enqueue_order() {
    let factory = Arc::new(ScriptedFactory::new());
    let pool = make_pool(1, 8, &factory);
    let io = Handle::current();
    let order = Arc::new(Mutex::new(Vec::new()));

    let held = pool.acquire(&io, timeouts()).await.unwrap();

    let mut tasks = Vec::new();
    for n in 1..=3 {
        let task_pool = pool.clone();
        let io = io.clone();
        let order = Arc::clone(&order);
        tasks.push(tokio::spawn(async move {
            let conn = task_pool.acquire(&io, timeouts()).await.unwrap();
            order.lock().push(n);
            tokio::task::yield_now().await;
            conn.id()
        }));
        until(&pool, |s| s.waiting == n).await;
    }

    drop(held);
    for task in tasks {
        // Every waiter received the same connection, handed over directly.
        assert_eq!(task.await.unwrap(), 1);
    }
    assert_eq!(*order.lock(), vec![1, 2, 3]);
    assert_eq!(factory.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn timed_out_waiter_keeps_others_in_order() {
    let factory = Arc::new(ScriptedFactory::new());
    let pool = make_pool(1, 8, &factory);
    let io = Handle::current();
    let order = Arc::new(Mutex::new(Vec::new()));

    let held = pool.acquire(&io, timeouts()).await.unwrap();

    let mut tasks = Vec::new();
    for (n, queue) in [(1, 10_000), (2, 50), (3, 10_000)] {
        let task_pool = pool.clone();
        let io = io.clone();
        let order = Arc::clone(&order);
        let t = PoolTimeouts {
            queue: Duration::from_millis(queue),
            ..timeouts()
        };
        tasks.push(tokio::spawn(async move {
            let result = task_pool.acquire(&io, t).await;
            if result.is_ok() {
                order.lock().push(n);
            }
            result.map(|c| c.id()).map_err(|e| e.into_parts().0)
        }));
        until(&pool, |s| s.waiting == n).await;
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.stats().waiting, 2);
    assert_eq!(pool.stats().queue_timeouts, 1);

    drop(held);
    let results: Vec<_> = join_all(tasks).await;
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(Error::QueueTimeout)));
    assert!(results[2].is_ok());
    assert_eq!(*order.lock(), vec![1, 3]);
}

async fn join_all<T>(tasks: Vec<tokio::task::JoinHandle<T>>) -> Vec<T> {
    let mut out = Vec::with_capacity(tasks.len());
    for task in tasks {
        out.push(task.await.unwrap());
    }
    out
}

// ── Queue timeout ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn queue_timeout_when_nothing_is_released() {
    let factory = Arc::new(ScriptedFactory::new());
    let pool = make_pool(1, 4, &factory);
    let io = Handle::current();

    let _held = pool.acquire(&io, timeouts()).await.unwrap();
    let start = tokio::time::Instant::now();
    let err = pool
        .acquire(
            &io,
            PoolTimeouts {
                queue: Duration::from_millis(250),
                ..timeouts()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err.error(), Error::QueueTimeout));
    assert!(err.error().is_resource());
    assert!(start.elapsed() >= Duration::from_millis(250));

    let stats = pool.stats();
    assert_eq!(stats.waiting, 0);
    assert_eq!(stats.queue_timeouts, 1);
    assert_eq!(stats.live, 1);
}

// ── Health gating ───────────────────────────────────────────────────

#[tokio::test]
async fn bad_connection_is_discarded_on_release() {
    let factory = Arc::new(ScriptedFactory::new());
    let pool = make_pool(2, 4, &factory);
    let io = Handle::current();

    let conn = pool.acquire(&io, timeouts()).await.unwrap();
    conn.probe().mark_bad();
    drop(conn);

    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.live, 0);
    assert_eq!(stats.discarded, 1);
    assert!(factory.probe(0).unwrap().is_closed());

    let conn = pool.acquire(&io, timeouts()).await.unwrap();
    assert_eq!(conn.id(), 2);
}

#[tokio::test]
async fn connection_gone_bad_while_idle_is_never_handed_out() {
    let factory = Arc::new(ScriptedFactory::new());
    let pool = make_pool(1, 4, &factory);
    let io = Handle::current();

    drop(pool.acquire(&io, timeouts()).await.unwrap());
    factory.probe(0).unwrap().mark_bad();

    let conn = pool.acquire(&io, timeouts()).await.unwrap();
    assert_eq!(conn.id(), 2);
    assert!(!conn.is_bad());
    assert!(factory.probe(0).unwrap().is_closed());
    assert_eq!(pool.stats().live, 1);
}

#[tokio::test]
async fn bad_release_hands_slot_to_waiter() {
    let factory = Arc::new(ScriptedFactory::new());
    let pool = make_pool(1, 4, &factory);
    let io = Handle::current();

    let held = pool.acquire(&io, timeouts()).await.unwrap();
    let waiter = {
        let pool = pool.clone();
        let io = io.clone();
        tokio::spawn(async move { pool.acquire(&io, timeouts()).await.map(|c| c.id()) })
    };
    until(&pool, |s| s.waiting == 1).await;

    held.probe().mark_bad();
    drop(held);

    assert_eq!(waiter.await.unwrap().unwrap(), 2);
    assert!(factory.probe(0).unwrap().is_closed());
    assert_eq!(pool.stats().live, 1);
}

#[tokio::test]
async fn handed_over_connection_is_rebound_to_waiter() {
    let factory = Arc::new(ScriptedFactory::new());
    let pool = make_pool(1, 4, &factory);
    let io = Handle::current();

    let held = pool.acquire(&io, timeouts()).await.unwrap();
    let waiter = {
        let pool = pool.clone();
        let io = io.clone();
        tokio::spawn(async move { pool.acquire(&io, timeouts()).await.map(|c| c.id()) })
    };
    until(&pool, |s| s.waiting == 1).await;
    drop(held);

    assert_eq!(waiter.await.unwrap().unwrap(), 1);
    assert_eq!(factory.probe(0).unwrap().count(&Event::SetExecutor), 1);
    assert_eq!(pool.stats().reused, 1);
}

// ── Idle expiry ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn expired_idle_connection_is_replaced() {
    let factory = Arc::new(ScriptedFactory::new());
    let pool = make_pool(1, 4, &factory);
    let io = Handle::current();

    drop(pool.acquire(&io, timeouts()).await.unwrap());
    tokio::time::advance(Duration::from_secs(61)).await;

    let conn = pool.acquire(&io, timeouts()).await.unwrap();
    assert_eq!(conn.id(), 2);
    assert!(factory.probe(0).unwrap().is_closed());

    let stats = pool.stats();
    assert_eq!(stats.live, 1);
    assert_eq!(stats.created, 2);
    assert_eq!(stats.reused, 0);
}

#[tokio::test(start_paused = true)]
async fn fresh_idle_connection_is_reused() {
    let factory = Arc::new(ScriptedFactory::new());
    let pool = make_pool(1, 4, &factory);
    let io = Handle::current();

    drop(pool.acquire(&io, timeouts()).await.unwrap());
    tokio::time::advance(Duration::from_secs(59)).await;

    let conn = pool.acquire(&io, timeouts()).await.unwrap();
    assert_eq!(conn.id(), 1);
}

// ── Handshake failure ───────────────────────────────────────────────

#[tokio::test]
async fn failed_handshake_returns_connection_and_frees_slot() {
    let factory = Arc::new(ScriptedFactory::new());
    factory.push(
        Script::new()
            .polls([pgbound::PollingStatus::Reading, pgbound::PollingStatus::Failed])
            .error_message("FATAL:  password authentication failed for user \"app\""),
    );
    let pool = make_pool(1, 4, &factory);
    let io = Handle::current();

    let err = pool.acquire(&io, timeouts()).await.unwrap_err();
    assert!(matches!(err.error(), Error::HandshakePollFailed));
    assert!(err.error().is_connection_fatal());
    assert!(err.context().unwrap().contains("password authentication failed"));
    assert_eq!(pool.stats().live, 0);
    assert_eq!(pool.stats().idle, 0);

    let conn = pool.acquire(&io, timeouts()).await.unwrap();
    assert_eq!(conn.id(), 2);
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_closes_socket() {
    let factory = Arc::new(ScriptedFactory::with_fallback(Script::new().stall()));
    let pool = make_pool(1, 4, &factory);
    let io = Handle::current();

    let err = pool
        .acquire(
            &io,
            PoolTimeouts {
                connect: Duration::ZERO,
                ..timeouts()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err.error(), Error::ConnectTimeout));
    assert!(factory.probe(0).unwrap().is_closed());
    assert!(!err.connection().unwrap().is_open());
    assert_eq!(pool.stats().live, 0);
}

#[tokio::test(start_paused = true)]
async fn timed_out_reservation_passes_slot_to_waiter() {
    let factory = Arc::new(ScriptedFactory::new());
    factory.push(Script::new().stall());
    let pool = make_pool(1, 4, &factory);
    let io = Handle::current();
    let t = PoolTimeouts {
        connect: Duration::from_secs(1),
        queue: Duration::from_secs(10),
    };

    let first = {
        let pool = pool.clone();
        let io = io.clone();
        tokio::spawn(async move { pool.acquire(&io, t).await.map(|c| c.id()) })
    };
    until(&pool, |s| s.live == 1).await;
    let second = {
        let pool = pool.clone();
        let io = io.clone();
        tokio::spawn(async move { pool.acquire(&io, t).await.map(|c| c.id()) })
    };
    until(&pool, |s| s.waiting == 1).await;

    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(err.error(), Error::ConnectTimeout));
    assert_eq!(second.await.unwrap().unwrap(), 2);
    assert_eq!(pool.stats().live, 1);
}

// ── Abandoned acquires ──────────────────────────────────────────────

#[tokio::test]
async fn abandoned_waiter_does_not_leak() {
    let factory = Arc::new(ScriptedFactory::new());
    let pool = make_pool(1, 1, &factory);
    let io = Handle::current();

    let held = pool.acquire(&io, timeouts()).await.unwrap();
    let waiter = {
        let pool = pool.clone();
        let io = io.clone();
        tokio::spawn(async move { pool.acquire(&io, timeouts()).await.map(|c| c.id()) })
    };
    until(&pool, |s| s.waiting == 1).await;
    waiter.abort();
    until(&pool, |s| s.waiting == 0).await;

    // The queue slot is free again and the released connection goes idle.
    drop(held);
    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.live, 1);
}

#[tokio::test]
async fn abandoned_handshake_returns_its_slot() {
    let factory = Arc::new(ScriptedFactory::new());
    factory.push(Script::new().stall());
    let pool = make_pool(1, 4, &factory);
    let io = Handle::current();

    let pending = {
        let pool = pool.clone();
        let io = io.clone();
        tokio::spawn(async move { pool.acquire(&io, timeouts()).await.map(|c| c.id()) })
    };
    until(&pool, |s| s.live == 1).await;
    pending.abort();
    until(&pool, |s| s.live == 0).await;

    let conn = pool.acquire(&io, timeouts()).await.unwrap();
    assert_eq!(conn.id(), 2);
}

#[tokio::test]
async fn connection_granted_to_abandoned_waiter_goes_back_to_idle() {
    let factory = Arc::new(ScriptedFactory::new());
    let pool = make_pool(1, 4, &factory);
    let io = Handle::current();

    let held = pool.acquire(&io, timeouts()).await.unwrap();
    let waiter = {
        let pool = pool.clone();
        let io = io.clone();
        tokio::spawn(async move { pool.acquire(&io, timeouts()).await.map(|c| c.id()) })
    };
    until(&pool, |s| s.waiting == 1).await;

    // The connection is handed to the waiter, which is cancelled before it
    // gets to run and take it.
    drop(held);
    assert_eq!(pool.stats().waiting, 0);
    waiter.abort();
    until(&pool, |s| s.idle == 1).await;

    let stats = pool.stats();
    assert_eq!(stats.live, 1);
    assert_eq!(stats.reused, 0);
    assert!(!factory.probe(0).unwrap().is_closed());

    let conn = pool.acquire(&io, timeouts()).await.unwrap();
    assert_eq!(conn.id(), 1);
    assert_eq!(pool.stats().reused, 1);
}

#[tokio::test]
async fn slot_granted_to_abandoned_waiter_is_released() {
    let factory = Arc::new(ScriptedFactory::new());
    let pool = make_pool(1, 4, &factory);
    let io = Handle::current();

    let held = pool.acquire(&io, timeouts()).await.unwrap();
    let waiter = {
        let pool = pool.clone();
        let io = io.clone();
        tokio::spawn(async move { pool.acquire(&io, timeouts()).await.map(|c| c.id()) })
    };
    until(&pool, |s| s.waiting == 1).await;

    // A bad release passes the freed slot to the waiter instead of a connection.
    held.probe().mark_bad();
    drop(held);
    assert_eq!(pool.stats().waiting, 0);
    assert_eq!(pool.stats().live, 1);
    waiter.abort();
    until(&pool, |s| s.live == 0).await;

    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.discarded, 1);
    assert_eq!(factory.created(), 1);

    let conn = pool.acquire(&io, timeouts()).await.unwrap();
    assert_eq!(conn.id(), 2);
}

// ── Capacity bound ──────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn live_count_never_exceeds_capacity() {
    let factory = Arc::new(ScriptedFactory::new());
    let pool = make_pool(3, 64, &factory);
    let io = Handle::current();

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let pool = pool.clone();
        let io = io.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                let conn = pool.acquire(&io, timeouts()).await.unwrap();
                let stats = pool.stats();
                assert!(stats.live <= stats.capacity, "live {} > capacity", stats.live);
                tokio::task::yield_now().await;
                drop(conn);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stats = pool.stats();
    assert!(stats.created <= 3);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.live, stats.idle);
}
