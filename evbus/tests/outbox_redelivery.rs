use anyhow::Result as AnyResult;
use evbus::contract::{FieldType, Schema};
use evbus::error::BusError;
use evbus::eventing::{Dispatcher, SubscribeOptions, handler_fn};
use evbus::outbox::{
    DispatchRecord, DurablePublisher, InMemoryOutboxStore, OutboxStore, RecordStatus,
    RedeliveryConfig, RedeliveryWorker,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// 一个“进程”：独立的分发器与处理器，共享同一个 Outbox 存储
struct Node {
    publisher: Arc<DurablePublisher>,
    worker: Arc<RedeliveryWorker>,
    calls: Arc<AtomicUsize>,
    healthy: Arc<AtomicBool>,
    /// 处理器耗时（毫秒）
    latency: Arc<AtomicU64>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

fn node(store: &InMemoryOutboxStore, config: RedeliveryConfig) -> Node {
    init_tracing();
    let dispatcher = Arc::new(Dispatcher::builder().build());
    dispatcher
        .define("invoice.issued", Schema::new().required("amount", FieldType::Int))
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let healthy = Arc::new(AtomicBool::new(true));
    let latency = Arc::new(AtomicU64::new(0));
    let (c, h, l) = (calls.clone(), healthy.clone(), latency.clone());
    let _sub = dispatcher
        .subscribe(
            "invoice.issued",
            handler_fn("ledger", move |_| {
                let (c, h, l) = (c.clone(), h.clone(), l.clone());
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    let ms = l.load(Ordering::SeqCst);
                    if ms > 0 {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                    anyhow::ensure!(h.load(Ordering::SeqCst), "ledger unavailable");
                    Ok(())
                }
            }),
            SubscribeOptions::default(),
        )
        .unwrap();
    dispatcher.freeze_registry();

    let publisher = Arc::new(
        DurablePublisher::builder()
            .dispatcher(dispatcher)
            .store(Arc::new(store.clone()))
            .config(config)
            .build(),
    );
    let worker = Arc::new(
        RedeliveryWorker::builder()
            .publisher(publisher.clone())
            .build(),
    );
    Node {
        publisher,
        worker,
        calls,
        healthy,
        latency,
    }
}

fn immediate(max_attempts: u32) -> RedeliveryConfig {
    RedeliveryConfig {
        max_attempts,
        backoff_base: Duration::ZERO,
        grace_interval: Duration::ZERO,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn record_survives_a_crash_and_is_delivered_after_restart() -> AnyResult<()> {
    let store = InMemoryOutboxStore::new();

    // 第一个进程：事务已提交，但在 complete 之前崩溃
    let id = {
        let before = node(&store, immediate(5));
        let event = before
            .publisher
            .dispatcher()
            .construct("invoice.issued", json!({ "amount": 120 }))?;
        let mut tx = store.begin();
        let staged = before.publisher.stage(&mut tx, event).await?;
        tx.commit()?;
        let id = staged.event().id();
        drop(staged);
        assert_eq!(before.calls.load(Ordering::SeqCst), 0);
        id
    };

    // 重启后的进程
    let after = node(&store, immediate(5));
    let report = after.worker.run_once().await?;
    assert_eq!(report.claimed, 1);
    assert_eq!(report.dispatched, 1);
    assert_eq!(after.calls.load(Ordering::SeqCst), 1);

    let record = store.get(id).await?.expect("record");
    assert_eq!(record.status(), RecordStatus::Dispatched);
    assert_eq!(record.attempt_count(), 1);

    // 终态记录不会被再次投递
    assert_eq!(after.worker.run_once().await?.claimed, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn persistent_failure_ends_in_dead_letter_after_max_attempts() -> AnyResult<()> {
    let store = InMemoryOutboxStore::new();
    let n = node(&store, immediate(3));
    n.healthy.store(false, Ordering::SeqCst);

    let event = n
        .publisher
        .dispatcher()
        .construct("invoice.issued", json!({ "amount": 5 }))?;
    let delivery = n.publisher.publish_durable(event).await?;
    assert_eq!(delivery.status, RecordStatus::Failed);
    assert_eq!(delivery.attempts, 1);

    let second = n.worker.run_once().await?;
    assert_eq!(second.failed, 1);

    let third = n.worker.run_once().await?;
    assert_eq!(third.dead_lettered, 1);
    assert_eq!(n.calls.load(Ordering::SeqCst), 3);

    let record = store.get(delivery.event_id).await?.expect("record");
    assert_eq!(record.status(), RecordStatus::DeadLettered);
    assert_eq!(record.attempt_count(), 3);
    assert_eq!(record.last_error(), Some("ledger: ledger unavailable"));

    // 死信不再被认领，也拒绝直接重投
    assert_eq!(n.worker.run_once().await?.claimed, 0);
    match n.publisher.redeliver(delivery.event_id).await {
        Err(BusError::DeadLettered { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("unexpected {other:?}"),
    }

    // 运维修复后重新入队
    let dead = store.dead_letters(10).await?;
    assert_eq!(dead.len(), 1);
    n.healthy.store(true, Ordering::SeqCst);
    store.requeue(delivery.event_id).await?;

    let report = n.worker.run_once().await?;
    assert_eq!(report.dispatched, 1);
    assert_eq!(
        store.get(delivery.event_id).await?.expect("record").status(),
        RecordStatus::Dispatched
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn backoff_delays_the_next_attempt() -> AnyResult<()> {
    let store = InMemoryOutboxStore::new();
    let n = node(
        &store,
        RedeliveryConfig {
            backoff_base: Duration::from_secs(3600),
            ..immediate(5)
        },
    );
    n.healthy.store(false, Ordering::SeqCst);

    let event = n
        .publisher
        .dispatcher()
        .construct("invoice.issued", json!({ "amount": 1 }))?;
    n.publisher.publish_durable(event).await?;

    assert_eq!(n.worker.run_once().await?.claimed, 0);
    assert_eq!(n.calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_workers_never_claim_the_same_record() -> AnyResult<()> {
    let store = InMemoryOutboxStore::new();
    let seed = node(&store, immediate(5));
    for amount in 0..50 {
        let event = seed
            .publisher
            .dispatcher()
            .construct("invoice.issued", json!({ "amount": amount }))?;
        store.append(DispatchRecord::pending(event)).await?;
    }

    let nodes: Vec<_> = (0..4).map(|_| node(&store, immediate(5))).collect();
    let rounds: Vec<_> = nodes
        .iter()
        .map(|n| {
            let worker = n.worker.clone();
            tokio::spawn(async move { worker.run_once().await })
        })
        .collect();

    let mut claimed = 0;
    for round in rounds {
        claimed += round.await??.claimed;
    }
    let calls: usize = nodes.iter().map(|n| n.calls.load(Ordering::SeqCst)).sum();
    assert_eq!(claimed, 50);
    assert_eq!(calls, 50);

    let statuses: HashSet<_> = store.records().iter().map(|r| r.status()).collect();
    assert_eq!(statuses, HashSet::from([RecordStatus::Dispatched]));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_first_dispatch_is_not_redelivered_while_in_flight() -> AnyResult<()> {
    let store = InMemoryOutboxStore::new();
    let n = node(
        &store,
        RedeliveryConfig {
            grace_interval: Duration::from_millis(50),
            ..immediate(5)
        },
    );
    n.latency.store(300, Ordering::SeqCst);

    // 直接持久化发布：分发耗时超过宽限期
    let event = n
        .publisher
        .dispatcher()
        .construct("invoice.issued", json!({ "amount": 10 }))?;
    let publisher = n.publisher.clone();
    let publishing = tokio::spawn(async move { publisher.publish_durable(event).await });

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(n.worker.run_once().await?.claimed, 0);

    let delivery = publishing.await??;
    assert_eq!(delivery.status, RecordStatus::Dispatched);
    assert_eq!(n.calls.load(Ordering::SeqCst), 1);
    let record = store.get(delivery.event_id).await?.expect("record");
    assert_eq!(record.status(), RecordStatus::Dispatched);
    assert_eq!(record.attempt_count(), 1);

    // 两阶段发布：complete 在分发前认领记录
    let event = n
        .publisher
        .dispatcher()
        .construct("invoice.issued", json!({ "amount": 20 }))?;
    let mut tx = store.begin();
    let staged = n.publisher.stage(&mut tx, event).await?;
    tx.commit()?;
    let id = staged.event().id();

    let publisher = n.publisher.clone();
    let completing = tokio::spawn(async move { publisher.complete(staged).await });

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(n.worker.run_once().await?.claimed, 0);

    let delivery = completing.await??;
    assert_eq!(delivery.status, RecordStatus::Dispatched);
    assert_eq!(n.calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.get(id).await?.expect("record").attempt_count(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn operator_redelivery_waits_for_the_workers_lease() -> AnyResult<()> {
    let store = InMemoryOutboxStore::new();
    let n = node(&store, immediate(5));
    n.healthy.store(false, Ordering::SeqCst);

    let event = n
        .publisher
        .dispatcher()
        .construct("invoice.issued", json!({ "amount": 3 }))?;
    let delivery = n.publisher.publish_durable(event).await?;
    assert_eq!(delivery.status, RecordStatus::Failed);

    // 另一个工作者认领了这条记录，仍在处理中
    let claimed = store
        .claim_due(chrono::Utc::now(), Duration::ZERO, 10, Duration::from_secs(30))
        .await?;
    assert_eq!(claimed.len(), 1);

    n.healthy.store(true, Ordering::SeqCst);
    match n.publisher.redeliver(delivery.event_id).await {
        Err(BusError::RecordLeased { event_id, .. }) => assert_eq!(event_id, delivery.event_id),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(n.calls.load(Ordering::SeqCst), 1);
    Ok(())
}
