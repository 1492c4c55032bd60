//! 重投工作者（RedeliveryWorker）
//!
//! 周期性认领到期记录并重新分发：
//! - 超过宽限期仍为 `Pending` 的记录（发布方在分发前后崩溃）；
//! - 到达 `next_attempt_at` 的 `Failed` 记录。
//!
//! 认领带租约，多个工作者实例（或多个进程共享同一存储）不会同时处理同一记录。
//!
use super::{DurablePublisher, RecordStatus, RedeliveryConfig};
use crate::error::BusResult;
use bon::Builder;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 单轮重投统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedeliveryReport {
    pub claimed: usize,
    pub dispatched: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

#[derive(Builder)]
pub struct RedeliveryWorker {
    publisher: Arc<DurablePublisher>,
}

impl RedeliveryWorker {
    pub fn config(&self) -> &RedeliveryConfig {
        self.publisher.config()
    }

    /// 执行一轮认领与重投
    ///
    /// 单条记录回写失败只记录日志，租约到期后会被再次认领。
    pub async fn run_once(&self) -> BusResult<RedeliveryReport> {
        let config = self.config();
        let records = self
            .publisher
            .store()
            .claim_due(
                Utc::now(),
                config.grace_interval,
                config.batch_size,
                config.claim_lease,
            )
            .await?;

        let mut report = RedeliveryReport {
            claimed: records.len(),
            ..Default::default()
        };

        for record in records {
            let event_id = record.event_id();
            let previous = record.attempt_count();
            debug!(%event_id, attempt = previous + 1, "redelivering event");

            match self.publisher.deliver(record.into_event(), previous).await {
                Ok(delivery) => match delivery.status {
                    RecordStatus::Dispatched => report.dispatched += 1,
                    RecordStatus::Failed => report.failed += 1,
                    RecordStatus::DeadLettered => report.dead_lettered += 1,
                    RecordStatus::Pending => {}
                },
                Err(err) => {
                    warn!(%event_id, error = %err, "failed to record redelivery result");
                }
            }
        }

        if report.claimed > 0 {
            debug!(?report, "redelivery round finished");
        }
        Ok(report)
    }

    /// 启动周期任务，返回可用于关闭/等待的句柄
    pub fn start(self: Arc<Self>) -> WorkerHandle {
        let token = CancellationToken::new();
        let interval = self.config().poll_interval;
        let task = spawn_periodic(token.clone(), interval, move || {
            let worker = self.clone();
            async move {
                if let Err(err) = worker.run_once().await {
                    warn!(error = %err, "redelivery round failed");
                }
            }
        });

        WorkerHandle {
            token,
            task: Some(task),
        }
    }
}

fn spawn_periodic<F, Fut>(token: CancellationToken, interval: Duration, mut f: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => f().await,
            }
        }
    })
}

/// 工作者运行句柄：用于优雅关闭与等待任务结束
pub struct WorkerHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::Schema;
    use crate::eventing::{Dispatcher, SubscribeOptions, handler_fn};
    use crate::outbox::{DispatchRecord, InMemoryOutboxStore, OutboxStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn worker(config: RedeliveryConfig, calls: Arc<AtomicUsize>) -> (Arc<RedeliveryWorker>, InMemoryOutboxStore) {
        let dispatcher = Arc::new(Dispatcher::builder().build());
        dispatcher.define("ping", Schema::new()).unwrap();
        let _h = dispatcher
            .subscribe(
                "ping",
                handler_fn("count", move |_| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                SubscribeOptions::default(),
            )
            .unwrap();

        let store = InMemoryOutboxStore::new();
        let publisher = DurablePublisher::builder()
            .dispatcher(dispatcher)
            .store(Arc::new(store.clone()))
            .config(config)
            .build();
        let worker = RedeliveryWorker::builder()
            .publisher(Arc::new(publisher))
            .build();
        (Arc::new(worker), store)
    }

    async fn orphan(worker: &RedeliveryWorker, store: &InMemoryOutboxStore) -> uuid::Uuid {
        let event = worker
            .publisher
            .dispatcher()
            .construct("ping", json!({}))
            .unwrap();
        let record = DispatchRecord::pending(event);
        let id = record.event_id();
        store.append(record).await.unwrap();
        id
    }

    #[tokio::test]
    async fn pending_within_grace_is_left_alone() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (worker, store) = worker(RedeliveryConfig::default(), calls.clone());
        orphan(&worker, &store).await;

        let report = worker.run_once().await.unwrap();
        assert_eq!(report, RedeliveryReport::default());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn orphaned_pending_record_is_dispatched() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = RedeliveryConfig {
            grace_interval: Duration::ZERO,
            ..Default::default()
        };
        let (worker, store) = worker(config, calls.clone());
        let id = orphan(&worker, &store).await;

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status(), RecordStatus::Dispatched);
        assert_eq!(record.attempt_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn started_worker_stops_on_shutdown() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = RedeliveryConfig {
            grace_interval: Duration::ZERO,
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let (worker, store) = worker(config, calls.clone());
        let id = orphan(&worker, &store).await;

        let handle = worker.start();
        let _ = time::timeout(Duration::from_secs(2), async {
            while calls.load(Ordering::SeqCst) == 0 {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        handle.shutdown();
        handle.join().await;

        assert_eq!(
            store.get(id).await.unwrap().unwrap().status(),
            RecordStatus::Dispatched
        );
    }
}
