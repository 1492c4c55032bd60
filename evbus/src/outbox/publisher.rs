//! 持久化发布（DurablePublisher）
//!
//! 在分发前先将事件写入 Outbox，再交给分发器；分发结果回写记录状态：
//! - 全部阻塞处理器成功 → `Dispatched`；
//! - 有失败且未达最大次数 → `Failed`，按退避时间等待重投；
//! - 达到最大次数 → `DeadLettered`。
//!
//! 发布方的首次分发计为第 1 次尝试。即发即弃处理器的失败不影响记录状态。
//!
use super::{DispatchRecord, OutboxStore, OutboxTransaction, RecordStatus, RedeliveryConfig};
use crate::contract::Event;
use crate::error::{BusError, BusResult};
use crate::eventing::{DispatchOutcome, Dispatcher};
use crate::outbox::record::after;
use bon::bon;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// 已在调用方事务中暂存的事件；事务提交后交给 `complete`
#[derive(Debug)]
#[must_use = "a staged event is only dispatched after `complete`"]
pub struct StagedEvent {
    event: Event,
}

impl StagedEvent {
    pub fn event(&self) -> &Event {
        &self.event
    }
}

/// 一次分发尝试后的记录状态
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub event_id: Uuid,
    pub status: RecordStatus,
    pub attempts: u32,
    /// 事件未能通过契约校验时为空
    pub outcome: Option<DispatchOutcome>,
}

pub struct DurablePublisher {
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn OutboxStore>,
    config: RedeliveryConfig,
}

#[bon]
impl DurablePublisher {
    #[builder]
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn OutboxStore>,
        #[builder(default)] config: RedeliveryConfig,
    ) -> Self {
        Self {
            dispatcher,
            store,
            config,
        }
    }
}

impl DurablePublisher {
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<dyn OutboxStore> {
        &self.store
    }

    pub fn config(&self) -> &RedeliveryConfig {
        &self.config
    }

    /// 持久化后立即分发
    ///
    /// 校验失败时不写入记录；写入失败时不分发。记录写入时即带租约，
    /// 分发期间重投工作者不会认领它。
    pub async fn publish_durable(&self, event: Event) -> BusResult<Delivery> {
        self.dispatcher.catalog().validate(&event)?;
        let mut record = DispatchRecord::pending(event.clone());
        record.claim(Utc::now(), self.config.claim_lease);
        self.store.append(record).await?;
        self.deliver(event, 0).await
    }

    /// 两阶段发布的第一步：在调用方事务中暂存记录
    pub async fn stage<T>(&self, tx: &mut T, event: Event) -> BusResult<StagedEvent>
    where
        T: OutboxTransaction + ?Sized,
    {
        self.dispatcher.catalog().validate(&event)?;
        tx.stage(&DispatchRecord::pending(event.clone())).await?;
        Ok(StagedEvent { event })
    }

    /// 两阶段发布的第二步：事务提交后认领记录并分发
    ///
    /// 若调用方在提交后、`complete` 前崩溃，记录仍为 `Pending`，由重投工作者在宽限期后接手。
    /// 记录已被工作者认领或已完成时不再分发，返回记录当前状态。
    pub async fn complete(&self, staged: StagedEvent) -> BusResult<Delivery> {
        let event_id = staged.event.id();
        match self
            .store
            .claim(event_id, Utc::now(), self.config.claim_lease)
            .await
        {
            Ok(record) => {
                let attempts = record.attempt_count();
                self.deliver(record.into_event(), attempts).await
            }
            Err(err @ (BusError::RecordLeased { .. } | BusError::RecordSettled { .. })) => {
                debug!(%event_id, reason = %err, "staged event already taken over");
                self.current(event_id).await
            }
            Err(err) => Err(err),
        }
    }

    /// 运维操作：立即重投一条未完成的记录
    ///
    /// 记录被其他工作者持有租约时返回 `RecordLeased`。
    pub async fn redeliver(&self, event_id: Uuid) -> BusResult<Delivery> {
        let record = self
            .store
            .get(event_id)
            .await?
            .ok_or(BusError::RecordNotFound { event_id })?;

        match record.status() {
            RecordStatus::DeadLettered => Err(BusError::DeadLettered {
                event_id,
                attempts: record.attempt_count(),
            }),
            RecordStatus::Dispatched => Ok(Delivery {
                event_id,
                status: RecordStatus::Dispatched,
                attempts: record.attempt_count(),
                outcome: None,
            }),
            RecordStatus::Pending | RecordStatus::Failed => {
                let record = self
                    .store
                    .claim(event_id, Utc::now(), self.config.claim_lease)
                    .await?;
                let attempts = record.attempt_count();
                self.deliver(record.into_event(), attempts).await
            }
        }
    }

    async fn current(&self, event_id: Uuid) -> BusResult<Delivery> {
        let record = self
            .store
            .get(event_id)
            .await?
            .ok_or(BusError::RecordNotFound { event_id })?;
        Ok(Delivery {
            event_id,
            status: record.status(),
            attempts: record.attempt_count(),
            outcome: None,
        })
    }

    /// 执行一次分发尝试并回写记录
    ///
    /// 回写时记录已是终态（租约过期后被其他工作者完成）则丢弃本次结果，返回记录的实际状态。
    pub(crate) async fn deliver(&self, event: Event, previous_attempts: u32) -> BusResult<Delivery> {
        let event_id = event.id();
        let type_tag = event.type_tag().to_string();
        let attempts = previous_attempts.saturating_add(1);

        let outcome = match self.dispatcher.publish(event).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // 契约已不再接受该事件，重投没有意义
                let reason = err.to_string();
                let marked = self
                    .store
                    .mark_dead_lettered(event_id, attempts, &reason)
                    .await;
                let status = settled(event_id, marked, RecordStatus::DeadLettered)?;
                error!(%event_id, %type_tag, attempt = attempts, error = %reason, "event dead-lettered");
                return Ok(Delivery {
                    event_id,
                    status,
                    attempts,
                    outcome: None,
                });
            }
        };

        let status = if outcome.is_success() {
            let marked = self.store.mark_dispatched(event_id, attempts).await;
            let status = settled(event_id, marked, RecordStatus::Dispatched)?;
            debug!(%event_id, %type_tag, attempt = attempts, "event dispatched durably");
            status
        } else {
            let reason = outcome
                .failure_summary()
                .unwrap_or_else(|| "dispatch failed".to_string());

            if attempts >= self.config.max_attempts {
                let marked = self
                    .store
                    .mark_dead_lettered(event_id, attempts, &reason)
                    .await;
                error!(%event_id, %type_tag, attempt = attempts, error = %reason, "event dead-lettered");
                settled(event_id, marked, RecordStatus::DeadLettered)?
            } else {
                let wait = self.config.backoff(attempts);
                let next_attempt_at = after(Utc::now(), wait);
                let marked = self
                    .store
                    .mark_failed(event_id, attempts, &reason, next_attempt_at)
                    .await;
                warn!(
                    %event_id,
                    %type_tag,
                    attempt = attempts,
                    retry_in = ?wait,
                    error = %reason,
                    "event dispatch failed, scheduled for redelivery"
                );
                settled(event_id, marked, RecordStatus::Failed)?
            }
        };

        Ok(Delivery {
            event_id,
            status,
            attempts,
            outcome: Some(outcome),
        })
    }
}

/// 回写结果对应的记录状态；记录已被他处完成时取其实际状态
fn settled(event_id: Uuid, marked: BusResult<()>, status: RecordStatus) -> BusResult<RecordStatus> {
    match marked {
        Ok(()) => Ok(status),
        Err(BusError::RecordSettled { status: actual, .. }) => {
            warn!(%event_id, attempted = %status, %actual, "record already settled, result discarded");
            Ok(actual)
        }
        Err(err) => Err(err),
    }
}
