//! 内存 Outbox 存储（开发与测试）
//!
//! 记录按事件 ID（UUIDv7，时间有序）保存在一把互斥锁之后，
//! 认领与状态变更都在锁内完成，等价于数据库的行级锁。
//!
use super::{DispatchRecord, OutboxStore, OutboxTransaction, RecordStatus};
use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone, Debug, Default)]
pub struct InMemoryOutboxStore {
    records: Arc<Mutex<BTreeMap<Uuid, DispatchRecord>>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开启事务；暂存的记录在 `commit` 时一次性写入
    pub fn begin(&self) -> InMemoryOutboxTx {
        InMemoryOutboxTx {
            store: self.clone(),
            staged: Vec::new(),
        }
    }

    /// 全部记录（按事件 ID 排序）
    pub fn records(&self) -> Vec<DispatchRecord> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Uuid, DispatchRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, event_id: Uuid, f: impl FnOnce(&mut DispatchRecord)) -> BusResult<()> {
        let mut records = self.lock();
        let record = records
            .get_mut(&event_id)
            .ok_or(BusError::RecordNotFound { event_id })?;
        record.ensure_open()?;
        f(record);
        Ok(())
    }
}

fn duplicate(event_id: Uuid) -> BusError {
    BusError::Outbox {
        reason: format!("record already exists: event={event_id}"),
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, record: DispatchRecord) -> BusResult<()> {
        let mut records = self.lock();
        let event_id = record.event_id();
        if records.contains_key(&event_id) {
            return Err(duplicate(event_id));
        }
        records.insert(event_id, record);
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
        limit: usize,
        lease: Duration,
    ) -> BusResult<Vec<DispatchRecord>> {
        let mut records = self.lock();
        let claimed = records
            .values_mut()
            .filter(|r| r.is_due(now, grace))
            .take(limit)
            .map(|r| {
                r.claim(now, lease);
                r.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn claim(
        &self,
        event_id: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> BusResult<DispatchRecord> {
        let mut records = self.lock();
        let record = records
            .get_mut(&event_id)
            .ok_or(BusError::RecordNotFound { event_id })?;
        record.ensure_open()?;
        if let Some(until) = record.leased_until(now) {
            return Err(BusError::RecordLeased { event_id, until });
        }
        record.claim(now, lease);
        Ok(record.clone())
    }

    async fn mark_dispatched(&self, event_id: Uuid, attempts: u32) -> BusResult<()> {
        self.update(event_id, |r| r.mark_dispatched(attempts, Utc::now()))
    }

    async fn mark_failed(
        &self,
        event_id: Uuid,
        attempts: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> BusResult<()> {
        self.update(event_id, |r| {
            r.mark_failed(attempts, error, next_attempt_at, Utc::now())
        })
    }

    async fn mark_dead_lettered(
        &self,
        event_id: Uuid,
        attempts: u32,
        error: &str,
    ) -> BusResult<()> {
        self.update(event_id, |r| r.mark_dead_lettered(attempts, error, Utc::now()))
    }

    async fn get(&self, event_id: Uuid) -> BusResult<Option<DispatchRecord>> {
        Ok(self.lock().get(&event_id).cloned())
    }

    async fn dead_letters(&self, limit: usize) -> BusResult<Vec<DispatchRecord>> {
        Ok(self
            .lock()
            .values()
            .filter(|r| r.status() == RecordStatus::DeadLettered)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn requeue(&self, event_id: Uuid) -> BusResult<()> {
        let mut records = self.lock();
        let record = records
            .get_mut(&event_id)
            .ok_or(BusError::RecordNotFound { event_id })?;
        if record.status() != RecordStatus::DeadLettered {
            return Err(BusError::Outbox {
                reason: format!(
                    "only dead-lettered records can be requeued: event={event_id}, status={}",
                    record.status()
                ),
            });
        }
        record.requeue(Utc::now());
        Ok(())
    }
}

/// 内存事务：`commit` 前暂存的记录对存储不可见
#[derive(Debug)]
#[must_use = "staged records are discarded unless the transaction is committed"]
pub struct InMemoryOutboxTx {
    store: InMemoryOutboxStore,
    staged: Vec<DispatchRecord>,
}

impl InMemoryOutboxTx {
    /// 原子提交：任一记录冲突时全部不写入
    pub fn commit(self) -> BusResult<()> {
        let mut records = self.store.lock();
        if let Some(r) = self.staged.iter().find(|r| records.contains_key(&r.event_id())) {
            return Err(duplicate(r.event_id()));
        }
        for record in self.staged {
            records.insert(record.event_id(), record);
        }
        Ok(())
    }

    pub fn rollback(self) {}
}

#[async_trait]
impl OutboxTransaction for InMemoryOutboxTx {
    async fn stage(&mut self, record: &DispatchRecord) -> BusResult<()> {
        self.staged.push(record.clone());
        Ok(())
    }
}
