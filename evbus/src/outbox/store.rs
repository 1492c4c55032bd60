//! Outbox 存储接口（OutboxStore / OutboxTransaction）
//!
//! 与具体存储解耦：默认提供内存实现，`infra-sqlx` 特性下提供 Postgres 实现。
//!
use super::DispatchRecord;
use crate::error::BusResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// 投递记录存储
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// 追加一条记录；同一事件重复追加返回错误
    async fn append(&self, record: DispatchRecord) -> BusResult<()>;

    /// 认领至多 `limit` 条到期记录并设置租约
    ///
    /// 同一记录在租约有效期内不会被再次认领，多个工作者可安全并发调用。
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
        limit: usize,
        lease: Duration,
    ) -> BusResult<Vec<DispatchRecord>>;

    /// 认领指定记录并设置租约
    ///
    /// 终态记录返回 `RecordSettled`，租约仍有效时返回 `RecordLeased`。
    async fn claim(
        &self,
        event_id: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> BusResult<DispatchRecord>;

    /// 标记已投递（终态）
    ///
    /// 以下三个标记操作只作用于 `Pending` / `Failed` 记录，终态记录返回 `RecordSettled`。
    async fn mark_dispatched(&self, event_id: Uuid, attempts: u32) -> BusResult<()>;

    /// 标记投递失败，等待下次重投
    async fn mark_failed(
        &self,
        event_id: Uuid,
        attempts: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> BusResult<()>;

    /// 标记死信（终态）
    async fn mark_dead_lettered(&self, event_id: Uuid, attempts: u32, error: &str)
    -> BusResult<()>;

    async fn get(&self, event_id: Uuid) -> BusResult<Option<DispatchRecord>>;

    /// 按创建时间列出死信记录
    async fn dead_letters(&self, limit: usize) -> BusResult<Vec<DispatchRecord>>;

    /// 运维操作：死信记录重置为可重投，尝试次数清零
    async fn requeue(&self, event_id: Uuid) -> BusResult<()>;
}

/// 发布方事务：让 Outbox 记录与业务写入在同一事务中提交
#[async_trait]
pub trait OutboxTransaction: Send {
    async fn stage(&mut self, record: &DispatchRecord) -> BusResult<()>;
}
