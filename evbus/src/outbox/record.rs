//! 投递记录（DispatchRecord）
//!
//! Outbox 中一条事件的投递状态：
//! - `Pending`：已持久化，尚未完成首次分发（或发布方在分发中途崩溃）；
//! - `Failed`：最近一次分发有阻塞处理器失败，等待 `next_attempt_at` 后重投；
//! - `Dispatched` / `DeadLettered`：终态。
//!
use crate::contract::Event;
use crate::error::{BusError, BusResult};
use bon::Builder;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    #[default]
    Pending,
    Dispatched,
    Failed,
    DeadLettered,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Dispatched => "dispatched",
            RecordStatus::Failed => "failed",
            RecordStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Dispatched | RecordStatus::DeadLettered)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "dispatched" => Ok(RecordStatus::Dispatched),
            "failed" => Ok(RecordStatus::Failed),
            "dead_lettered" => Ok(RecordStatus::DeadLettered),
            other => Err(format!("unknown record status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct DispatchRecord {
    /// 待投递的事件
    event: Event,
    /// 投递状态
    #[builder(default)]
    status: RecordStatus,
    /// 已完成的分发次数（发布方的首次分发计为第 1 次）
    #[builder(default)]
    attempt_count: u32,
    /// 最近一次失败原因
    last_error: Option<String>,
    /// 下一次允许重投的时间（仅 `Failed`）
    next_attempt_at: Option<DateTime<Utc>>,
    /// 租约到期时间；未到期前其他工作者不会再次认领
    claimed_until: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    updated_at: DateTime<Utc>,
}

impl DispatchRecord {
    /// 新的待投递记录
    pub fn pending(event: Event) -> Self {
        let now = Utc::now();
        DispatchRecord::builder()
            .event(event)
            .created_at(now)
            .updated_at(now)
            .build()
    }

    pub fn event_id(&self) -> Uuid {
        self.event.id()
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn into_event(self) -> Event {
        self.event
    }

    pub fn status(&self) -> RecordStatus {
        self.status
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.next_attempt_at
    }

    pub fn claimed_until(&self) -> Option<DateTime<Utc>> {
        self.claimed_until
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// 是否可被重投工作者认领
    ///
    /// `Pending` 需超过宽限期（避免与仍在分发中的发布方竞争），
    /// `Failed` 需到达 `next_attempt_at`；两者都要求当前没有有效租约。
    pub fn is_due(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        if self.leased_until(now).is_some() {
            return false;
        }

        match self.status {
            RecordStatus::Pending => after(self.created_at, grace) <= now,
            RecordStatus::Failed => self.next_attempt_at.is_none_or(|at| at <= now),
            RecordStatus::Dispatched | RecordStatus::DeadLettered => false,
        }
    }

    /// `now` 时仍有效的租约到期时间
    pub fn leased_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.claimed_until.filter(|until| *until > now)
    }

    /// 终态记录不再接受任何状态变更
    pub(crate) fn ensure_open(&self) -> BusResult<()> {
        if self.status.is_terminal() {
            return Err(BusError::RecordSettled {
                event_id: self.event_id(),
                status: self.status,
            });
        }
        Ok(())
    }

    pub(crate) fn claim(&mut self, now: DateTime<Utc>, lease: Duration) {
        self.claimed_until = Some(after(now, lease));
    }

    pub(crate) fn mark_dispatched(&mut self, attempts: u32, now: DateTime<Utc>) {
        self.status = RecordStatus::Dispatched;
        self.attempt_count = attempts;
        self.next_attempt_at = None;
        self.claimed_until = None;
        self.updated_at = now;
    }

    pub(crate) fn mark_failed(
        &mut self,
        attempts: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.status = RecordStatus::Failed;
        self.attempt_count = attempts;
        self.last_error = Some(error.to_string());
        self.next_attempt_at = Some(next_attempt_at);
        self.claimed_until = None;
        self.updated_at = now;
    }

    pub(crate) fn mark_dead_lettered(&mut self, attempts: u32, error: &str, now: DateTime<Utc>) {
        self.status = RecordStatus::DeadLettered;
        self.attempt_count = attempts;
        self.last_error = Some(error.to_string());
        self.next_attempt_at = None;
        self.claimed_until = None;
        self.updated_at = now;
    }

    pub(crate) fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = RecordStatus::Failed;
        self.attempt_count = 0;
        self.next_attempt_at = Some(now);
        self.claimed_until = None;
        self.updated_at = now;
    }
}

/// `t + d`，溢出时饱和到最大时间
pub(crate) fn after(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX);
    t.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
