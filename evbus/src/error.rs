//! 事件总线统一错误定义
//!
//! 聚焦契约注册、事件构造、分发与 Outbox 持久化的最小必要集合。
//! 处理器自身的失败不在此列：它们被记录到 `DispatchOutcome` 中，不会向发布方传播。
//!
use crate::outbox::RecordStatus;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BusError {
    // --- 事件契约 ---
    #[error("contract conflict: type={type_tag} is already defined with a different schema")]
    ContractConflict { type_tag: String },
    #[error("unknown event type: {type_tag}")]
    UnknownEventType { type_tag: String },
    #[error("schema violation: type={type_tag}, reason={reason}")]
    SchemaViolation { type_tag: String, reason: String },

    // --- 订阅与分发 ---
    #[error("subscription registry is frozen")]
    RegistryFrozen,
    #[error("dispatch aborted: event={event_id}, reason={reason}")]
    DispatchAborted { event_id: Uuid, reason: String },
    #[error("drain timed out after {timeout:?}: {pending} handler task(s) still running")]
    DrainTimedOut { timeout: Duration, pending: usize },

    // --- Outbox ---
    #[error("dispatch record dead-lettered: event={event_id}, attempts={attempts}")]
    DeadLettered { event_id: Uuid, attempts: u32 },
    #[error("dispatch record not found: event={event_id}")]
    RecordNotFound { event_id: Uuid },
    #[error("dispatch record already settled: event={event_id}, status={status}")]
    RecordSettled { event_id: Uuid, status: RecordStatus },
    #[error("dispatch record is leased: event={event_id}, until={until}")]
    RecordLeased { event_id: Uuid, until: DateTime<Utc> },
    #[error("outbox error: {reason}")]
    Outbox { reason: String },
    #[error("database error: {reason}")]
    Database { reason: String },

    // --- 序列化 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
}

impl BusError {
    pub(crate) fn schema(type_tag: &str, reason: impl Into<String>) -> Self {
        BusError::SchemaViolation {
            type_tag: type_tag.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unknown(type_tag: &str) -> Self {
        BusError::UnknownEventType {
            type_tag: type_tag.to_string(),
        }
    }
}

/// 统一 Result 类型别名
pub type BusResult<T> = Result<T, BusError>;

// 允许在基础设施层直接使用 `?` 将 sqlx 错误转换为 BusError
#[cfg(feature = "infra-sqlx")]
impl From<sqlx::Error> for BusError {
    fn from(err: sqlx::Error) -> Self {
        BusError::Database {
            reason: err.to_string(),
        }
    }
}
