//! 分发结果（DispatchOutcome）
//!
//! 汇总一次 `publish` 中每个处理器的执行结果。处理器失败只记录在这里，
//! 不会以错误形式返回给发布方。
//!
use super::{DeliveryMode, SubscriptionId};
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// 处理器失败原因
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("{reason}")]
    Failed { reason: String },
    #[error("panicked: {reason}")]
    Panicked { reason: String },
    #[error("timed out after {after:?}")]
    TimedOut { after: Duration },
}

impl HandlerError {
    /// 失败原因文本
    pub fn reason(&self) -> String {
        match self {
            HandlerError::Failed { reason } | HandlerError::Panicked { reason } => reason.clone(),
            HandlerError::TimedOut { .. } => self.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerResult {
    Succeeded,
    Failed(HandlerError),
    /// 即发即弃处理器已调度，结果不在本次分发中
    Scheduled,
    /// 因取消而未执行
    Skipped,
}

impl HandlerResult {
    pub fn is_success(&self) -> bool {
        matches!(self, HandlerResult::Succeeded)
    }

    pub fn error(&self) -> Option<&HandlerError> {
        match self {
            HandlerResult::Failed(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub subscription_id: SubscriptionId,
    pub handler: String,
    pub mode: DeliveryMode,
    pub result: HandlerResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// 全部订阅均已处理（成功或失败）
    Completed,
    /// 调用方取消，部分处理器被跳过
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub event_id: Uuid,
    pub type_tag: String,
    pub status: DispatchStatus,
    /// 按注册表顺序排列
    pub handlers: Vec<HandlerOutcome>,
}

impl DispatchOutcome {
    /// 未被取消且没有处理器失败
    pub fn is_success(&self) -> bool {
        self.status == DispatchStatus::Completed
            && self.handlers.iter().all(|h| h.result.error().is_none())
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == DispatchStatus::Cancelled
    }

    pub fn failures(&self) -> impl Iterator<Item = (&HandlerOutcome, &HandlerError)> {
        self.handlers
            .iter()
            .filter_map(|h| h.result.error().map(|e| (h, e)))
    }

    /// 按处理器名称查找结果（同名时取第一个）
    pub fn result_of(&self, handler: &str) -> Option<&HandlerResult> {
        self.handlers
            .iter()
            .find(|h| h.handler == handler)
            .map(|h| &h.result)
    }

    /// 已实际执行（成功或失败）的处理器
    pub fn completed(&self) -> impl Iterator<Item = &HandlerOutcome> {
        self.handlers
            .iter()
            .filter(|h| matches!(h.result, HandlerResult::Succeeded | HandlerResult::Failed(_)))
    }

    /// 失败摘要，形如 `b: boom; c: timed out after 1s`
    pub fn failure_summary(&self) -> Option<String> {
        let mut parts: Vec<String> = self
            .failures()
            .map(|(h, e)| format!("{}: {e}", h.handler))
            .collect();
        if self.is_cancelled() {
            parts.push("dispatch cancelled".to_string());
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

/// 处理器失败上报（观测通道）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailureReport {
    pub event_id: Uuid,
    pub type_tag: String,
    pub subscription_id: SubscriptionId,
    pub handler: String,
    pub mode: DeliveryMode,
    pub error: HandlerError,
    pub occurred_at: DateTime<Utc>,
}
