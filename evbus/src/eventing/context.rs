use tokio_util::sync::CancellationToken;

/// 分发上下文（Dispatch Context）
///
/// 承载一次 `publish` 调用的横切信息：
/// - 取消令牌：取消后不再启动尚未执行的处理器，已在执行的处理器允许完成；
/// - 关联 ID：仅用于日志关联。
#[derive(Clone, Debug, Default)]
pub struct DispatchContext {
    cancellation: CancellationToken,
    correlation_id: Option<String>,
}

impl DispatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
