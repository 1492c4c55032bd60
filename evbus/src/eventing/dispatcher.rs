//! 事件分发器（Dispatcher）
//!
//! 由应用显式构造并注入各模块，持有契约目录与订阅注册表：
//! - 阻塞处理器按注册表顺序逐个执行，单个失败（错误/panic/超时）不影响后续处理器；
//! - 即发即弃处理器作为独立任务调度，失败仅记录；
//! - 失败同时写入日志并广播到观测通道（`failures`）；
//! - 提供 `freeze_registry` 与 `drain` 两个宿主生命周期钩子。
//!
use super::{
    DeliveryMode, DispatchContext, DispatchOutcome, DispatchStatus, EventHandler,
    HandlerError, HandlerFailureReport, HandlerOutcome, HandlerResult, SubscribeOptions,
    Subscription, SubscriptionHandle, SubscriptionRegistry,
};
use crate::contract::{Event, EventCatalog, EventType, Schema};
use crate::error::{BusError, BusResult};
use bon::bon;
use chrono::Utc;
use futures_core::stream::BoxStream;
use futures_util::{FutureExt, StreamExt, future};
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::time;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// 分发器配置
#[derive(Clone, Copy, Debug)]
pub struct DispatcherConfig {
    /// 订阅未指定超时时使用的默认超时；为空表示不限时
    pub default_timeout: Option<Duration>,
    /// 失败观测通道的缓冲容量
    pub failure_channel_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            failure_channel_capacity: 256,
        }
    }
}

pub struct Dispatcher {
    catalog: Arc<EventCatalog>,
    registry: SubscriptionRegistry,
    tracker: TaskTracker,
    /// 同一时刻只有一个 drain 关闭/重开 tracker
    draining: Mutex<()>,
    failures: broadcast::Sender<HandlerFailureReport>,
    config: DispatcherConfig,
}

#[bon]
impl Dispatcher {
    #[builder]
    pub fn new(
        #[builder(default = Arc::new(EventCatalog::new()))] catalog: Arc<EventCatalog>,
        #[builder(default)] config: DispatcherConfig,
    ) -> Self {
        let (failures, _rx) = broadcast::channel(config.failure_channel_capacity.max(1));
        Self {
            registry: SubscriptionRegistry::new(catalog.clone()),
            catalog,
            tracker: TaskTracker::new(),
            draining: Mutex::new(()),
            failures,
            config,
        }
    }
}

impl Dispatcher {
    pub fn catalog(&self) -> &Arc<EventCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// 定义事件类型（委托给契约目录）
    pub fn define(&self, type_tag: impl Into<String>, schema: Schema) -> BusResult<Arc<EventType>> {
        self.catalog.define(type_tag, schema)
    }

    /// 构造事件（委托给契约目录）
    pub fn construct(&self, type_tag: &str, fields: Value) -> BusResult<Event> {
        self.catalog.construct(type_tag, fields)
    }

    pub fn subscribe(
        &self,
        type_tag: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> BusResult<SubscriptionHandle> {
        self.registry.subscribe(type_tag, handler, options)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.registry.unsubscribe(handle)
    }

    /// 启动完成后调用一次，结束订阅注册阶段
    pub fn freeze_registry(&self) {
        self.registry.freeze();
    }

    /// 发布事件
    pub async fn publish(&self, event: Event) -> BusResult<DispatchOutcome> {
        self.publish_with(&DispatchContext::default(), event).await
    }

    /// 在给定上下文（取消令牌等）下发布事件
    ///
    /// 仅当事件未通过契约校验时返回 `DispatchAborted`（此时没有处理器被调用）；
    /// 处理器的任何失败都只体现在返回的 `DispatchOutcome` 中。
    pub async fn publish_with(
        &self,
        ctx: &DispatchContext,
        event: Event,
    ) -> BusResult<DispatchOutcome> {
        if let Err(err) = self.catalog.validate(&event) {
            return Err(BusError::DispatchAborted {
                event_id: event.id(),
                reason: err.to_string(),
            });
        }

        let subscribers = self.registry.subscribers(event.type_tag());
        let event = Arc::new(event);
        let mut status = DispatchStatus::Completed;
        let mut handlers = Vec::with_capacity(subscribers.len());

        for subscription in subscribers.iter() {
            let result = if ctx.is_cancelled() {
                status = DispatchStatus::Cancelled;
                HandlerResult::Skipped
            } else {
                match subscription.mode() {
                    DeliveryMode::Blocking => {
                        let timeout = self.timeout_for(subscription);
                        match invoke(subscription, &event, timeout).await {
                            Ok(()) => HandlerResult::Succeeded,
                            Err(err) => {
                                report_failure(&self.failures, subscription, &event, err.clone());
                                HandlerResult::Failed(err)
                            }
                        }
                    }
                    DeliveryMode::FireAndForget => {
                        self.spawn_detached(subscription.clone(), event.clone());
                        HandlerResult::Scheduled
                    }
                }
            };

            handlers.push(HandlerOutcome {
                subscription_id: subscription.id(),
                handler: subscription.handler_name().to_string(),
                mode: subscription.mode(),
                result,
            });
        }

        let outcome = DispatchOutcome {
            event_id: event.id(),
            type_tag: event.type_tag().to_string(),
            status,
            handlers,
        };

        debug!(
            event_id = %outcome.event_id,
            type_tag = %outcome.type_tag,
            correlation_id = ?ctx.correlation_id(),
            handlers = outcome.handlers.len(),
            failed = outcome.failures().count(),
            status = ?outcome.status,
            "event dispatched"
        );

        Ok(outcome)
    }

    /// 等待所有在途的即发即弃处理器结束
    ///
    /// 并发调用依次执行，排队时间计入各自的超时。
    pub async fn drain(&self, timeout: Duration) -> BusResult<()> {
        let now = time::Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30));
        let timed_out = || BusError::DrainTimedOut {
            timeout,
            pending: self.tracker.len(),
        };

        let Ok(_guard) = time::timeout_at(deadline, self.draining.lock()).await else {
            return Err(timed_out());
        };
        self.tracker.close();
        let waited = time::timeout_at(deadline, self.tracker.wait()).await;
        self.tracker.reopen();

        waited.map_err(|_| timed_out())
    }

    /// 在途的即发即弃任务数
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// 订阅处理器失败流（阻塞与即发即弃处理器均会上报）
    ///
    /// 仅能收到订阅之后发生的失败；消费过慢时会丢弃最旧的记录。
    pub fn failures(&self) -> BoxStream<'static, HandlerFailureReport> {
        let stream = BroadcastStream::new(self.failures.subscribe())
            .filter_map(|r| future::ready(r.ok()));
        Box::pin(stream)
    }

    fn timeout_for(&self, subscription: &Subscription) -> Option<Duration> {
        subscription.timeout().or(self.config.default_timeout)
    }

    fn spawn_detached(&self, subscription: Arc<Subscription>, event: Arc<Event>) {
        let timeout = self.timeout_for(&subscription);
        let failures = self.failures.clone();

        self.tracker.spawn(async move {
            if let Err(err) = invoke(&subscription, &event, timeout).await {
                report_failure(&failures, &subscription, &event, err);
            }
        });
    }
}

/// 在单个处理器边界上捕获错误、panic 与超时
async fn invoke(
    subscription: &Subscription,
    event: &Event,
    timeout: Option<Duration>,
) -> Result<(), HandlerError> {
    let call = AssertUnwindSafe(subscription.handler().handle(event)).catch_unwind();

    let result = match timeout {
        Some(after) => match time::timeout(after, call).await {
            Ok(result) => result,
            Err(_) => return Err(HandlerError::TimedOut { after }),
        },
        None => call.await,
    };

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(HandlerError::Failed {
            reason: format!("{err:#}"),
        }),
        Err(panic) => Err(HandlerError::Panicked {
            reason: panic_message(panic.as_ref()),
        }),
    }
}

fn report_failure(
    failures: &broadcast::Sender<HandlerFailureReport>,
    subscription: &Subscription,
    event: &Event,
    error: HandlerError,
) {
    warn!(
        event_id = %event.id(),
        type_tag = event.type_tag(),
        handler = subscription.handler_name(),
        mode = ?subscription.mode(),
        error = %error,
        "event handler failed"
    );

    // 无订阅者时发送失败，视为非致命并忽略
    let _ = failures.send(HandlerFailureReport {
        event_id: event.id(),
        type_tag: event.type_tag().to_string(),
        subscription_id: subscription.id(),
        handler: subscription.handler_name().to_string(),
        mode: subscription.mode(),
        error,
        occurred_at: Utc::now(),
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
