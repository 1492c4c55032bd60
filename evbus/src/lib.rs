//! 进程内事件总线（evbus）
//!
//! 在单个可部署应用内解耦业务模块，同时保持发布/订阅契约足够稳定，
//! 以便日后替换为基于消息中间件的实现：
//! - 事件契约（`contract`）：类型标签、载荷模式与不可变事件；
//! - 事件分发（`eventing`）：订阅注册表、分发器与失败隔离；
//! - Outbox（`outbox`）：可选的持久化投递与重投。
//!
//! 典型用法：
//! 1. 构造 `Dispatcher`，在启动阶段 `define` 事件类型并 `subscribe` 处理器；
//! 2. 调用 `freeze_registry` 结束注册；
//! 3. 业务模块 `construct` 事件并 `publish`（或经 `DurablePublisher::publish_durable`）；
//! 4. 关闭时调用 `drain` 等待即发即弃处理器结束。
//!
pub mod contract;
pub mod error;
pub mod eventing;
pub mod outbox;

pub use contract::{Event, EventCatalog, EventFamily, EventType, FieldType, Schema};
pub use error::{BusError, BusResult};
pub use eventing::{
    DeliveryMode, DispatchContext, DispatchOutcome, Dispatcher, DispatcherConfig, EventHandler,
    HandlerError, HandlerResult, SubscribeOptions, SubscriptionHandle, handler_fn, typed_handler,
};
pub use outbox::{DurablePublisher, InMemoryOutboxStore, RedeliveryConfig, RedeliveryWorker};
