//! 事件子系统（eventing）
//!
//! 提供进程内发布/订阅与处理的运行时：
//! - `EventHandler`：对事件进行消费处理；
//! - `SubscriptionRegistry`：类型标签到有序订阅列表的映射；
//! - `Dispatcher`：按注册顺序执行处理器，隔离失败并汇总为 `DispatchOutcome`；
//! - `DispatchContext`：单次发布的取消令牌与关联 ID。
//!
pub mod context;
pub mod dispatcher;
pub mod handler;
pub mod outcome;
pub mod registry;

pub use context::DispatchContext;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use handler::{EventHandler, handler_fn, typed_handler};
pub use outcome::{
    DispatchOutcome, DispatchStatus, HandlerError, HandlerFailureReport, HandlerOutcome,
    HandlerResult,
};
pub use registry::{
    DeliveryMode, SubscribeOptions, Subscription, SubscriptionHandle, SubscriptionId,
    SubscriptionRegistry,
};
