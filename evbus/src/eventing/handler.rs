//! 事件处理器（EventHandler）
//!
//! 定义消费事件的处理逻辑与元信息（名称），并提供闭包与事件族两种适配器。
//!
use crate::contract::{Event, EventFamily};
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// 事件处理器：处理某一类型的事件
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理器名称（用于分发结果、失败上报与日志）
    fn handler_name(&self) -> &str;
    /// 处理事件
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// 以闭包实现的处理器
pub struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}

/// 由闭包构造处理器
///
/// ```
/// use evbus::eventing::{EventHandler, handler_fn};
///
/// let handler = handler_fn("audit", |event| async move {
///     println!("{}", event.type_tag());
///     Ok(())
/// });
/// assert_eq!(handler.handler_name(), "audit");
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

/// 以事件族解码后再处理的处理器
pub struct TypedHandler<E, F> {
    name: String,
    f: F,
    _family: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, F, Fut> EventHandler for TypedHandler<E, F>
where
    E: EventFamily,
    F: Fn(Event, E) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let decoded = E::decode(event)?;
        (self.f)(event.clone(), decoded).await
    }
}

/// 由事件族闭包构造处理器；解码失败记为处理器失败
pub fn typed_handler<E, F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    E: EventFamily,
    F: Fn(Event, E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(TypedHandler {
        name: name.into(),
        f,
        _family: PhantomData,
    })
}
