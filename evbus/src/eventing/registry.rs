//! 订阅注册表（SubscriptionRegistry）
//!
//! 维护类型标签 → 有序订阅列表：
//! - 先按 `order` 升序，再按注册顺序，保证多次运行的分发顺序一致；
//! - 写操作经单一写锁串行化，并发布新的不可变快照；读取方仅克隆快照的 `Arc`；
//! - `freeze` 结束注册阶段，此后仅允许取消订阅（测试清理/关闭）。
//!
use super::EventHandler;
use crate::contract::EventCatalog;
use crate::error::{BusError, BusResult};
use bon::Builder;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// 投递模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    /// 同一事件的阻塞处理器按顺序逐个执行，全部结束后 `publish` 才返回
    #[default]
    Blocking,
    /// 独立调度，失败仅记录，不影响发布方
    FireAndForget,
}

/// 订阅选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Builder)]
pub struct SubscribeOptions {
    /// 越小越先执行
    #[builder(default)]
    pub order: i32,
    #[builder(default)]
    pub mode: DeliveryMode,
    /// 单次调用超时；为空时使用分发器的默认超时
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// 订阅句柄：用于取消订阅
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[must_use = "dropping the handle makes the subscription impossible to remove"]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    type_tag: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }
}

/// 一条订阅；注册后不可变
pub struct Subscription {
    id: SubscriptionId,
    type_tag: String,
    handler: Arc<dyn EventHandler>,
    options: SubscribeOptions,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }

    pub fn handler_name(&self) -> &str {
        self.handler.handler_name()
    }

    pub fn order(&self) -> i32 {
        self.options.order
    }

    pub fn mode(&self) -> DeliveryMode {
        self.options.mode
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.options.timeout
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("type_tag", &self.type_tag)
            .field("handler", &self.handler.handler_name())
            .field("options", &self.options)
            .finish()
    }
}

type Subscribers = Arc<[Arc<Subscription>]>;
type Snapshot = HashMap<String, Subscribers>;

pub struct SubscriptionRegistry {
    catalog: Arc<EventCatalog>,
    // 写锁：保护可变的订阅表
    table: Mutex<HashMap<String, Vec<Arc<Subscription>>>>,
    snapshot: RwLock<Arc<Snapshot>>,
    frozen: AtomicBool,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new(catalog: Arc<EventCatalog>) -> Self {
        Self {
            catalog,
            table: Mutex::new(HashMap::new()),
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            frozen: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    /// 注册订阅；类型标签必须已在契约目录中定义
    pub fn subscribe(
        &self,
        type_tag: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> BusResult<SubscriptionHandle> {
        if !self.catalog.contains(type_tag) {
            return Err(BusError::unknown(type_tag));
        }

        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        // 在写锁内检查，避免与 freeze 竞争
        if self.frozen.load(Ordering::Acquire) {
            return Err(BusError::RegistryFrozen);
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscription = Arc::new(Subscription {
            id,
            type_tag: type_tag.to_string(),
            handler,
            options,
        });

        debug!(
            type_tag,
            subscription = %id,
            handler = subscription.handler_name(),
            order = options.order,
            mode = ?options.mode,
            "subscription registered"
        );

        let list = table.entry(type_tag.to_string()).or_default();
        list.push(subscription);
        // id 单调递增，即注册顺序
        list.sort_by_key(|s| (s.options.order, s.id));

        self.publish_snapshot(&table);

        Ok(SubscriptionHandle {
            id,
            type_tag: type_tag.to_string(),
        })
    }

    /// 取消订阅；幂等，返回本次是否实际移除
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(list) = table.get_mut(handle.type_tag()) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != handle.id);
        if list.len() == before {
            return false;
        }
        if list.is_empty() {
            table.remove(handle.type_tag());
        }

        debug!(
            type_tag = handle.type_tag(),
            subscription = %handle.id,
            "subscription removed"
        );
        self.publish_snapshot(&table);
        true
    }

    /// 结束注册阶段
    pub fn freeze(&self) {
        let _table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.frozen.swap(true, Ordering::AcqRel) {
            debug!("subscription registry frozen");
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// 某类型的有序订阅列表（只读快照）
    pub fn subscribers(&self, type_tag: &str) -> Subscribers {
        let snapshot = self
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        snapshot
            .get(type_tag)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    /// 订阅总数
    pub fn len(&self) -> usize {
        let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        snapshot.values().map(|l| l.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn catalog(&self) -> &Arc<EventCatalog> {
        &self.catalog
    }

    fn publish_snapshot(&self, table: &HashMap<String, Vec<Arc<Subscription>>>) {
        let next: Snapshot = table
            .iter()
            .map(|(tag, list)| (tag.clone(), Subscribers::from(list.as_slice())))
            .collect();
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.len())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}
