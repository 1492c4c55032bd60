//! 事件契约目录（EventCatalog）
//!
//! 维护类型标签 → 事件类型描述的唯一映射，负责：
//! - 定义事件类型（同标签不同结构视为契约冲突）；
//! - 按结构校验载荷并构造不可变事件；
//! - 对线上反序列化得到的事件进行重新校验。
//!
use super::{Event, EventFamily, Schema};
use crate::error::{BusError, BusResult};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// 事件类型描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventType {
    type_tag: String,
    schema: Schema,
}

impl EventType {
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }
}

#[derive(Debug, Default)]
pub struct EventCatalog {
    types: DashMap<String, Arc<EventType>>,
}

impl EventCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 定义事件类型
    ///
    /// 以相同结构重复定义是幂等的，返回已有描述；结构不同则返回 `ContractConflict`。
    pub fn define(&self, type_tag: impl Into<String>, schema: Schema) -> BusResult<Arc<EventType>> {
        let type_tag = type_tag.into();
        if type_tag.trim().is_empty() {
            return Err(BusError::schema(&type_tag, "type tag must not be empty"));
        }

        match self.types.entry(type_tag.clone()) {
            Entry::Occupied(existing) => {
                if existing.get().schema == schema {
                    Ok(existing.get().clone())
                } else {
                    Err(BusError::ContractConflict { type_tag })
                }
            }
            Entry::Vacant(slot) => {
                let event_type = Arc::new(EventType { type_tag, schema });
                debug!(
                    type_tag = event_type.type_tag(),
                    version = event_type.schema().version(),
                    "event type defined"
                );
                slot.insert(event_type.clone());
                Ok(event_type)
            }
        }
    }

    /// 一次性定义某个事件族的全部类型
    pub fn define_family<F: EventFamily>(&self) -> BusResult<Vec<Arc<EventType>>> {
        F::definitions()
            .into_iter()
            .map(|(tag, schema)| self.define(tag, schema))
            .collect()
    }

    pub fn get(&self, type_tag: &str) -> Option<Arc<EventType>> {
        self.types.get(type_tag).map(|t| t.value().clone())
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.types.contains_key(type_tag)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// 已定义的类型标签（排序后）
    pub fn type_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.types.iter().map(|e| e.key().clone()).collect();
        tags.sort();
        tags
    }

    /// 校验载荷并构造事件；失败时不会产生任何事件实例
    pub fn construct(&self, type_tag: &str, fields: Value) -> BusResult<Event> {
        let event_type = self.get(type_tag).ok_or_else(|| BusError::unknown(type_tag))?;
        event_type
            .schema
            .validate(&fields)
            .map_err(|reason| BusError::schema(type_tag, reason))?;

        Ok(Event::new(&event_type, fields))
    }

    /// 由事件族的某个变体构造事件
    pub fn construct_from<F: EventFamily>(&self, value: &F) -> BusResult<Event> {
        let (type_tag, payload) = value.encode()?;
        self.construct(&type_tag, payload)
    }

    /// 校验一个已存在的事件（如从线上格式解码得到）
    pub fn validate(&self, event: &Event) -> BusResult<()> {
        let type_tag = event.type_tag();
        let event_type = self.get(type_tag).ok_or_else(|| BusError::unknown(type_tag))?;

        if event.version() != event_type.schema.version() {
            return Err(BusError::schema(
                type_tag,
                format!(
                    "version mismatch: expected={}, found={}",
                    event_type.schema.version(),
                    event.version()
                ),
            ));
        }

        event_type
            .schema
            .validate(event.payload())
            .map_err(|reason| BusError::schema(type_tag, reason))
    }
}
