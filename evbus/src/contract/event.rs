//! 事件实例（Event）
//!
//! 事件一经构造即不可变，只能通过 `EventCatalog::construct` 创建（或从线上格式反序列化后
//! 由 `EventCatalog::validate` 校验）。线上格式为自描述记录
//! `{typeTag, id, version, createdAt, payload}`，便于将来替换为外部消息中间件。
//!
use crate::error::{BusError, BusResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

use super::catalog::EventType;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// 事件类型标签，如 `experience.created`
    type_tag: String,
    /// UUIDv7：进程内单调递增，跨重启不冲突
    id: Uuid,
    /// 载荷版本
    version: u32,
    /// 事件创建时间
    created_at: DateTime<Utc>,
    /// 事件载荷
    payload: Value,
}

impl Event {
    pub(crate) fn new(event_type: &EventType, payload: Value) -> Self {
        Self {
            type_tag: event_type.type_tag().to_string(),
            id: Uuid::now_v7(),
            version: event_type.schema().version(),
            created_at: Utc::now(),
            payload,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// 读取载荷中的单个字段
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// 将载荷反序列化为具体结构
    pub fn decode<T: DeserializeOwned>(&self) -> BusResult<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| BusError::schema(&self.type_tag, e.to_string()))
    }
}

// 身份由 (id, type_tag) 决定
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.type_tag == other.type_tag
    }
}

impl Eq for Event {}

impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.type_tag.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use crate::contract::{EventCatalog, FieldType, Schema};
    use serde::Deserialize;
    use serde_json::json;

    fn catalog() -> EventCatalog {
        let catalog = EventCatalog::new();
        catalog
            .define(
                "experience.created",
                Schema::new()
                    .required("userId", FieldType::Int)
                    .required("rawText", FieldType::String),
            )
            .unwrap();
        catalog
    }

    #[test]
    fn wire_shape_is_self_describing() {
        let event = catalog()
            .construct("experience.created", json!({"userId": 3, "rawText": "hi"}))
            .unwrap();

        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["typeTag"], "experience.created");
        assert_eq!(wire["id"], event.id().to_string());
        assert_eq!(wire["version"], 1);
        assert!(wire["createdAt"].is_string());
        assert_eq!(wire["payload"]["userId"], 3);

        let back: super::Event = serde_json::from_value(wire).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.created_at(), event.created_at());
    }

    #[test]
    fn ids_are_unique_and_time_ordered() {
        let catalog = catalog();
        let ids: Vec<_> = (0..64)
            .map(|i| {
                catalog
                    .construct("experience.created", json!({"userId": i, "rawText": ""}))
                    .unwrap()
                    .id()
            })
            .collect();

        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted, ids);
    }

    #[test]
    fn decode_payload_into_struct() {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Created {
            user_id: i64,
            raw_text: String,
        }

        let event = catalog()
            .construct("experience.created", json!({"userId": 9, "rawText": "x"}))
            .unwrap();
        let created: Created = event.decode().unwrap();
        assert_eq!(created.user_id, 9);
        assert_eq!(created.raw_text, "x");
        assert_eq!(event.field("userId"), Some(&json!(9)));
    }
}
