//! 事件族（EventFamily）
//!
//! 将一组事件类型收敛为一个封闭枚举：每个变体对应一个类型标签，
//! 在处理器侧通过 `match` 获得穷尽性检查。
//!
//! 约定枚举使用 serde 的相邻标签表示：
//! `#[serde(tag = "typeTag", content = "payload")]`，变体名重命名为类型标签。
//! 仅支持带字段的结构体变体。
//!
use super::{Event, Schema};
use crate::error::{BusError, BusResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

pub trait EventFamily: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// 事件族内全部类型标签及其载荷结构
    fn definitions() -> Vec<(&'static str, Schema)>;

    /// 解码为族内变体；类型标签不属于本族时返回 `UnknownEventType`
    fn decode(event: &Event) -> BusResult<Self> {
        let type_tag = event.type_tag();
        if !Self::definitions().iter().any(|(tag, _)| *tag == type_tag) {
            return Err(BusError::unknown(type_tag));
        }

        let tagged = json!({ "typeTag": type_tag, "payload": event.payload() });
        serde_json::from_value(tagged).map_err(|e| BusError::schema(type_tag, e.to_string()))
    }

    /// 编码为 (类型标签, 载荷)
    fn encode(&self) -> BusResult<(String, Value)> {
        let Value::Object(mut tagged) = serde_json::to_value(self)? else {
            return Err(BusError::schema(
                "<unknown>",
                "event family must serialize as an adjacently tagged object",
            ));
        };

        let type_tag = match tagged.remove("typeTag") {
            Some(Value::String(tag)) => tag,
            _ => {
                return Err(BusError::schema(
                    "<unknown>",
                    "event family is missing the `typeTag` field",
                ));
            }
        };
        let payload = tagged
            .remove("payload")
            .unwrap_or_else(|| Value::Object(Map::new()));

        Ok((type_tag, payload))
    }
}
