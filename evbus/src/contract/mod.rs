//! 事件契约模型（contract）
//!
//! 定义不可变、可版本化的事件类型及其载荷结构：
//! - `Schema`/`FieldType`：载荷字段的类型与必填约束；
//! - `EventCatalog`：类型标签唯一的契约目录，负责定义、构造与校验；
//! - `Event`：不可变事件实例及其线上格式；
//! - `EventFamily`：封闭的事件族，便于处理器侧穷尽匹配。

mod catalog;
mod event;
mod family;
mod schema;

pub use catalog::{EventCatalog, EventType};
pub use event::Event;
pub use family::EventFamily;
pub use schema::{FieldSpec, FieldType, Schema};
