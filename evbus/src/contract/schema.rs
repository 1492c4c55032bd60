//! 事件载荷结构（Schema）
//!
//! 以字段名 → 类型/是否必填 的方式描述一个事件类型的载荷，
//! 并在构造事件时对 JSON 载荷做递归校验。
//!
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// 字段类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "of", rename_all = "snake_case")]
pub enum FieldType {
    Bool,
    /// 整数（i64/u64 范围内）
    Int,
    /// 任意数值
    Float,
    String,
    /// RFC 3339 格式的时间字符串
    Timestamp,
    /// 不做类型约束
    Any,
    List(Box<FieldType>),
    Object(Schema),
}

impl FieldType {
    pub fn list(inner: FieldType) -> Self {
        FieldType::List(Box::new(inner))
    }

    fn name(&self) -> &'static str {
        match self {
            FieldType::Bool => "bool",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::String => "string",
            FieldType::Timestamp => "timestamp",
            FieldType::Any => "any",
            FieldType::List(_) => "list",
            FieldType::Object(_) => "object",
        }
    }

    fn check(&self, value: &Value, path: &str) -> Result<(), String> {
        let ok = match (self, value) {
            (FieldType::Any, _) => true,
            (FieldType::Bool, Value::Bool(_)) => true,
            (FieldType::Int, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (FieldType::Float, Value::Number(_)) => true,
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Timestamp, Value::String(s)) => {
                if DateTime::parse_from_rfc3339(s).is_err() {
                    return Err(format!("field `{path}` is not an RFC 3339 timestamp"));
                }
                true
            }
            (FieldType::List(inner), Value::Array(items)) => {
                for (i, item) in items.iter().enumerate() {
                    inner.check(item, &format!("{path}[{i}]"))?;
                }
                true
            }
            (FieldType::Object(schema), Value::Object(map)) => {
                schema.check_object(map, path)?;
                true
            }
            _ => false,
        };

        if ok {
            Ok(())
        } else {
            Err(format!(
                "field `{path}` expected {}, found {}",
                self.name(),
                json_kind(value)
            ))
        }
    }
}

/// 字段定义
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    ty: FieldType,
    required: bool,
}

impl FieldSpec {
    pub fn field_type(&self) -> &FieldType {
        &self.ty
    }

    pub fn is_required(&self) -> bool {
        self.required
    }
}

/// 事件载荷结构
///
/// 字段按名称有序存储，因此两个字段集合相同的 schema 无论声明顺序如何都相等；
/// 契约冲突检测依赖这一点。
///
/// ```
/// use evbus::contract::{FieldType, Schema};
///
/// let schema = Schema::new()
///     .required("userId", FieldType::Int)
///     .optional("note", FieldType::String);
/// assert_eq!(schema.len(), 2);
/// assert!(schema.field("userId").unwrap().is_required());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    version: u32,
    fields: BTreeMap<String, FieldSpec>,
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            version: 1,
            fields: BTreeMap::new(),
        }
    }
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置载荷版本（默认 1）
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn required(self, name: impl Into<String>, ty: FieldType) -> Self {
        self.field_spec(name, ty, true)
    }

    pub fn optional(self, name: impl Into<String>, ty: FieldType) -> Self {
        self.field_spec(name, ty, false)
    }

    fn field_spec(mut self, name: impl Into<String>, ty: FieldType, required: bool) -> Self {
        self.fields.insert(name.into(), FieldSpec { ty, required });
        self
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// 校验载荷；失败时返回首个违规原因
    pub fn validate(&self, payload: &Value) -> Result<(), String> {
        match payload {
            Value::Object(map) => self.check_object(map, ""),
            other => Err(format!("payload must be an object, found {}", json_kind(other))),
        }
    }

    fn check_object(&self, map: &Map<String, Value>, prefix: &str) -> Result<(), String> {
        for (name, spec) in &self.fields {
            let path = join(prefix, name);
            match map.get(name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(format!("missing required field `{path}`"));
                }
                None | Some(Value::Null) => {}
                Some(value) => spec.ty.check(value, &path)?,
            }
        }

        if let Some(extra) = map.keys().find(|k| !self.fields.contains_key(*k)) {
            return Err(format!("undeclared field `{}`", join(prefix, extra)));
        }

        Ok(())
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn experience() -> Schema {
        Schema::new()
            .required("userId", FieldType::Int)
            .required("experienceId", FieldType::Int)
            .required("rawText", FieldType::String)
    }

    #[test]
    fn accepts_well_formed_payload() {
        let payload = json!({"userId": 1, "experienceId": 7, "rawText": ""});
        assert!(experience().validate(&payload).is_ok());
    }

    #[test]
    fn rejects_missing_and_null_required_fields() {
        let err = experience()
            .validate(&json!({"userId": 1, "experienceId": 7}))
            .unwrap_err();
        assert!(err.contains("rawText"), "{err}");

        let err = experience()
            .validate(&json!({"userId": null, "experienceId": 7, "rawText": "x"}))
            .unwrap_err();
        assert!(err.contains("userId"), "{err}");
    }

    #[test]
    fn rejects_wrong_types_and_undeclared_fields() {
        let err = experience()
            .validate(&json!({"userId": "1", "experienceId": 7, "rawText": "x"}))
            .unwrap_err();
        assert!(err.contains("expected int"), "{err}");

        let err = experience()
            .validate(&json!({"userId": 1, "experienceId": 7, "rawText": "x", "extra": true}))
            .unwrap_err();
        assert!(err.contains("undeclared field `extra`"), "{err}");

        let err = experience().validate(&json!([1, 2])).unwrap_err();
        assert!(err.contains("must be an object"), "{err}");
    }

    #[test]
    fn validates_nested_structures() {
        let schema = Schema::new()
            .required("tags", FieldType::list(FieldType::String))
            .optional(
                "author",
                FieldType::Object(Schema::new().required("name", FieldType::String)),
            )
            .optional("at", FieldType::Timestamp);

        assert!(schema
            .validate(&json!({"tags": ["a"], "author": {"name": "x"}, "at": "2024-05-01T10:00:00Z"}))
            .is_ok());

        let err = schema.validate(&json!({"tags": ["a", 2]})).unwrap_err();
        assert!(err.contains("tags[1]"), "{err}");

        let err = schema
            .validate(&json!({"tags": [], "author": {}}))
            .unwrap_err();
        assert!(err.contains("author.name"), "{err}");

        let err = schema
            .validate(&json!({"tags": [], "at": "yesterday"}))
            .unwrap_err();
        assert!(err.contains("RFC 3339"), "{err}");
    }

    #[test]
    fn equality_ignores_declaration_order() {
        let a = Schema::new()
            .required("a", FieldType::Int)
            .optional("b", FieldType::Bool);
        let b = Schema::new()
            .optional("b", FieldType::Bool)
            .required("a", FieldType::Int);
        assert_eq!(a, b);
        assert_ne!(a, b.clone().with_version(2));
    }
}
