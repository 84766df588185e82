use datasync_core::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 记录映射与校验
///
/// `transform` 是纯映射，缺失字段映射为 `null`，不会失败；
/// `validate` 对单条记录独立判定，失败时返回 `SyncError::Validation`。
pub trait RecordMapper: Send + Sync {
    fn transform(&self, raw: &Value) -> Value;

    fn validate(&self, mapped: Value) -> SyncResult<Value>;
}

/// 目标字段定义
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub target: String,
    /// 点分路径，数组下标写作数字，例如 `contact.emails.0`
    pub source_path: String,
    #[serde(default)]
    pub required: bool,
}

/// 按字段定义表映射的通用映射器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldMapper {
    fields: Vec<FieldSpec>,
}

impl FieldMapper {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn field(mut self, target: &str, source_path: &str, required: bool) -> Self {
        self.fields.push(FieldSpec {
            target: target.to_string(),
            source_path: source_path.to_string(),
            required,
        });
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

impl RecordMapper for FieldMapper {
    fn transform(&self, raw: &Value) -> Value {
        let mapped: Map<String, Value> = self
            .fields
            .iter()
            .map(|spec| {
                let value = lookup(raw, &spec.source_path)
                    .cloned()
                    .unwrap_or(Value::Null);
                (spec.target.clone(), value)
            })
            .collect();
        Value::Object(mapped)
    }

    fn validate(&self, mapped: Value) -> SyncResult<Value> {
        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|spec| spec.required)
            .filter(|spec| mapped.get(&spec.target).map_or(true, Value::is_null))
            .map(|spec| spec.target.as_str())
            .collect();

        if !missing.is_empty() {
            return Err(SyncError::Validation(format!(
                "必填字段缺失: {}",
                missing.join(", ")
            )));
        }
        Ok(mapped)
    }
}
