//! Schema 类型注册表
//!
//! 根据属性路径解析声明的类型和格式，用于规则编译时的校验和求值时的类型转换。

use crate::error::{Result, RuleError};
use crate::path::{FieldPath, Segment};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// 属性类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl PropertyType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Number | Self::Integer)
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, Self::Object | Self::Array)
    }

    /// 没有声明默认值时使用的类型默认值
    pub fn fallback_value(&self) -> Value {
        match self {
            Self::String => Value::String("sample_value".to_string()),
            Self::Number | Self::Integer => Value::from(100),
            Self::Boolean => Value::Bool(true),
            Self::Object => Value::Object(Map::new()),
            Self::Array => Value::Array(Vec::new()),
        }
    }

    /// 严格类型检查（动作写入的值），null 总是允许
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Self::String, Value::String(_)) => true,
            (Self::Number, Value::Number(_)) => true,
            (Self::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Boolean, Value::Bool(_)) => true,
            (Self::Object, Value::Object(_)) => true,
            (Self::Array, Value::Array(_)) => true,
            _ => false,
        }
    }

    /// 宽松类型检查（输入事实），允许数字字符串和布尔字符串
    pub fn coercible(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Self::String, v) => !v.is_object() && !v.is_array(),
            (Self::Number, Value::String(s)) => s.trim().parse::<f64>().is_ok(),
            (Self::Integer, Value::String(s)) => s.trim().parse::<i64>().is_ok(),
            (Self::Integer, Value::Number(n)) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            (Self::Boolean, Value::String(s)) => matches!(s.as_str(), "true" | "false"),
            _ => self.accepts(value),
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        };
        write!(f, "{}", s)
    }
}

/// 影响解析和比较的格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalFormat {
    Date,
    DateTime,
    Time,
}

/// Schema 属性树节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaProperty {
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(rename = "type")]
    pub property_type: PropertyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<SchemaProperty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<SchemaProperty>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

impl SchemaProperty {
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        Self {
            name: name.into(),
            path: String::new(),
            property_type,
            format: None,
            description: None,
            required: false,
            properties: Vec::new(),
            items: None,
            enum_values: Vec::new(),
            default_value: None,
        }
    }

    pub fn object(name: impl Into<String>, properties: Vec<SchemaProperty>) -> Self {
        Self {
            properties,
            ..Self::new(name, PropertyType::Object)
        }
    }

    pub fn array(name: impl Into<String>, items: SchemaProperty) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::new(name, PropertyType::Array)
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = values;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn temporal_format(&self) -> Option<TemporalFormat> {
        match self.format.as_deref()? {
            "date" => Some(TemporalFormat::Date),
            "date-time" | "datetime" => Some(TemporalFormat::DateTime),
            "time" => Some(TemporalFormat::Time),
            _ => None,
        }
    }

    /// 非 null 的示例值：默认值、第一个枚举值，最后才是类型默认值
    pub fn sample_value(&self) -> Value {
        if let Some(value) = self.default_value.as_ref().filter(|v| !v.is_null()) {
            return value.clone();
        }
        if let Some(value) = self.enum_values.first() {
            return value.clone();
        }
        match (self.property_type, self.temporal_format()) {
            (PropertyType::String, Some(TemporalFormat::Date)) => Value::from("2024-01-01"),
            (PropertyType::String, Some(TemporalFormat::DateTime)) => {
                Value::from("2024-01-01T00:00:00Z")
            }
            (PropertyType::String, Some(TemporalFormat::Time)) => Value::from("12:00:00"),
            (property_type, _) => property_type.fallback_value(),
        }
    }

    fn assign_paths(&mut self, parent: &str) {
        self.path = if parent.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", parent, self.name)
        };

        let own = self.path.clone();
        for child in &mut self.properties {
            child.assign_paths(&own);
        }
        if let Some(items) = self.items.as_mut() {
            let item_path = format!("{}[]", own);
            items.path = item_path.clone();
            for child in &mut items.properties {
                child.assign_paths(&item_path);
            }
            if let Some(nested) = items.items.as_mut() {
                nested.assign_paths(&item_path);
            }
        }
    }

    fn validate(&self, paths: &mut HashSet<String>) -> Result<()> {
        let has_children = !self.properties.is_empty();
        let has_items = self.items.is_some();

        match self.property_type {
            PropertyType::Object if has_items => {
                return Err(RuleError::InvalidSchema(format!(
                    "对象属性 '{}' 不能声明 items",
                    self.path
                )));
            }
            PropertyType::Array if has_children => {
                return Err(RuleError::InvalidSchema(format!(
                    "数组属性 '{}' 不能声明 properties",
                    self.path
                )));
            }
            t if t.is_scalar() && (has_children || has_items) => {
                return Err(RuleError::InvalidSchema(format!(
                    "标量属性 '{}' 不能包含子属性",
                    self.path
                )));
            }
            _ => {}
        }

        if !paths.insert(self.path.clone()) {
            return Err(RuleError::InvalidSchema(format!(
                "属性路径重复: {}",
                self.path
            )));
        }

        validate_siblings(&self.properties, paths)?;
        if let Some(items) = &self.items {
            validate_siblings(&items.properties, paths)?;
            if let Some(nested) = &items.items {
                nested.validate(paths)?;
            }
        }
        Ok(())
    }

    fn check_fact_value(&self, value: &Value, at: &str) -> Result<()> {
        if !self.property_type.coercible(value) {
            return Err(RuleError::MalformedFacts(format!(
                "字段 '{}' 期望 {}, 实际为 {}",
                at,
                self.property_type,
                value_type_name(value)
            )));
        }

        match (self.property_type, value) {
            (PropertyType::Object, Value::Object(map)) => check_fact_object(&self.properties, map, at),
            (PropertyType::Array, Value::Array(items)) => {
                let Some(item_schema) = &self.items else {
                    return Ok(());
                };
                for (i, item) in items.iter().enumerate() {
                    let item_at = format!("{}[{}]", at, i);
                    if !item_schema.properties.is_empty() {
                        match item {
                            Value::Object(map) => {
                                check_fact_object(&item_schema.properties, map, &item_at)?
                            }
                            Value::Null => {}
                            other => {
                                return Err(RuleError::MalformedFacts(format!(
                                    "字段 '{}' 期望 object, 实际为 {}",
                                    item_at,
                                    value_type_name(other)
                                )));
                            }
                        }
                    } else {
                        item_schema.check_fact_value(item, &item_at)?;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn validate_siblings(properties: &[SchemaProperty], paths: &mut HashSet<String>) -> Result<()> {
    let mut names = HashSet::new();
    for property in properties {
        if property.name.is_empty() {
            return Err(RuleError::InvalidSchema("属性名称不能为空".to_string()));
        }
        if !names.insert(property.name.as_str()) {
            return Err(RuleError::InvalidSchema(format!(
                "同级属性名称重复: {}",
                property.name
            )));
        }
        property.validate(paths)?;
    }
    Ok(())
}

fn check_fact_object(properties: &[SchemaProperty], map: &Map<String, Value>, at: &str) -> Result<()> {
    for property in properties {
        if let Some(value) = map.get(&property.name) {
            let child_at = if at.is_empty() {
                property.name.clone()
            } else {
                format!("{}.{}", at, property.name)
            };
            property.check_fact_value(value, &child_at)?;
        }
    }
    Ok(())
}

fn collect_defaults(properties: &[SchemaProperty]) -> Map<String, Value> {
    let mut out = Map::new();
    for property in properties {
        if let Some(value) = &property.default_value {
            out.insert(property.name.clone(), value.clone());
        } else if property.property_type == PropertyType::Object {
            let nested = collect_defaults(&property.properties);
            if !nested.is_empty() {
                out.insert(property.name.clone(), Value::Object(nested));
            }
        }
    }
    out
}

pub(crate) fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Schema 定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: Vec<SchemaProperty>,
}

impl Schema {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        properties: Vec<SchemaProperty>,
    ) -> Self {
        let mut schema = Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            description: None,
            properties,
        };
        schema.assign_paths();
        schema
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// 根据属性树重新计算每个节点的 path
    pub fn assign_paths(&mut self) {
        for property in &mut self.properties {
            property.assign_paths("");
        }
    }

    /// 校验属性树：每个节点只能是标量、对象或数组之一，同级名称和路径唯一
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(RuleError::InvalidSchema("Schema ID 不能为空".to_string()));
        }
        let mut paths = HashSet::new();
        validate_siblings(&self.properties, &mut paths)
    }

    /// 解析路径并去掉可选的类型名前缀
    pub fn normalize_path(&self, raw: &str) -> Result<FieldPath> {
        let path = FieldPath::parse(raw)?;
        let shadowed = self.properties.iter().any(|p| p.name == self.name);
        if !shadowed {
            if let Some(stripped) = path.without_prefix(&self.name) {
                return Ok(stripped);
            }
        }
        Ok(path)
    }

    /// 解析属性路径，返回声明的属性节点
    pub fn resolve(&self, raw: &str) -> Result<&SchemaProperty> {
        let path = self.normalize_path(raw)?;
        self.resolve_path(&path)
    }

    pub fn resolve_path(&self, path: &FieldPath) -> Result<&SchemaProperty> {
        let not_found = || RuleError::PathNotFound {
            schema: self.id.clone(),
            path: path.as_str().to_string(),
        };

        let mut siblings = &self.properties;
        let mut current: Option<&SchemaProperty> = None;

        for segment in path.segments() {
            match segment {
                Segment::Field(name) => {
                    if let Some(property) = current {
                        if property.property_type != PropertyType::Object {
                            return Err(not_found());
                        }
                    }
                    let found = siblings
                        .iter()
                        .find(|p| &p.name == name)
                        .ok_or_else(not_found)?;
                    siblings = &found.properties;
                    current = Some(found);
                }
                Segment::Index(_) | Segment::Each => {
                    let items = current
                        .filter(|p| p.property_type == PropertyType::Array)
                        .and_then(|p| p.items.as_deref())
                        .ok_or_else(not_found)?;
                    siblings = &items.properties;
                    current = Some(items);
                }
            }
        }

        current.ok_or_else(not_found)
    }

    /// 由声明的 defaultValue 构建默认对象
    pub fn defaults(&self) -> Map<String, Value> {
        collect_defaults(&self.properties)
    }

    /// 在事实进入工作集前校验其形状
    pub fn validate_fact(&self, fact: &Value) -> Result<()> {
        match fact {
            Value::Object(map) => check_fact_object(&self.properties, map, ""),
            other => Err(RuleError::MalformedFacts(format!(
                "{} 类型的事实必须是 JSON 对象, 实际为 {}",
                self.name,
                value_type_name(other)
            ))),
        }
    }
}

/// Schema 注册表
///
/// 每次执行或编译时显式传入，不依赖全局查找。
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<Schema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册 Schema（会重新计算路径并校验属性树）
    pub fn register(&mut self, mut schema: Schema) -> Result<Arc<Schema>> {
        schema.assign_paths();
        schema.validate()?;
        let schema = Arc::new(schema);
        self.schemas.insert(schema.id.clone(), schema.clone());
        Ok(schema)
    }

    pub fn get(&self, schema_id: &str) -> Result<Arc<Schema>> {
        self.schemas
            .get(schema_id)
            .cloned()
            .ok_or_else(|| RuleError::SchemaNotFound(schema_id.to_string()))
    }

    /// 按名称或 ID 查找
    pub fn find_by_name(&self, name: &str) -> Option<Arc<Schema>> {
        self.schemas
            .get(name)
            .or_else(|| self.schemas.values().find(|s| s.name == name))
            .cloned()
    }

    pub fn resolve(&self, schema_id: &str, path: &str) -> Result<&SchemaProperty> {
        let schema = self
            .schemas
            .get(schema_id)
            .ok_or_else(|| RuleError::SchemaNotFound(schema_id.to_string()))?;
        schema.resolve(path)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
