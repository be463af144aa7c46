//! 条件评估器
//!
//! 对事实求值条件组，纯函数、无副作用。数据形状不匹配从不报错：
//! 路径缺失视为 null，类型转换失败时该条件为 false。

use crate::error::{Result, RuleError};
use crate::models::{Condition, ConditionGroup};
use crate::operators::{LogicalOperator, Operator};
use crate::path::FieldPath;
use crate::schema::{PropertyType, Schema, SchemaProperty, TemporalFormat, value_type_name};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::sync::LazyLock;

/// 正则缓存上限，超过后整体清空
const REGEX_CACHE_LIMIT: usize = 1024;

static REGEX_CACHE: LazyLock<DashMap<String, Regex>> = LazyLock::new(DashMap::new);

/// 比较时采用的值类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Number,
    Boolean,
    String,
    Temporal,
    Array,
    Object,
    /// 无 Schema 信息时按值本身推断
    Any,
}

impl ValueKind {
    pub fn of_property(property: &SchemaProperty) -> Self {
        match property.property_type {
            PropertyType::Number | PropertyType::Integer => Self::Number,
            PropertyType::Boolean => Self::Boolean,
            PropertyType::String if property.temporal_format().is_some() => Self::Temporal,
            PropertyType::String => Self::String,
            PropertyType::Array => Self::Array,
            PropertyType::Object => Self::Object,
        }
    }
}

/// 评估追踪
struct Trace<'t>(Option<&'t mut Vec<String>>);

impl Trace<'_> {
    fn push(&mut self, line: impl FnOnce() -> String) {
        if let Some(lines) = self.0.as_mut() {
            lines.push(line());
        }
    }
}

/// 条件评估器
///
/// 绑定 Schema 时按声明的属性类型转换，否则按字面值推断。
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator<'a> {
    schema: Option<&'a Schema>,
}

impl<'a> ConditionEvaluator<'a> {
    pub fn untyped() -> Self {
        Self { schema: None }
    }

    pub fn for_schema(schema: &'a Schema) -> Self {
        Self {
            schema: Some(schema),
        }
    }

    /// 评估条件组
    pub fn evaluate(&self, group: &ConditionGroup, fact: &Value) -> bool {
        self.evaluate_group(group, fact, &mut Trace(None), "root")
    }

    /// 评估条件组并记录每一步的追踪信息
    pub fn evaluate_traced(
        &self,
        group: &ConditionGroup,
        fact: &Value,
        trace: &mut Vec<String>,
    ) -> bool {
        self.evaluate_group(group, fact, &mut Trace(Some(trace)), "root")
    }

    /// 评估单个条件（包含其 nested 子组）
    pub fn evaluate_condition(&self, cond: &Condition, fact: &Value) -> bool {
        self.evaluate_node(cond, fact, &mut Trace(None), "root")
    }

    /// 逻辑组求值（短路）
    fn evaluate_group(
        &self,
        group: &ConditionGroup,
        fact: &Value,
        trace: &mut Trace<'_>,
        path: &str,
    ) -> bool {
        trace.push(|| {
            format!(
                "{}: 开始评估 {} 组 (共 {} 个条件)",
                path,
                group.operator,
                group.conditions.len()
            )
        });

        match group.operator {
            LogicalOperator::All => {
                for (i, cond) in group.conditions.iter().enumerate() {
                    let child_path = format!("{}.conditions[{}]", path, i);
                    if !self.evaluate_node(cond, fact, trace, &child_path) {
                        trace.push(|| format!("{}: all 短路 - 条件 {} 不匹配", path, i));
                        return false;
                    }
                }
                // 空 all 组为 true
                true
            }
            LogicalOperator::Any => {
                for (i, cond) in group.conditions.iter().enumerate() {
                    let child_path = format!("{}.conditions[{}]", path, i);
                    if self.evaluate_node(cond, fact, trace, &child_path) {
                        trace.push(|| format!("{}: any 短路 - 条件 {} 匹配", path, i));
                        return true;
                    }
                }
                // 空 any 组为 false
                false
            }
        }
    }

    fn evaluate_node(
        &self,
        cond: &Condition,
        fact: &Value,
        trace: &mut Trace<'_>,
        path: &str,
    ) -> bool {
        let base = if cond.is_pure_group() {
            true
        } else {
            let matched = self.test(cond, fact);
            trace.push(|| {
                format!(
                    "{}: {} {} {} => {}",
                    path,
                    cond.fact,
                    cond.operator,
                    cond.value,
                    if matched { "MATCHED" } else { "NOT_MATCHED" }
                )
            });
            matched
        };

        match (&cond.nested, base) {
            (Some(nested), true) => {
                self.evaluate_group(nested, fact, trace, &format!("{}.nested", path))
            }
            _ => base,
        }
    }

    /// 条件自身的判断（不含 nested）
    fn test(&self, cond: &Condition, fact: &Value) -> bool {
        let Some((path, declared)) = self.locate(&cond.fact) else {
            return false;
        };

        let actual = path.lookup(fact);
        let expected: Cow<'_, Value> = if cond.value_is_field {
            match cond.value.as_str().and_then(|other| self.locate(other)) {
                Some((other, _)) => other.lookup(fact).unwrap_or(Cow::Owned(Value::Null)),
                None => return false,
            }
        } else {
            Cow::Borrowed(&cond.value)
        };

        let kind = declared.map(ValueKind::of_property).unwrap_or(ValueKind::Any);
        if path.has_each() {
            return compare_any_element(actual.as_deref(), cond.operator, &expected, kind);
        }
        compare(actual.as_deref(), cond.operator, &expected, kind).unwrap_or(false)
    }

    fn locate(&self, raw: &str) -> Option<(FieldPath, Option<&'a SchemaProperty>)> {
        match self.schema {
            Some(schema) => {
                let path = schema.normalize_path(raw).ok()?;
                let declared = schema.resolve_path(&path).ok();
                Some((path, declared))
            }
            None => FieldPath::parse(raw).ok().map(|p| (p, None)),
        }
    }
}

/// `[]` 路径：读取结果是逐元素收集的数组，任一元素满足即匹配
///
/// 没有任何元素时按字段缺失处理。
pub(crate) fn compare_any_element(
    collected: Option<&Value>,
    operator: Operator,
    expected: &Value,
    kind: ValueKind,
) -> bool {
    match collected {
        Some(Value::Array(items)) if !items.is_empty() => items
            .iter()
            .any(|item| compare(Some(item), operator, expected, kind).unwrap_or(false)),
        _ => compare(None, operator, expected, kind).unwrap_or(false),
    }
}

/// 单个操作符的比较语义
///
/// `actual` 为 None 或 null 时按空值规则处理；类型转换失败返回 Err，
/// 由调用方视为不匹配。
pub fn compare(
    actual: Option<&Value>,
    operator: Operator,
    expected: &Value,
    kind: ValueKind,
) -> Result<bool> {
    let actual = actual.filter(|v| !v.is_null());

    match operator {
        Operator::IsNull => return Ok(actual.is_none()),
        Operator::IsNotNull => return Ok(actual.is_some()),
        _ => {}
    }

    let Some(actual) = actual else {
        return Ok(operator.is_negated() && !expected.is_null());
    };
    if expected.is_null() {
        return Ok(operator.is_negated());
    }

    match operator {
        Operator::Equals => values_equal(actual, expected, kind),
        Operator::NotEquals => values_equal(actual, expected, kind).map(|r| !r),
        Operator::GreaterThan => compare_numbers(actual, expected, |o| o == Ordering::Greater),
        Operator::GreaterThanOrEquals => {
            compare_numbers(actual, expected, |o| o != Ordering::Less)
        }
        Operator::LessThan => compare_numbers(actual, expected, |o| o == Ordering::Less),
        Operator::LessThanOrEquals => {
            compare_numbers(actual, expected, |o| o != Ordering::Greater)
        }
        Operator::Contains => contains(actual, expected),
        Operator::NotContains => contains(actual, expected).map(|r| !r),
        Operator::MemberOf => member_of(actual, expected, kind),
        Operator::NotMemberOf => member_of(actual, expected, kind).map(|r| !r),
        Operator::StartsWith => Ok(as_text(actual)?.starts_with(&*as_text(expected)?)),
        Operator::EndsWith => Ok(as_text(actual)?.ends_with(&*as_text(expected)?)),
        Operator::Matches => regex_match(actual, expected),
        Operator::Before => compare_temporal(actual, expected, Ordering::Less),
        Operator::After => compare_temporal(actual, expected, Ordering::Greater),
        Operator::IsNull | Operator::IsNotNull => unreachable!("handled above"),
    }
}

fn mismatch(expected: &str, actual: &Value) -> RuleError {
    RuleError::TypeMismatch {
        expected: expected.to_string(),
        actual: value_type_name(actual).to_string(),
    }
}

/// 相等比较
pub(crate) fn values_equal(a: &Value, b: &Value, kind: ValueKind) -> Result<bool> {
    match kind {
        ValueKind::Number => Ok(numbers_equal(as_number(a)?, as_number(b)?)),
        ValueKind::Boolean => Ok(as_bool(a)? == as_bool(b)?),
        ValueKind::String => Ok(as_text(a)? == as_text(b)?),
        ValueKind::Temporal => match (parse_temporal(a), parse_temporal(b)) {
            (Ok(x), Ok(y)) => Ok(x.cmp_same_kind(&y) == Some(Ordering::Equal)),
            _ => Ok(as_text(a)? == as_text(b)?),
        },
        ValueKind::Array | ValueKind::Object => Ok(a == b),
        ValueKind::Any => {
            if a.is_number() || b.is_number() {
                // 数值统一转为浮点数，避免 100 与 100.0 比较失败
                match (as_number(a), as_number(b)) {
                    (Ok(x), Ok(y)) => Ok(numbers_equal(x, y)),
                    _ => Ok(false),
                }
            } else if a.is_boolean() || b.is_boolean() {
                match (as_bool(a), as_bool(b)) {
                    (Ok(x), Ok(y)) => Ok(x == y),
                    _ => Ok(false),
                }
            } else {
                Ok(a == b)
            }
        }
    }
}

fn numbers_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < f64::EPSILON
}

fn compare_numbers(actual: &Value, expected: &Value, accept: impl Fn(Ordering) -> bool) -> Result<bool> {
    let a = as_number(actual)?;
    let b = as_number(expected)?;
    Ok(a.partial_cmp(&b).is_some_and(accept))
}

/// 字符串包含子串，或数组包含元素
fn contains(actual: &Value, expected: &Value) -> Result<bool> {
    match actual {
        Value::String(s) => Ok(s.contains(&*as_text(expected)?)),
        Value::Array(items) => {
            for item in items {
                if values_equal(item, expected, ValueKind::Any)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(mismatch("string or array", other)),
    }
}

/// 实际值属于给定集合（数组元素或字符串子串）
fn member_of(actual: &Value, expected: &Value, kind: ValueKind) -> Result<bool> {
    match expected {
        Value::Array(items) => {
            let kind = if kind == ValueKind::Array { ValueKind::Any } else { kind };
            for item in items {
                if values_equal(actual, item, kind).unwrap_or(false) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::String(s) => Ok(s.contains(&*as_text(actual)?)),
        other => Err(mismatch("array or string", other)),
    }
}

fn regex_match(actual: &Value, expected: &Value) -> Result<bool> {
    let text = as_text(actual)?;
    let pattern = expected.as_str().ok_or_else(|| mismatch("string", expected))?;
    with_regex(pattern, |re| re.is_match(&text))
}

/// 使用缓存的整值匹配正则
pub(crate) fn with_regex<T>(pattern: &str, f: impl FnOnce(&Regex) -> T) -> Result<T> {
    if let Some(re) = REGEX_CACHE.get(pattern) {
        return Ok(f(re.value()));
    }

    let re = compile_anchored(pattern)?;
    let out = f(&re);
    if REGEX_CACHE.len() >= REGEX_CACHE_LIMIT {
        REGEX_CACHE.clear();
    }
    REGEX_CACHE.insert(pattern.to_string(), re);
    Ok(out)
}

/// 编译锚定到整个值的正则
pub(crate) fn compile_anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| RuleError::InvalidValue {
        path: pattern.to_string(),
        message: format!("正则表达式无效: {}", e),
    })
}

fn compare_temporal(actual: &Value, expected: &Value, want: Ordering) -> Result<bool> {
    let a = parse_temporal(actual)?;
    let b = parse_temporal(expected)?;
    a.cmp_same_kind(&b)
        .map(|o| o == want)
        .ok_or_else(|| mismatch("matching temporal kind", expected))
}

/// 转为数值（数字字符串也接受）
pub(crate) fn as_number(value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| mismatch("number", value)),
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| mismatch("number", value)),
        other => Err(mismatch("number", other)),
    }
}

fn as_bool(value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) if s == "true" => Ok(true),
        Value::String(s) if s == "false" => Ok(false),
        other => Err(mismatch("boolean", other)),
    }
}

/// 标量转为文本
pub(crate) fn as_text(value: &Value) -> Result<Cow<'_, str>> {
    match value {
        Value::String(s) => Ok(Cow::Borrowed(s)),
        Value::Number(n) => Ok(Cow::Owned(n.to_string())),
        Value::Bool(b) => Ok(Cow::Owned(b.to_string())),
        other => Err(mismatch("string", other)),
    }
}

/// 时间值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temporal {
    Instant(DateTime<Utc>),
    Time(NaiveTime),
}

impl Temporal {
    /// 只比较同类时间值
    pub fn cmp_same_kind(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Instant(a), Self::Instant(b)) => Some(a.cmp(b)),
            (Self::Time(a), Self::Time(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// 按格式输出
    pub fn render(&self, format: Option<TemporalFormat>) -> String {
        match (self, format) {
            (Self::Instant(t), Some(TemporalFormat::Date)) => t.format("%Y-%m-%d").to_string(),
            (Self::Instant(t), _) => t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            (Self::Time(t), _) => t.format("%H:%M:%S").to_string(),
        }
    }
}

/// 解析时间值：RFC3339、无时区日期时间、`YYYY-MM-DD`、`HH:MM[:SS]` 或毫秒时间戳
pub fn parse_temporal(value: &Value) -> Result<Temporal> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(t) = DateTime::parse_from_rfc3339(s) {
                return Ok(Temporal::Instant(t.with_timezone(&Utc)));
            }
            for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
                if let Ok(t) = NaiveDateTime::parse_from_str(s, format) {
                    return Ok(Temporal::Instant(t.and_utc()));
                }
            }
            if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return Ok(Temporal::Instant(d.and_time(NaiveTime::MIN).and_utc()));
            }
            for format in ["%H:%M:%S", "%H:%M"] {
                if let Ok(t) = NaiveTime::parse_from_str(s, format) {
                    return Ok(Temporal::Time(t));
                }
            }
            Err(mismatch("date/time string", value))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(Temporal::Instant)
            .ok_or_else(|| mismatch("epoch millis", value)),
        other => Err(mismatch("date/time string", other)),
    }
}
