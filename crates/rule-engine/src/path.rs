//! 字段路径
//!
//! 支持 `a.b.c`、`a[].b`（数组每个元素）、`a[0].b` 以及 `a.0.b` 形式的索引访问。

use crate::error::{Result, RuleError};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::fmt;

/// 路径中允许的最大数组下标，写入时缺少的元素以 null 补齐
pub const MAX_ARRAY_INDEX: usize = 1024;

/// 路径片段
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Field(String),
    Index(usize),
    /// `[]`，数组中的每个元素
    Each,
}

/// 解析后的字段路径
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || RuleError::InvalidRule(format!("无效的字段路径: '{}'", raw));
        let index = |text: &str| -> Result<Segment> {
            match text.parse::<usize>() {
                Ok(i) if i <= MAX_ARRAY_INDEX => Ok(Segment::Index(i)),
                Ok(i) => Err(RuleError::InvalidRule(format!(
                    "字段路径 '{}' 的下标 {} 超过上限 {}",
                    raw, i, MAX_ARRAY_INDEX
                ))),
                Err(_) => Err(invalid()),
            }
        };

        if raw.trim().is_empty() {
            return Err(invalid());
        }

        let mut segments = Vec::new();
        for part in raw.split('.') {
            let (name, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };

            if name.is_empty() {
                // 只允许 `[0]` 紧跟在前一个片段之后，不允许空字段名
                if rest.is_empty() || segments.is_empty() {
                    return Err(invalid());
                }
            } else if name.chars().all(|c| c.is_ascii_digit()) && !segments.is_empty() {
                segments.push(index(name)?);
            } else {
                segments.push(Segment::Field(name.to_string()));
            }

            while !rest.is_empty() {
                let close = rest.find(']').ok_or_else(invalid)?;
                let inner = &rest[1..close];
                if inner.is_empty() {
                    segments.push(Segment::Each);
                } else {
                    segments.push(index(inner)?);
                }
                rest = &rest[close + 1..];
                if !rest.is_empty() && !rest.starts_with('[') {
                    return Err(invalid());
                }
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn has_each(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Each))
    }

    /// 去掉以类型名开头的前缀（如 `Order.amount` -> `amount`）
    pub fn without_prefix(&self, prefix: &str) -> Option<Self> {
        match self.segments.first() {
            Some(Segment::Field(first)) if first == prefix && self.segments.len() > 1 => {
                let raw = self.raw[prefix.len()..].trim_start_matches('.').to_string();
                Some(Self {
                    raw,
                    segments: self.segments[1..].to_vec(),
                })
            }
            _ => None,
        }
    }

    /// 读取路径上的值
    ///
    /// 包含 `[]` 时返回收集到的数组；路径不存在返回 None。
    pub fn lookup<'a>(&self, root: &'a Value) -> Option<Cow<'a, Value>> {
        walk(root, &self.segments)
    }

    /// 写入已存在的路径，不创建中间对象
    ///
    /// 最后一级字段可以不存在，但它的父对象必须存在。
    pub fn set_existing(&self, root: &mut Value, value: Value) -> Result<()> {
        let missing = || RuleError::ExecutionError(format!("目标路径不存在: {}", self.raw));

        let (last, parents) = self.segments.split_last().ok_or_else(missing)?;
        let mut current = root;
        for segment in parents {
            current = match segment {
                Segment::Field(name) => current.as_object_mut().and_then(|m| m.get_mut(name)),
                Segment::Index(i) => current.as_array_mut().and_then(|a| a.get_mut(*i)),
                Segment::Each => None,
            }
            .ok_or_else(missing)?;
        }

        match last {
            Segment::Field(name) => {
                let map = current.as_object_mut().ok_or_else(missing)?;
                map.insert(name.clone(), value);
            }
            Segment::Index(i) => {
                let slot = current
                    .as_array_mut()
                    .and_then(|a| a.get_mut(*i))
                    .ok_or_else(missing)?;
                *slot = value;
            }
            Segment::Each => return Err(missing()),
        }
        Ok(())
    }

    /// 写入路径，按需创建中间对象和数组（`[]` 视为第一个元素）
    pub fn set_creating(&self, root: &mut Value, value: Value) -> Result<()> {
        set_creating(root, &self.segments, value)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

fn walk<'a>(current: &'a Value, segments: &[Segment]) -> Option<Cow<'a, Value>> {
    let Some((segment, rest)) = segments.split_first() else {
        return Some(Cow::Borrowed(current));
    };

    match segment {
        Segment::Field(name) => walk(current.as_object()?.get(name)?, rest),
        Segment::Index(i) => walk(current.as_array()?.get(*i)?, rest),
        Segment::Each => {
            let items = current
                .as_array()?
                .iter()
                .filter_map(|item| walk(item, rest).map(Cow::into_owned))
                .collect();
            Some(Cow::Owned(Value::Array(items)))
        }
    }
}

fn set_creating(current: &mut Value, segments: &[Segment], value: Value) -> Result<()> {
    let Some((segment, rest)) = segments.split_first() else {
        *current = value;
        return Ok(());
    };

    match segment {
        Segment::Field(name) => {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            match current {
                Value::Object(map) => {
                    let child = map.entry(name.clone()).or_insert(Value::Null);
                    set_creating(child, rest, value)
                }
                _ => Ok(()),
            }
        }
        Segment::Index(_) | Segment::Each => {
            let index = match segment {
                Segment::Index(i) => *i,
                _ => 0,
            };
            if index > MAX_ARRAY_INDEX {
                return Err(RuleError::ExecutionError(format!(
                    "数组下标 {} 超过上限 {}",
                    index, MAX_ARRAY_INDEX
                )));
            }
            if !current.is_array() {
                *current = Value::Array(Vec::new());
            }
            match current {
                Value::Array(items) => {
                    if items.len() <= index {
                        items.resize(index + 1, Value::Null);
                    }
                    set_creating(&mut items[index], rest, value)
                }
                _ => Ok(()),
            }
        }
    }
}
