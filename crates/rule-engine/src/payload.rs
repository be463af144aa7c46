//! 匹配载荷生成
//!
//! 根据编译后规则的条件求解出一个能命中该规则的最小事实对象：
//! 先按字段路径收集约束，再为每个路径生成候选值并逐一检验，
//! 第一个满足该路径全部约束的候选值胜出。
//!
//! 约束互相冲突或无法求解（如找不到满足 matches 的字面值）时返回
//! [`RuleError::Unsatisfiable`]，不会返回错误的数据。生成结果在返回前
//! 用带类型的评估器再校验一次。

use crate::action::coerce;
use crate::compiler::CompiledRule;
use crate::error::{Result, RuleError};
use crate::evaluator::{
    ConditionEvaluator, Temporal, ValueKind, as_number, as_text, compare, parse_temporal,
};
use crate::models::{Condition, ConditionGroup};
use crate::operators::{LogicalOperator, Operator};
use crate::path::FieldPath;
use crate::schema::{PropertyType, Schema, SchemaProperty, TemporalFormat};
use chrono::TimeDelta;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, instrument};

/// 数值候选值在基准值两侧的探测步数
const NUMERIC_PROBES: i32 = 8;

/// 字符串排除值的替代候选数
const STRING_VARIANTS: usize = 4;

/// 匹配载荷生成器
pub struct MatchPayloadGenerator;

impl MatchPayloadGenerator {
    /// 生成能命中规则的事实
    #[instrument(skip_all, fields(rule_id = %rule.rule_id, schema = %schema.id))]
    pub fn generate(rule: &CompiledRule, schema: &Schema) -> Result<Value> {
        let mut constraints = ConstraintSet::default();
        constraints.collect_group(schema, &rule.predicate)?;

        let payload = constraints.solve()?;

        if !ConditionEvaluator::for_schema(schema).evaluate(&rule.predicate, &payload) {
            return Err(RuleError::Unsatisfiable(format!(
                "规则 {} 的条件组合无法同时满足",
                rule.rule_id
            )));
        }

        debug!(fields = constraints.paths.len(), "匹配载荷已生成");
        Ok(payload)
    }
}

/// 字面值约束
#[derive(Debug, Clone)]
struct Constraint {
    operator: Operator,
    value: Value,
}

/// 单个路径上的全部约束
#[derive(Debug, Clone)]
struct PathConstraints<'s> {
    path: FieldPath,
    property: &'s SchemaProperty,
    literals: Vec<Constraint>,
    /// 与同一事实上另一字段比较
    references: Vec<(Operator, FieldPath)>,
}

impl<'s> PathConstraints<'s> {
    fn new(path: FieldPath, property: &'s SchemaProperty) -> Self {
        Self {
            path,
            property,
            literals: Vec::new(),
            references: Vec::new(),
        }
    }

    fn kind(&self) -> ValueKind {
        ValueKind::of_property(self.property)
    }

    /// 引用字段都已求解时，把引用约束展开为字面值约束
    fn expand(&self, solved: &HashMap<String, Value>) -> Option<Vec<Constraint>> {
        let mut constraints = self.literals.clone();
        for (operator, other) in &self.references {
            let value = solved.get(other.as_str())?;
            constraints.push(Constraint {
                operator: *operator,
                value: value.clone(),
            });
        }
        Some(constraints)
    }

    fn solve(&self, constraints: &[Constraint]) -> Result<Value> {
        self.candidates(constraints)
            .into_iter()
            .find(|candidate| self.admits(candidate, constraints))
            .ok_or_else(|| self.conflict(constraints))
    }

    /// 候选值是否满足该路径的全部约束
    fn admits(&self, candidate: &Value, constraints: &[Constraint]) -> bool {
        // `[]` 路径只生成一个元素，每个约束都要由这个元素满足
        let kind = self.kind();
        constraints
            .iter()
            .all(|c| compare(Some(candidate), c.operator, &c.value, kind).unwrap_or(false))
    }

    fn conflict(&self, constraints: &[Constraint]) -> RuleError {
        let described: Vec<String> = constraints
            .iter()
            .map(|c| format!("{} {}", c.operator, c.value))
            .collect();

        if constraints.iter().any(|c| c.operator == Operator::Matches) {
            RuleError::Unsatisfiable(format!(
                "字段 {} 找不到满足 [{}] 的字面值",
                self.path,
                described.join(", ")
            ))
        } else {
            RuleError::Unsatisfiable(format!(
                "字段 {} 的约束相互冲突: [{}]",
                self.path,
                described.join(", ")
            ))
        }
    }

    fn candidates(&self, constraints: &[Constraint]) -> Vec<Value> {
        let has = |op: Operator| constraints.iter().any(|c| c.operator == op);
        let property_type = self.property.property_type;

        if has(Operator::IsNull) {
            return vec![Value::Null];
        }

        // 等值直接确定取值
        let equals: Vec<Value> = constraints
            .iter()
            .filter(|c| c.operator == Operator::Equals)
            .map(|c| coerce(property_type, &c.value))
            .collect();
        if !equals.is_empty() {
            return equals;
        }

        let mut out = Vec::new();
        for c in constraints.iter().filter(|c| c.operator == Operator::MemberOf) {
            match &c.value {
                Value::Array(items) => out.extend(items.iter().map(|v| coerce(property_type, v))),
                Value::String(s) => out.push(Value::String(s.clone())),
                _ => {}
            }
        }

        if has(Operator::Before) || has(Operator::After) {
            out.extend(self.temporal_candidates(constraints));
            return out;
        }

        match self.kind() {
            ValueKind::Number => out.extend(self.numeric_candidates(constraints)),
            ValueKind::String | ValueKind::Temporal => {
                out.extend(self.string_candidates(constraints))
            }
            ValueKind::Boolean => {
                out.push(self.property.sample_value());
                out.extend([Value::Bool(true), Value::Bool(false)]);
            }
            ValueKind::Array => {
                let items: Vec<Value> = constraints
                    .iter()
                    .filter(|c| c.operator == Operator::Contains)
                    .map(|c| match self.property.items.as_deref() {
                        Some(item) => coerce(item.property_type, &c.value),
                        None => c.value.clone(),
                    })
                    .collect();
                out.push(Value::Array(items));
                out.push(self.property.sample_value());
            }
            ValueKind::Object | ValueKind::Any => out.push(self.property.sample_value()),
        }
        out
    }

    /// 数值：按上下界取值（integer ±1，number ±1 或区间中点），再向两侧探测
    fn numeric_candidates(&self, constraints: &[Constraint]) -> Vec<Value> {
        let integer = self.property.property_type == PropertyType::Integer;
        let mut lower: Option<Bound> = None;
        let mut upper: Option<Bound> = None;

        for c in constraints {
            let Ok(value) = as_number(&c.value) else {
                continue;
            };
            match c.operator {
                Operator::GreaterThan => tighten(&mut lower, Bound::new(value, false), Ordering::Greater),
                Operator::GreaterThanOrEquals => {
                    tighten(&mut lower, Bound::new(value, true), Ordering::Greater)
                }
                Operator::LessThan => tighten(&mut upper, Bound::new(value, false), Ordering::Less),
                Operator::LessThanOrEquals => {
                    tighten(&mut upper, Bound::new(value, true), Ordering::Less)
                }
                _ => {}
            }
        }

        let base = match (lower, upper) {
            (Some(lo), _) => match (lo.inclusive, integer) {
                (true, true) => lo.value.ceil(),
                (true, false) => lo.value,
                (false, true) => lo.value.floor() + 1.0,
                (false, false) => lo.value + 1.0,
            },
            (None, Some(hi)) => match (hi.inclusive, integer) {
                (true, true) => hi.value.floor(),
                (true, false) => hi.value,
                (false, true) => hi.value.ceil() - 1.0,
                (false, false) => hi.value - 1.0,
            },
            (None, None) => as_number(&self.property.sample_value()).unwrap_or(100.0),
        };

        let mut values = vec![base];
        if let (Some(lo), Some(hi), false) = (lower, upper, integer) {
            values.push((lo.value + hi.value) / 2.0);
            for k in 1..NUMERIC_PROBES {
                values.push(lo.value + (hi.value - lo.value) * f64::from(k) / f64::from(NUMERIC_PROBES));
            }
        }
        for step in 1..=NUMERIC_PROBES {
            values.push(base + f64::from(step));
            values.push(base - f64::from(step));
        }

        values
            .into_iter()
            .filter_map(|v| number_value(v, integer))
            .collect()
    }

    /// 字符串：由 startsWith / contains / endsWith 拼出，再补充默认值、枚举和正则字面值
    fn string_candidates(&self, constraints: &[Constraint]) -> Vec<Value> {
        let texts = |op: Operator| -> Vec<String> {
            constraints
                .iter()
                .filter(|c| c.operator == op)
                .filter_map(|c| as_text(&c.value).ok().map(|t| t.into_owned()))
                .collect()
        };
        let longest = |items: Vec<String>| items.into_iter().max_by_key(String::len).unwrap_or_default();

        let prefix = longest(texts(Operator::StartsWith));
        let suffix = longest(texts(Operator::EndsWith));
        let mut body = prefix;
        for part in texts(Operator::Contains) {
            if !body.contains(&part) {
                body.push_str(&part);
            }
        }

        let sample = self.property.sample_value();
        let mut out = Vec::new();
        let base = if body.is_empty() && suffix.is_empty() {
            as_text(&sample)
                .map(|t| t.into_owned())
                .unwrap_or_else(|_| "sample_value".to_string())
        } else {
            let composed = if body.ends_with(&suffix) {
                body.clone()
            } else {
                format!("{}{}", body, suffix)
            };
            out.push(Value::String(composed));
            body.clone()
        };

        out.push(sample);
        out.extend(self.property.enum_values.iter().cloned());
        for i in 1..=STRING_VARIANTS {
            out.push(Value::String(format!("{}_{}{}", base, i, suffix)));
        }

        for pattern in texts(Operator::Matches) {
            out.extend(regex_literals(&pattern).into_iter().map(Value::String));
        }
        out
    }

    /// 时间：after +1 天、before -1 天，两者都有时再取中点
    fn temporal_candidates(&self, constraints: &[Constraint]) -> Vec<Value> {
        let mut after: Option<Temporal> = None;
        let mut before: Option<Temporal> = None;
        let mut format = self.property.temporal_format();

        for c in constraints {
            let Ok(t) = parse_temporal(&c.value) else {
                continue;
            };
            match c.operator {
                Operator::After => after = Some(pick(after, t, Ordering::Greater)),
                Operator::Before => before = Some(pick(before, t, Ordering::Less)),
                _ => continue,
            }
            if format.is_none() && c.value.as_str().is_some_and(|s| s.trim().len() == 10) {
                format = Some(TemporalFormat::Date);
            }
        }

        let mut points = Vec::new();
        match (after, before) {
            (Some(lo), Some(hi)) => {
                points.push(shift(lo, 1));
                points.extend(midpoint(lo, hi));
            }
            (Some(lo), None) => points.push(shift(lo, 1)),
            (None, Some(hi)) => points.push(shift(hi, -1)),
            (None, None) => return vec![self.property.sample_value()],
        }

        let mut out = Vec::new();
        for point in points {
            out.push(Value::String(point.render(format)));
            // 按日期输出可能落在边界上，退回完整时间戳
            out.push(Value::String(point.render(None)));
        }
        out
    }
}

#[derive(Debug, Clone, Copy)]
struct Bound {
    value: f64,
    inclusive: bool,
}

impl Bound {
    fn new(value: f64, inclusive: bool) -> Self {
        Self { value, inclusive }
    }
}

/// 保留更紧的边界：`tighter` 为 Greater 表示下界，Less 表示上界
fn tighten(slot: &mut Option<Bound>, bound: Bound, tighter: Ordering) {
    let replace = match slot {
        None => true,
        Some(current) => match bound.value.partial_cmp(&current.value) {
            Some(o) if o == tighter => true,
            Some(Ordering::Equal) => current.inclusive && !bound.inclusive,
            _ => false,
        },
    };
    if replace {
        *slot = Some(bound);
    }
}

fn pick(current: Option<Temporal>, candidate: Temporal, tighter: Ordering) -> Temporal {
    match current {
        Some(existing) if existing.cmp_same_kind(&candidate) != Some(tighter.reverse()) => existing,
        _ => candidate,
    }
}

fn shift(point: Temporal, direction: i64) -> Temporal {
    match point {
        Temporal::Instant(t) => Temporal::Instant(t + TimeDelta::days(direction)),
        Temporal::Time(t) => Temporal::Time(t.overflowing_add_signed(TimeDelta::hours(direction)).0),
    }
}

fn midpoint(lo: Temporal, hi: Temporal) -> Option<Temporal> {
    match (lo, hi) {
        (Temporal::Instant(a), Temporal::Instant(b)) => Some(Temporal::Instant(a + (b - a) / 2)),
        (Temporal::Time(a), Temporal::Time(b)) => Some(Temporal::Time(
            a.overflowing_add_signed(b.signed_duration_since(a) / 2).0,
        )),
        _ => None,
    }
}

/// 整数值输出为 JSON 整数，其余输出浮点数
fn number_value(value: f64, integer: bool) -> Option<Value> {
    if !value.is_finite() {
        return None;
    }
    if (integer || value.fract() == 0.0) && value.abs() < 9.0e15 {
        return Some(Value::from(value.round() as i64));
    }
    serde_json::Number::from_f64(value).map(Value::Number)
}

/// 正则中可以直接作为字面值尝试的片段：整个模式、顶层分支以及去掉元字符后的文本
fn regex_literals(pattern: &str) -> Vec<String> {
    let strip = |s: &str| -> String {
        s.chars()
            .filter(|c| !".*+?^${}()|[]\\".contains(*c))
            .collect()
    };

    let mut out = vec![pattern.to_string()];
    let trimmed = pattern.trim_start_matches('^').trim_end_matches('$');
    let inner = trimmed
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(trimmed);
    for branch in inner.split('|') {
        out.push(branch.to_string());
        out.push(strip(branch));
    }
    out.push(strip(pattern));
    out.retain(|s| !s.is_empty());
    out.dedup();
    out
}

/// 按路径归并的约束集合
#[derive(Debug, Clone, Default)]
struct ConstraintSet<'s> {
    paths: BTreeMap<String, PathConstraints<'s>>,
}

impl<'s> ConstraintSet<'s> {
    fn collect_group(&mut self, schema: &'s Schema, group: &ConditionGroup) -> Result<()> {
        match group.operator {
            LogicalOperator::All => {
                // 先收集本组的直接约束，any 子组在此基础上选择分支
                for cond in group.conditions.iter().filter(|c| !c.is_pure_group()) {
                    self.add(schema, cond)?;
                }
                for nested in group.conditions.iter().filter_map(|c| c.nested.as_deref()) {
                    self.collect_group(schema, nested)?;
                }
                Ok(())
            }
            LogicalOperator::Any => {
                if group.conditions.is_empty() {
                    return Err(RuleError::Unsatisfiable("空的 any 组永远不匹配".to_string()));
                }

                let mut last_err = None;
                for cond in &group.conditions {
                    let mut attempt = self.clone();
                    match attempt
                        .collect_condition(schema, cond)
                        .and_then(|_| attempt.solve().map(|_| ()))
                    {
                        Ok(()) => {
                            *self = attempt;
                            return Ok(());
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                Err(last_err.unwrap_or_else(|| {
                    RuleError::Unsatisfiable("any 组中没有可满足的分支".to_string())
                }))
            }
        }
    }

    fn collect_condition(&mut self, schema: &'s Schema, cond: &Condition) -> Result<()> {
        if !cond.is_pure_group() {
            self.add(schema, cond)?;
        }
        if let Some(nested) = &cond.nested {
            self.collect_group(schema, nested)?;
        }
        Ok(())
    }

    fn add(&mut self, schema: &'s Schema, cond: &Condition) -> Result<()> {
        let path = schema.normalize_path(&cond.fact)?;
        let property = schema.resolve_path(&path)?;

        if cond.value_is_field {
            let other = cond.value.as_str().ok_or_else(|| RuleError::InvalidValue {
                path: cond.fact.clone(),
                message: "字段引用必须是字符串路径".to_string(),
            })?;
            let other = schema.normalize_path(other)?;
            let other_property = schema.resolve_path(&other)?;
            // 被引用的字段也要出现在载荷中
            self.entry(other.clone(), other_property);
            self.entry(path, property).references.push((cond.operator, other));
        } else {
            self.entry(path, property).literals.push(Constraint {
                operator: cond.operator,
                value: cond.value.clone(),
            });
        }
        Ok(())
    }

    fn entry(&mut self, path: FieldPath, property: &'s SchemaProperty) -> &mut PathConstraints<'s> {
        self.paths
            .entry(path.as_str().to_string())
            .or_insert_with(|| PathConstraints::new(path, property))
    }

    /// 逐路径求解并写入载荷，字段引用按依赖顺序展开
    fn solve(&self) -> Result<Value> {
        let mut solved: HashMap<String, Value> = HashMap::new();
        let mut pending: Vec<(&String, &PathConstraints<'s>)> = self.paths.iter().collect();

        while !pending.is_empty() {
            let before = pending.len();
            let mut waiting = Vec::new();
            for (key, constraints) in pending {
                match constraints.expand(&solved) {
                    Some(expanded) => {
                        let value = constraints.solve(&expanded)?;
                        solved.insert(key.clone(), value);
                    }
                    None => waiting.push((key, constraints)),
                }
            }
            if waiting.len() == before {
                return Err(RuleError::Unsatisfiable(format!(
                    "字段引用存在循环: {}",
                    waiting
                        .iter()
                        .map(|(k, _)| k.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
            pending = waiting;
        }

        // 父路径先写入，子路径再写入其中
        let mut ordered: Vec<&PathConstraints<'s>> = self.paths.values().collect();
        ordered.sort_by_key(|c| c.path.segments().len());

        let mut payload = Value::Object(Map::new());
        for constraints in ordered {
            if let Some(value) = solved.remove(constraints.path.as_str()) {
                constraints.path.set_creating(&mut payload, value)?;
            }
        }
        Ok(payload)
    }
}
