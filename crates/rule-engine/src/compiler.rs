//! 规则编译器
//!
//! 校验规则的条件/动作模型是否与输入、输出 Schema 一致，并生成可执行的编译产物。
//! 编译是确定性的：模型和 Schema 版本不变时，重复编译得到相等的 [`CompiledRule`]。

use crate::drl::DrlRenderer;
use crate::error::{Result, RuleError};
use crate::evaluator::{Temporal, as_number, as_text, compile_anchored, parse_temporal};
use crate::models::{ActionType, Condition, ConditionGroup, Rule, RuleAction, RuleSet};
use crate::operators::Operator;
use crate::path::FieldPath;
use crate::schema::{PropertyType, Schema, SchemaProperty, SchemaRegistry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;

/// 规则生效时间窗口
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveWindow {
    pub effective: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
}

impl EffectiveWindow {
    /// `effective <= now < expires`
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.effective.is_none_or(|e| now >= e) && self.expires.is_none_or(|x| now < x)
    }
}

/// 编译后的规则
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledRule {
    pub rule_id: String,
    pub name: String,
    pub project_id: String,
    pub schema_id: String,
    /// 匹配的事实类型（输入 Schema 名称）
    pub fact_type: String,
    pub predicate: ConditionGroup,
    pub effects: Vec<RuleAction>,
    pub priority: i32,
    pub activation_group: Option<String>,
    pub lock_on_active: bool,
    /// 规则自身的 MODIFY 不会再次激活自己
    pub no_loop: bool,
    pub effective_window: EffectiveWindow,
    /// 条件中引用的所有字段路径
    pub required_fields: BTreeSet<String>,
    /// 规则模型 + Schema 版本的 SHA-256
    pub fingerprint: String,
    /// 渲染出的 DRL 文本
    pub drl: String,
}

impl CompiledRule {
    pub fn id(&self) -> &str {
        &self.rule_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.effective_window.contains(now)
    }
}

/// 编译上下文：规则集以及解析好的输入、输出 Schema
#[derive(Debug, Clone)]
pub struct CompileContext<'a> {
    pub rule_set: &'a RuleSet,
    pub input_schema: Arc<Schema>,
    /// 规则集未声明输出 Schema 时为输入 Schema
    pub output_schemas: Vec<Arc<Schema>>,
}

impl<'a> CompileContext<'a> {
    pub fn new(
        rule_set: &'a RuleSet,
        input_schema: Arc<Schema>,
        output_schemas: Vec<Arc<Schema>>,
    ) -> Self {
        let output_schemas = if output_schemas.is_empty() {
            vec![input_schema.clone()]
        } else {
            output_schemas
        };
        Self {
            rule_set,
            input_schema,
            output_schemas,
        }
    }

    /// 从注册表解析规则的输入 Schema 和规则集的输出 Schema
    pub fn resolve(registry: &SchemaRegistry, rule_set: &'a RuleSet, rule: &Rule) -> Result<Self> {
        let input_schema = registry.get(&rule.schema_id)?;
        let output_schemas = rule_set
            .output_schema_ids
            .iter()
            .map(|id| registry.get(id))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(rule_set, input_schema, output_schemas))
    }

    /// 按名称或 ID 查找输出 Schema
    pub fn find_output(&self, fact_type: &str) -> Option<&Arc<Schema>> {
        self.output_schemas
            .iter()
            .find(|s| s.name == fact_type || s.id == fact_type)
    }

    /// 在输出 Schema 中解析 MODIFY 目标路径
    fn resolve_output(&self, raw: &str) -> Result<&SchemaProperty> {
        let mut first_err = None;
        for schema in &self.output_schemas {
            match schema.resolve(raw) {
                Ok(property) => return Ok(property),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        Err(first_err.unwrap_or_else(|| RuleError::PathNotFound {
            schema: self.input_schema.id.clone(),
            path: raw.to_string(),
        }))
    }
}

/// 规则编译器
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleCompiler;

impl RuleCompiler {
    pub fn new() -> Self {
        Self
    }

    /// 从 JSON 字符串编译规则
    pub fn compile_from_json(&self, json: &str, ctx: &CompileContext<'_>) -> Result<CompiledRule> {
        let rule: Rule = serde_json::from_str(json)?;
        self.compile(&rule, ctx)
    }

    /// 编译规则
    ///
    /// 先做校验（失败为 Validation 类错误），再处理时间窗口和动作类型限制
    /// （失败为 [`RuleError::CompileError`]）。
    pub fn compile(&self, rule: &Rule, ctx: &CompileContext<'_>) -> Result<CompiledRule> {
        self.validate(rule, ctx)?;

        let compile_error = |message: String| RuleError::CompileError {
            rule_id: rule.id.clone(),
            message,
        };

        for action in &rule.actions {
            let action_type = action.action_type();
            if !ctx.rule_set.allows(action_type) {
                return Err(compile_error(format!(
                    "规则集 {} 不允许 {} 动作",
                    ctx.rule_set.id, action_type
                )));
            }
        }

        let effective_window = Self::effective_window(rule).map_err(compile_error)?;

        let mut compiled = CompiledRule {
            rule_id: rule.id.clone(),
            name: rule.name.clone(),
            project_id: rule.project_id.clone(),
            schema_id: rule.schema_id.clone(),
            fact_type: ctx.input_schema.name.clone(),
            predicate: rule.conditions.clone(),
            effects: rule.actions.clone(),
            priority: rule.priority,
            activation_group: rule
                .activation_group
                .clone()
                .or_else(|| ctx.rule_set.activation_group.clone()),
            lock_on_active: rule.lock_on_active || ctx.rule_set.lock_on_active.unwrap_or(false),
            no_loop: rule
                .actions
                .iter()
                .any(|a| a.action_type() == ActionType::Modify),
            effective_window,
            required_fields: Self::extract_fields(&rule.conditions, &ctx.input_schema),
            fingerprint: Self::fingerprint(rule, ctx),
            drl: String::new(),
        };
        compiled.drl = DrlRenderer::render(&compiled);

        Ok(compiled)
    }

    /// 只做校验，不生成产物
    pub fn validate(&self, rule: &Rule, ctx: &CompileContext<'_>) -> Result<()> {
        if rule.id.is_empty() {
            return Err(RuleError::InvalidRule("规则 ID 不能为空".to_string()));
        }
        if rule.name.is_empty() {
            return Err(RuleError::InvalidRule("规则名称不能为空".to_string()));
        }
        if !ctx.rule_set.input_schema_ids.is_empty()
            && !ctx.rule_set.input_schema_ids.contains(&rule.schema_id)
        {
            return Err(RuleError::InvalidRule(format!(
                "Schema {} 不是规则集 {} 的输入 Schema",
                rule.schema_id, ctx.rule_set.id
            )));
        }

        self.validate_group(&rule.conditions, &ctx.input_schema, "conditions")?;

        for (i, action) in rule.actions.iter().enumerate() {
            self.validate_action(action, ctx, &format!("actions[{}]", i))?;
        }
        Ok(())
    }

    /// 计算规则模型指纹
    ///
    /// 只包含影响编译产物的字段，启用状态、描述和时间戳不参与。
    pub fn fingerprint(rule: &Rule, ctx: &CompileContext<'_>) -> String {
        let schemas: Vec<Value> = std::iter::once(&ctx.input_schema)
            .chain(ctx.output_schemas.iter())
            .map(|s| json!([s.id, s.version]))
            .collect();

        let canonical = json!({
            "id": rule.id,
            "name": rule.name,
            "schemaId": rule.schema_id,
            "projectId": rule.project_id,
            "priority": rule.priority,
            "conditions": rule.conditions,
            "actions": rule.actions,
            "activationGroup": rule.activation_group,
            "lockOnActive": rule.lock_on_active,
            "dateEffective": rule.date_effective,
            "dateExpires": rule.date_expires,
            "ruleSet": {
                "allowedOutputTypes": ctx.rule_set.allowed_output_types,
                "activationGroup": ctx.rule_set.activation_group,
                "lockOnActive": ctx.rule_set.lock_on_active,
            },
            "schemas": schemas,
        });

        format!("{:x}", Sha256::digest(canonical.to_string().as_bytes()))
    }

    fn effective_window(rule: &Rule) -> std::result::Result<EffectiveWindow, String> {
        let parse = |raw: &Option<String>, label: &str| -> std::result::Result<Option<DateTime<Utc>>, String> {
            match raw.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                None => Ok(None),
                Some(s) => match parse_temporal(&Value::String(s.to_string())) {
                    Ok(Temporal::Instant(t)) => Ok(Some(t)),
                    _ => Err(format!("{} 无法解析: {}", label, s)),
                },
            }
        };

        let window = EffectiveWindow {
            effective: parse(&rule.date_effective, "dateEffective")?,
            expires: parse(&rule.date_expires, "dateExpires")?,
        };

        if let (Some(e), Some(x)) = (window.effective, window.expires) {
            if x <= e {
                return Err(format!("dateExpires ({}) 必须晚于 dateEffective ({})", x, e));
            }
        }
        Ok(window)
    }

    fn validate_group(&self, group: &ConditionGroup, schema: &Schema, label: &str) -> Result<()> {
        for (i, cond) in group.conditions.iter().enumerate() {
            self.validate_condition(cond, schema, &format!("{}[{}]", label, i))?;
        }
        Ok(())
    }

    fn validate_condition(&self, cond: &Condition, schema: &Schema, label: &str) -> Result<()> {
        if !cond.is_pure_group() {
            if cond.fact.trim().is_empty() {
                return Err(RuleError::InvalidRule(format!(
                    "条件 '{}' 的字段不能为空",
                    label
                )));
            }

            let property = schema.resolve(&cond.fact)?;
            if !cond.operator.applies_to(property.property_type) {
                return Err(RuleError::InvalidOperator {
                    operator: cond.operator.to_string(),
                    property_type: property.property_type.to_string(),
                });
            }

            if !cond.operator.is_unary() {
                self.validate_operand(cond, property, schema, label)?;
            }
        }

        if let Some(nested) = &cond.nested {
            self.validate_group(nested, schema, &format!("{}.nested", label))?;
        }
        Ok(())
    }

    /// 校验比较值与操作符、属性类型的兼容性
    fn validate_operand(
        &self,
        cond: &Condition,
        property: &SchemaProperty,
        schema: &Schema,
        label: &str,
    ) -> Result<()> {
        let invalid = |message: String| RuleError::InvalidValue {
            path: format!("{} ({})", label, cond.fact),
            message,
        };

        if cond.value_is_field {
            let other = cond
                .value
                .as_str()
                .ok_or_else(|| invalid("字段引用必须是字符串路径".to_string()))?;
            schema.resolve(other)?;
            return Ok(());
        }

        let value = &cond.value;
        if value.is_null() {
            return Err(invalid(format!("{} 操作符缺少比较值", cond.operator)));
        }

        match cond.operator {
            Operator::GreaterThan
            | Operator::GreaterThanOrEquals
            | Operator::LessThan
            | Operator::LessThanOrEquals => {
                as_number(value).map_err(|_| invalid(format!("{} 需要数值", cond.operator)))?;
            }
            Operator::MemberOf | Operator::NotMemberOf => {
                if !value.is_array() && !value.is_string() {
                    return Err(invalid(format!("{} 需要数组或字符串", cond.operator)));
                }
            }
            Operator::Matches => {
                let pattern = value
                    .as_str()
                    .ok_or_else(|| invalid("matches 需要字符串正则".to_string()))?;
                compile_anchored(pattern)?;
            }
            Operator::Before | Operator::After => {
                parse_temporal(value)
                    .map_err(|_| invalid(format!("{} 需要日期或时间", cond.operator)))?;
            }
            Operator::StartsWith | Operator::EndsWith => {
                as_text(value).map_err(|_| invalid(format!("{} 需要字符串", cond.operator)))?;
            }
            Operator::Contains | Operator::NotContains => {
                if property.property_type == PropertyType::String {
                    as_text(value).map_err(|_| invalid(format!("{} 需要字符串", cond.operator)))?;
                }
            }
            Operator::Equals | Operator::NotEquals => {
                if !property.property_type.coercible(value) {
                    return Err(invalid(format!(
                        "比较值与属性类型 {} 不兼容",
                        property.property_type
                    )));
                }
            }
            Operator::IsNull | Operator::IsNotNull => {}
        }
        Ok(())
    }

    fn validate_action(&self, action: &RuleAction, ctx: &CompileContext<'_>, label: &str) -> Result<()> {
        let invalid = |message: String| RuleError::InvalidValue {
            path: label.to_string(),
            message,
        };

        match action {
            RuleAction::Modify(modify) => {
                let path = FieldPath::parse(&modify.target_field)?;
                if path.has_each() {
                    return Err(invalid(format!(
                        "MODIFY 目标不能包含 []: {}",
                        modify.target_field
                    )));
                }
                let property = ctx.resolve_output(&modify.target_field)?;
                check_value(property, &modify.value).map_err(invalid)?;
            }
            RuleAction::Insert(insert) => {
                let schema = ctx.find_output(&insert.fact_type).ok_or_else(|| {
                    invalid(format!(
                        "INSERT 的 factType {} 不在规则集的输出 Schema 中",
                        insert.fact_type
                    ))
                })?;
                for (key, value) in &insert.fact_data {
                    let property = schema.resolve(key)?;
                    check_value(property, value)
                        .map_err(|m| invalid(format!("factData.{}: {}", key, m)))?;
                }
            }
            RuleAction::Retract(retract) => {
                if let Some(fact_type) = &retract.fact_type {
                    let known = ctx.input_schema.name == *fact_type
                        || ctx.input_schema.id == *fact_type
                        || ctx.find_output(fact_type).is_some();
                    if !known {
                        return Err(invalid(format!("RETRACT 的 factType {} 未知", fact_type)));
                    }
                }
            }
            RuleAction::Log(log) => {
                if log.log_message.trim().is_empty() {
                    return Err(invalid("LOG 消息不能为空".to_string()));
                }
            }
            RuleAction::Webhook(webhook) => {
                let url = reqwest::Url::parse(&webhook.webhook_url)
                    .map_err(|e| invalid(format!("Webhook URL 无效: {}", e)))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(invalid(format!("Webhook URL 协议不支持: {}", url.scheme())));
                }
            }
        }
        Ok(())
    }

    /// 提取条件中引用的字段（已去掉类型前缀）
    pub fn extract_fields(group: &ConditionGroup, schema: &Schema) -> BTreeSet<String> {
        let mut fields = BTreeSet::new();
        Self::collect_fields(group, schema, &mut fields);
        fields
    }

    fn collect_fields(group: &ConditionGroup, schema: &Schema, fields: &mut BTreeSet<String>) {
        for cond in &group.conditions {
            if !cond.is_pure_group() {
                if let Ok(path) = schema.normalize_path(&cond.fact) {
                    fields.insert(path.as_str().to_string());
                }
                if cond.value_is_field {
                    if let Some(Ok(path)) = cond.value.as_str().map(|v| schema.normalize_path(v)) {
                        fields.insert(path.as_str().to_string());
                    }
                }
            }
            if let Some(nested) = &cond.nested {
                Self::collect_fields(nested, schema, fields);
            }
        }
    }
}

/// 动作写入值与属性类型的兼容性
fn check_value(property: &SchemaProperty, value: &Value) -> std::result::Result<(), String> {
    if !property.property_type.coercible(value) {
        return Err(format!(
            "值 {} 与属性 {} 的类型 {} 不兼容",
            value, property.path, property.property_type
        ));
    }

    if let (PropertyType::Array, Value::Array(items), Some(item)) =
        (property.property_type, value, property.items.as_deref())
    {
        for element in items {
            if !item.property_type.coercible(element) {
                return Err(format!(
                    "数组元素 {} 与类型 {} 不兼容",
                    element, item.property_type
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConditionGroup, RuleSet};
    use crate::schema::SchemaProperty;

    fn order_schema() -> Arc<Schema> {
        Arc::new(Schema::new(
            "order",
            "Order",
            vec![
                SchemaProperty::new("amount", PropertyType::Number),
                SchemaProperty::new("status", PropertyType::String),
                SchemaProperty::new("email", PropertyType::String),
                SchemaProperty::new("createdAt", PropertyType::String).with_format("date-time"),
                SchemaProperty::array("tags", SchemaProperty::new("tag", PropertyType::String)),
                SchemaProperty::object(
                    "customer",
                    vec![SchemaProperty::new("tier", PropertyType::String)],
                ),
            ],
        ))
    }

    fn risk_schema() -> Arc<Schema> {
        Arc::new(Schema::new(
            "risk",
            "RiskScore",
            vec![
                SchemaProperty::new("riskLevel", PropertyType::String),
                SchemaProperty::new("riskScore", PropertyType::Number).with_default(0),
            ],
        ))
    }

    fn rule_set() -> RuleSet {
        RuleSet::new("p1", "fraud")
            .with_input("order")
            .with_output("order")
            .with_output("risk")
    }

    fn sample_rule() -> Rule {
        Rule::new("large order", "order", "p1")
            .with_id("rule-001")
            .with_priority(10)
            .with_conditions(ConditionGroup::all(vec![
                Condition::new("amount", Operator::GreaterThan, 10000),
                Condition::new("Order.status", Operator::Equals, "OK"),
            ]))
            .with_action(RuleAction::modify("status", "FLAGGED"))
            .with_action(RuleAction::log("large order {amount}"))
    }

    fn compile(rule: &Rule) -> Result<CompiledRule> {
        let rule_set = rule_set();
        let ctx = CompileContext::new(&rule_set, order_schema(), vec![order_schema(), risk_schema()]);
        RuleCompiler::new().compile(rule, &ctx)
    }

    #[test]
    fn test_compile_basic() {
        let compiled = compile(&sample_rule()).unwrap();

        assert_eq!(compiled.id(), "rule-001");
        assert_eq!(compiled.fact_type, "Order");
        assert_eq!(compiled.priority, 10);
        assert!(compiled.no_loop);
        assert!(compiled.required_fields.contains("amount"));
        assert!(compiled.required_fields.contains("status"));
        assert_eq!(compiled.fingerprint.len(), 64);
        assert!(compiled.drl.contains("rule \"large order\""));
    }

    #[test]
    fn test_compile_is_idempotent() {
        let rule = sample_rule();
        let first = compile(&rule).unwrap();
        let second = compile(&rule).unwrap();
        assert_eq!(first, second);

        // 时间戳与启用状态不影响产物
        let mut touched = rule.clone();
        touched.updated_at = Utc::now() + chrono::Duration::days(1);
        touched.enabled = false;
        assert_eq!(compile(&touched).unwrap(), first);
    }

    #[test]
    fn test_fingerprint_tracks_schema_version() {
        let rule = sample_rule();
        let rule_set = rule_set();
        let v1 = CompileContext::new(&rule_set, order_schema(), vec![risk_schema()]);
        let bumped = Arc::new((*order_schema()).clone().with_version("2.0"));
        let v2 = CompileContext::new(&rule_set, bumped, vec![risk_schema()]);

        assert_ne!(
            RuleCompiler::fingerprint(&rule, &v1),
            RuleCompiler::fingerprint(&rule, &v2)
        );
    }

    #[test]
    fn test_unresolvable_path_rejected() {
        let rule = sample_rule().with_conditions(ConditionGroup::all(vec![Condition::new(
            "customer.email",
            Operator::Equals,
            "x",
        )]));
        let err = compile(&rule).unwrap_err();
        assert!(matches!(err, RuleError::PathNotFound { .. }));
        assert!(err.is_validation());
    }

    #[test]
    fn test_operator_type_mismatch_rejected() {
        let rule = sample_rule().with_conditions(ConditionGroup::all(vec![Condition::new(
            "status",
            Operator::GreaterThan,
            5,
        )]));
        assert!(matches!(
            compile(&rule).unwrap_err(),
            RuleError::InvalidOperator { .. }
        ));

        let rule = sample_rule().with_conditions(ConditionGroup::all(vec![Condition::new(
            "amount",
            Operator::StartsWith,
            "1",
        )]));
        assert!(compile(&rule).is_err());
    }

    #[test]
    fn test_invalid_literals_rejected() {
        let cases = vec![
            Condition::new("amount", Operator::GreaterThan, "lots"),
            Condition::new("email", Operator::Matches, "[invalid"),
            Condition::new("createdAt", Operator::Before, "yesterday"),
            Condition::new("status", Operator::MemberOf, 5),
            Condition::new("amount", Operator::Equals, Value::Null),
        ];
        for cond in cases {
            let rule = sample_rule().with_conditions(ConditionGroup::all(vec![cond.clone()]));
            let err = compile(&rule).unwrap_err();
            assert!(err.is_validation(), "{:?} should be rejected, got {:?}", cond, err);
        }
    }

    #[test]
    fn test_nested_conditions_validated() {
        let rule = sample_rule().with_conditions(ConditionGroup::all(vec![
            Condition::new("amount", Operator::GreaterThan, 1).with_nested(ConditionGroup::any(
                vec![Condition::new("nope", Operator::Equals, 1)],
            )),
        ]));
        assert!(matches!(
            compile(&rule).unwrap_err(),
            RuleError::PathNotFound { .. }
        ));
    }

    #[test]
    fn test_action_validation() {
        let rule = sample_rule().with_action(RuleAction::modify("customer.level", "GOLD"));
        assert!(compile(&rule).is_err());

        let rule = sample_rule().with_action(RuleAction::modify("amount", "not a number"));
        assert!(compile(&rule).is_err());

        let rule = sample_rule().with_action(RuleAction::insert(
            "RiskScore",
            json!({"riskLevel": "HIGH"}),
        ));
        assert!(compile(&rule).is_ok());

        let rule = sample_rule().with_action(RuleAction::insert("Unknown", json!({})));
        assert!(compile(&rule).unwrap_err().is_validation());

        let rule = sample_rule().with_action(RuleAction::webhook(
            "not a url",
            crate::models::HttpMethod::Post,
        ));
        assert!(compile(&rule).is_err());
    }

    #[test]
    fn test_insert_index_bounded() {
        let rule = sample_rule().with_action(RuleAction::insert(
            "Order",
            json!({"tags[0]": "vip", "amount": 1}),
        ));
        assert!(compile(&rule).is_ok());

        let rule = sample_rule().with_action(RuleAction::insert(
            "Order",
            json!({"tags[4000000000]": "vip"}),
        ));
        assert!(compile(&rule).unwrap_err().is_validation());
    }

    #[test]
    fn test_compile_errors_are_distinct() {
        let rule = sample_rule().with_window(Some("2024-02-01"), Some("2024-01-01"));
        let err = compile(&rule).unwrap_err();
        assert!(matches!(err, RuleError::CompileError { .. }));

        let mut restricted = rule_set();
        restricted.allowed_output_types = Some(vec![ActionType::Modify]);
        let ctx = CompileContext::new(&restricted, order_schema(), vec![]);
        let err = RuleCompiler::new().compile(&sample_rule(), &ctx).unwrap_err();
        assert!(matches!(err, RuleError::CompileError { .. }));
    }

    #[test]
    fn test_effective_window() {
        let rule = sample_rule().with_window(Some("2024-01-01"), Some("2024-12-31T23:59:59Z"));
        let compiled = compile(&rule).unwrap();

        let inside = "2024-06-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let before = "2023-12-31T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let after = "2025-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(compiled.is_active_at(inside));
        assert!(!compiled.is_active_at(before));
        assert!(!compiled.is_active_at(after));
    }

    #[test]
    fn test_rule_set_defaults_apply() {
        let mut rule_set = rule_set();
        rule_set.activation_group = Some("pricing".to_string());
        rule_set.lock_on_active = Some(true);
        let ctx = CompileContext::new(&rule_set, order_schema(), vec![]);

        let compiled = RuleCompiler::new().compile(&sample_rule(), &ctx).unwrap();
        assert_eq!(compiled.activation_group.as_deref(), Some("pricing"));
        assert!(compiled.lock_on_active);

        let own = sample_rule().with_activation_group("own");
        let compiled = RuleCompiler::new().compile(&own, &ctx).unwrap();
        assert_eq!(compiled.activation_group.as_deref(), Some("own"));
    }

    #[test]
    fn test_compile_from_json() {
        let rule_set = rule_set();
        let ctx = CompileContext::new(&rule_set, order_schema(), vec![]);
        let json = r#"
        {
            "id": "rule-json",
            "name": "vip",
            "schemaId": "order",
            "projectId": "p1",
            "conditions": {
                "operator": "any",
                "conditions": [
                    {"fact": "customer.tier", "operator": "equals", "value": "GOLD"},
                    {"fact": "tags", "operator": "contains", "value": "vip"}
                ]
            },
            "actions": [{"type": "LOG", "logMessage": "vip order"}]
        }
        "#;

        let compiled = RuleCompiler::new().compile_from_json(json, &ctx).unwrap();
        assert_eq!(compiled.required_fields.len(), 2);
        assert!(!compiled.no_loop);
    }
}
