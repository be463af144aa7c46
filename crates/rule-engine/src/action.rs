//! 动作执行器
//!
//! 规则触发时按声明顺序执行动作。一次触发的所有效果先在副本上计算，
//! 全部成功后才写回工作集，任一动作失败则本次触发不产生任何效果。

use crate::compiler::CompiledRule;
use crate::error::{Result, RuleError};
use crate::fact::{Fact, FactHandle, WorkingSet};
use crate::models::{InsertAction, ModifyAction, RuleAction, WebhookAction};
use crate::path::FieldPath;
use crate::schema::{PropertyType, Schema, SchemaRegistry};
use crate::webhook::WebhookRequest;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

/// 一次触发的效果
#[derive(Debug, Default)]
pub struct ActionOutcome {
    /// 触发事实是否被修改
    pub modified: bool,
    pub inserted: Vec<FactHandle>,
    pub retracted: Vec<FactHandle>,
    pub logs: Vec<String>,
    pub webhooks: Vec<WebhookRequest>,
}

/// 动作执行器
pub struct ActionExecutor<'a> {
    registry: &'a SchemaRegistry,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self { registry }
    }

    /// 对触发事实执行规则的全部动作
    pub fn apply(
        &self,
        rule: &CompiledRule,
        trigger: FactHandle,
        working: &mut WorkingSet,
    ) -> Result<ActionOutcome> {
        let fact = working.get(trigger).ok_or_else(|| {
            RuleError::ExecutionError(format!("触发事实已被撤回: #{}", trigger.index()))
        })?;
        let fact_type = fact.fact_type.clone();
        let schema = self.registry.find_by_name(&fact_type);

        // 在副本上计算，LOG 和 WEBHOOK 看到的是同一次触发中前序 MODIFY 之后的数据
        let mut staged = fact.data.clone();
        let mut modified = false;
        let mut inserts = Vec::new();
        let mut retracts = Vec::new();
        let mut outcome = ActionOutcome::default();

        for action in &rule.effects {
            match action {
                RuleAction::Modify(modify) => {
                    self.modify(schema.as_deref(), modify, &mut staged)?;
                    modified = true;
                }
                RuleAction::Insert(insert) => inserts.push(self.build_insert(insert)?),
                RuleAction::Retract(retract) => match &retract.fact_type {
                    None => retracts.push(trigger),
                    Some(target) => {
                        let target = self
                            .registry
                            .find_by_name(target)
                            .map(|s| s.name.clone())
                            .unwrap_or_else(|| target.clone());
                        // 同一次触发中先前 INSERT 的同类型事实一并撤回
                        inserts.retain(|f: &Fact| f.fact_type != target);
                        retracts.extend(working.live_of_type(&target));
                    }
                },
                RuleAction::Log(log) => {
                    let line = format!(
                        "[RULE LOG] {} | Fact: {}",
                        interpolate(&log.log_message, &staged),
                        fact_type
                    );
                    info!(rule_id = %rule.rule_id, "{}", line);
                    outcome.logs.push(line);
                }
                RuleAction::Webhook(webhook) => {
                    outcome
                        .webhooks
                        .push(build_webhook(&rule.rule_id, webhook, &staged));
                }
            }
        }

        if modified {
            if let Some(data) = working.data_mut(trigger) {
                *data = staged;
                outcome.modified = true;
            }
        }
        for fact in inserts {
            outcome.inserted.push(working.insert(fact, &rule.rule_id));
        }
        for handle in retracts {
            if working.retract(handle) {
                outcome.retracted.push(handle);
            }
        }

        Ok(outcome)
    }

    fn modify(&self, schema: Option<&Schema>, modify: &ModifyAction, data: &mut Value) -> Result<()> {
        let (path, value) = match schema {
            Some(schema) => {
                let path = schema.normalize_path(&modify.target_field)?;
                let value = match schema.resolve_path(&path) {
                    Ok(property) => coerce(property.property_type, &modify.value),
                    Err(_) => modify.value.clone(),
                };
                (path, value)
            }
            None => (FieldPath::parse(&modify.target_field)?, modify.value.clone()),
        };

        if path.has_each() {
            return Err(RuleError::ExecutionError(format!(
                "MODIFY 目标不能包含 []: {}",
                modify.target_field
            )));
        }
        path.set_existing(data, value)
    }

    /// 构建新事实：Schema 默认值 + factData
    fn build_insert(&self, insert: &InsertAction) -> Result<Fact> {
        let schema: Option<Arc<Schema>> = self.registry.find_by_name(&insert.fact_type);

        let (fact_type, mut data) = match &schema {
            Some(schema) => (schema.name.clone(), Value::Object(schema.defaults())),
            None => (insert.fact_type.clone(), Value::Object(Map::new())),
        };

        for (key, value) in &insert.fact_data {
            let path = match &schema {
                Some(schema) => schema.normalize_path(key)?,
                None => FieldPath::parse(key)?,
            };
            let value = schema
                .as_ref()
                .and_then(|s| s.resolve_path(&path).ok())
                .map(|p| coerce(p.property_type, value))
                .unwrap_or_else(|| value.clone());
            path.set_creating(&mut data, value)?;
        }

        Ok(Fact::new(fact_type, data))
    }
}

fn build_webhook(rule_id: &str, webhook: &WebhookAction, fact: &Value) -> WebhookRequest {
    let body = if webhook.webhook_method.has_body() {
        Some(match &webhook.webhook_body_template {
            Some(template) => interpolate(template, fact),
            None => fact.to_string(),
        })
    } else {
        None
    };

    WebhookRequest {
        rule_id: rule_id.to_string(),
        url: interpolate(&webhook.webhook_url, fact),
        method: webhook.webhook_method,
        headers: webhook.webhook_headers.clone(),
        body,
    }
}

/// 按声明类型转换写入值，无法转换时保持原值
pub(crate) fn coerce(property_type: PropertyType, value: &Value) -> Value {
    match (property_type, value) {
        (PropertyType::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| value.clone()),
        (PropertyType::Integer, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| value.clone()),
        (PropertyType::Boolean, Value::String(s)) => match s.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => value.clone(),
        },
        (PropertyType::String, Value::Number(n)) => Value::String(n.to_string()),
        (PropertyType::String, Value::Bool(b)) => Value::String(b.to_string()),
        _ => value.clone(),
    }
}

/// 替换模板中的 `{path}` 占位符
///
/// 字符串原样输出，其他值输出 JSON，路径不存在输出 `null`。
/// 不像路径的花括号内容（例如 JSON 模板本身）保持不变。
pub fn interpolate(template: &str, fact: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) if is_placeholder(&after[..end]) => {
                let rendered = FieldPath::parse(&after[..end])
                    .ok()
                    .and_then(|p| p.lookup(fact))
                    .map(|v| match v.as_ref() {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_else(|| "null".to_string());
                out.push_str(&rendered);
                rest = &after[end + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_placeholder(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '[' | ']' | '-'))
}
