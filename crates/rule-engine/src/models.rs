//! 规则引擎领域模型

use crate::operators::{LogicalOperator, Operator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// 条件节点
///
/// `nested` 与条件自身的判断结果做 AND；`fact` 为空且带 `nested` 时只评估子组。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default)]
    pub fact: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
    /// value 是同一事实上的另一个字段路径
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub value_is_field: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested: Option<Box<ConditionGroup>>,
}

impl Condition {
    pub fn new(fact: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            fact: fact.into(),
            operator,
            value: value.into(),
            value_is_field: false,
            nested: None,
        }
    }

    /// 与同一事实上另一字段比较
    pub fn field_ref(fact: impl Into<String>, operator: Operator, other: impl Into<String>) -> Self {
        Self {
            value_is_field: true,
            ..Self::new(fact, operator, Value::String(other.into()))
        }
    }

    pub fn with_nested(mut self, group: ConditionGroup) -> Self {
        self.nested = Some(Box::new(group));
        self
    }

    /// 没有自身判断、只承载子组
    pub fn is_pure_group(&self) -> bool {
        self.fact.is_empty() && self.nested.is_some()
    }
}

/// 条件组
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub operator: LogicalOperator,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ConditionGroup {
    pub fn new(operator: LogicalOperator, conditions: Vec<Condition>) -> Self {
        Self {
            operator,
            conditions,
        }
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Self::new(LogicalOperator::All, conditions)
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Self::new(LogicalOperator::Any, conditions)
    }
}

impl Default for ConditionGroup {
    fn default() -> Self {
        Self::all(Vec::new())
    }
}

/// 动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionType {
    Modify,
    Insert,
    Retract,
    Log,
    Webhook,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Modify => "MODIFY",
            Self::Insert => "INSERT",
            Self::Retract => "RETRACT",
            Self::Log => "LOG",
            Self::Webhook => "WEBHOOK",
        };
        write!(f, "{}", s)
    }
}

/// 规则动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum RuleAction {
    Modify(ModifyAction),
    Insert(InsertAction),
    Retract(RetractAction),
    Log(LogAction),
    Webhook(WebhookAction),
}

impl RuleAction {
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::Modify(_) => ActionType::Modify,
            Self::Insert(_) => ActionType::Insert,
            Self::Retract(_) => ActionType::Retract,
            Self::Log(_) => ActionType::Log,
            Self::Webhook(_) => ActionType::Webhook,
        }
    }

    pub fn modify(target_field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Modify(ModifyAction {
            target_field: target_field.into(),
            value: value.into(),
        })
    }

    pub fn insert(fact_type: impl Into<String>, fact_data: Value) -> Self {
        let fact_data = match fact_data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::Insert(InsertAction {
            fact_type: fact_type.into(),
            fact_data,
        })
    }

    pub fn retract() -> Self {
        Self::Retract(RetractAction::default())
    }

    pub fn log(message: impl Into<String>) -> Self {
        Self::Log(LogAction {
            log_message: message.into(),
        })
    }

    pub fn webhook(url: impl Into<String>, method: HttpMethod) -> Self {
        Self::Webhook(WebhookAction {
            webhook_url: url.into(),
            webhook_method: method,
            webhook_headers: BTreeMap::new(),
            webhook_body_template: None,
        })
    }
}

/// 修改触发事实上的字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyAction {
    pub target_field: String,
    #[serde(default)]
    pub value: Value,
}

/// 插入新事实
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertAction {
    pub fact_type: String,
    /// 属性路径 -> 值
    #[serde(default)]
    pub fact_data: Map<String, Value>,
}

/// 从工作集中移除事实
///
/// 未指定 `factType` 时移除触发事实，否则移除该类型的所有存活事实。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetractAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogAction {
    pub log_message: String,
}

/// HTTP 方法
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn has_body(&self) -> bool {
        !matches!(self, Self::Get | Self::Delete)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAction {
    pub webhook_url: String,
    #[serde(default)]
    pub webhook_method: HttpMethod,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub webhook_headers: BTreeMap<String, String>,
    /// 请求体模板，支持 `{field}` 占位符；为空时发送触发事实
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_body_template: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// 规则定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// 输入 Schema
    pub schema_id: String,
    /// 所属规则集
    pub project_id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub conditions: ConditionGroup,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_group: Option<String>,
    #[serde(default)]
    pub lock_on_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_effective: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_expires: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    pub fn new(
        name: impl Into<String>,
        schema_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            schema_id: schema_id.into(),
            project_id: project_id.into(),
            priority: 0,
            enabled: true,
            category: None,
            conditions: ConditionGroup::default(),
            actions: Vec::new(),
            activation_group: None,
            lock_on_active: false,
            date_effective: None,
            date_expires: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_conditions(mut self, conditions: ConditionGroup) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_action(mut self, action: RuleAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_activation_group(mut self, group: impl Into<String>) -> Self {
        self.activation_group = Some(group.into());
        self
    }

    pub fn with_lock_on_active(mut self) -> Self {
        self.lock_on_active = true;
        self
    }

    pub fn with_window(mut self, effective: Option<&str>, expires: Option<&str>) -> Self {
        self.date_effective = effective.map(str::to_string);
        self.date_expires = expires.map(str::to_string);
        self
    }
}

/// 规则集（项目 / 模板）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSet {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input_schema_ids: Vec<String>,
    #[serde(default)]
    pub output_schema_ids: Vec<String>,
    /// 允许的动作类型，为空表示不限制
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_output_types: Option<Vec<ActionType>>,
    /// 规则未设置时使用的激活组
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_on_active: Option<bool>,
}

impl RuleSet {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input_schema_ids: Vec::new(),
            output_schema_ids: Vec::new(),
            allowed_output_types: None,
            activation_group: None,
            lock_on_active: None,
        }
    }

    pub fn with_input(mut self, schema_id: impl Into<String>) -> Self {
        self.input_schema_ids.push(schema_id.into());
        self
    }

    pub fn with_output(mut self, schema_id: impl Into<String>) -> Self {
        self.output_schema_ids.push(schema_id.into());
        self
    }

    pub fn allows(&self, action_type: ActionType) -> bool {
        self.allowed_output_types
            .as_ref()
            .is_none_or(|allowed| allowed.is_empty() || allowed.contains(&action_type))
    }
}

/// 执行请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub facts: Vec<Value>,
    #[serde(default)]
    pub dry_run: bool,
    /// 输入事实的 Schema，默认取规则集的第一个输入 Schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<String>,
    /// 覆盖生效时间窗口判断用的当前时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_of: Option<DateTime<Utc>>,
}

impl ExecuteRequest {
    pub fn new(facts: Vec<Value>) -> Self {
        Self {
            facts,
            ..Default::default()
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// 触发的规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FiredRule {
    pub rule_id: String,
    pub rule_name: String,
    pub fire_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Webhook 调用结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResult {
    pub url: String,
    /// 网络错误时为 0
    pub status_code: u16,
    pub response: String,
    pub success: bool,
}

/// 执行报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub execution_id: Uuid,
    pub success: bool,
    pub dry_run: bool,
    pub result_facts: Vec<Value>,
    pub fired_rules: Vec<FiredRule>,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhook_results: Vec<WebhookResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
}

impl ExecutionReport {
    /// 某条规则的触发次数（未触发为 0）
    pub fn fire_count(&self, rule_id: &str) -> u32 {
        self.fired_rules
            .iter()
            .find(|r| r.rule_id == rule_id)
            .map(|r| r.fire_count)
            .unwrap_or(0)
    }
}

/// 执行历史记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub project_id: String,
    pub input_facts: Vec<Value>,
    pub report: ExecutionReport,
    pub dry_run: bool,
    pub executed_at: DateTime<Utc>,
}
