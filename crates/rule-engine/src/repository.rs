//! 外部协作方接口
//!
//! Schema、规则集和规则的存储，以及执行历史和事实持久化都由外部服务提供。
//! 这里定义接口并给出内存实现，供测试和命令行使用。

use crate::error::{Result, RuleError};
use crate::models::{ExecutionRecord, Rule, RuleSet};
use crate::schema::{Schema, SchemaRegistry};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{info, instrument};

/// Schema 仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SchemaRepository: Send + Sync {
    async fn get_schema(&self, schema_id: &str) -> Result<Schema>;
}

/// 规则与规则集仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn get_rule_set(&self, project_id: &str) -> Result<RuleSet>;
    /// 规则集下的全部规则（含禁用），按保存顺序
    async fn get_rules_for_project(&self, project_id: &str) -> Result<Vec<Rule>>;
    async fn get_rule(&self, rule_id: &str) -> Result<Rule>;
    async fn save_rule(&self, rule: Rule) -> Result<Rule>;
    async fn delete_rule(&self, rule_id: &str) -> Result<()>;
}

/// 执行历史
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionHistorySink: Send + Sync {
    async fn record_execution(&self, record: ExecutionRecord) -> Result<()>;
}

/// 事实持久化
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FactStore: Send + Sync {
    async fn load_facts(&self, project_id: &str) -> Result<Vec<Value>>;
    async fn commit_facts(&self, project_id: &str, facts: Vec<Value>) -> Result<()>;
}

/// 从仓储加载 Schema 并构建注册表
pub async fn load_registry<'a, I>(repo: &dyn SchemaRepository, schema_ids: I) -> Result<SchemaRegistry>
where
    I: IntoIterator<Item = &'a str>,
{
    let ids: BTreeSet<&str> = schema_ids.into_iter().filter(|id| !id.is_empty()).collect();
    let mut registry = SchemaRegistry::new();
    for id in ids {
        registry.register(repo.get_schema(id).await?)?;
    }
    Ok(registry)
}

// ============================================================================
// 内存实现
// ============================================================================

#[derive(Default)]
pub struct InMemorySchemaRepository {
    schemas: DashMap<String, Schema>,
}

impl InMemorySchemaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, schema: Schema) {
        self.schemas.insert(schema.id.clone(), schema);
    }
}

#[async_trait]
impl SchemaRepository for InMemorySchemaRepository {
    async fn get_schema(&self, schema_id: &str) -> Result<Schema> {
        self.schemas
            .get(schema_id)
            .map(|s| s.clone())
            .ok_or_else(|| RuleError::SchemaNotFound(schema_id.to_string()))
    }
}

/// 规则按保存顺序存放，同优先级规则的执行顺序依赖于此
#[derive(Default)]
pub struct InMemoryRuleRepository {
    rule_sets: DashMap<String, RuleSet>,
    rules: RwLock<Vec<Rule>>,
}

impl InMemoryRuleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_rule_set(&self, rule_set: RuleSet) {
        self.rule_sets.insert(rule_set.id.clone(), rule_set);
    }

    /// 新增或原位替换
    pub fn upsert(&self, rule: Rule) {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}

#[async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn get_rule_set(&self, project_id: &str) -> Result<RuleSet> {
        self.rule_sets
            .get(project_id)
            .map(|r| r.clone())
            .ok_or_else(|| RuleError::RuleSetNotFound(project_id.to_string()))
    }

    async fn get_rules_for_project(&self, project_id: &str) -> Result<Vec<Rule>> {
        Ok(self
            .rules
            .read()
            .iter()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn get_rule(&self, rule_id: &str) -> Result<Rule> {
        self.rules
            .read()
            .iter()
            .find(|r| r.id == rule_id)
            .cloned()
            .ok_or_else(|| RuleError::RuleNotFound(rule_id.to_string()))
    }

    async fn save_rule(&self, rule: Rule) -> Result<Rule> {
        self.upsert(rule.clone());
        Ok(rule)
    }

    async fn delete_rule(&self, rule_id: &str) -> Result<()> {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.id != rule_id);
        if rules.len() == before {
            return Err(RuleError::RuleNotFound(rule_id.to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryHistory {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl ExecutionHistorySink for InMemoryHistory {
    async fn record_execution(&self, record: ExecutionRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryFactStore {
    facts: DashMap<String, Vec<Value>>,
}

impl InMemoryFactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, project_id: &str, facts: Vec<Value>) {
        self.facts.insert(project_id.to_string(), facts);
    }
}

#[async_trait]
impl FactStore for InMemoryFactStore {
    async fn load_facts(&self, project_id: &str) -> Result<Vec<Value>> {
        Ok(self
            .facts
            .get(project_id)
            .map(|f| f.clone())
            .unwrap_or_default())
    }

    async fn commit_facts(&self, project_id: &str, facts: Vec<Value>) -> Result<()> {
        self.facts.insert(project_id.to_string(), facts);
        Ok(())
    }
}

/// 规则包：一次性导入的 Schema、规则集和规则
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    #[serde(default)]
    pub schemas: Vec<Schema>,
    #[serde(default)]
    pub rule_sets: Vec<RuleSet>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Bundle {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// 导入内存仓储
    #[instrument(skip_all, fields(schemas = self.schemas.len(), rules = self.rules.len()))]
    pub fn seed(self, schemas: &InMemorySchemaRepository, rules: &InMemoryRuleRepository) {
        for schema in self.schemas {
            schemas.insert(schema);
        }
        for rule_set in self.rule_sets {
            rules.insert_rule_set(rule_set);
        }
        for rule in self.rules {
            rules.upsert(rule);
        }
        info!("规则包已导入");
    }
}
