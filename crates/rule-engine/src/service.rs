//! 规则编写服务
//!
//! 保存、重新生成、启停和删除规则，并维护编译缓存。
//!
//! ## 保存语义
//!
//! - 校验失败（路径无法解析、操作符与类型不匹配等）直接拒绝保存
//! - 编译失败（时间窗口无效、动作类型不被规则集允许）仍然保存规则模型，
//!   失败原因体现在 [`SaveOutcome::compile_error`] 中，缓存中之前的编译产物保持不变

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::compiler::{CompileContext, CompiledRule, RuleCompiler};
use crate::error::Result;
use crate::models::{Rule, RuleSet};
use crate::payload::MatchPayloadGenerator;
use crate::repository::{RuleRepository, SchemaRepository, load_registry};
use crate::schema::SchemaRegistry;
use crate::store::CompiledRuleCache;

/// 保存结果
#[derive(Debug, Clone)]
pub struct SaveOutcome {
    pub rule: Rule,
    /// 编译成功时的产物
    pub compiled: Option<Arc<CompiledRule>>,
    pub compile_error: Option<String>,
}

impl SaveOutcome {
    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }
}

/// 规则编写服务
#[derive(Clone)]
pub struct RuleService {
    rules: Arc<dyn RuleRepository>,
    schemas: Arc<dyn SchemaRepository>,
    cache: CompiledRuleCache,
    compiler: RuleCompiler,
}

impl RuleService {
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        schemas: Arc<dyn SchemaRepository>,
        cache: CompiledRuleCache,
    ) -> Self {
        Self {
            rules,
            schemas,
            cache,
            compiler: RuleCompiler::new(),
        }
    }

    pub fn cache(&self) -> &CompiledRuleCache {
        &self.cache
    }

    /// 保存规则
    #[instrument(skip(self, rule), fields(rule_id = %rule.id, project_id = %rule.project_id))]
    pub async fn save_rule(&self, mut rule: Rule) -> Result<SaveOutcome> {
        // 1. 加载规则集与相关 Schema
        let (rule_set, registry) = self.load_context(&rule).await?;
        let ctx = CompileContext::resolve(&registry, &rule_set, &rule)?;

        // 2. 校验失败不保存
        self.compiler.validate(&rule, &ctx)?;

        // 3. 保存模型
        rule.updated_at = Utc::now();
        let rule = self.rules.save_rule(rule).await?;

        // 4. 编译，失败时保留之前的编译产物
        let outcome = match self.cache.get_or_compile(&rule, &ctx) {
            Ok(compiled) => SaveOutcome {
                rule,
                compiled: Some(compiled),
                compile_error: None,
            },
            Err(e) => {
                warn!(error = %e, "规则已保存，但编译失败");
                SaveOutcome {
                    rule,
                    compiled: None,
                    compile_error: Some(e.to_string()),
                }
            }
        };

        info!(compiled = outcome.is_compiled(), "规则已保存");
        Ok(outcome)
    }

    /// 按当前 Schema 重新生成编译产物
    ///
    /// 模型和 Schema 版本未变时直接返回缓存中的产物。
    #[instrument(skip(self))]
    pub async fn regenerate(&self, rule_id: &str) -> Result<Arc<CompiledRule>> {
        let rule = self.rules.get_rule(rule_id).await?;
        let (rule_set, registry) = self.load_context(&rule).await?;
        let ctx = CompileContext::resolve(&registry, &rule_set, &rule)?;

        let compiled = self.cache.get_or_compile(&rule, &ctx)?;
        info!(fingerprint = %compiled.fingerprint, "编译产物已生成");
        Ok(compiled)
    }

    /// 启用或停用规则
    #[instrument(skip(self))]
    pub async fn toggle_rule(&self, rule_id: &str, enabled: bool) -> Result<Rule> {
        let mut rule = self.rules.get_rule(rule_id).await?;
        rule.enabled = enabled;
        rule.updated_at = Utc::now();

        let rule = self.rules.save_rule(rule).await?;
        self.cache.invalidate(rule_id);
        info!(enabled, "规则状态已更新");
        Ok(rule)
    }

    #[instrument(skip(self))]
    pub async fn delete_rule(&self, rule_id: &str) -> Result<()> {
        self.rules.delete_rule(rule_id).await?;
        self.cache.invalidate(rule_id);
        info!("规则已删除");
        Ok(())
    }

    /// 生成能命中规则的示例事实
    #[instrument(skip(self))]
    pub async fn get_match_payload(&self, rule_id: &str) -> Result<Value> {
        let rule = self.rules.get_rule(rule_id).await?;
        let (rule_set, registry) = self.load_context(&rule).await?;
        let ctx = CompileContext::resolve(&registry, &rule_set, &rule)?;

        let compiled = self.cache.get_or_compile(&rule, &ctx)?;
        MatchPayloadGenerator::generate(&compiled, &ctx.input_schema)
    }

    /// 规则所属规则集，以及规则引用到的全部 Schema
    async fn load_context(&self, rule: &Rule) -> Result<(RuleSet, SchemaRegistry)> {
        let rule_set = self.rules.get_rule_set(&rule.project_id).await?;
        let ids = rule_set
            .input_schema_ids
            .iter()
            .chain(rule_set.output_schema_ids.iter())
            .chain(std::iter::once(&rule.schema_id))
            .map(String::as_str);
        let registry = load_registry(self.schemas.as_ref(), ids).await?;
        Ok((rule_set, registry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuleError;
    use crate::models::{Condition, ConditionGroup, RuleAction};
    use crate::operators::Operator;
    use crate::repository::{InMemoryRuleRepository, InMemorySchemaRepository};
    use crate::schema::{PropertyType, Schema, SchemaProperty};

    fn order_schema(version: &str) -> Schema {
        Schema::new(
            "order",
            "Order",
            vec![
                SchemaProperty::new("amount", PropertyType::Number),
                SchemaProperty::new("status", PropertyType::String),
            ],
        )
        .with_version(version)
    }

    fn setup() -> (RuleService, Arc<InMemoryRuleRepository>, Arc<InMemorySchemaRepository>) {
        let schemas = Arc::new(InMemorySchemaRepository::new());
        schemas.insert(order_schema("1.0"));
        let rules = Arc::new(InMemoryRuleRepository::new());
        rules.insert_rule_set(RuleSet::new("p1", "fraud").with_input("order"));

        let service = RuleService::new(rules.clone(), schemas.clone(), CompiledRuleCache::new());
        (service, rules, schemas)
    }

    fn big_order(id: &str) -> Rule {
        Rule::new("big order", "order", "p1")
            .with_id(id)
            .with_priority(5)
            .with_conditions(ConditionGroup::all(vec![Condition::new(
                "amount",
                Operator::GreaterThan,
                1000,
            )]))
            .with_action(RuleAction::modify("status", "REVIEW"))
    }

    #[tokio::test]
    async fn test_save_compiles_rule() {
        let (service, _, _) = setup();

        let outcome = service.save_rule(big_order("r1")).await.unwrap();
        assert!(outcome.is_compiled());
        assert!(outcome.compile_error.is_none());
        assert!(service.cache().contains("r1"));
        assert!(outcome.compiled.unwrap().drl.contains("salience 5"));
    }

    #[tokio::test]
    async fn test_validation_error_rejects_save() {
        let (service, rules, _) = setup();
        let rule = big_order("r1").with_conditions(ConditionGroup::all(vec![Condition::new(
            "missing",
            Operator::Equals,
            1,
        )]));

        let err = service.save_rule(rule).await.unwrap_err();
        assert!(err.is_validation());
        assert!(matches!(
            rules.get_rule("r1").await,
            Err(RuleError::RuleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_compile_error_still_saves_and_keeps_previous_artifact() {
        let (service, rules, _) = setup();
        let first = service.save_rule(big_order("r1")).await.unwrap();
        let previous = first.compiled.unwrap();

        let broken = big_order("r1")
            .with_priority(9)
            .with_window(Some("2025-02-01"), Some("2025-01-01"));
        let outcome = service.save_rule(broken).await.unwrap();

        assert!(!outcome.is_compiled());
        assert!(outcome.compile_error.unwrap().contains("dateExpires"));
        assert_eq!(rules.get_rule("r1").await.unwrap().priority, 9);
        assert_eq!(service.cache().get("r1").unwrap().priority, previous.priority);
        assert!(matches!(
            service.regenerate("r1").await,
            Err(RuleError::CompileError { .. })
        ));
    }

    #[tokio::test]
    async fn test_regenerate_is_idempotent_until_schema_changes() {
        let (service, _, schemas) = setup();
        service.save_rule(big_order("r1")).await.unwrap();

        let first = service.regenerate("r1").await.unwrap();
        let second = service.regenerate("r1").await.unwrap();
        assert_eq!(first, second);

        schemas.insert(order_schema("2.0"));
        let third = service.regenerate("r1").await.unwrap();
        assert_ne!(first.fingerprint, third.fingerprint);
        assert_eq!(first.predicate, third.predicate);
    }

    #[tokio::test]
    async fn test_toggle_and_delete_invalidate_cache() {
        let (service, rules, _) = setup();
        service.save_rule(big_order("r1")).await.unwrap();

        let rule = service.toggle_rule("r1", false).await.unwrap();
        assert!(!rule.enabled);
        assert!(!service.cache().contains("r1"));

        service.regenerate("r1").await.unwrap();
        service.delete_rule("r1").await.unwrap();
        assert!(!service.cache().contains("r1"));
        assert!(rules.is_empty());
        assert!(service.delete_rule("r1").await.is_err());
    }

    #[tokio::test]
    async fn test_get_match_payload() {
        let (service, _, _) = setup();
        service.save_rule(big_order("r1")).await.unwrap();

        let payload = service.get_match_payload("r1").await.unwrap();
        assert_eq!(payload, serde_json::json!({"amount": 1001}));

        assert!(matches!(
            service.get_match_payload("nope").await,
            Err(RuleError::RuleNotFound(_))
        ));
    }
}
