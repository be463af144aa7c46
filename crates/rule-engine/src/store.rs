//! 编译产物缓存
//!
//! 使用 DashMap 提供线程安全的编译结果缓存，以规则 ID 为键、指纹判断是否过期。
//! 规则模型或所依赖的 Schema 版本变化后，下一次访问会自动重新编译。

use crate::compiler::{CompileContext, CompiledRule, RuleCompiler};
use crate::error::Result;
use crate::models::Rule;
use dashmap::DashMap;
use rules_shared::observability::metrics;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, instrument};

/// 编译产物缓存
#[derive(Clone, Default)]
pub struct CompiledRuleCache {
    rules: Arc<DashMap<String, Arc<CompiledRule>>>,
    compiler: RuleCompiler,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl CompiledRuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 取缓存的编译产物，指纹不一致时重新编译
    #[instrument(skip(self, rule, ctx), fields(rule_id = %rule.id))]
    pub fn get_or_compile(&self, rule: &Rule, ctx: &CompileContext<'_>) -> Result<Arc<CompiledRule>> {
        let fingerprint = RuleCompiler::fingerprint(rule, ctx);

        if let Some(cached) = self.rules.get(&rule.id) {
            if cached.fingerprint == fingerprint {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(cached.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let compiled = match self.compiler.compile(rule, ctx) {
            Ok(compiled) => Arc::new(compiled),
            Err(e) => {
                metrics::record_compilation(false);
                return Err(e);
            }
        };
        metrics::record_compilation(true);
        self.rules.insert(rule.id.clone(), compiled.clone());
        debug!("规则已编译: {}", rule.id);
        Ok(compiled)
    }

    /// 直接放入编译产物
    pub fn insert(&self, compiled: CompiledRule) -> Arc<CompiledRule> {
        let compiled = Arc::new(compiled);
        self.rules
            .insert(compiled.rule_id.clone(), compiled.clone());
        compiled
    }

    pub fn get(&self, rule_id: &str) -> Option<Arc<CompiledRule>> {
        self.rules.get(rule_id).map(|r| r.clone())
    }

    pub fn contains(&self, rule_id: &str) -> bool {
        self.rules.contains_key(rule_id)
    }

    /// 移除单条规则的编译产物
    pub fn invalidate(&self, rule_id: &str) -> bool {
        let removed = self.rules.remove(rule_id).is_some();
        if removed {
            debug!("编译缓存已失效: {}", rule_id);
        }
        removed
    }

    /// 移除某个规则集下的全部编译产物
    #[instrument(skip(self))]
    pub fn invalidate_project(&self, project_id: &str) -> usize {
        let before = self.rules.len();
        self.rules.retain(|_, r| r.project_id != project_id);
        let removed = before.saturating_sub(self.rules.len());
        info!("规则集 {} 的编译缓存已失效: {} 条", project_id, removed);
        removed
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.key().clone()).collect()
    }

    #[instrument(skip(self))]
    pub fn clear(&self) {
        let count = self.rules.len();
        self.rules.clear();
        info!("已清空 {} 条编译产物", count);
    }

    /// 获取缓存统计信息
    pub fn stats(&self) -> CacheStats {
        let rules_count = self.rules.len();
        let total_fields: usize = self
            .rules
            .iter()
            .map(|r| r.required_fields.len())
            .sum();

        CacheStats {
            rules_count,
            total_fields,
            avg_fields_per_rule: if rules_count > 0 {
                total_fields as f64 / rules_count as f64
            } else {
                0.0
            },
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// 缓存统计信息
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub rules_count: usize,
    /// 所有规则引用的字段总数
    pub total_fields: usize,
    pub avg_fields_per_rule: f64,
    pub hits: u64,
    pub misses: u64,
}
