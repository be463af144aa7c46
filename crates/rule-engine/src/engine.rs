//! 执行引擎
//!
//! 每次执行都是独立的工作单元：加载规则集、编译（命中缓存时复用）、
//! 在工作集上按优先级反复匹配直到不再有规则触发，最后生成执行报告。
//!
//! 除编译缓存外，执行之间不共享任何可变状态。

use crate::action::ActionExecutor;
use crate::compiler::{CompileContext, CompiledRule};
use crate::error::{Result, RuleError};
use crate::evaluator::ConditionEvaluator;
use crate::fact::{FactHandle, WorkingSet};
use crate::models::{ExecuteRequest, ExecutionRecord, ExecutionReport, FiredRule, WebhookResult};
use crate::repository::{ExecutionHistorySink, FactStore, RuleRepository, SchemaRepository, load_registry};
use crate::schema::{Schema, SchemaRegistry};
use crate::store::CompiledRuleCache;
use crate::webhook::{WebhookClient, WebhookRequest};
use chrono::Utc;
use rules_shared::config::EngineConfig;
use rules_shared::observability::metrics;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// 执行引擎
#[derive(Clone)]
pub struct ExecutionEngine {
    rules: Arc<dyn RuleRepository>,
    schemas: Arc<dyn SchemaRepository>,
    webhooks: Arc<dyn WebhookClient>,
    history: Option<Arc<dyn ExecutionHistorySink>>,
    fact_store: Option<Arc<dyn FactStore>>,
    cache: CompiledRuleCache,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        schemas: Arc<dyn SchemaRepository>,
        webhooks: Arc<dyn WebhookClient>,
    ) -> Self {
        Self {
            rules,
            schemas,
            webhooks,
            history: None,
            fact_store: None,
            cache: CompiledRuleCache::new(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// 共享编译缓存（通常与 [`crate::service::RuleService`] 共用）
    pub fn with_cache(mut self, cache: CompiledRuleCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_history(mut self, history: Arc<dyn ExecutionHistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_fact_store(mut self, fact_store: Arc<dyn FactStore>) -> Self {
        self.fact_store = Some(fact_store);
        self
    }

    pub fn cache(&self) -> &CompiledRuleCache {
        &self.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 对已持久化的事实执行规则集
    pub async fn execute_stored(&self, project_id: &str, dry_run: bool) -> ExecutionReport {
        let facts = match &self.fact_store {
            Some(store) => store.load_facts(project_id).await,
            None => Ok(Vec::new()),
        };

        match facts {
            Ok(facts) => {
                let request = ExecuteRequest {
                    facts,
                    dry_run,
                    ..Default::default()
                };
                self.execute(project_id, request).await
            }
            Err(e) => {
                warn!(project_id = %project_id, error = %e, "加载事实失败");
                let mut trace = Trace::default();
                let report = fatal_report(Uuid::now_v7(), dry_run, &e, &mut trace, 0);
                metrics::record_execution("error", dry_run, 0.0);
                report
            }
        }
    }

    /// 执行规则集
    ///
    /// 从不返回错误：致命错误体现为 `success = false` 的报告。
    #[instrument(
        skip(self, request),
        fields(project_id = %project_id, facts = request.facts.len(), dry_run = request.dry_run)
    )]
    pub async fn execute(&self, project_id: &str, request: ExecuteRequest) -> ExecutionReport {
        let started = Instant::now();
        let deadline = started + self.config.request_timeout();
        let execution_id = Uuid::now_v7();
        let mut trace = Trace::default();

        let outcome = self.run(project_id, &request, deadline, &mut trace).await;
        let webhook_results = self.join_webhooks(&mut trace, deadline).await;
        let elapsed = started.elapsed();
        let execution_time_ms = elapsed.as_millis() as u64;

        let outcome = match (outcome, webhook_results) {
            (Ok(run), Ok(())) => Ok(run),
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
        };

        let report = match outcome {
            Ok(run) => {
                let result_facts = run.working.into_result_facts();
                if !request.dry_run {
                    self.commit(project_id, &result_facts).await;
                }
                info!(
                    fired = run.fired_rules.len(),
                    result_facts = result_facts.len(),
                    elapsed_ms = execution_time_ms,
                    "规则集执行完成"
                );
                ExecutionReport {
                    execution_id,
                    success: true,
                    dry_run: request.dry_run,
                    result_facts,
                    fired_rules: run.fired_rules,
                    execution_time_ms,
                    error_message: None,
                    webhook_results: std::mem::take(&mut trace.webhook_results),
                    logs: std::mem::take(&mut trace.logs),
                }
            }
            Err(e) => {
                warn!(error = %e, code = e.code(), "规则集执行失败");
                fatal_report(execution_id, request.dry_run, &e, &mut trace, execution_time_ms)
            }
        };

        let status = if report.success { "success" } else { "error" };
        metrics::record_execution(status, report.dry_run, elapsed.as_secs_f64());

        self.record_history(project_id, &request, &report);
        report
    }

    /// 加载、匹配、触发，直到不动点
    async fn run(
        &self,
        project_id: &str,
        request: &ExecuteRequest,
        deadline: Instant,
        trace: &mut Trace,
    ) -> Result<RunOutcome> {
        // Loading
        let rule_set = self.rules.get_rule_set(project_id).await?;
        let input_schema_id = request
            .schema_id
            .clone()
            .or_else(|| rule_set.input_schema_ids.first().cloned())
            .ok_or_else(|| {
                RuleError::SchemaNotFound(format!("规则集 {} 未声明输入 Schema", project_id))
            })?;

        let rules: Vec<_> = self
            .rules
            .get_rules_for_project(project_id)
            .await?
            .into_iter()
            .filter(|r| r.enabled)
            .collect();

        let schema_ids = rule_set
            .input_schema_ids
            .iter()
            .chain(rule_set.output_schema_ids.iter())
            .chain(rules.iter().map(|r| &r.schema_id))
            .chain(std::iter::once(&input_schema_id))
            .map(String::as_str);
        let registry = load_registry(self.schemas.as_ref(), schema_ids).await?;

        let input_schema = registry.get(&input_schema_id)?;
        for (i, fact) in request.facts.iter().enumerate() {
            input_schema.validate_fact(fact).map_err(|e| match e {
                RuleError::MalformedFacts(msg) => {
                    RuleError::MalformedFacts(format!("facts[{}]: {}", i, msg))
                }
                other => other,
            })?;
        }

        let now = request.as_of.unwrap_or_else(Utc::now);
        let mut agenda = Vec::with_capacity(rules.len());
        for rule in &rules {
            let ctx = CompileContext::resolve(&registry, &rule_set, rule)?;
            let compiled = match self.cache.get_or_compile(rule, &ctx) {
                Ok(compiled) => compiled,
                // 编译失败时沿用之前的编译产物
                Err(e) => match self.cache.get(&rule.id) {
                    Some(previous) => {
                        warn!(rule_id = %rule.id, error = %e, "规则编译失败，使用上一次的编译产物");
                        previous
                    }
                    None => {
                        warn!(rule_id = %rule.id, error = %e, "规则编译失败，跳过");
                        continue;
                    }
                },
            };
            if !compiled.is_active_at(now) {
                debug!(rule_id = %rule.id, "规则不在生效时间窗口内");
                continue;
            }
            let schema = ctx.input_schema.clone();
            agenda.push(AgendaItem { rule: compiled, schema });
        }
        // 稳定排序：同优先级保持保存顺序
        agenda.sort_by_key(|item| std::cmp::Reverse(item.rule.priority));

        debug!(rules = agenda.len(), "规则加载完成");

        let working = WorkingSet::from_inputs(&input_schema.name, &request.facts);
        self.match_and_fire(project_id, &registry, &agenda, working, deadline, trace)
    }

    /// 匹配与触发循环
    fn match_and_fire(
        &self,
        project_id: &str,
        registry: &SchemaRegistry,
        agenda: &[AgendaItem],
        mut working: WorkingSet,
        deadline: Instant,
        trace: &mut Trace,
    ) -> Result<RunOutcome> {
        let executor = ActionExecutor::new(registry);
        let mut state = AgendaState::new(agenda.len());
        let mut total_firings = 0usize;
        let mut passes = 0usize;

        loop {
            let mut fired_this_pass = false;
            for (idx, item) in agenda.iter().enumerate() {
                let rule = item.rule.as_ref();
                let evaluator = ConditionEvaluator::for_schema(&item.schema);

                for handle in working.live_of_type(&rule.fact_type) {
                    if state.disabled[idx] || state.suppressed(idx, rule) {
                        break;
                    }
                    if !working.is_live(handle) {
                        continue;
                    }
                    let key = (idx, handle);
                    let version = working.version(handle);
                    if state.locked.contains(&key) || state.seen.get(&key) == Some(&version) {
                        continue;
                    }

                    if Instant::now() >= deadline {
                        return Err(RuleError::Timeout(self.config.request_timeout_ms));
                    }

                    let Some(fact) = working.get(handle) else {
                        continue;
                    };
                    let matched = evaluator.evaluate(&rule.predicate, &fact.data);
                    state.seen.insert(key, version);
                    if !matched {
                        continue;
                    }

                    // Firing
                    total_firings += 1;
                    if total_firings > self.config.max_rule_firings {
                        return Err(RuleError::IterationLimitExceeded(
                            self.config.max_rule_firings,
                        ));
                    }
                    if rule.lock_on_active {
                        state.locked.insert(key);
                    }

                    match executor.apply(rule, handle, &mut working) {
                        Ok(outcome) => {
                            state.fire_counts[idx] += 1;
                            // 规则自身的修改不会重新激活自己
                            state.seen.insert(key, working.version(handle));
                            if let Some(group) = &rule.activation_group {
                                state.group_winners.entry(group.clone()).or_insert(idx);
                            }
                            fired_this_pass = true;
                            metrics::record_rule_firing(project_id);
                            debug!(
                                rule_id = %rule.rule_id,
                                fact = handle.index(),
                                inserted = outcome.inserted.len(),
                                retracted = outcome.retracted.len(),
                                "规则触发"
                            );

                            trace.logs.extend(outcome.logs);
                            for request in outcome.webhooks {
                                trace.pending.push(self.dispatch(request));
                            }
                        }
                        Err(e) => {
                            warn!(rule_id = %rule.rule_id, error = %e, "规则动作执行失败，本次执行中跳过该规则");
                            state.disabled[idx] = true;
                            state.errors[idx] = Some(e.to_string());
                        }
                    }
                }
            }

            if !fired_this_pass {
                break;
            }
            // 只统计有规则触发的轮次，确认不动点的最后一轮不计入
            passes += 1;
            if passes > self.config.max_passes {
                return Err(RuleError::IterationLimitExceeded(self.config.max_passes));
            }
        }

        debug!(passes, total_firings, "达到不动点");

        let fired_rules = agenda
            .iter()
            .enumerate()
            .filter(|(idx, _)| state.fire_counts[*idx] > 0 || state.errors[*idx].is_some())
            .map(|(idx, item)| FiredRule {
                rule_id: item.rule.rule_id.clone(),
                rule_name: item.rule.name.clone(),
                fire_count: state.fire_counts[idx],
                error: state.errors[idx].clone(),
            })
            .collect();

        Ok(RunOutcome {
            working,
            fired_rules,
        })
    }

    /// 在运行时上异步发出 Webhook，超时由 `webhook_timeout_ms` 限定
    fn dispatch(&self, request: WebhookRequest) -> JoinHandle<WebhookResult> {
        let client = self.webhooks.clone();
        let timeout = self.config.webhook_timeout();
        tokio::spawn(async move {
            let url = request.url.clone();
            let result = match tokio::time::timeout(timeout, client.call(request)).await {
                Ok(result) => result,
                Err(_) => WebhookResult {
                    url,
                    status_code: 0,
                    response: format!("请求超时 ({}ms)", timeout.as_millis()),
                    success: false,
                },
            };
            metrics::record_webhook_call(result.success);
            result
        })
    }

    /// 汇总所有 Webhook 结果，超过总超时返回 Timeout
    async fn join_webhooks(&self, trace: &mut Trace, deadline: Instant) -> Result<()> {
        let pending = std::mem::take(&mut trace.pending);
        if pending.is_empty() {
            return Ok(());
        }

        let joined = futures::future::join_all(pending.into_iter().map(|handle| async move {
            let abort = handle.abort_handle();
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(result)) => Some(result),
                Ok(Err(e)) => Some(WebhookResult {
                    url: String::new(),
                    status_code: 0,
                    response: format!("Webhook 任务异常: {e}"),
                    success: false,
                }),
                Err(_) => {
                    abort.abort();
                    None
                }
            }
        }))
        .await;

        let mut timed_out = false;
        for result in joined {
            match result {
                Some(result) => trace.webhook_results.push(result),
                None => timed_out = true,
            }
        }

        if timed_out {
            Err(RuleError::Timeout(self.config.request_timeout_ms))
        } else {
            Ok(())
        }
    }

    async fn commit(&self, project_id: &str, facts: &[serde_json::Value]) {
        if let Some(store) = &self.fact_store {
            if let Err(e) = store.commit_facts(project_id, facts.to_vec()).await {
                warn!(project_id = %project_id, error = %e, "提交事实失败");
            }
        }
    }

    /// 异步写入执行历史，不影响执行结果
    fn record_history(&self, project_id: &str, request: &ExecuteRequest, report: &ExecutionReport) {
        if !self.config.history_enabled {
            return;
        }
        let Some(sink) = self.history.clone() else {
            return;
        };

        let record = ExecutionRecord {
            id: report.execution_id,
            project_id: project_id.to_string(),
            input_facts: request.facts.clone(),
            report: report.clone(),
            dry_run: request.dry_run,
            executed_at: Utc::now(),
        };

        tokio::spawn(async move {
            let id = record.id;
            if let Err(e) = sink.record_execution(record).await {
                warn!(execution_id = %id, error = %e, "写入执行历史失败");
            }
        });
    }
}

fn fatal_report(
    execution_id: Uuid,
    dry_run: bool,
    error: &RuleError,
    trace: &mut Trace,
    execution_time_ms: u64,
) -> ExecutionReport {
    ExecutionReport {
        execution_id,
        success: false,
        dry_run,
        result_facts: Vec::new(),
        fired_rules: Vec::new(),
        execution_time_ms,
        error_message: Some(error.to_string()),
        webhook_results: std::mem::take(&mut trace.webhook_results),
        logs: std::mem::take(&mut trace.logs),
    }
}

struct AgendaItem {
    rule: Arc<CompiledRule>,
    schema: Arc<Schema>,
}

/// 单次执行内的匹配状态
struct AgendaState {
    fire_counts: Vec<u32>,
    errors: Vec<Option<String>>,
    /// 动作出错的规则，本次执行不再参与匹配
    disabled: Vec<bool>,
    /// (规则, 事实) -> 上次评估时的事实版本
    seen: HashMap<(usize, FactHandle), u64>,
    /// lockOnActive 规则已匹配过的事实
    locked: HashSet<(usize, FactHandle)>,
    /// 激活组 -> 最先触发的规则
    group_winners: HashMap<String, usize>,
}

impl AgendaState {
    fn new(len: usize) -> Self {
        Self {
            fire_counts: vec![0; len],
            errors: vec![None; len],
            disabled: vec![false; len],
            seen: HashMap::new(),
            locked: HashSet::new(),
            group_winners: HashMap::new(),
        }
    }

    /// 同组已有其他规则触发
    fn suppressed(&self, idx: usize, rule: &CompiledRule) -> bool {
        rule.activation_group
            .as_ref()
            .and_then(|g| self.group_winners.get(g))
            .is_some_and(|winner| *winner != idx)
    }
}

/// 执行过程中累积、即使失败也保留的信息
#[derive(Default)]
struct Trace {
    logs: Vec<String>,
    pending: Vec<JoinHandle<WebhookResult>>,
    webhook_results: Vec<WebhookResult>,
}

struct RunOutcome {
    working: WorkingSet,
    fired_rules: Vec<FiredRule>,
}
