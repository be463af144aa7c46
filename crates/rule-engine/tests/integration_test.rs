//! 规则引擎集成测试
//!
//! 覆盖从规则保存、编译到执行、载荷生成的完整流程。

use rule_engine::repository::{
    FactStore, InMemoryFactStore, InMemoryHistory, InMemoryRuleRepository,
    InMemorySchemaRepository,
};
use rule_engine::{
    CompileContext, CompiledRuleCache, Condition, ConditionEvaluator, ConditionGroup,
    ExecuteRequest, ExecutionEngine, HttpMethod, HttpWebhookClient, Operator, PropertyType, Rule,
    RuleAction, RuleCompiler, RuleError, RuleService, RuleSet, Schema, SchemaProperty,
};
use rules_shared::config::EngineConfig;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// 测试数据
// ============================================================================

fn order_schema() -> Schema {
    Schema::new(
        "order",
        "Order",
        vec![
            SchemaProperty::new("id", PropertyType::Integer),
            SchemaProperty::new("amount", PropertyType::Number),
            SchemaProperty::new("status", PropertyType::String),
            SchemaProperty::object(
                "customer",
                vec![SchemaProperty::new("tier", PropertyType::String)],
            ),
        ],
    )
}

fn risk_schema() -> Schema {
    Schema::new(
        "risk",
        "RiskScore",
        vec![
            SchemaProperty::new("riskLevel", PropertyType::String),
            SchemaProperty::new("riskScore", PropertyType::Number).with_default(0),
            SchemaProperty::new("category", PropertyType::String).with_default("fraud"),
        ],
    )
}

fn alert_schema() -> Schema {
    Schema::new(
        "alert",
        "Alert",
        vec![SchemaProperty::new("level", PropertyType::String)],
    )
}

/// 测试环境：内存仓储 + 引擎 + 编写服务
struct Harness {
    rules: Arc<InMemoryRuleRepository>,
    schemas: Arc<InMemorySchemaRepository>,
    cache: CompiledRuleCache,
}

impl Harness {
    fn new() -> Self {
        let schemas = Arc::new(InMemorySchemaRepository::new());
        schemas.insert(order_schema());
        schemas.insert(risk_schema());
        schemas.insert(alert_schema());

        let rules = Arc::new(InMemoryRuleRepository::new());
        rules.insert_rule_set(
            RuleSet::new("fraud", "fraud detection")
                .with_input("order")
                .with_input("alert")
                .with_output("order")
                .with_output("risk")
                .with_output("alert"),
        );

        Self {
            rules,
            schemas,
            cache: CompiledRuleCache::new(),
        }
    }

    fn with_rules(rules: Vec<Rule>) -> Self {
        let harness = Self::new();
        for rule in rules {
            harness.rules.upsert(rule);
        }
        harness
    }

    fn engine(&self) -> ExecutionEngine {
        ExecutionEngine::new(
            self.rules.clone(),
            self.schemas.clone(),
            Arc::new(HttpWebhookClient::new(Duration::from_millis(500))),
        )
        .with_cache(self.cache.clone())
    }

    fn service(&self) -> RuleService {
        RuleService::new(self.rules.clone(), self.schemas.clone(), self.cache.clone())
    }
}

fn order_rule(id: &str, priority: i32, conditions: Vec<Condition>) -> Rule {
    Rule::new(id, "order", "fraud")
        .with_id(id)
        .with_priority(priority)
        .with_conditions(ConditionGroup::all(conditions))
}

// ============================================================================
// 条件评估
// ============================================================================

#[test]
fn test_empty_groups_are_vacuous() {
    let evaluator = ConditionEvaluator::untyped();
    let fact = json!({"amount": 1});

    assert!(evaluator.evaluate(&ConditionGroup::all(vec![]), &fact));
    assert!(!evaluator.evaluate(&ConditionGroup::any(vec![]), &fact));
}

#[test]
fn test_null_checks_ignore_value() {
    let evaluator = ConditionEvaluator::untyped();
    let facts = [json!({"a": null}), json!({"a": 1}), json!({})];

    for fact in &facts {
        let expected_null = evaluator.evaluate(
            &ConditionGroup::all(vec![Condition::new("a", Operator::IsNull, Value::Null)]),
            fact,
        );
        let expected_not_null = evaluator.evaluate(
            &ConditionGroup::all(vec![Condition::new("a", Operator::IsNotNull, Value::Null)]),
            fact,
        );

        for value in [json!(1), json!("x"), json!([1, 2]), json!({"k": true})] {
            let is_null =
                ConditionGroup::all(vec![Condition::new("a", Operator::IsNull, value.clone())]);
            let is_not_null =
                ConditionGroup::all(vec![Condition::new("a", Operator::IsNotNull, value)]);
            assert_eq!(evaluator.evaluate(&is_null, fact), expected_null);
            assert_eq!(evaluator.evaluate(&is_not_null, fact), expected_not_null);
        }
    }
}

#[test]
fn test_nested_condition_is_anded_with_parent() {
    let group: ConditionGroup = serde_json::from_value(json!({
        "operator": "all",
        "conditions": [{
            "fact": "a",
            "operator": "equals",
            "value": 1,
            "nested": {
                "operator": "any",
                "conditions": [{"fact": "b", "operator": "equals", "value": 2}]
            }
        }]
    }))
    .unwrap();

    let evaluator = ConditionEvaluator::untyped();
    assert!(evaluator.evaluate(&group, &json!({"a": 1, "b": 2})));
    assert!(!evaluator.evaluate(&group, &json!({"a": 1, "b": 3})));
    assert!(!evaluator.evaluate(&group, &json!({"a": 2, "b": 2})));
}

// ============================================================================
// 编译
// ============================================================================

#[test]
fn test_compile_is_idempotent() {
    let rule_set = RuleSet::new("fraud", "fraud detection").with_input("order");
    let ctx = CompileContext::new(&rule_set, Arc::new(order_schema()), vec![]);
    let rule = order_rule(
        "big",
        10,
        vec![Condition::new("Order.amount", Operator::GreaterThan, 10000)],
    )
    .with_action(RuleAction::modify("status", "FLAGGED"));

    let compiler = RuleCompiler::new();
    let first = compiler.compile(&rule, &ctx).unwrap();
    let second = compiler.compile(&rule, &ctx).unwrap();

    assert_eq!(first, second);
    assert!(first.drl.contains("rule \"big\""));
}

#[test]
fn test_compile_rejects_invalid_rules() {
    let rule_set = RuleSet::new("fraud", "fraud detection").with_input("order");
    let ctx = CompileContext::new(&rule_set, Arc::new(order_schema()), vec![]);
    let compiler = RuleCompiler::new();

    let unknown_path = order_rule(
        "r1",
        0,
        vec![Condition::new("customer.segment", Operator::Equals, "X")],
    );
    assert!(matches!(
        compiler.compile(&unknown_path, &ctx),
        Err(RuleError::PathNotFound { .. })
    ));

    let wrong_operator = order_rule(
        "r2",
        0,
        vec![Condition::new("status", Operator::GreaterThan, 5)],
    );
    assert!(matches!(
        compiler.compile(&wrong_operator, &ctx),
        Err(RuleError::InvalidOperator { .. })
    ));
}

#[tokio::test]
async fn test_fingerprint_changes_with_schema_version() {
    let harness = Harness::with_rules(vec![order_rule(
        "big",
        0,
        vec![Condition::new("amount", Operator::GreaterThan, 10)],
    )]);
    let service = harness.service();

    let before = service.regenerate("big").await.unwrap();
    harness.schemas.insert(order_schema().with_version("2.0"));
    let after = service.regenerate("big").await.unwrap();

    assert_ne!(before.fingerprint, after.fingerprint);
    assert_eq!(before.drl, after.drl);
}

// ============================================================================
// 动作
// ============================================================================

#[tokio::test]
async fn test_modify_leaves_other_fields_untouched() {
    let harness = Harness::with_rules(vec![
        order_rule("flag", 0, vec![]).with_action(RuleAction::modify("status", "FLAGGED")),
    ]);

    let report = harness
        .engine()
        .execute("fraud", ExecuteRequest::new(vec![json!({"status": "OK", "id": 1})]))
        .await;

    assert!(report.success, "{:?}", report.error_message);
    assert_eq!(report.result_facts, vec![json!({"status": "FLAGGED", "id": 1})]);
    // 自身的修改不会再次激活自己
    assert_eq!(report.fire_count("flag"), 1);
}

#[tokio::test]
async fn test_insert_applies_schema_defaults() {
    let harness = Harness::with_rules(vec![
        order_rule(
            "risky",
            0,
            vec![Condition::new("amount", Operator::GreaterThan, 10000)],
        )
        .with_action(RuleAction::insert("RiskScore", json!({"riskLevel": "HIGH"}))),
    ]);

    let report = harness
        .engine()
        .execute("fraud", ExecuteRequest::new(vec![json!({"amount": 50000})]))
        .await;

    assert!(report.success, "{:?}", report.error_message);
    assert_eq!(
        report.result_facts,
        vec![
            json!({"amount": 50000}),
            json!({"riskLevel": "HIGH", "riskScore": 0, "category": "fraud"}),
        ]
    );
}

#[tokio::test]
async fn test_retract_hides_fact_from_later_rules() {
    let harness = Harness::with_rules(vec![
        order_rule(
            "drop-spam",
            10,
            vec![Condition::new("status", Operator::Equals, "SPAM")],
        )
        .with_action(RuleAction::retract()),
        order_rule("audit", 1, vec![]).with_action(RuleAction::log("audit {id}")),
    ]);

    let report = harness
        .engine()
        .execute(
            "fraud",
            ExecuteRequest::new(vec![
                json!({"id": 1, "status": "SPAM"}),
                json!({"id": 2, "status": "OK"}),
            ]),
        )
        .await;

    assert!(report.success);
    assert_eq!(report.result_facts, vec![json!({"id": 2, "status": "OK"})]);
    assert_eq!(report.fire_count("audit"), 1);
    assert_eq!(report.logs, vec!["[RULE LOG] audit 2 | Fact: Order"]);
}

#[tokio::test]
async fn test_log_interpolates_fact_fields() {
    let harness = Harness::with_rules(vec![order_rule("log", 0, vec![]).with_action(
        RuleAction::log("order {id} from {customer.tier} customer: {amount}"),
    )]);

    let report = harness
        .engine()
        .execute(
            "fraud",
            ExecuteRequest::new(vec![json!({"id": 7, "amount": 12.5, "customer": {"tier": "GOLD"}})]),
        )
        .await;

    assert_eq!(
        report.logs,
        vec!["[RULE LOG] order 7 from GOLD customer: 12.5 | Fact: Order"]
    );
}

// ============================================================================
// 执行引擎
// ============================================================================

#[tokio::test]
async fn test_activation_group_suppresses_lower_priority() {
    let harness = Harness::with_rules(vec![
        order_rule(
            "over-5000",
            1,
            vec![Condition::new("amount", Operator::GreaterThan, 5000)],
        )
        .with_activation_group("amount-tier")
        .with_action(RuleAction::log("tier 2")),
        order_rule(
            "over-10000",
            10,
            vec![Condition::new("amount", Operator::GreaterThan, 10000)],
        )
        .with_activation_group("amount-tier")
        .with_action(RuleAction::log("tier 1")),
    ]);

    let report = harness
        .engine()
        .execute("fraud", ExecuteRequest::new(vec![json!({"amount": 15000})]))
        .await;

    assert!(report.success);
    assert_eq!(report.fire_count("over-10000"), 1);
    assert_eq!(report.fire_count("over-5000"), 0);
}

#[tokio::test]
async fn test_forward_chaining_on_inserted_fact() {
    let alert_rule = Rule::new("escalate", "alert", "fraud")
        .with_id("escalate")
        .with_conditions(ConditionGroup::all(vec![Condition::new(
            "level",
            Operator::Equals,
            "HIGH",
        )]))
        .with_action(RuleAction::log("alert {level}"));

    let harness = Harness::with_rules(vec![
        order_rule(
            "raise",
            10,
            vec![Condition::new("amount", Operator::GreaterThan, 1000)],
        )
        .with_action(RuleAction::insert("Alert", json!({"level": "HIGH"}))),
        alert_rule,
    ]);

    let report = harness
        .engine()
        .execute("fraud", ExecuteRequest::new(vec![json!({"amount": 5000})]))
        .await;

    assert!(report.success, "{:?}", report.error_message);
    assert_eq!(report.fire_count("raise"), 1);
    assert_eq!(report.fire_count("escalate"), 1);
    assert_eq!(report.result_facts.len(), 2);
    assert_eq!(report.logs, vec!["[RULE LOG] alert HIGH | Fact: Alert"]);
}

#[tokio::test]
async fn test_iteration_cap_is_fatal() {
    let harness = Harness::with_rules(vec![
        order_rule("to-b", 0, vec![Condition::new("status", Operator::Equals, "A")])
            .with_action(RuleAction::modify("status", "B")),
        order_rule("to-a", 0, vec![Condition::new("status", Operator::Equals, "B")])
            .with_action(RuleAction::modify("status", "A")),
    ]);

    let report = harness
        .engine()
        .execute("fraud", ExecuteRequest::new(vec![json!({"status": "A"})]))
        .await;

    assert!(!report.success);
    assert!(report.result_facts.is_empty());
    assert!(report.fired_rules.is_empty());
    assert!(report.error_message.unwrap().contains("最大迭代次数"));
}

#[tokio::test]
async fn test_date_window_filters_rules() {
    let harness = Harness::with_rules(vec![
        order_rule("promo", 0, vec![])
            .with_window(Some("2024-01-01"), Some("2024-02-01"))
            .with_action(RuleAction::log("promo")),
    ]);
    let engine = harness.engine();

    let outside = engine
        .execute(
            "fraud",
            ExecuteRequest {
                as_of: Some("2024-03-01T00:00:00Z".parse().unwrap()),
                ..ExecuteRequest::new(vec![json!({"id": 1})])
            },
        )
        .await;
    assert_eq!(outside.fire_count("promo"), 0);

    let inside = engine
        .execute(
            "fraud",
            ExecuteRequest {
                as_of: Some("2024-01-15T00:00:00Z".parse().unwrap()),
                ..ExecuteRequest::new(vec![json!({"id": 1})])
            },
        )
        .await;
    assert_eq!(inside.fire_count("promo"), 1);
}

#[tokio::test]
async fn test_disabled_rules_do_not_fire() {
    let harness = Harness::with_rules(vec![
        order_rule("flag", 0, vec![]).with_action(RuleAction::modify("status", "FLAGGED")),
    ]);
    harness.service().toggle_rule("flag", false).await.unwrap();

    let report = harness
        .engine()
        .execute("fraud", ExecuteRequest::new(vec![json!({"status": "OK"})]))
        .await;
    assert!(report.success);
    assert!(report.fired_rules.is_empty());
    assert_eq!(report.result_facts, vec![json!({"status": "OK"})]);
}

#[tokio::test]
async fn test_malformed_facts_are_fatal() {
    let harness = Harness::new();

    let report = harness
        .engine()
        .execute("fraud", ExecuteRequest::new(vec![json!(["not", "an", "object"])]))
        .await;
    assert!(!report.success);
    assert!(report.error_message.is_some());

    let report = harness
        .engine()
        .execute("unknown", ExecuteRequest::new(vec![json!({})]))
        .await;
    assert!(!report.success);
}

#[tokio::test]
async fn test_dry_run_is_not_persisted() {
    let harness = Harness::with_rules(vec![
        order_rule("seen-ok", 10, vec![Condition::new("status", Operator::Equals, "OK")])
            .with_action(RuleAction::log("status={status}")),
        order_rule("flag", 1, vec![]).with_action(RuleAction::modify("status", "FLAGGED")),
    ]);
    let store = Arc::new(InMemoryFactStore::new());
    store.put("fraud", vec![json!({"id": 1, "status": "OK"})]);
    let engine = harness.engine().with_fact_store(store.clone());

    let dry = engine.execute_stored("fraud", true).await;
    assert!(dry.success);
    assert!(dry.dry_run);
    assert_eq!(dry.result_facts, vec![json!({"id": 1, "status": "FLAGGED"})]);
    assert_eq!(
        store.load_facts("fraud").await.unwrap(),
        vec![json!({"id": 1, "status": "OK"})]
    );

    let real = engine.execute_stored("fraud", false).await;
    assert!(real.success);
    assert_eq!(real.logs, vec!["[RULE LOG] status=OK | Fact: Order"]);
    assert_eq!(
        store.load_facts("fraud").await.unwrap(),
        vec![json!({"id": 1, "status": "FLAGGED"})]
    );
}

#[tokio::test]
async fn test_history_is_recorded() {
    let harness = Harness::with_rules(vec![
        order_rule("flag", 0, vec![]).with_action(RuleAction::modify("status", "FLAGGED")),
    ]);
    let history = Arc::new(InMemoryHistory::new());
    let engine = harness.engine().with_history(history.clone());

    let report = engine
        .execute("fraud", ExecuteRequest::new(vec![json!({"status": "OK"})]).dry_run())
        .await;

    for _ in 0..50 {
        if !history.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let records = history.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, report.execution_id);
    assert!(records[0].dry_run);
    assert_eq!(records[0].input_facts, vec![json!({"status": "OK"})]);
}

#[tokio::test]
async fn test_history_disabled_by_config() {
    let harness = Harness::with_rules(vec![]);
    let history = Arc::new(InMemoryHistory::new());
    let engine = harness
        .engine()
        .with_history(history.clone())
        .with_config(EngineConfig {
            history_enabled: false,
            ..Default::default()
        });

    engine
        .execute("fraud", ExecuteRequest::new(vec![json!({})]))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(history.is_empty());
}

// ============================================================================
// Webhook
// ============================================================================

#[tokio::test]
async fn test_webhook_failure_does_not_fail_execution() {
    let harness = Harness::with_rules(vec![order_rule("notify", 0, vec![]).with_action(
        RuleAction::webhook("http://127.0.0.1:1/hook", HttpMethod::Post),
    )]);

    let report = harness
        .engine()
        .execute("fraud", ExecuteRequest::new(vec![json!({"id": 1})]))
        .await;

    assert!(report.success);
    assert_eq!(report.fire_count("notify"), 1);
    assert_eq!(report.webhook_results.len(), 1);
    assert!(!report.webhook_results[0].success);
    assert_eq!(report.webhook_results[0].status_code, 0);
}

#[tokio::test]
async fn test_webhook_delivers_interpolated_body() {
    use axum::{Router, routing::post};

    // 回显请求体
    let app = Router::new().route("/hook", post(|body: String| async move { body }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let mut action = RuleAction::webhook(format!("http://{}/hook", addr), HttpMethod::Post);
    if let RuleAction::Webhook(webhook) = &mut action {
        webhook.webhook_body_template = Some(r#"{"order": {id}, "status": "{status}"}"#.to_string());
    }
    let harness = Harness::with_rules(vec![order_rule("notify", 0, vec![]).with_action(action)]);

    let report = harness
        .engine()
        .execute(
            "fraud",
            ExecuteRequest::new(vec![json!({"id": 42, "status": "NEW"})]).dry_run(),
        )
        .await;

    assert!(report.success);
    let result = &report.webhook_results[0];
    assert!(result.success, "{:?}", result);
    assert_eq!(result.status_code, 200);
    assert_eq!(result.response, r#"{"order": 42, "status": "NEW"}"#);
}

// ============================================================================
// 匹配载荷
// ============================================================================

#[tokio::test]
async fn test_match_payload_triggers_rule() {
    let nested = Condition::new("", Operator::Equals, Value::Null).with_nested(ConditionGroup::any(
        vec![
            Condition::new("customer.tier", Operator::Equals, "GOLD"),
            Condition::new("status", Operator::Equals, "VIP"),
        ],
    ));
    let harness = Harness::with_rules(vec![
        order_rule(
            "vip-big",
            0,
            vec![
                Condition::new("amount", Operator::GreaterThanOrEquals, 500),
                Condition::new("amount", Operator::LessThan, 1000),
                nested,
            ],
        )
        .with_action(RuleAction::log("hit")),
    ]);

    let payload = harness.service().get_match_payload("vip-big").await.unwrap();
    assert_eq!(payload, json!({"amount": 500, "customer": {"tier": "GOLD"}}));

    let report = harness
        .engine()
        .execute("fraud", ExecuteRequest::new(vec![payload]))
        .await;
    assert_eq!(report.fire_count("vip-big"), 1);
}

#[tokio::test]
async fn test_match_payload_reports_conflicts() {
    let harness = Harness::with_rules(vec![order_rule(
        "impossible",
        0,
        vec![
            Condition::new("amount", Operator::GreaterThan, 100),
            Condition::new("amount", Operator::LessThan, 50),
        ],
    )]);

    let err = harness
        .service()
        .get_match_payload("impossible")
        .await
        .unwrap_err();
    assert!(matches!(err, RuleError::Unsatisfiable(_)));
    assert!(err.is_validation());
}
