//! 业务规则引擎
//!
//! 基于 Schema 的条件/动作规则模型，提供：
//! - Schema 类型注册与路径解析
//! - 嵌套 all/any 条件组的短路求值
//! - 规则编译（校验、指纹、DRL 渲染）与编译缓存
//! - 带优先级、激活组、前向链式推理的执行引擎
//! - 命中规则的示例载荷生成

pub mod action;
pub mod compiler;
pub mod drl;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod fact;
pub mod models;
pub mod operators;
pub mod path;
pub mod payload;
pub mod repository;
pub mod schema;
pub mod service;
pub mod store;
pub mod webhook;

pub use compiler::{CompileContext, CompiledRule, RuleCompiler};
pub use engine::ExecutionEngine;
pub use error::{ErrorKind, Result, RuleError};
pub use evaluator::ConditionEvaluator;
pub use models::{
    Condition, ConditionGroup, ExecuteRequest, ExecutionReport, FiredRule, HttpMethod, Rule,
    RuleAction, RuleSet, WebhookResult,
};
pub use operators::{LogicalOperator, Operator};
pub use payload::MatchPayloadGenerator;
pub use schema::{PropertyType, Schema, SchemaProperty, SchemaRegistry};
pub use service::{RuleService, SaveOutcome};
pub use store::CompiledRuleCache;
pub use webhook::{HttpWebhookClient, WebhookClient};
