//! DRL 文本渲染
//!
//! 编译产物附带一份 Drools 风格的规则文本，便于审阅和导出。
//! 执行不依赖该文本。

use crate::compiler::CompiledRule;
use crate::models::{Condition, ConditionGroup, RuleAction};
use crate::operators::{LogicalOperator, Operator};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;

pub struct DrlRenderer;

/// 以 Display 输出规则文本
struct Drl<'a>(&'a CompiledRule);

impl fmt::Display for Drl<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        DrlRenderer::write_to(self.0, f)
    }
}

impl DrlRenderer {
    pub fn render(rule: &CompiledRule) -> String {
        Drl(rule).to_string()
    }

    /// 写入任意 fmt::Write 目标，写入错误原样返回
    pub fn write_to<W: fmt::Write>(rule: &CompiledRule, out: &mut W) -> fmt::Result {
        writeln!(out, "rule \"{}\"", escape(&rule.name))?;
        writeln!(out, "    salience {}", rule.priority)?;
        if rule.no_loop {
            out.write_str("    no-loop true\n")?;
        }
        if let Some(group) = &rule.activation_group {
            writeln!(out, "    activation-group \"{}\"", escape(group))?;
        }
        if rule.lock_on_active {
            out.write_str("    lock-on-active true\n")?;
        }
        if let Some(effective) = rule.effective_window.effective {
            writeln!(out, "    date-effective \"{}\"", drools_date(effective))?;
        }
        if let Some(expires) = rule.effective_window.expires {
            writeln!(out, "    date-expires \"{}\"", drools_date(expires))?;
        }

        out.write_str("when\n")?;
        let constraints = Self::render_group(&rule.predicate, true);
        writeln!(out, "    $fact : {}( {} )", rule.fact_type, constraints)?;

        out.write_str("then\n")?;
        for action in &rule.effects {
            writeln!(out, "    {}", Self::render_action(action))?;
        }
        out.write_str("end\n")
    }

    fn render_group(group: &ConditionGroup, top_level: bool) -> String {
        let parts: Vec<String> = group
            .conditions
            .iter()
            .map(Self::render_condition)
            .collect();

        if parts.is_empty() {
            return match (group.operator, top_level) {
                (LogicalOperator::All, true) => String::new(),
                (LogicalOperator::All, false) => "eval(true)".to_string(),
                (LogicalOperator::Any, _) => "eval(false)".to_string(),
            };
        }

        let joined = match group.operator {
            LogicalOperator::All if top_level => parts.join(", "),
            LogicalOperator::All => parts.join(" && "),
            LogicalOperator::Any => parts.join(" || "),
        };
        if top_level || parts.len() == 1 {
            joined
        } else {
            format!("({})", joined)
        }
    }

    fn render_condition(cond: &Condition) -> String {
        let nested = cond.nested.as_ref().map(|g| Self::render_group(g, false));
        if cond.is_pure_group() {
            return nested.unwrap_or_default();
        }

        let field = cond.fact.as_str();
        let value = if cond.value_is_field {
            cond.value.as_str().unwrap_or_default().to_string()
        } else {
            literal(&cond.value)
        };

        let own = match cond.operator {
            Operator::Equals => format!("{} == {}", field, value),
            Operator::NotEquals => format!("{} != {}", field, value),
            Operator::GreaterThan => format!("{} > {}", field, value),
            Operator::GreaterThanOrEquals => format!("{} >= {}", field, value),
            Operator::LessThan => format!("{} < {}", field, value),
            Operator::LessThanOrEquals => format!("{} <= {}", field, value),
            Operator::Contains => format!("{} contains {}", field, value),
            Operator::NotContains => format!("{} not contains {}", field, value),
            Operator::MemberOf => format!("{} memberOf {}", field, value),
            Operator::NotMemberOf => format!("{} not memberOf {}", field, value),
            Operator::Matches => format!("{} matches {}", field, value),
            Operator::StartsWith => format!("{} str[startsWith] {}", field, value),
            Operator::EndsWith => format!("{} str[endsWith] {}", field, value),
            Operator::IsNull => format!("{} == null", field),
            Operator::IsNotNull => format!("{} != null", field),
            Operator::Before => format!("{} < {}", field, value),
            Operator::After => format!("{} > {}", field, value),
        };

        match nested {
            Some(nested) => format!("({} && {})", own, nested),
            None => own,
        }
    }

    fn render_action(action: &RuleAction) -> String {
        match action {
            RuleAction::Modify(m) => format!(
                "modify($fact) {{ set(\"{}\", {}) }}",
                escape(&m.target_field),
                literal(&m.value)
            ),
            RuleAction::Insert(i) => format!(
                "insert(new {}({}));",
                i.fact_type,
                Value::Object(i.fact_data.clone())
            ),
            RuleAction::Retract(r) => match &r.fact_type {
                Some(fact_type) => format!("retractAll(\"{}\");", escape(fact_type)),
                None => "retract($fact);".to_string(),
            },
            RuleAction::Log(l) => format!(
                "System.out.println(\"[RULE LOG] {}\");",
                escape(&l.log_message)
            ),
            RuleAction::Webhook(w) => format!(
                "webhook.call(\"{}\", \"{}\", $fact);",
                w.webhook_method,
                escape(&w.webhook_url)
            ),
        }
    }
}

fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", escape(s)),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(literal).collect();
            format!("({})", parts.join(", "))
        }
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn drools_date(t: DateTime<Utc>) -> String {
    t.format("%d-%b-%Y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompileContext, RuleCompiler};
    use crate::models::{Rule, RuleSet};
    use crate::schema::{PropertyType, Schema, SchemaProperty};
    use std::sync::Arc;

    fn compile(rule: Rule) -> CompiledRule {
        let schema = Arc::new(Schema::new(
            "order",
            "Order",
            vec![
                SchemaProperty::new("amount", PropertyType::Number),
                SchemaProperty::new("status", PropertyType::String),
                SchemaProperty::new("country", PropertyType::String),
            ],
        ));
        let rule_set = RuleSet::new("p1", "project");
        let ctx = CompileContext::new(&rule_set, schema, vec![]);
        RuleCompiler::new().compile(&rule, &ctx).unwrap()
    }

    #[test]
    fn test_render_attributes_and_actions() {
        let rule = Rule::new("flag \"big\"", "order", "p1")
            .with_priority(5)
            .with_activation_group("discount")
            .with_window(Some("2024-03-01"), None)
            .with_conditions(ConditionGroup::all(vec![Condition::new(
                "amount",
                Operator::GreaterThan,
                100,
            )]))
            .with_action(RuleAction::modify("status", "FLAGGED"))
            .with_action(RuleAction::retract());

        let drl = compile(rule).drl;
        assert!(drl.starts_with("rule \"flag \\\"big\\\"\"\n"));
        assert!(drl.contains("salience 5"));
        assert!(drl.contains("no-loop true"));
        assert!(drl.contains("activation-group \"discount\""));
        assert!(drl.contains("date-effective \"01-Mar-2024\""));
        assert!(drl.contains("$fact : Order( amount > 100 )"));
        assert!(drl.contains("modify($fact) { set(\"status\", \"FLAGGED\") }"));
        assert!(drl.contains("retract($fact);"));
        assert!(drl.ends_with("end\n"));
    }

    /// 写满上限后返回错误
    struct Bounded {
        buf: String,
        limit: usize,
    }

    impl fmt::Write for Bounded {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            if self.buf.len() + s.len() > self.limit {
                return Err(fmt::Error);
            }
            self.buf.push_str(s);
            Ok(())
        }
    }

    #[test]
    fn test_write_to_propagates_errors() {
        let rule = compile(
            Rule::new("flag", "order", "p1").with_action(RuleAction::modify("status", "FLAGGED")),
        );

        let mut full = Bounded { buf: String::new(), limit: usize::MAX };
        DrlRenderer::write_to(&rule, &mut full).unwrap();
        assert_eq!(full.buf, rule.drl);

        let mut short = Bounded { buf: String::new(), limit: 16 };
        assert!(DrlRenderer::write_to(&rule, &mut short).is_err());
        assert!(!short.buf.contains("when"));
    }

    #[test]
    fn test_render_nested_groups() {
        let rule = Rule::new("mixed", "order", "p1").with_conditions(ConditionGroup::all(vec![
            Condition::new("status", Operator::Equals, "OK"),
            Condition::new("", Operator::Equals, Value::Null).with_nested(ConditionGroup::any(
                vec![
                    Condition::new("country", Operator::MemberOf, vec!["CN", "US"]),
                    Condition::new("amount", Operator::IsNull, Value::Null),
                ],
            )),
        ]));

        let drl = compile(rule).drl;
        assert!(drl.contains(
            "$fact : Order( status == \"OK\", (country memberOf (\"CN\", \"US\") || amount == null) )"
        ));
    }
}
