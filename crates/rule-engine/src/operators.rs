//! 规则操作符定义

use crate::schema::PropertyType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 条件操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    // 通用比较
    Equals,
    NotEquals,

    // 数值比较
    GreaterThan,
    GreaterThanOrEquals,
    LessThan,
    LessThanOrEquals,

    // 包含检查
    Contains,
    NotContains,
    MemberOf,
    NotMemberOf,

    // 字符串操作
    StartsWith,
    EndsWith,
    Matches,

    // 时间操作
    Before,
    After,

    // 空值检查
    IsNull,
    IsNotNull,
}

impl Operator {
    pub const ALL: [Operator; 17] = [
        Self::Equals,
        Self::NotEquals,
        Self::GreaterThan,
        Self::GreaterThanOrEquals,
        Self::LessThan,
        Self::LessThanOrEquals,
        Self::Contains,
        Self::NotContains,
        Self::MemberOf,
        Self::NotMemberOf,
        Self::StartsWith,
        Self::EndsWith,
        Self::Matches,
        Self::Before,
        Self::After,
        Self::IsNull,
        Self::IsNotNull,
    ];

    /// 操作符是否适用于给定的属性类型
    ///
    /// 数值比较只用于 number/integer；startsWith、endsWith、matches、before、after
    /// 只用于 string；contains/notContains 用于 string 或 array；其余适用于所有类型。
    pub fn applies_to(&self, property_type: PropertyType) -> bool {
        match self {
            Self::GreaterThan
            | Self::GreaterThanOrEquals
            | Self::LessThan
            | Self::LessThanOrEquals => property_type.is_numeric(),
            Self::StartsWith | Self::EndsWith | Self::Matches | Self::Before | Self::After => {
                property_type == PropertyType::String
            }
            Self::Contains | Self::NotContains => {
                matches!(property_type, PropertyType::String | PropertyType::Array)
            }
            Self::Equals
            | Self::NotEquals
            | Self::MemberOf
            | Self::NotMemberOf
            | Self::IsNull
            | Self::IsNotNull => true,
        }
    }

    /// 不读取 value 的操作符
    pub fn is_unary(&self) -> bool {
        matches!(self, Self::IsNull | Self::IsNotNull)
    }

    /// 实际值为空时结果为 true 的取反类操作符
    pub fn is_negated(&self) -> bool {
        matches!(self, Self::NotEquals | Self::NotContains | Self::NotMemberOf)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::GreaterThan | Self::GreaterThanOrEquals | Self::LessThan | Self::LessThanOrEquals
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Equals => "equals",
            Self::NotEquals => "notEquals",
            Self::GreaterThan => "greaterThan",
            Self::GreaterThanOrEquals => "greaterThanOrEquals",
            Self::LessThan => "lessThan",
            Self::LessThanOrEquals => "lessThanOrEquals",
            Self::Contains => "contains",
            Self::NotContains => "notContains",
            Self::MemberOf => "memberOf",
            Self::NotMemberOf => "notMemberOf",
            Self::StartsWith => "startsWith",
            Self::EndsWith => "endsWith",
            Self::Matches => "matches",
            Self::Before => "before",
            Self::After => "after",
            Self::IsNull => "isNull",
            Self::IsNotNull => "isNotNull",
        };
        write!(f, "{}", s)
    }
}

/// 逻辑操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    #[serde(alias = "AND")]
    All,
    #[serde(alias = "OR")]
    Any,
}

impl fmt::Display for LogicalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Any => write!(f, "any"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_serde_names() {
        let op: Operator = serde_json::from_str("\"greaterThanOrEquals\"").unwrap();
        assert_eq!(op, Operator::GreaterThanOrEquals);
        assert_eq!(
            serde_json::to_string(&Operator::NotMemberOf).unwrap(),
            "\"notMemberOf\""
        );
        for op in Operator::ALL {
            let json = serde_json::to_string(&op).unwrap();
            assert_eq!(json, format!("\"{}\"", op));
        }
    }

    #[test]
    fn test_operator_type_gate() {
        assert!(Operator::GreaterThan.applies_to(PropertyType::Integer));
        assert!(!Operator::GreaterThan.applies_to(PropertyType::String));
        assert!(Operator::Contains.applies_to(PropertyType::Array));
        assert!(!Operator::Contains.applies_to(PropertyType::Number));
        assert!(!Operator::Before.applies_to(PropertyType::Number));
        assert!(Operator::IsNull.applies_to(PropertyType::Object));
        assert!(Operator::MemberOf.applies_to(PropertyType::Boolean));
    }

    #[test]
    fn test_logical_operator_aliases() {
        let op: LogicalOperator = serde_json::from_str("\"AND\"").unwrap();
        assert_eq!(op, LogicalOperator::All);
        let op: LogicalOperator = serde_json::from_str("\"any\"").unwrap();
        assert_eq!(op, LogicalOperator::Any);
    }
}
