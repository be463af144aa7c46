//! 规则引擎错误类型
//!
//! 所有错误按处理方式归为五类（见 [`ErrorKind`]），调用方据此决定是拒绝请求、
//! 记录到执行报告中继续，还是终止整次执行。

use thiserror::Error;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 校验失败：路径无法解析、操作符与类型不匹配、载荷约束无法满足
    Validation,
    /// 编译失败：规则无法生成可执行产物
    Compilation,
    /// 单条规则在触发过程中出错，记录后继续执行
    Evaluation,
    /// 外部调用失败（Webhook），只记录不终止
    Integration,
    /// 致命错误，终止整次执行
    Fatal,
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Schema 不存在: {0}")]
    SchemaNotFound(String),

    #[error("Schema 定义无效: {0}")]
    InvalidSchema(String),

    #[error("路径无法解析: schema={schema} path={path}")]
    PathNotFound { schema: String, path: String },

    #[error("无效的操作符: {operator} 不支持类型 {property_type}")]
    InvalidOperator {
        operator: String,
        property_type: String,
    },

    #[error("条件值无效: {path} - {message}")]
    InvalidValue { path: String, message: String },

    #[error("规则定义无效: {0}")]
    InvalidRule(String),

    #[error("条件无法满足: {0}")]
    Unsatisfiable(String),

    #[error("规则编译失败: {rule_id} - {message}")]
    CompileError { rule_id: String, message: String },

    #[error("规则执行失败: {0}")]
    ExecutionError(String),

    #[error("类型不匹配: 期望 {expected}, 实际 {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Webhook 调用失败: {url} - {message}")]
    WebhookError { url: String, message: String },

    #[error("事实数据格式错误: {0}")]
    MalformedFacts(String),

    #[error("规则集不存在: {0}")]
    RuleSetNotFound(String),

    #[error("规则未找到: {0}")]
    RuleNotFound(String),

    #[error("超过最大迭代次数: {0}")]
    IterationLimitExceeded(usize),

    #[error("执行超时: {0}ms")]
    Timeout(u64),

    #[error("数据源错误: {0}")]
    Repository(String),

    #[error("JSON 序列化错误: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl RuleError {
    /// 错误所属类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PathNotFound { .. }
            | Self::InvalidOperator { .. }
            | Self::InvalidValue { .. }
            | Self::InvalidRule(_)
            | Self::Unsatisfiable(_) => ErrorKind::Validation,
            Self::CompileError { .. } | Self::InvalidSchema(_) => ErrorKind::Compilation,
            Self::ExecutionError(_) | Self::TypeMismatch { .. } => ErrorKind::Evaluation,
            Self::WebhookError { .. } => ErrorKind::Integration,
            Self::SchemaNotFound(_)
            | Self::MalformedFacts(_)
            | Self::RuleSetNotFound(_)
            | Self::RuleNotFound(_)
            | Self::IterationLimitExceeded(_)
            | Self::Timeout(_)
            | Self::Repository(_)
            | Self::JsonError(_) => ErrorKind::Fatal,
        }
    }

    /// 获取错误码（用于上层 API 返回）
    pub fn code(&self) -> &'static str {
        match self {
            Self::SchemaNotFound(_) => "SCHEMA_NOT_FOUND",
            Self::InvalidSchema(_) => "INVALID_SCHEMA",
            Self::PathNotFound { .. } => "PATH_NOT_FOUND",
            Self::InvalidOperator { .. } => "INVALID_OPERATOR",
            Self::InvalidValue { .. } => "INVALID_VALUE",
            Self::InvalidRule(_) => "INVALID_RULE",
            Self::Unsatisfiable(_) => "UNSATISFIABLE",
            Self::CompileError { .. } => "COMPILE_ERROR",
            Self::ExecutionError(_) => "EXECUTION_ERROR",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::WebhookError { .. } => "WEBHOOK_ERROR",
            Self::MalformedFacts(_) => "MALFORMED_FACTS",
            Self::RuleSetNotFound(_) => "RULE_SET_NOT_FOUND",
            Self::RuleNotFound(_) => "RULE_NOT_FOUND",
            Self::IterationLimitExceeded(_) => "ITERATION_LIMIT_EXCEEDED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Repository(_) => "REPOSITORY_ERROR",
            Self::JsonError(_) => "JSON_ERROR",
        }
    }

    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}

pub type Result<T> = std::result::Result<T, RuleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        let err = RuleError::PathNotFound {
            schema: "Order".to_string(),
            path: "amount".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.code(), "PATH_NOT_FOUND");

        let err = RuleError::CompileError {
            rule_id: "r1".to_string(),
            message: "bad window".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Compilation);

        assert_eq!(RuleError::IterationLimitExceeded(1000).kind(), ErrorKind::Fatal);
        assert_eq!(RuleError::MalformedFacts("x".into()).kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_error_display() {
        let err = RuleError::InvalidOperator {
            operator: "greaterThan".to_string(),
            property_type: "string".to_string(),
        };
        assert!(err.to_string().contains("greaterThan"));
        assert!(err.to_string().contains("string"));
    }
}
