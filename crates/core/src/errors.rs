use thiserror::Error;

/// 编排器错误类型定义
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("参数校验失败: {0}")]
    Validation(#[from] ValidationError),

    #[error("非法状态转换: {entity} 在状态 '{from}' 下不允许执行 '{action}'")]
    StateTransition {
        entity: &'static str,
        from: String,
        action: String,
    },

    #[error("配额不足: {0}")]
    QuotaExceeded(String),

    #[error("{kind}未找到: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("外部服务调用失败 [{provider}]: {message}")]
    ExternalProvider { provider: String, message: String },

    #[error("等待超时: {operation} 在 {timeout_seconds} 秒内未完成")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("操作已取消: {0}")]
    Cancelled(String),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 校验错误
///
/// 每种拒绝原因对应一个稳定的变体，调用方可以按变体匹配。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("无效的套餐类型: {0}")]
    InvalidPlanType(String),

    #[error("无效的资源规格: {field} 必须大于0")]
    InvalidResourceSpec { field: &'static str },

    #[error("价格不能为负数: {0}")]
    NegativePrice(String),

    #[error("无效的节点规格: {0}")]
    InvalidNodeSpec(String),

    #[error("无效的计费周期: {0}")]
    InvalidBillingPeriod(String),

    #[error("无效的请求: {0}")]
    InvalidRequest(String),
}

impl OrchestratorError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn external(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalProvider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::Validation(ValidationError::InvalidRequest(message.into()))
    }

    /// 判断错误是否可由任务引擎重试
    ///
    /// 超时不在此列：重新发起创建调用可能产生重复的外部资源。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalProvider { .. } | Self::Database(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(OrchestratorError::external("node-gateway", "connection reset").is_retryable());
        assert!(!OrchestratorError::Timeout {
            operation: "wait_for_ready".to_string(),
            timeout_seconds: 300
        }
        .is_retryable());
        assert!(!OrchestratorError::invalid_request("bad").is_retryable());
        assert!(!OrchestratorError::QuotaExceeded("cpu".to_string()).is_retryable());
        assert!(!OrchestratorError::not_found("节点", "n-1").is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = OrchestratorError::StateTransition {
            entity: "节点",
            from: "stopped".to_string(),
            action: "complete".to_string(),
        };
        assert!(err.to_string().contains("stopped"));
        assert!(err.to_string().contains("complete"));

        let err: OrchestratorError = ValidationError::NegativePrice("-1".to_string()).into();
        assert!(matches!(
            err,
            OrchestratorError::Validation(ValidationError::NegativePrice(_))
        ));
    }
}
