//! 数据产品服务错误类型
//!
//! 定义服务层的业务错误和系统错误

use catalog_shared::worker::WorkerError;
use thiserror::Error;

use crate::query::QueryError;

/// 数据产品服务错误类型
#[derive(Debug, Error)]
pub enum DataProductError {
    // === 资源不存在 ===
    #[error("数据产品不存在: {0}")]
    NotFound(String),

    #[error("规则不存在: {0}")]
    RuleNotFound(String),

    #[error("资产不存在: {0}")]
    AssetNotFound(String),

    // === 输入错误 ===
    #[error("无效输入: {0}")]
    InvalidInput(String),

    #[error("资源冲突: {0}")]
    Conflict(String),

    #[error("规则数量超出上限: 每个数据产品最多 {max} 条")]
    TooManyRules { max: usize },

    // === 协作方错误 ===
    #[error("查询表达式错误: {0}")]
    Query(#[from] QueryError),

    #[error("后台任务错误: {0}")]
    Worker(#[from] WorkerError),

    // === 系统错误 ===
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, DataProductError>;

impl DataProductError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "DATA_PRODUCT_NOT_FOUND",
            Self::RuleNotFound(_) => "RULE_NOT_FOUND",
            Self::AssetNotFound(_) => "ASSET_NOT_FOUND",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Conflict(_) => "CONFLICT",
            Self::TooManyRules { .. } => "TOO_MANY_RULES",
            Self::Query(_) => "QUERY_ERROR",
            Self::Worker(e) => e.code(),
            Self::Database(_) => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            Self::Worker(WorkerError::QueueFull(_)) | Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// 是否为资源不存在类错误
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::RuleNotFound(_) | Self::AssetNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        assert_eq!(
            DataProductError::NotFound("dp-1".into()).error_code(),
            "DATA_PRODUCT_NOT_FOUND"
        );
        assert_eq!(
            DataProductError::Worker(WorkerError::QueueFull("rule-evaluation".into())).error_code(),
            "QUEUE_FULL"
        );
    }

    #[test]
    fn test_sentinels_are_distinguishable() {
        let err = DataProductError::RuleNotFound("r-1".into());
        assert!(err.is_not_found());
        assert!(matches!(err, DataProductError::RuleNotFound(ref id) if id == "r-1"));
        assert!(!DataProductError::Internal("x".into()).is_not_found());
    }

    #[test]
    fn test_is_retryable() {
        assert!(DataProductError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!DataProductError::Database(sqlx::Error::RowNotFound).is_retryable());
        assert!(!DataProductError::InvalidInput("bad".into()).is_retryable());
    }
}
