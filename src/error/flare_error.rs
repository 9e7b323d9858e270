//! 统一错误类型

use super::code::ErrorCode;
use thiserror::Error;

/// 服务发现与 RPC 统一错误类型
#[derive(Error, Debug, Clone)]
pub enum FlareError {
    /// 带错误代码的错误（可以暴露给调用方）
    #[error("错误 [{code}] {reason}", code = .code.as_str())]
    Localized {
        code: ErrorCode,
        reason: String,
        details: Option<String>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// 系统错误（用于内部错误，不暴露给用户）
    #[error("系统错误: {0}")]
    System(String),
}

impl FlareError {
    /// 创建带错误代码的错误
    pub fn localized(code: ErrorCode, reason: impl Into<String>) -> Self {
        FlareError::Localized {
            code,
            reason: reason.into(),
            details: None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// 创建系统错误
    pub fn system(msg: impl Into<String>) -> Self {
        FlareError::System(msg.into())
    }

    /// 附加错误详情（仅对 Localized 生效）
    pub fn with_details(self, details: impl Into<String>) -> Self {
        match self {
            FlareError::Localized {
                code,
                reason,
                timestamp,
                ..
            } => FlareError::Localized {
                code,
                reason,
                details: Some(details.into()),
                timestamp,
            },
            other => other,
        }
    }

    // ============================================================
    // 便捷方法
    // ============================================================

    /// 服务没有任何实例
    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::NotFound, reason)
    }

    /// 没有就绪连接
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::Unavailable, reason)
    }

    /// 超时
    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::Timeout, reason)
    }

    /// 注册中心注册/注销失败
    pub fn registration_failed(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::RegistrationFailed, reason)
    }

    /// 配置错误
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::ConfigurationError, reason)
    }

    /// 连接失败
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::ConnectionFailed, reason)
    }

    /// 注册中心响应异常
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::BackendError, reason)
    }

    // ============================================================
    // 信息获取方法
    // ============================================================

    /// 获取错误代码
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            FlareError::Localized { code, .. } => Some(*code),
            FlareError::System(_) => None,
        }
    }

    /// 获取错误原因
    pub fn reason(&self) -> &str {
        match self {
            FlareError::Localized { reason, .. } => reason,
            FlareError::System(msg) => msg,
        }
    }

    /// 获取错误详情
    pub fn details(&self) -> Option<&str> {
        match self {
            FlareError::Localized { details, .. } => details.as_deref(),
            FlareError::System(_) => None,
        }
    }

    /// 判断错误代码是否一致
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code() == Some(code)
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        self.code().map(|code| code.is_retryable()).unwrap_or(false)
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, FlareError>;
