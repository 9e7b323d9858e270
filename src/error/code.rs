//! 错误代码定义
//!
//! 错误代码按类别分组，每个类别占用1000个代码范围：
//! - 1000-1999: 连接相关错误
//! - 2000-2999: 服务发现相关错误
//! - 6000-6999: 系统相关错误

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误代码枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 连接相关错误 (1000-1999)
    // ============================================================
    ConnectionFailed = 1000,
    /// 已解析到地址，但没有任何就绪连接
    Unavailable = 1001,
    /// 长轮询、拨号或调用超时
    Timeout = 1002,

    // ============================================================
    // 服务发现相关错误 (2000-2999)
    // ============================================================
    /// 服务没有任何实例
    NotFound = 2000,
    /// 注册中心注册/注销调用失败
    RegistrationFailed = 2001,
    /// 注册中心返回了无法处理的响应
    BackendError = 2002,

    // ============================================================
    // 系统相关错误 (6000-6999)
    // ============================================================
    InternalError = 6000,
    /// 目标地址格式错误、未声明服务等配置问题
    ConfigurationError = 6003,
}

impl ErrorCode {
    /// 获取错误代码的数值
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// 获取错误代码的英文标识符
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::RegistrationFailed => "REGISTRATION_FAILED",
            ErrorCode::BackendError => "BACKEND_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
        }
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionFailed
                | ErrorCode::Unavailable
                | ErrorCode::Timeout
                | ErrorCode::RegistrationFailed
                | ErrorCode::BackendError
        )
    }

    /// 映射为 gRPC 状态码
    pub fn to_grpc_code(&self) -> tonic::Code {
        match self {
            ErrorCode::ConnectionFailed | ErrorCode::Unavailable => tonic::Code::Unavailable,
            ErrorCode::Timeout => tonic::Code::DeadlineExceeded,
            ErrorCode::NotFound => tonic::Code::NotFound,
            ErrorCode::ConfigurationError => tonic::Code::InvalidArgument,
            ErrorCode::RegistrationFailed | ErrorCode::BackendError | ErrorCode::InternalError => {
                tonic::Code::Internal
            }
        }
    }

    /// 从 gRPC 状态码还原错误代码
    pub fn from_grpc_code(code: tonic::Code) -> Self {
        match code {
            tonic::Code::Unavailable => ErrorCode::Unavailable,
            tonic::Code::DeadlineExceeded => ErrorCode::Timeout,
            tonic::Code::NotFound => ErrorCode::NotFound,
            tonic::Code::InvalidArgument => ErrorCode::ConfigurationError,
            _ => ErrorCode::InternalError,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
