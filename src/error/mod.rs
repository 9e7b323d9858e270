//! 错误处理模块
//!
//! 提供统一的错误类型、错误代码分类以及与 gRPC Status 的转换

pub mod code;
pub mod flare_error;
pub mod grpc;

pub use code::ErrorCode;
pub use flare_error::{FlareError, Result};

/// 将基础设施错误转换为 `FlareError`
pub fn map_infra_error<E, S>(error: E, code: ErrorCode, message: S) -> FlareError
where
    E: std::fmt::Display,
    S: Into<String>,
{
    FlareError::localized(code, message).with_details(error.to_string())
}

/// `Result` 的辅助扩展，用于快速转换为统一的错误类型
pub trait ResultExt<T> {
    fn into_flare<S>(self, code: ErrorCode, message: S) -> Result<T>
    where
        S: Into<String>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn into_flare<S>(self, code: ErrorCode, message: S) -> Result<T>
    where
        S: Into<String>,
    {
        self.map_err(|err| map_infra_error(err, code, message))
    }
}
