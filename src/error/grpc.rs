//! gRPC 错误处理
//!
//! 提供 tonic::Status 与 FlareError 之间的转换

use super::{ErrorCode, FlareError};
use tonic::{Code, Status};

impl From<FlareError> for Status {
    fn from(err: FlareError) -> Self {
        match err {
            FlareError::Localized {
                code,
                reason,
                details,
                ..
            } => {
                let message = match details {
                    Some(details) => format!("{}: {}", reason, details),
                    None => reason,
                };
                Status::new(code.to_grpc_code(), message)
            }
            FlareError::System(msg) => Status::internal(msg),
        }
    }
}

impl From<Status> for FlareError {
    fn from(status: Status) -> Self {
        match status.code() {
            Code::Ok => FlareError::system("unexpected ok status converted to error"),
            code => FlareError::localized(ErrorCode::from_grpc_code(code), status.message())
                .with_details(format!("grpc code: {:?}", code)),
        }
    }
}

impl From<tonic::transport::Error> for FlareError {
    fn from(err: tonic::transport::Error) -> Self {
        FlareError::connection_failed(err.to_string())
    }
}
