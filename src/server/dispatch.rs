//! 请求分发
//!
//! 每个服务挂载在 `/<package>.<service>/*` 下，请求体按原始字节交给 `RpcHandler`。
//! 处理器中的 panic 会被捕获并转换为 `Status::internal`。

use super::service_info::{RpcHandler, ServiceInfo};
use crate::client::BytesCodec;
use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tonic::server::{Grpc, UnaryService};
use tonic::service::Routes;
use tonic::{Request, Response, Status};
use tracing::{debug, error};

/// 为所有服务构建路由
pub(crate) fn build_routes(services: &[ServiceInfo]) -> Routes {
    let mut router = axum::Router::new();
    for service in services {
        let path = format!("/{}/{{*method}}", service.key());
        router = router.route_service(&path, ServiceDispatcher::new(service));
    }
    Routes::from(router)
}

#[derive(Clone)]
struct ServiceDispatcher {
    service: ServiceInfo,
}

impl ServiceDispatcher {
    fn new(service: &ServiceInfo) -> Self {
        Self {
            service: service.clone(),
        }
    }
}

impl tower::Service<http::Request<axum::body::Body>> for ServiceDispatcher {
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<axum::body::Body>) -> Self::Future {
        let path = req.uri().path().to_string();
        let method = path.rsplit('/').next().unwrap_or_default().to_string();

        if !self.service.declares(&method) {
            let status = Status::unimplemented(format!("method {} is not declared", path));
            return Box::pin(async move { Ok(status.into_http()) });
        }

        let call = UnaryCall {
            path,
            method,
            handler: self.service.handler.clone(),
        };
        Box::pin(async move {
            let mut grpc = Grpc::new(BytesCodec);
            Ok(grpc.unary(call, req).await)
        })
    }
}

struct UnaryCall {
    path: String,
    method: String,
    handler: Arc<dyn RpcHandler>,
}

impl UnaryService<Bytes> for UnaryCall {
    type Response = Bytes;
    type Future = BoxFuture<'static, Result<Response<Bytes>, Status>>;

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let handler = self.handler.clone();
        let path = self.path.clone();
        let method = self.method.clone();

        Box::pin(async move {
            let start = Instant::now();
            let outcome = AssertUnwindSafe(handler.call(&method, request))
                .catch_unwind()
                .await;

            let result = match outcome {
                Ok(result) => result,
                Err(panic) => {
                    error!(method = %path, panic = %panic_message(&panic), "❌ Handler panicked");
                    Err(Status::internal(format!("internal error while handling {}", path)))
                }
            };

            debug!(
                method = %path,
                duration_ms = start.elapsed().as_millis() as u64,
                code = ?result.as_ref().err().map(|s| s.code()),
                "gRPC request handled"
            );
            result
        })
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
