//! gRPC 客户端模块
//!
//! 一个 `GrpcClient` 对应一个发现目标（如 `consul://Greeter`），内部组合了
//! 解析器、子连接池和轮询选择器。调用方只需要提供完整方法路径和原始字节。

pub mod codec;
pub mod manager;
pub mod pool;

pub use codec::BytesCodec;
pub use manager::ClientManager;
pub use pool::{SubConn, SubConnPool};

use crate::balancer::{PickInfo, RoundRobinBuilder};
use crate::config::ClientConfig;
use crate::error::{ErrorCode, FlareError, Result};
use crate::registry::Registry;
use crate::resolver::{Resolver, ResolverBuilder, ResolverOptions, Target};
use async_trait::async_trait;
use bytes::Bytes;
use http::uri::PathAndQuery;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response};
use tracing::{debug, info};

/// 客户端参数
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    /// 单次调用的总时限，包括等待就绪连接的时间
    pub request_timeout: Duration,
    pub resolver: ResolverOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl ClientOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            resolver: ResolverOptions::from_config(config),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_resolver(mut self, resolver: ResolverOptions) -> Self {
        self.resolver = resolver;
        self
    }
}

/// 面向发现目标的逻辑客户端
#[async_trait]
pub trait Client: Send + Sync {
    /// 构建时使用的目标字符串
    fn target(&self) -> &str;

    async fn invoke_request(
        &self,
        method: &str,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>>;

    /// 以原始字节发起一次一元调用
    async fn invoke(&self, method: &str, payload: Bytes) -> Result<Bytes> {
        self.invoke_request(method, Request::new(payload))
            .await
            .map(Response::into_inner)
    }

    async fn close(&self);
}

/// 基于服务发现的 gRPC 客户端
pub struct GrpcClient {
    target: String,
    pool: SubConnPool,
    resolver: Resolver,
    options: ClientOptions,
}

impl GrpcClient {
    pub fn connect(target: &str, resolvers: &ResolverBuilder, options: ClientOptions) -> Result<Self> {
        let parsed = Target::parse(target)?;
        let pool = SubConnPool::new(target, Arc::new(RoundRobinBuilder), options.connect_timeout);
        let resolver = resolvers.build(&parsed, Arc::new(pool.clone()))?;

        info!(
            target_addr = %target,
            balancer = %pool.balancer_name(),
            "✅ gRPC client created"
        );

        Ok(Self {
            target: target.to_string(),
            pool,
            resolver,
            options,
        })
    }

    pub fn pool(&self) -> &SubConnPool {
        &self.pool
    }

    /// 选择一个就绪连接；暂无就绪连接时等待选择器重建，直到截止时间
    async fn pick(&self, method: &str, metadata: &MetadataMap, deadline: Instant) -> Result<SubConn> {
        let mut pickers = self.pool.subscribe();
        loop {
            let picker = pickers.borrow_and_update().clone();
            match picker.pick(&PickInfo::new(method).with_metadata(metadata)) {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is(ErrorCode::Unavailable) => {}
                Err(e) => return Err(e),
            }

            match tokio::time::timeout_at(deadline, pickers.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(FlareError::unavailable(format!(
                        "client for {} is closed",
                        self.target
                    )));
                }
                Err(_) => {
                    return Err(FlareError::unavailable(format!(
                        "no ready connection for {} within {:?}",
                        self.target, self.options.request_timeout
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl Client for GrpcClient {
    fn target(&self) -> &str {
        &self.target
    }

    async fn invoke_request(
        &self,
        method: &str,
        mut request: Request<Bytes>,
    ) -> Result<Response<Bytes>> {
        if !method.starts_with('/') {
            return Err(FlareError::configuration(format!(
                "invalid method '{}', expected '/<package>.<service>/<method>'",
                method
            )));
        }
        let path = PathAndQuery::try_from(method)
            .map_err(|e| FlareError::configuration(format!("invalid method '{}': {}", method, e)))?;

        let start = Instant::now();
        let deadline = start + self.options.request_timeout;
        let conn = self.pick(method, request.metadata(), deadline).await?;
        request.set_timeout(deadline.saturating_duration_since(Instant::now()));

        let mut grpc = tonic::client::Grpc::new(conn.channel.clone());
        let call = async {
            grpc.ready().await.map_err(|e| {
                FlareError::connection_failed(format!("connection to {} not ready", conn.address))
                    .with_details(e.to_string())
            })?;
            grpc.unary(request, path, BytesCodec)
                .await
                .map_err(FlareError::from)
        };

        let result = match tokio::time::timeout_at(deadline, call).await {
            Ok(Err(e)) if e.is(ErrorCode::Unavailable) || e.is(ErrorCode::ConnectionFailed) => {
                self.pool.report_failure(&conn);
                Err(e)
            }
            Ok(result) => result,
            Err(_) => Err(FlareError::timeout(format!(
                "call {} exceeded {:?}",
                method, self.options.request_timeout
            ))),
        };

        debug!(
            target_addr = %self.target,
            method = %method,
            address = %conn.address,
            duration_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "gRPC call finished"
        );
        result
    }

    async fn close(&self) {
        self.resolver.close().await;
        self.pool.close();
        info!(target_addr = %self.target, "gRPC client closed");
    }
}

/// 客户端工厂
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(&self, target: &str) -> Result<Arc<dyn Client>>;
}

/// 按 scheme 选择解析器来创建 `GrpcClient`
#[derive(Clone)]
pub struct GrpcClientFactory {
    resolvers: HashMap<String, ResolverBuilder>,
    options: ClientOptions,
}

impl GrpcClientFactory {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            resolvers: HashMap::new(),
            options,
        }
    }

    /// 注册一个解析器，scheme 取自注册中心名称
    pub fn with_registry(self, registry: Arc<dyn Registry>) -> Self {
        let builder = ResolverBuilder::new(registry).with_options(self.options.resolver.clone());
        self.with_resolver(builder)
    }

    pub fn with_resolver(mut self, builder: ResolverBuilder) -> Self {
        self.resolvers.insert(builder.scheme().to_string(), builder);
        self
    }
}

#[async_trait]
impl ClientFactory for GrpcClientFactory {
    async fn create(&self, target: &str) -> Result<Arc<dyn Client>> {
        let parsed = Target::parse(target)?;
        let builder = self.resolvers.get(&parsed.scheme).ok_or_else(|| {
            FlareError::configuration(format!("no resolver registered for scheme '{}'", parsed.scheme))
        })?;
        let client = GrpcClient::connect(target, builder, self.options.clone())?;
        Ok(Arc::new(client))
    }
}
