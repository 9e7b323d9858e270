//! 服务器生命周期测试
//!
//! 使用进程内注册中心观察注册、心跳、回滚和注销。

use async_trait::async_trait;
use bytes::Bytes;
use flare_rpc_discovery::error::{ErrorCode, FlareError, Result};
use flare_rpc_discovery::health::STATUS_OK;
use flare_rpc_discovery::registry::{GetOptions, MemoryRegistry, RegisterOptions, Registry, Service};
use flare_rpc_discovery::server::{
    GrpcServer, RpcHandler, ServerOptions, ServerState, ServiceInfo,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tonic::{Request, Response, Status};

struct Greeter;

#[async_trait]
impl RpcHandler for Greeter {
    async fn call(&self, _method: &str, request: Request<Bytes>) -> std::result::Result<Response<Bytes>, Status> {
        Ok(Response::new(request.into_inner()))
    }
}

/// 指定服务名的注册总是失败
struct RejectingRegistry {
    inner: MemoryRegistry,
    reject: &'static str,
    rejected: AtomicUsize,
}

#[async_trait]
impl Registry for RejectingRegistry {
    fn name(&self) -> &str {
        "rejecting"
    }

    async fn register(&self, service: &Service, options: &RegisterOptions) -> Result<()> {
        if service.name == self.reject {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(FlareError::connection_failed("registry unreachable"));
        }
        self.inner.register(service, options).await
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        self.inner.deregister(service).await
    }

    async fn get_service(&self, name: &str, options: &GetOptions) -> Result<Vec<Service>> {
        self.inner.get_service(name, options).await
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        self.inner.list_services().await
    }
}

fn greeter_service() -> ServiceInfo {
    ServiceInfo::new("api", "Greeter", Arc::new(Greeter))
        .with_version("1.0.0")
        .with_method("SayHello")
}

fn options(registry: Arc<dyn Registry>) -> ServerOptions {
    ServerOptions::new(registry)
        .with_bind_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_port_range(30000, 40000)
        .with_register_backoff(Duration::from_millis(10))
        .with_shutdown_timeout(Duration::from_secs(2))
}

#[tokio::test]
async fn start_registers_and_stop_deregisters() {
    let registry = Arc::new(MemoryRegistry::new());
    let server = GrpcServer::new(options(registry.clone()));
    assert_eq!(server.state(), ServerState::Created);

    server.start(vec![greeter_service()]).await.unwrap();
    assert_eq!(server.state(), ServerState::Serving);
    assert!(server.health().is_serving().await);

    let local = server.local_addr().await.unwrap();
    let http = server.http_addr().await.unwrap();
    assert_eq!(http.port(), local.port() + 1);
    assert_eq!(
        server.advertised_address().await.unwrap(),
        format!("127.0.0.1:{}", local.port())
    );

    let node_id = format!("Greeter:127.0.0.1:{}", local.port());
    let records = server.registrations().await;
    assert_eq!(records.len(), 1);
    assert!(records[0].registered);
    assert_eq!(records[0].key, "api.Greeter");
    assert_eq!(records[0].node_id(), node_id);

    let instance = registry.instance(&node_id).await.unwrap();
    assert_eq!(instance.name, "Greeter");
    assert_eq!(instance.version, "1.0.0");
    assert_eq!(instance.endpoints[0].name, "Greeter.SayHello");
    let node = &instance.nodes[0];
    assert_eq!(node.address, format!("127.0.0.1:{}", local.port()));
    assert_eq!(node.metadata.get("protocol").map(String::as_str), Some("grpc"));
    assert_eq!(node.metadata.get("language").map(String::as_str), Some("rust"));

    let body = reqwest::get(format!("http://{}/status", http))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, STATUS_OK);
    let health = reqwest::get(format!("http://{}/health", http)).await.unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);

    server.stop().await.unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(!server.is_started().await);
    assert!(registry.instance(&node_id).await.is_none());
    assert!(!server.health().is_serving().await);
    assert!(tokio::net::TcpStream::connect(local).await.is_err());
    assert!(tokio::net::TcpStream::connect(http).await.is_err());
}

#[tokio::test]
async fn second_start_is_a_no_op() {
    let registry = Arc::new(MemoryRegistry::new());
    let server = GrpcServer::new(options(registry.clone()));

    server.start(vec![greeter_service()]).await.unwrap();
    let calls = registry.register_count();
    let addr = server.local_addr().await;

    server.start(vec![greeter_service()]).await.unwrap();
    assert_eq!(registry.register_count(), calls);
    assert_eq!(server.local_addr().await, addr);

    server.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn heartbeat_keeps_reregistering() {
    let registry = Arc::new(MemoryRegistry::new());
    let server = GrpcServer::new(
        options(registry.clone()).with_register_interval(Duration::from_millis(50)),
    );

    server.start(vec![greeter_service()]).await.unwrap();
    let after_start = registry.register_count();
    let index = registry.current_index();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(registry.register_count() >= after_start + 3);
    // 内容未变的重复注册不改变变更索引
    assert_eq!(registry.current_index(), index);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn heartbeat_restores_removed_registration() {
    let registry = Arc::new(MemoryRegistry::new());
    let server = GrpcServer::new(
        options(registry.clone()).with_register_interval(Duration::from_millis(50)),
    );
    server.start(vec![greeter_service()]).await.unwrap();

    let record = server.registrations().await.remove(0);
    registry.deregister(&record.service).await.unwrap();
    assert!(registry.instance(record.node_id()).await.is_none());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(registry.instance(record.node_id()).await.is_some());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn failed_registration_rolls_back() {
    let registry = Arc::new(RejectingRegistry {
        inner: MemoryRegistry::new(),
        reject: "Echo",
        rejected: AtomicUsize::new(0),
    });
    let server = GrpcServer::new(options(registry.clone()).with_register_attempts(3));

    let echo = ServiceInfo::new("api", "Echo", Arc::new(Greeter));
    let err = server
        .start(vec![greeter_service(), echo])
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(ErrorCode::RegistrationFailed));
    assert_eq!(registry.rejected.load(Ordering::SeqCst), 3);
    assert_eq!(server.state(), ServerState::Created);
    assert!(!server.is_started().await);
    assert!(!server.health().is_serving().await);

    // 已成功的注册被回滚
    let remaining = registry.inner.list_services().await.unwrap();
    assert!(remaining.is_empty(), "{:?}", remaining);
}

#[tokio::test]
async fn failed_start_can_be_retried() {
    let registry = Arc::new(RejectingRegistry {
        inner: MemoryRegistry::new(),
        reject: "Echo",
        rejected: AtomicUsize::new(0),
    });
    let server = GrpcServer::new(options(registry.clone()).with_register_attempts(1));

    let echo = ServiceInfo::new("api", "Echo", Arc::new(Greeter));
    assert!(server.start(vec![echo]).await.is_err());

    server.start(vec![greeter_service()]).await.unwrap();
    assert_eq!(server.state(), ServerState::Serving);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn start_without_services_is_rejected() {
    let server = GrpcServer::new(options(Arc::new(MemoryRegistry::new())));
    let err = server.start(Vec::new()).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::ConfigurationError));
    assert_eq!(server.state(), ServerState::Created);
}

#[tokio::test]
async fn stop_before_start_is_a_no_op() {
    let server = GrpcServer::new(options(Arc::new(MemoryRegistry::new())));
    server.stop().await.unwrap();
    assert_eq!(server.state(), ServerState::Created);
}
