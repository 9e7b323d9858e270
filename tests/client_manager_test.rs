//! 客户端缓存测试

use async_trait::async_trait;
use bytes::Bytes;
use flare_rpc_discovery::client::{
    Client, ClientFactory, ClientManager, ClientOptions, GrpcClientFactory,
};
use flare_rpc_discovery::error::{ErrorCode, FlareError, Result};
use flare_rpc_discovery::registry::MemoryRegistry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tonic::{Request, Response};

struct EchoClient {
    target: String,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Client for EchoClient {
    fn target(&self) -> &str {
        &self.target
    }

    async fn invoke_request(&self, _method: &str, request: Request<Bytes>) -> Result<Response<Bytes>> {
        Ok(Response::new(request.into_inner()))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// 记录创建次数，前 `failures` 次创建失败
struct CountingFactory {
    created: AtomicUsize,
    failures: AtomicUsize,
    closed: Arc<AtomicBool>,
}

impl CountingFactory {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            created: AtomicUsize::new(0),
            failures: AtomicUsize::new(failures),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[async_trait]
impl ClientFactory for CountingFactory {
    async fn create(&self, target: &str) -> Result<Arc<dyn Client>> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(FlareError::connection_failed("factory not ready"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        // 拉长创建窗口，让并发调用方在锁上排队
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(Arc::new(EchoClient {
            target: target.to_string(),
            closed: self.closed.clone(),
        }))
    }
}

#[tokio::test]
async fn concurrent_callers_share_one_client() {
    let factory = CountingFactory::new(0);
    let manager = Arc::new(ClientManager::new(factory.clone()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager.get_client("memory://Greeter").await.unwrap()
        }));
    }

    let mut clients = Vec::new();
    for handle in handles {
        clients.push(handle.await.unwrap());
    }

    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    assert!(clients.iter().all(|c| Arc::ptr_eq(c, &clients[0])));
    assert_eq!(manager.len().await, 1);

    let reply = clients[0].invoke("/api.Greeter/SayHello", Bytes::from_static(b"hi")).await.unwrap();
    assert_eq!(reply, Bytes::from_static(b"hi"));
}

#[tokio::test]
async fn distinct_targets_get_distinct_clients() {
    let factory = CountingFactory::new(0);
    let manager = ClientManager::new(factory.clone());

    let a = manager.get_client("memory://Greeter").await.unwrap();
    let b = manager.get_client("memory://Echo").await.unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(a.target(), "memory://Greeter");
    assert_eq!(b.target(), "memory://Echo");
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_creation_is_not_cached() {
    let factory = CountingFactory::new(1);
    let manager = ClientManager::new(factory.clone());

    let err = manager.get_client("memory://Greeter").await.err().unwrap();
    assert_eq!(err.code(), Some(ErrorCode::ConnectionFailed));
    assert!(manager.is_empty().await);

    manager.get_client("memory://Greeter").await.unwrap();
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    assert_eq!(manager.len().await, 1);
}

#[tokio::test]
async fn close_all_closes_and_empties() {
    let factory = CountingFactory::new(0);
    let manager = ClientManager::new(factory.clone());
    manager.get_client("memory://Greeter").await.unwrap();

    manager.close_all().await;
    assert!(factory.closed.load(Ordering::SeqCst));
    assert!(manager.is_empty().await);

    manager.get_client("memory://Greeter").await.unwrap();
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn grpc_factory_rejects_unknown_scheme() {
    let factory = GrpcClientFactory::new(ClientOptions::default())
        .with_registry(Arc::new(MemoryRegistry::new()));
    let manager = ClientManager::new(Arc::new(factory));

    let err = manager.get_client("consul://Greeter").await.err().unwrap();
    assert_eq!(err.code(), Some(ErrorCode::ConfigurationError));

    let err = manager.get_client("not-a-target").await.err().unwrap();
    assert_eq!(err.code(), Some(ErrorCode::ConfigurationError));
}

#[tokio::test]
async fn grpc_client_without_instances_is_unavailable() {
    let options = ClientOptions::default().with_request_timeout(Duration::from_millis(200));
    let factory = GrpcClientFactory::new(options).with_registry(Arc::new(MemoryRegistry::new()));
    let manager = ClientManager::new(Arc::new(factory));

    let client = manager.get_client("memory://Greeter").await.unwrap();
    let err = client
        .invoke("/api.Greeter/SayHello", Bytes::from_static(b"hi"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::Unavailable));

    let err = client.invoke("api.Greeter/SayHello", Bytes::new()).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::ConfigurationError));

    manager.close_all().await;
}
