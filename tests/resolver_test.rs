//! 解析器集成测试
//!
//! 使用进程内注册中心驱动 watch 循环，通过记录型 sink 观察推送。

use async_trait::async_trait;
use flare_rpc_discovery::error::{ErrorCode, FlareError, Result};
use flare_rpc_discovery::registry::{
    GetOptions, MemoryRegistry, Node, RegisterOptions, Registry, Service,
};
use flare_rpc_discovery::resolver::{
    AddressSink, ResolverBuilder, ResolverOptions, ResolverState, Target,
};
use flare_rpc_discovery::retry::StepBackoffPolicy;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_millis(200);

struct RecordingSink {
    tx: mpsc::UnboundedSender<ResolverState>,
    failures: AtomicUsize,
}

impl RecordingSink {
    fn new(failures: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<ResolverState>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(Self {
            tx,
            failures: AtomicUsize::new(failures),
        });
        (sink, rx)
    }
}

#[async_trait]
impl AddressSink for RecordingSink {
    async fn update_state(&self, state: ResolverState) -> Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(FlareError::unavailable("sink is busy"));
        }
        let _ = self.tx.send(state);
        Ok(())
    }
}

/// 前几次查询失败的注册中心
struct FlakyRegistry {
    inner: MemoryRegistry,
    failures: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl Registry for FlakyRegistry {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn register(&self, service: &Service, options: &RegisterOptions) -> Result<()> {
        self.inner.register(service, options).await
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        self.inner.deregister(service).await
    }

    async fn get_service(&self, name: &str, options: &GetOptions) -> Result<Vec<Service>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(FlareError::connection_failed("registry unreachable"));
        }
        self.inner.get_service(name, options).await
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        self.inner.list_services().await
    }
}

/// 不返回变更索引的注册中心
struct IndexlessRegistry {
    inner: MemoryRegistry,
    calls: AtomicUsize,
}

#[async_trait]
impl Registry for IndexlessRegistry {
    fn name(&self) -> &str {
        "indexless"
    }

    async fn register(&self, service: &Service, options: &RegisterOptions) -> Result<()> {
        self.inner.register(service, options).await
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        self.inner.deregister(service).await
    }

    async fn get_service(&self, name: &str, _options: &GetOptions) -> Result<Vec<Service>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_service(name, &GetOptions::default()).await
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        self.inner.list_services().await
    }
}

fn instance(port: u16) -> Service {
    Service::new("Greeter")
        .with_version("1.0.0")
        .with_metadata("zone", "sh-1")
        .with_node(Node::new(
            format!("Greeter:127.0.0.1:{}", port),
            format!("127.0.0.1:{}", port),
        ))
}

fn options() -> ResolverOptions {
    ResolverOptions::default()
        .with_wait_time(WAIT)
        .with_backoff(StepBackoffPolicy::new(
            Duration::from_millis(20),
            5,
            Duration::from_millis(100),
        ))
}

async fn next_state(rx: &mut mpsc::UnboundedReceiver<ResolverState>) -> ResolverState {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("resolver did not push in time")
        .expect("sink channel closed")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<ResolverState>) {
    let pushed = tokio::time::timeout(WAIT * 3, rx.recv()).await;
    assert!(pushed.is_err(), "unexpected push: {:?}", pushed);
}

fn addrs(state: &ResolverState) -> Vec<&str> {
    state.addresses.iter().map(|a| a.addr.as_str()).collect()
}

#[test]
fn target_parsing() {
    let target = Target::parse("consul://Greeter.dc1").unwrap();
    assert_eq!(target.scheme, "consul");
    assert_eq!(target.service, "Greeter");
    assert_eq!(target.datacenter.as_deref(), Some("dc1"));
    assert_eq!(target.to_string(), "consul://Greeter.dc1");

    let target = Target::parse("memory://Greeter").unwrap();
    assert_eq!(target.datacenter, None);

    for bad in ["Greeter", "consul://", "consul://a.b.c", "://Greeter", "consul://.dc1"] {
        let err = Target::parse(bad).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ConfigurationError), "{}", bad);
    }
}

#[tokio::test]
async fn build_rejects_foreign_scheme() {
    let builder = ResolverBuilder::new(Arc::new(MemoryRegistry::new()));
    assert_eq!(builder.scheme(), "memory");

    let (sink, _rx) = RecordingSink::new(0);
    let target = Target::parse("consul://Greeter").unwrap();
    let err = builder.build(&target, sink).err().unwrap();
    assert_eq!(err.code(), Some(ErrorCode::ConfigurationError));
}

#[tokio::test]
async fn pushes_follow_instance_changes() {
    let registry = Arc::new(MemoryRegistry::new());
    let options_register = RegisterOptions::default();
    registry.register(&instance(9001), &options_register).await.unwrap();
    registry.register(&instance(9000), &options_register).await.unwrap();

    let builder = ResolverBuilder::new(registry.clone()).with_options(options());
    let (sink, mut rx) = RecordingSink::new(0);
    let resolver = builder
        .build(&Target::parse("memory://Greeter").unwrap(), sink)
        .unwrap();

    // 初始快照按地址排序，并携带版本与服务元数据
    let state = next_state(&mut rx).await;
    assert_eq!(addrs(&state), vec!["127.0.0.1:9000", "127.0.0.1:9001"]);
    assert_eq!(state.addresses[0].attributes.version, "1.0.0");
    assert_eq!(
        state.addresses[0].attributes.metadata.get("zone").map(String::as_str),
        Some("sh-1")
    );

    // 心跳式重复注册不产生推送
    registry.register(&instance(9000), &options_register).await.unwrap();
    assert_quiet(&mut rx).await;

    // 实例进入 critical 后被摘除
    assert!(registry.set_critical("Greeter:127.0.0.1:9001", true).await);
    let state = next_state(&mut rx).await;
    assert_eq!(addrs(&state), vec!["127.0.0.1:9000"]);

    // 全部下线时推送一次空列表
    registry.deregister(&instance(9000)).await.unwrap();
    let state = next_state(&mut rx).await;
    assert!(state.addresses.is_empty());

    // 已经为空时不再推送
    registry.deregister(&instance(9001)).await.unwrap();
    assert_quiet(&mut rx).await;

    registry.register(&instance(9002), &options_register).await.unwrap();
    let state = next_state(&mut rx).await;
    assert_eq!(addrs(&state), vec!["127.0.0.1:9002"]);

    resolver.close().await;
}

#[tokio::test]
async fn empty_service_is_not_pushed_initially() {
    let registry = Arc::new(MemoryRegistry::new());
    let builder = ResolverBuilder::new(registry.clone()).with_options(options());
    let (sink, mut rx) = RecordingSink::new(0);
    let resolver = builder
        .build(&Target::parse("memory://Greeter").unwrap(), sink)
        .unwrap();

    assert_quiet(&mut rx).await;
    resolver.close().await;
}

#[tokio::test]
async fn sink_failure_is_retried_on_next_poll() {
    let registry = Arc::new(MemoryRegistry::new());
    registry
        .register(&instance(9000), &RegisterOptions::default())
        .await
        .unwrap();

    let builder = ResolverBuilder::new(registry.clone()).with_options(options());
    let (sink, mut rx) = RecordingSink::new(1);
    let resolver = builder
        .build(&Target::parse("memory://Greeter").unwrap(), sink)
        .unwrap();

    let state = next_state(&mut rx).await;
    assert_eq!(addrs(&state), vec!["127.0.0.1:9000"]);
    resolver.close().await;
}

#[tokio::test]
async fn query_errors_back_off_and_recover() {
    let registry = Arc::new(FlakyRegistry {
        inner: MemoryRegistry::new(),
        failures: AtomicUsize::new(3),
        calls: AtomicUsize::new(0),
    });
    registry
        .register(&instance(9000), &RegisterOptions::default())
        .await
        .unwrap();

    let builder = ResolverBuilder::new(registry.clone()).with_options(options());
    let (sink, mut rx) = RecordingSink::new(0);
    let resolver = builder
        .build(&Target::parse("flaky://Greeter").unwrap(), sink)
        .unwrap();

    let state = next_state(&mut rx).await;
    assert_eq!(addrs(&state), vec!["127.0.0.1:9000"]);
    assert!(registry.calls.load(Ordering::SeqCst) >= 4);
    resolver.close().await;
}

#[tokio::test]
async fn close_interrupts_backoff() {
    let registry = Arc::new(FlakyRegistry {
        inner: MemoryRegistry::new(),
        failures: AtomicUsize::new(usize::MAX),
        calls: AtomicUsize::new(0),
    });
    let options = ResolverOptions::default().with_backoff(StepBackoffPolicy::new(
        Duration::from_secs(30),
        5,
        Duration::from_secs(60),
    ));
    let builder = ResolverBuilder::new(registry.clone()).with_options(options);
    let (sink, _rx) = RecordingSink::new(0);
    let resolver = builder
        .build(&Target::parse("flaky://Greeter").unwrap(), sink)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    tokio::time::timeout(Duration::from_secs(1), resolver.close())
        .await
        .expect("close waited out the backoff");
    assert_eq!(registry.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn closed_resolver_stops_pushing() {
    let registry = Arc::new(MemoryRegistry::new());
    let builder = ResolverBuilder::new(registry.clone()).with_options(options());
    let (sink, mut rx) = RecordingSink::new(0);
    let resolver = builder
        .build(&Target::parse("memory://Greeter").unwrap(), sink)
        .unwrap();
    resolver.resolve_now();
    resolver.close().await;

    registry
        .register(&instance(9000), &RegisterOptions::default())
        .await
        .unwrap();
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn missing_index_does_not_spin() {
    let registry = Arc::new(IndexlessRegistry {
        inner: MemoryRegistry::new(),
        calls: AtomicUsize::new(0),
    });
    registry
        .register(&instance(9000), &RegisterOptions::default())
        .await
        .unwrap();

    let builder = ResolverBuilder::new(registry.clone()).with_options(options());
    let (sink, mut rx) = RecordingSink::new(0);
    let resolver = builder
        .build(&Target::parse("indexless://Greeter").unwrap(), sink)
        .unwrap();

    let state = next_state(&mut rx).await;
    assert_eq!(addrs(&state), vec!["127.0.0.1:9000"]);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(registry.calls.load(Ordering::SeqCst) <= 2);
    resolver.close().await;
}
