//! Consul 集成测试
//!
//! 这些测试需要运行中的 Consul Agent。
//! 默认情况下，测试会被忽略，需要使用 `cargo test --test consul_live_test -- --ignored` 运行。
//!
//! 启动 Consul：
//! ```bash
//! docker run -d --name consul-test -p 8500:8500 hashicorp/consul:1.17 agent -dev -client=0.0.0.0
//! ```

use flare_rpc_discovery::config::RegistryConfig;
use flare_rpc_discovery::registry::{
    GetOptions, Node, QueryOptions, RegisterOptions, Registry, Service, create_registry,
};
use std::time::Duration;

/// 可以通过环境变量 CONSUL_ADDR 覆盖，默认为 127.0.0.1:8500
fn consul_config() -> RegistryConfig {
    RegistryConfig {
        registry_type: "consul".to_string(),
        addrs: vec![std::env::var("CONSUL_ADDR").unwrap_or_else(|_| "127.0.0.1:8500".to_string())],
        timeout_secs: 5,
    }
}

fn instance(port: u16) -> Service {
    Service::new("flare-live-test")
        .with_version("1.0.0")
        .with_metadata("env", "test")
        .with_node(
            Node::new(
                format!("flare-live-test:127.0.0.1:{}", port),
                format!("127.0.0.1:{}", port),
            )
            .with_metadata("protocol", "grpc"),
        )
}

#[tokio::test]
#[ignore]
async fn ttl_instance_is_discoverable_until_deregistered() {
    let registry = create_registry(&consul_config()).await.unwrap();
    let service = instance(31001);
    let options = RegisterOptions::default().with_ttl(Duration::from_secs(30));

    registry.register(&service, &options).await.unwrap();
    // 重复注册走去重路径
    registry.register(&service, &options).await.unwrap();

    let found = registry
        .get_service("flare-live-test", &GetOptions::default().with_passing_only(true))
        .await
        .unwrap();
    let ours = found
        .iter()
        .find(|s| s.nodes[0].id == service.nodes[0].id)
        .expect("registered instance not found");
    assert_eq!(ours.version, "1.0.0");
    assert_eq!(ours.metadata.get("env").map(String::as_str), Some("test"));
    assert_eq!(ours.nodes[0].metadata.get("protocol").map(String::as_str), Some("grpc"));

    let names = registry.list_services().await.unwrap();
    assert!(names.iter().any(|s| s.name == "flare-live-test"));

    registry.deregister(&service).await.unwrap();
    let found = registry
        .get_service("flare-live-test", &GetOptions::default())
        .await
        .unwrap();
    assert!(found.iter().all(|s| s.nodes[0].id != service.nodes[0].id));
}

#[tokio::test]
#[ignore]
async fn blocking_query_returns_after_wait() {
    let registry = create_registry(&consul_config()).await.unwrap();

    let first = registry
        .get_service(
            "flare-live-test-empty",
            &GetOptions::default().with_query(QueryOptions::default()),
        )
        .await
        .unwrap();
    assert!(first.is_empty());

    let index = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
    let observed = index.clone();
    registry
        .get_service(
            "flare-live-test-empty",
            &GetOptions::default()
                .with_query(QueryOptions::default())
                .with_result_callback(move |meta| {
                    observed.store(meta.last_index, std::sync::atomic::Ordering::SeqCst)
                }),
        )
        .await
        .unwrap();
    let last = index.load(std::sync::atomic::Ordering::SeqCst);
    assert!(last > 0);

    let start = std::time::Instant::now();
    registry
        .get_service(
            "flare-live-test-empty",
            &GetOptions::default().with_query(QueryOptions {
                wait_index: last,
                wait_time: Some(Duration::from_secs(1)),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    assert!(start.elapsed() >= Duration::from_millis(900));
}
