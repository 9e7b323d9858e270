//! 服务注册发现模块
//!
//! `Registry` 是对外部注册中心的抽象，提供注册、注销、查询服务实例的能力。
//! 目前支持的后端：
//! - `consul`：基于 Consul HTTP API
//! - `memory`：进程内实现，用于本地开发与测试

pub mod consul;
pub mod memory;
pub mod types;

pub use consul::ConsulRegistry;
pub use memory::MemoryRegistry;
pub use types::{Endpoint, Node, Service, Value};

use crate::config::RegistryConfig;
use crate::error::{FlareError, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// 注册中心 Trait
#[async_trait]
pub trait Registry: Send + Sync {
    /// 后端名称，同时作为解析器的 scheme
    fn name(&self) -> &str;

    /// 注册服务实例（内容未变化时跳过网络注册）
    async fn register(&self, service: &Service, options: &RegisterOptions) -> Result<()>;

    /// 按 `Node.id` 注销服务实例
    async fn deregister(&self, service: &Service) -> Result<()>;

    /// 查询服务实例，永远不会返回处于 critical 状态的实例
    ///
    /// 没有实例时返回空列表而不是错误。
    async fn get_service(&self, name: &str, options: &GetOptions) -> Result<Vec<Service>>;

    /// 列出所有服务名（只填充 `name`）
    async fn list_services(&self) -> Result<Vec<Service>>;
}

/// 健康检查方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckTarget {
    /// TCP 探测，值为 `host:port`
    Tcp(String),
    /// HTTP 探测，值为 URL
    Http(String),
}

/// 健康检查定义
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSpec {
    pub target: CheckTarget,
    pub interval: Duration,
    pub timeout: Duration,
}

impl CheckSpec {
    /// interval 或 timeout 为 0 时返回 None（不启用）
    pub fn tcp(addr: impl Into<String>, interval: Duration, timeout: Duration) -> Option<Self> {
        Self::build(CheckTarget::Tcp(addr.into()), interval, timeout)
    }

    /// interval 或 timeout 为 0 时返回 None（不启用）
    pub fn http(url: impl Into<String>, interval: Duration, timeout: Duration) -> Option<Self> {
        Self::build(CheckTarget::Http(url.into()), interval, timeout)
    }

    fn build(target: CheckTarget, interval: Duration, timeout: Duration) -> Option<Self> {
        if interval.is_zero() || timeout.is_zero() {
            return None;
        }
        Some(Self {
            target,
            interval,
            timeout,
        })
    }
}

/// 注册选项
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub ttl: Duration,
    pub tcp_check: Option<CheckSpec>,
    pub http_check: Option<CheckSpec>,
}

impl RegisterOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_tcp_check(mut self, check: Option<CheckSpec>) -> Self {
        self.tcp_check = check;
        self
    }

    pub fn with_http_check(mut self, check: Option<CheckSpec>) -> Self {
        self.http_check = check;
        self
    }

    /// 按优先级 TCP > HTTP 选出的探测检查
    pub fn probe_check(&self) -> Option<&CheckSpec> {
        self.tcp_check.as_ref().or(self.http_check.as_ref())
    }

    /// 生效的 TTL：配置了 TCP/HTTP 检查时为 0
    pub fn effective_ttl(&self) -> Duration {
        if self.probe_check().is_some() {
            Duration::ZERO
        } else {
            self.ttl
        }
    }
}

/// 查询元信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryMeta {
    /// 后端变更索引，用于下一次长轮询
    pub last_index: u64,
    pub known_leader: bool,
}

/// 长轮询查询参数
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub wait_index: u64,
    pub wait_time: Option<Duration>,
    /// 就近排序，例如 `_agent`
    pub near: Option<String>,
    pub datacenter: Option<String>,
    pub allow_stale: bool,
}

/// 查询结果回调
pub type QueryCallback = Arc<dyn Fn(&QueryMeta) + Send + Sync>;

/// 查询选项
#[derive(Clone, Default)]
pub struct GetOptions {
    pub passing_only: bool,
    /// 为 None 时执行一次允许旧数据的普通查询
    pub query: Option<QueryOptions>,
    pub on_result: Option<QueryCallback>,
}

impl GetOptions {
    pub fn with_passing_only(mut self, passing_only: bool) -> Self {
        self.passing_only = passing_only;
        self
    }

    pub fn with_query(mut self, query: QueryOptions) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_result_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&QueryMeta) + Send + Sync + 'static,
    {
        self.on_result = Some(Arc::new(callback));
        self
    }

    pub(crate) fn notify(&self, meta: &QueryMeta) {
        if let Some(callback) = &self.on_result {
            callback(meta);
        }
    }
}

impl fmt::Debug for GetOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetOptions")
            .field("passing_only", &self.passing_only)
            .field("query", &self.query)
            .field("on_result", &self.on_result.is_some())
            .finish()
    }
}

/// 注册中心类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryType {
    Consul,
    Memory,
}

impl RegistryType {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "consul" => Ok(RegistryType::Consul),
            "memory" => Ok(RegistryType::Memory),
            other => Err(FlareError::configuration(format!(
                "unsupported registry type: {}",
                other
            ))),
        }
    }
}

/// 创建注册中心实例
pub async fn create_registry(config: &RegistryConfig) -> Result<Arc<dyn Registry>> {
    match RegistryType::parse(&config.registry_type)? {
        RegistryType::Consul => Ok(Arc::new(ConsulRegistry::connect(config).await?)),
        RegistryType::Memory => Ok(Arc::new(MemoryRegistry::new())),
    }
}
