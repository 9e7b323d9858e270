//! 服务地址解析
//!
//! 每个 `Resolver` 对应一个后台 watch 任务：对注册中心发起长轮询，
//! 将健康实例集合转换成地址列表推送给下游（连接池）。
//!
//! 推送规则：
//! - 新集合为空、旧集合非空：推送空地址列表
//! - 新旧集合的地址完全一致：不推送
//! - 其他情况：推送完整的新地址列表（整体替换）

use crate::config::ClientConfig;
use crate::error::{FlareError, Result};
use crate::registry::{GetOptions, QueryOptions, Registry, Service};
use crate::retry::{RetryPolicy, StepBackoffPolicy};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 解析目标：`<scheme>://<service>[.<datacenter>]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub scheme: String,
    pub service: String,
    pub datacenter: Option<String>,
}

impl Target {
    pub fn parse(target: &str) -> Result<Self> {
        let invalid = || {
            FlareError::configuration(format!(
                "invalid target '{}', expected '<scheme>://service[.dc]'",
                target
            ))
        };

        let (scheme, authority) = target.split_once("://").ok_or_else(invalid)?;
        let authority = authority.trim_end_matches('/');
        if scheme.is_empty() || authority.is_empty() || authority.contains('/') {
            return Err(invalid());
        }

        let parts: Vec<&str> = authority.split('.').collect();
        match parts.as_slice() {
            [service] if !service.is_empty() => Ok(Self {
                scheme: scheme.to_string(),
                service: service.to_string(),
                datacenter: None,
            }),
            [service, dc] if !service.is_empty() && !dc.is_empty() => Ok(Self {
                scheme: scheme.to_string(),
                service: service.to_string(),
                datacenter: Some(dc.to_string()),
            }),
            _ => Err(invalid()),
        }
    }

    /// `service[.dc]`
    pub fn authority(&self) -> String {
        match &self.datacenter {
            Some(dc) => format!("{}.{}", self.service, dc),
            None => self.service.clone(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

/// 附加在地址上的路由属性
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressAttributes {
    pub version: String,
    pub metadata: BTreeMap<String, String>,
}

/// 解析出的单个地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// `host:port`
    pub addr: String,
    pub attributes: AddressAttributes,
}

/// 一次完整的地址快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverState {
    pub addresses: Vec<Address>,
}

/// 地址快照的接收方
#[async_trait]
pub trait AddressSink: Send + Sync {
    async fn update_state(&self, state: ResolverState) -> Result<()>;
}

/// 解析器参数
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// 单次长轮询的最长等待时间
    pub wait_time: Duration,
    pub near: Option<String>,
    pub backoff: StepBackoffPolicy,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            wait_time: Duration::from_secs(60),
            near: Some("_agent".to_string()),
            backoff: StepBackoffPolicy::default(),
        }
    }
}

impl ResolverOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::default().with_wait_time(Duration::from_secs(config.watch_wait_secs))
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    pub fn with_near(mut self, near: Option<String>) -> Self {
        self.near = near;
        self
    }

    pub fn with_backoff(mut self, backoff: StepBackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// 解析器构建器，scheme 与注册中心名称一致
#[derive(Clone)]
pub struct ResolverBuilder {
    registry: Arc<dyn Registry>,
    options: ResolverOptions,
}

impl ResolverBuilder {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            options: ResolverOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ResolverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn scheme(&self) -> &str {
        self.registry.name()
    }

    /// 启动后台 watch 任务
    pub fn build(&self, target: &Target, sink: Arc<dyn AddressSink>) -> Result<Resolver> {
        if target.scheme != self.scheme() {
            return Err(FlareError::configuration(format!(
                "target scheme '{}' does not match resolver scheme '{}'",
                target.scheme,
                self.scheme()
            )));
        }

        let cancel = CancellationToken::new();
        let watcher = Watcher {
            registry: self.registry.clone(),
            target: target.clone(),
            options: self.options.clone(),
            sink,
            cancel: cancel.clone(),
            last_index: 0,
            error_count: 0,
            addresses: HashMap::new(),
        };

        info!(service = %target, "Resolver watching service");
        let task = tokio::spawn(watcher.run());

        Ok(Resolver {
            target: target.clone(),
            cancel,
            task: Mutex::new(Some(task)),
        })
    }
}

/// 运行中的解析器
pub struct Resolver {
    target: Target,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Resolver {
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// watch 为持续长轮询，无需主动触发
    pub fn resolve_now(&self) {}

    /// 取消 watch 任务并等待其退出
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(service = %self.target, error = %e, "Resolver task ended abnormally");
            }
        }
        debug!(service = %self.target, "Resolver closed");
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

const UNINDEXED_POLL_DELAY: Duration = Duration::from_secs(1);

/// 下一次长轮询使用的索引：索引回退时重置为 0
fn next_wait_index(previous: u64, reported: u64) -> u64 {
    if reported < previous { 0 } else { reported }
}

struct Watcher {
    registry: Arc<dyn Registry>,
    target: Target,
    options: ResolverOptions,
    sink: Arc<dyn AddressSink>,
    cancel: CancellationToken,
    last_index: u64,
    error_count: usize,
    /// Node.address -> 最近一次看到的服务快照
    addresses: HashMap<String, Service>,
}

impl Watcher {
    async fn run(mut self) {
        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.query() => result,
            };

            match result {
                Ok((index, services)) => {
                    self.error_count = 0;
                    self.last_index = next_wait_index(self.last_index, index);
                    self.apply(services).await;

                    // 没有可用索引时查询会立即返回，限制轮询频率
                    if self.last_index == 0 {
                        debug!(service = %self.target, "Registry reported no index, delaying next query");
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(UNINDEXED_POLL_DELAY) => {}
                        }
                    }
                }
                Err(e) => {
                    self.error_count += 1;
                    let delay = self.options.backoff.backoff_duration(self.error_count);
                    error!(
                        service = %self.target,
                        errors = self.error_count,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "❌ Resolver query failed"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        info!(service = %self.target, "Resolver watch stopped");
    }

    async fn query(&self) -> Result<(u64, Vec<Service>)> {
        let index = Arc::new(AtomicU64::new(self.last_index));
        let observed = index.clone();

        let options = GetOptions::default()
            .with_passing_only(true)
            .with_query(QueryOptions {
                wait_index: self.last_index,
                wait_time: Some(self.options.wait_time),
                near: self.options.near.clone(),
                datacenter: self.target.datacenter.clone(),
                allow_stale: false,
            })
            .with_result_callback(move |meta| observed.store(meta.last_index, Ordering::SeqCst));

        let services = self
            .registry
            .get_service(&self.target.service, &options)
            .await?;
        Ok((index.load(Ordering::SeqCst), services))
    }

    async fn apply(&mut self, services: Vec<Service>) {
        let latest: HashMap<String, Service> = services
            .into_iter()
            .filter_map(|s| s.first_node().map(|n| (n.address.clone(), s.clone())))
            .collect();

        if latest.is_empty() {
            if self.addresses.is_empty() {
                return;
            }
            if let Err(e) = self.sink.update_state(ResolverState::default()).await {
                error!(service = %self.target, error = %e, "❌ Failed to push empty address set");
                return;
            }
            self.addresses.clear();
            warn!(service = %self.target, "⚠️ No healthy instances left, pushed empty address set");
            return;
        }

        if latest.len() == self.addresses.len()
            && latest.keys().all(|addr| self.addresses.contains_key(addr))
        {
            debug!(service = %self.target, "Address set unchanged");
            return;
        }

        let mut addresses: Vec<Address> = latest
            .iter()
            .map(|(addr, service)| Address {
                addr: addr.clone(),
                attributes: AddressAttributes {
                    version: service.version.clone(),
                    metadata: service.metadata.clone(),
                },
            })
            .collect();
        addresses.sort_by(|a, b| a.addr.cmp(&b.addr));

        let count = addresses.len();
        if let Err(e) = self.sink.update_state(ResolverState { addresses }).await {
            error!(service = %self.target, error = %e, "❌ Failed to push address set");
            return;
        }
        self.addresses = latest;
        info!(service = %self.target, count, "Resolver pushed address set");
    }
}
