//! 子连接池
//!
//! 接收解析器推送的地址快照，为每个地址维护一条 tonic `Channel`。
//! 连接建立成功的地址构成就绪集合，就绪集合每次变化都会重建 `Picker`，
//! 并通过 watch 通道整体替换发布。调用失败的连接会被移出就绪集合并重新建连。

use crate::balancer::{Picker, PickerBuilder};
use crate::error::{FlareError, Result};
use crate::resolver::{AddressAttributes, AddressSink, ResolverState};
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

/// 一个已连接的后端地址
#[derive(Debug, Clone)]
pub struct SubConn {
    pub address: String,
    pub attributes: AddressAttributes,
    pub channel: Channel,
    pub(crate) generation: u64,
}

pub type SharedPicker = Arc<dyn Picker<SubConn>>;

struct Entry {
    attributes: AddressAttributes,
    channel: Option<Channel>,
    /// 每次连接就绪加一，用于忽略过期的失败报告
    generation: u64,
    cancel: CancellationToken,
}

struct PoolInner {
    target: String,
    connect_timeout: Duration,
    builder: Arc<dyn PickerBuilder<SubConn>>,
    entries: Mutex<HashMap<String, Entry>>,
    picker: watch::Sender<SharedPicker>,
    cancel: CancellationToken,
}

/// 子连接池
#[derive(Clone)]
pub struct SubConnPool {
    inner: Arc<PoolInner>,
}

impl SubConnPool {
    pub fn new(
        target: impl Into<String>,
        builder: Arc<dyn PickerBuilder<SubConn>>,
        connect_timeout: Duration,
    ) -> Self {
        let (picker, _) = watch::channel(builder.build(Vec::new()));
        Self {
            inner: Arc::new(PoolInner {
                target: target.into(),
                connect_timeout,
                builder,
                entries: Mutex::new(HashMap::new()),
                picker,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn balancer_name(&self) -> &str {
        self.inner.builder.name()
    }

    /// 当前选择器
    pub fn picker(&self) -> SharedPicker {
        self.inner.picker.borrow().clone()
    }

    /// 订阅选择器变化
    pub fn subscribe(&self) -> watch::Receiver<SharedPicker> {
        self.inner.picker.subscribe()
    }

    /// 已知地址（包括尚未连通的）
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = match self.inner.entries.lock() {
            Ok(entries) => entries.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        addresses.sort();
        addresses
    }

    pub fn ready_count(&self) -> usize {
        match self.inner.entries.lock() {
            Ok(entries) => entries.values().filter(|e| e.channel.is_some()).count(),
            Err(_) => 0,
        }
    }

    /// 调用在该连接上遇到传输层失败：移出就绪集合并在后台重连
    pub fn report_failure(&self, conn: &SubConn) {
        let Ok(mut entries) = self.inner.entries.lock() else {
            return;
        };
        let Some(entry) = entries.get_mut(&conn.address) else {
            return;
        };
        if entry.cancel.is_cancelled() || entry.channel.is_none() || entry.generation != conn.generation {
            return;
        }

        entry.channel = None;
        let cancel = entry.cancel.clone();
        warn!(
            target_addr = %self.inner.target,
            address = %conn.address,
            "⚠️ Sub connection broken, reconnecting"
        );
        self.inner.rebuild_locked(&entries);
        tokio::spawn(connect_loop(
            Arc::downgrade(&self.inner),
            conn.address.clone(),
            cancel,
        ));
    }

    /// 停止所有连接任务并清空就绪集合
    pub fn close(&self) {
        self.inner.cancel.cancel();
        if let Ok(mut entries) = self.inner.entries.lock() {
            entries.clear();
        }
        self.inner.picker.send_replace(self.inner.builder.build(Vec::new()));
        debug!(target_addr = %self.inner.target, "Sub connection pool closed");
    }
}

impl PoolInner {
    fn rebuild_locked(&self, entries: &HashMap<String, Entry>) {
        let mut ready: Vec<SubConn> = entries
            .iter()
            .filter_map(|(address, entry)| {
                entry.channel.as_ref().map(|channel| SubConn {
                    address: address.clone(),
                    attributes: entry.attributes.clone(),
                    channel: channel.clone(),
                    generation: entry.generation,
                })
            })
            .collect();
        ready.sort_by(|a, b| a.address.cmp(&b.address));

        let count = ready.len();
        self.picker.send_replace(self.builder.build(ready));
        debug!(target_addr = %self.target, ready = count, "Picker rebuilt");
    }

    fn mark_ready(&self, address: &str, channel: Channel) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        match entries.get_mut(address) {
            Some(entry) if !entry.cancel.is_cancelled() => {
                entry.channel = Some(channel);
                entry.generation += 1;
                self.rebuild_locked(&entries);
            }
            _ => {}
        }
    }
}

async fn connect_loop(pool: Weak<PoolInner>, address: String, cancel: CancellationToken) {
    let policy = ExponentialBackoffPolicy::new(
        usize::MAX,
        Duration::from_millis(100),
        Duration::from_secs(5),
    );
    let uri = format!("http://{}", address);
    let mut attempt = 0usize;

    loop {
        let connect_timeout = match pool.upgrade() {
            Some(inner) => inner.connect_timeout,
            None => return,
        };

        let endpoint = match Endpoint::from_shared(uri.clone()) {
            Ok(endpoint) => endpoint.connect_timeout(connect_timeout),
            Err(e) => {
                warn!(address = %address, error = %e, "⚠️ Invalid backend address, giving up");
                return;
            }
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = endpoint.connect() => result,
        };

        match result {
            Ok(channel) => {
                if let Some(inner) = pool.upgrade() {
                    info!(target_addr = %inner.target, address = %address, "✅ Sub connection ready");
                    inner.mark_ready(&address, channel);
                }
                return;
            }
            Err(e) => {
                attempt += 1;
                let delay = policy.backoff_duration(attempt);
                warn!(
                    address = %address,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "⚠️ Failed to connect sub connection"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[async_trait]
impl AddressSink for SubConnPool {
    async fn update_state(&self, state: ResolverState) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(FlareError::unavailable("connection pool is closed"));
        }

        let mut entries = self
            .inner
            .entries
            .lock()
            .map_err(|_| FlareError::system("connection pool lock poisoned"))?;

        let latest: HashMap<String, AddressAttributes> = state
            .addresses
            .into_iter()
            .filter(|a| !a.addr.is_empty())
            .map(|a| (a.addr, a.attributes))
            .collect();

        let mut ready_changed = false;
        entries.retain(|address, entry| {
            if latest.contains_key(address) {
                return true;
            }
            entry.cancel.cancel();
            ready_changed |= entry.channel.is_some();
            info!(target_addr = %self.inner.target, address = %address, "Sub connection removed");
            false
        });

        for (address, attributes) in latest {
            match entries.get_mut(&address) {
                Some(entry) => {
                    if entry.attributes != attributes {
                        entry.attributes = attributes;
                        ready_changed |= entry.channel.is_some();
                    }
                }
                None => {
                    let cancel = self.inner.cancel.child_token();
                    tokio::spawn(connect_loop(
                        Arc::downgrade(&self.inner),
                        address.clone(),
                        cancel.clone(),
                    ));
                    entries.insert(
                        address,
                        Entry {
                            attributes,
                            channel: None,
                            generation: 0,
                            cancel,
                        },
                    );
                }
            }
        }

        if ready_changed {
            self.inner.rebuild_locked(&entries);
        }
        Ok(())
    }
}
