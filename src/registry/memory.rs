//! 进程内注册中心
//!
//! 以 `Node.id` 为键保存实例，支持基于变更索引的长轮询，
//! 可用于本地开发以及不依赖外部 Consul 的测试。

use super::{GetOptions, QueryMeta, RegisterOptions, Registry, Service};
use crate::error::{FlareError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tracing::debug;

const DEFAULT_WAIT: Duration = Duration::from_secs(60);

struct Instance {
    service: Service,
    critical: bool,
}

/// 进程内注册中心
pub struct MemoryRegistry {
    instances: RwLock<BTreeMap<String, Instance>>,
    index: watch::Sender<u64>,
    register_calls: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (index, _) = watch::channel(1);
        Self {
            instances: RwLock::new(BTreeMap::new()),
            index,
            register_calls: AtomicUsize::new(0),
        }
    }

    /// 当前变更索引
    pub fn current_index(&self) -> u64 {
        *self.index.borrow()
    }

    /// register 被调用的次数
    pub fn register_count(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    /// 模拟健康检查进入/离开 critical 状态，返回实例是否存在
    pub async fn set_critical(&self, node_id: &str, critical: bool) -> bool {
        let mut instances = self.instances.write().await;
        match instances.get_mut(node_id) {
            Some(instance) => {
                if instance.critical != critical {
                    instance.critical = critical;
                    self.bump();
                }
                true
            }
            None => false,
        }
    }

    /// 按实例 ID 查询（包括 critical 实例）
    pub async fn instance(&self, node_id: &str) -> Option<Service> {
        let instances = self.instances.read().await;
        instances.get(node_id).map(|i| i.service.clone())
    }

    fn bump(&self) {
        self.index.send_modify(|index| *index += 1);
    }

    async fn wait_for_change(&self, wait_index: u64, wait_time: Duration) {
        if wait_index == 0 || self.current_index() > wait_index {
            return;
        }
        let mut rx = self.index.subscribe();
        let changed = tokio::time::timeout(wait_time, rx.wait_for(|index| *index > wait_index))
            .await
            .is_ok();
        debug!(wait_index, changed, "Memory registry long-poll returned");
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    fn name(&self) -> &str {
        "memory"
    }

    async fn register(&self, service: &Service, _options: &RegisterOptions) -> Result<()> {
        if service.nodes.is_empty() {
            return Err(FlareError::registration_failed(
                "require at least one node",
            ));
        }
        self.register_calls.fetch_add(1, Ordering::SeqCst);

        let mut instances = self.instances.write().await;
        let mut changed = false;
        for node in &service.nodes {
            let mut single = service.clone();
            single.nodes = vec![node.clone()];

            match instances.get_mut(&node.id) {
                Some(existing) if existing.service == single && !existing.critical => {}
                Some(existing) => {
                    existing.service = single;
                    existing.critical = false;
                    changed = true;
                }
                None => {
                    instances.insert(
                        node.id.clone(),
                        Instance {
                            service: single,
                            critical: false,
                        },
                    );
                    changed = true;
                }
            }
        }
        if changed {
            self.bump();
        }
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        let node = service
            .first_node()
            .ok_or_else(|| FlareError::registration_failed("require at least one node"))?;

        let mut instances = self.instances.write().await;
        if instances.remove(&node.id).is_some() {
            self.bump();
        }
        Ok(())
    }

    async fn get_service(&self, name: &str, options: &GetOptions) -> Result<Vec<Service>> {
        if let Some(query) = &options.query {
            self.wait_for_change(query.wait_index, query.wait_time.unwrap_or(DEFAULT_WAIT))
                .await;
        }

        let services: Vec<Service> = {
            let instances = self.instances.read().await;
            instances
                .values()
                .filter(|i| !i.critical && i.service.name == name)
                .map(|i| i.service.clone())
                .collect()
        };

        options.notify(&QueryMeta {
            last_index: self.current_index(),
            known_leader: true,
        });
        Ok(services)
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let instances = self.instances.read().await;
        let names: BTreeSet<&str> = instances.values().map(|i| i.service.name.as_str()).collect();
        Ok(names.into_iter().map(Service::new).collect())
    }
}
