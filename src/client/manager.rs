//! 客户端缓存
//!
//! 每个目标字符串最多对应一个已初始化的客户端。初始化失败不会被缓存，
//! 下一次调用会重新创建。

use super::{Client, ClientFactory};
use crate::error::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

pub struct ClientManager {
    factory: Arc<dyn ClientFactory>,
    clients: RwLock<HashMap<String, Arc<dyn Client>>>,
}

impl ClientManager {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// 获取（或创建）目标对应的客户端
    pub async fn get_client(&self, target: &str) -> Result<Arc<dyn Client>> {
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(target) {
                return Ok(client.clone());
            }
        }

        let mut clients = self.clients.write().await;
        // 双重检查：等待写锁期间可能已被其他调用方创建
        if let Some(client) = clients.get(target) {
            return Ok(client.clone());
        }

        let client = self.factory.create(target).await?;
        clients.insert(target.to_string(), client.clone());
        info!(target_addr = %target, "Client cached");
        Ok(client)
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// 关闭并清空所有客户端
    pub async fn close_all(&self) {
        let clients: Vec<Arc<dyn Client>> = {
            let mut clients = self.clients.write().await;
            clients.drain().map(|(_, client)| client).collect()
        };
        for client in clients {
            client.close().await;
        }
    }
}
