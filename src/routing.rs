//! 网关路由表
//!
//! API 名称映射到 `<scheme>://<service>/<method>` 形式的后端方法。
//! 路由表整体替换，读者无锁读取，持有的快照不受重新加载影响。

use crate::error::{FlareError, Result};
use arc_swap::ArcSwap;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::info;

/// 单条路由
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub scheme: String,
    pub service: String,
    pub method: String,
}

impl RouteEntry {
    /// 解析 `consul://Greeter/SayHello`
    pub fn parse(route: &str) -> Result<Self> {
        let invalid = || {
            FlareError::configuration(format!(
                "invalid route '{}', expected '<scheme>://<service>/<method>'",
                route
            ))
        };

        let (scheme, rest) = route.split_once("://").ok_or_else(invalid)?;
        let (service, method) = rest.split_once('/').ok_or_else(invalid)?;
        if scheme.is_empty() || service.is_empty() || method.is_empty() || method.contains('/') {
            return Err(invalid());
        }

        Ok(Self {
            scheme: scheme.to_string(),
            service: service.to_string(),
            method: method.to_string(),
        })
    }

    /// 服务发现目标
    pub fn target(&self) -> String {
        format!("{}://{}", self.scheme, self.service)
    }

    /// `/<package>.<service>/<method>`
    pub fn full_method(&self, package: &str) -> String {
        if package.is_empty() {
            format!("/{}/{}", self.service, self.method)
        } else {
            format!("/{}.{}/{}", package, self.service, self.method)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    routes: HashMap<String, RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由 `api -> route` 字符串映射构建
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut table = Self::new();
        for (api, route) in pairs {
            table.insert(api, RouteEntry::parse(route.as_ref())?);
        }
        Ok(table)
    }

    pub fn insert(&mut self, api: impl Into<String>, entry: RouteEntry) {
        self.routes.insert(api.into(), entry);
    }

    pub fn get(&self, api: &str) -> Option<&RouteEntry> {
        self.routes.get(api)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// 新增、删除或目标不同的 API，按名称排序
    pub fn changed_keys(&self, other: &RouteTable) -> Vec<String> {
        let keys: BTreeSet<&String> = self.routes.keys().chain(other.routes.keys()).collect();
        keys.into_iter()
            .filter(|key| self.routes.get(*key) != other.routes.get(*key))
            .cloned()
            .collect()
    }
}

/// 可热更新的路由表
#[derive(Debug)]
pub struct SharedRouteTable {
    current: ArcSwap<RouteTable>,
    /// 串行化重新加载
    reload_lock: Mutex<()>,
}

impl Default for SharedRouteTable {
    fn default() -> Self {
        Self::new(RouteTable::default())
    }
}

impl SharedRouteTable {
    pub fn new(table: RouteTable) -> Self {
        Self {
            current: ArcSwap::from_pointee(table),
            reload_lock: Mutex::new(()),
        }
    }

    pub fn load(&self) -> Arc<RouteTable> {
        self.current.load_full()
    }

    /// 映射有变化时替换并返回 true
    pub fn reload(&self, table: RouteTable) -> bool {
        let _guard = match self.reload_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let changed = self.current.load().changed_keys(&table);
        if changed.is_empty() {
            return false;
        }
        for key in &changed {
            match table.get(key) {
                Some(entry) => info!(api = %key, route = %entry.target(), method = %entry.method, "Route updated"),
                None => info!(api = %key, "Route removed"),
            }
        }
        self.current.store(Arc::new(table));
        true
    }
}
