//! 服务声明

use crate::registry::Endpoint;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// 原始字节形式的 RPC 处理器
///
/// `method` 为不带前缀的方法名，例如 `SayHello`。
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn call(&self, method: &str, request: Request<Bytes>) -> Result<Response<Bytes>, Status>;
}

/// 服务器上挂载的一个 gRPC 服务
#[derive(Clone)]
pub struct ServiceInfo {
    pub package_name: String,
    /// 注册到注册中心的服务名
    pub service_name: String,
    pub version: String,
    pub service_metadata: BTreeMap<String, String>,
    pub node_metadata: BTreeMap<String, String>,
    /// 声明的方法名；为空时不限制
    pub methods: Vec<String>,
    pub handler: Arc<dyn RpcHandler>,
}

impl ServiceInfo {
    pub fn new(
        package_name: impl Into<String>,
        service_name: impl Into<String>,
        handler: Arc<dyn RpcHandler>,
    ) -> Self {
        let mut node_metadata = BTreeMap::new();
        node_metadata.insert("protocol".to_string(), "grpc".to_string());
        node_metadata.insert("language".to_string(), "rust".to_string());

        Self {
            package_name: package_name.into(),
            service_name: service_name.into(),
            version: String::new(),
            service_metadata: BTreeMap::new(),
            node_metadata,
            methods: Vec::new(),
            handler,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_service_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.service_metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_node_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.node_metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.methods.push(method.into());
        self
    }

    /// `<package>.<service>`，即 gRPC 路径中的服务部分
    pub fn key(&self) -> String {
        if self.package_name.is_empty() {
            self.service_name.clone()
        } else {
            format!("{}.{}", self.package_name, self.service_name)
        }
    }

    pub fn declares(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m == method)
    }

    pub(crate) fn endpoints(&self) -> Vec<Endpoint> {
        self.methods
            .iter()
            .map(|method| Endpoint::new(format!("{}.{}", self.service_name, method)))
            .collect()
    }
}

impl fmt::Debug for ServiceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInfo")
            .field("key", &self.key())
            .field("version", &self.version)
            .field("methods", &self.methods)
            .finish()
    }
}
