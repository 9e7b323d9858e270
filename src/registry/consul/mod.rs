//! Consul 服务注册发现实现
//!
//! 通过 Consul Agent HTTP API 注册实例、维护健康检查，并通过
//! `/v1/health/service` 阻塞查询实现长轮询。
//!
//! 同一实例重复注册时会先比较服务定义的哈希，内容未变且健康检查仍然通过时
//! 不会发起网络注册，因此可以放心地周期性调用 `register` 作为心跳。

mod api;
pub mod encoding;

use self::api::{AgentServiceCheck, AgentServiceRegistration, HEALTH_PASSING, HealthCheck, ServiceEntry};
use self::encoding::{
    NODE_METADATA_PREFIX, SERVICE_METADATA_PREFIX, decode_endpoints, decode_metadata,
    decode_version, deregister_after, encode_endpoints, encode_metadata, encode_version,
    go_duration,
};
use super::{CheckTarget, GetOptions, Node, QueryMeta, RegisterOptions, Registry, Service};
use crate::config::RegistryConfig;
use crate::error::{FlareError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_PORT: u16 = 8500;
const INDEX_HEADER: &str = "X-Consul-Index";
const KNOWN_LEADER_HEADER: &str = "X-Consul-KnownLeader";

/// Consul 服务注册发现
pub struct ConsulRegistry {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    /// Node.id -> 最近一次成功注册的服务哈希
    registered: Mutex<HashMap<String, u64>>,
}

impl ConsulRegistry {
    /// 依次探测配置的地址，绑定到第一个可达的 Agent；都不可达时使用第一个地址
    pub async fn connect(config: &RegistryConfig) -> Result<Self> {
        let addrs: Vec<String> = config.addrs.iter().map(|a| normalize_address(a)).collect();
        let first = addrs
            .first()
            .cloned()
            .ok_or_else(|| FlareError::configuration("no consul address configured"))?;

        let client = reqwest::Client::new();
        let timeout = config.timeout();

        for addr in &addrs {
            let probe = client
                .get(format!("{}/v1/agent/self", addr))
                .timeout(timeout)
                .send()
                .await;
            match probe {
                Ok(resp) if resp.status().is_success() => {
                    info!(address = %addr, "✅ Connected to Consul agent");
                    return Ok(Self::from_parts(client, addr.clone(), timeout));
                }
                Ok(resp) => {
                    warn!(address = %addr, status = %resp.status(), "⚠️ Consul agent probe rejected");
                }
                Err(e) => {
                    warn!(address = %addr, error = %e, "⚠️ Consul agent unreachable");
                }
            }
        }

        warn!(address = %first, "⚠️ No Consul agent answered, falling back to first address");
        Ok(Self::from_parts(client, first, timeout))
    }

    /// 不做探测，直接使用给定地址
    pub fn new(address: &str, timeout: Duration) -> Self {
        Self::from_parts(reqwest::Client::new(), normalize_address(address), timeout)
    }

    fn from_parts(client: reqwest::Client, base_url: String, timeout: Duration) -> Self {
        Self {
            client,
            base_url,
            timeout,
            registered: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FlareError::timeout("consul request timed out").with_details(e.to_string())
            } else {
                FlareError::connection_failed("consul request failed").with_details(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FlareError::backend(format!("consul responded {}", status)).with_details(body));
        }
        Ok(response)
    }

    fn cached_fingerprint(&self, node_id: &str) -> Option<u64> {
        self.registered
            .lock()
            .ok()
            .and_then(|cache| cache.get(node_id).copied())
    }

    fn remember(&self, node_id: &str, fingerprint: u64) {
        if let Ok(mut cache) = self.registered.lock() {
            cache.insert(node_id.to_string(), fingerprint);
        }
    }

    fn forget(&self, node_id: &str) {
        if let Ok(mut cache) = self.registered.lock() {
            cache.remove(node_id);
        }
    }

    /// 标记 TTL 检查为 passing
    pub async fn pass_ttl(&self, node_id: &str) -> Result<()> {
        let url = self.url(&format!("/v1/agent/check/pass/service:{}", node_id));
        self.execute(self.client.put(url).timeout(self.timeout))
            .await
            .map(|_| ())
    }

    /// 实例的健康检查是否处于 passing 状态
    async fn check_passing(&self, service_name: &str, node_id: &str) -> Result<bool> {
        let url = self.url(&format!("/v1/health/checks/{}", service_name));
        let response = self.execute(self.client.get(url).timeout(self.timeout)).await?;
        let checks: Vec<HealthCheck> = response
            .json()
            .await
            .map_err(|e| FlareError::backend("invalid health checks response").with_details(e.to_string()))?;

        Ok(checks
            .iter()
            .any(|check| check.ServiceID == node_id && check.Status == HEALTH_PASSING))
    }

    /// 内容未变时判断是否可以跳过重新注册
    async fn still_healthy(&self, service: &Service, node: &Node, ttl: Duration) -> bool {
        if !ttl.is_zero() {
            return self.pass_ttl(&node.id).await.is_ok();
        }
        match self.check_passing(&service.name, &node.id).await {
            Ok(passing) => passing,
            Err(e) => {
                debug!(node_id = %node.id, error = %e, "Health check query failed, re-registering");
                false
            }
        }
    }

    fn build_registration(
        service: &Service,
        node: &Node,
        options: &RegisterOptions,
    ) -> AgentServiceRegistration {
        let mut tags = encode_version(&service.version);
        tags.extend(encode_metadata(SERVICE_METADATA_PREFIX, &service.metadata));
        tags.extend(encode_metadata(NODE_METADATA_PREFIX, &node.metadata));
        tags.extend(encode_endpoints(&service.endpoints));

        let (host, port) = split_host_port(&node.address);

        AgentServiceRegistration {
            ID: node.id.clone(),
            Name: service.name.clone(),
            Tags: tags,
            Port: port,
            Address: host,
            Meta: service.metadata.clone(),
            Check: build_check(options),
        }
    }

    fn build_service(entry: &ServiceEntry) -> Service {
        let tags = entry.Service.Tags.as_deref().unwrap_or_default();
        let host = entry.host();
        let address = if host.contains(':') {
            format!("[{}]:{}", host, entry.Service.Port)
        } else {
            format!("{}:{}", host, entry.Service.Port)
        };

        Service {
            name: entry.Service.Service.clone(),
            version: decode_version(tags).unwrap_or_default(),
            metadata: entry.Service.Meta.clone().unwrap_or_default(),
            endpoints: decode_endpoints(tags),
            nodes: vec![Node {
                id: entry.Service.ID.clone(),
                address,
                metadata: decode_metadata(NODE_METADATA_PREFIX, tags),
            }],
        }
    }
}

#[async_trait]
impl Registry for ConsulRegistry {
    fn name(&self) -> &str {
        "consul"
    }

    async fn register(&self, service: &Service, options: &RegisterOptions) -> Result<()> {
        let node = service
            .first_node()
            .ok_or_else(|| FlareError::registration_failed("require at least one node"))?;

        let fingerprint = service.fingerprint();
        let ttl = options.effective_ttl();

        if self.cached_fingerprint(&node.id) == Some(fingerprint)
            && self.still_healthy(service, node, ttl).await
        {
            debug!(service = %service.name, node_id = %node.id, "Registration unchanged, skipping");
            return Ok(());
        }

        let registration = Self::build_registration(service, node, options);
        let request = self
            .client
            .put(self.url("/v1/agent/service/register"))
            .timeout(self.timeout)
            .json(&registration);
        self.execute(request).await.map_err(|e| {
            FlareError::registration_failed(format!("failed to register {}", node.id))
                .with_details(e.to_string())
        })?;

        self.remember(&node.id, fingerprint);
        info!(
            service = %service.name,
            node_id = %node.id,
            address = %node.address,
            "✅ Service registered with Consul"
        );

        if ttl.is_zero() {
            return Ok(());
        }
        self.pass_ttl(&node.id).await.map_err(|e| {
            FlareError::registration_failed(format!("failed to pass ttl check for {}", node.id))
                .with_details(e.to_string())
        })
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        let node = service
            .first_node()
            .ok_or_else(|| FlareError::registration_failed("require at least one node"))?;

        self.forget(&node.id);

        let url = self.url(&format!("/v1/agent/service/deregister/{}", node.id));
        self.execute(self.client.put(url).timeout(self.timeout))
            .await
            .map_err(|e| {
                FlareError::registration_failed(format!("failed to deregister {}", node.id))
                    .with_details(e.to_string())
            })?;

        info!(service = %service.name, node_id = %node.id, "Service deregistered from Consul");
        Ok(())
    }

    async fn get_service(&self, name: &str, options: &GetOptions) -> Result<Vec<Service>> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if options.passing_only {
            params.push(("passing", "true".to_string()));
        }

        let timeout = match &options.query {
            None => {
                params.push(("stale", String::new()));
                self.timeout
            }
            Some(query) => {
                if query.wait_index > 0 {
                    params.push(("index", query.wait_index.to_string()));
                }
                if let Some(near) = &query.near {
                    params.push(("near", near.clone()));
                }
                if let Some(dc) = query.datacenter.as_ref().filter(|dc| !dc.is_empty()) {
                    params.push(("dc", dc.clone()));
                }
                if query.allow_stale {
                    params.push(("stale", String::new()));
                }
                match query.wait_time {
                    Some(wait) => {
                        params.push(("wait", go_duration(wait)));
                        blocking_timeout(wait)
                    }
                    None => self.timeout,
                }
            }
        };

        let url = self.url(&format!("/v1/health/service/{}", name));
        let response = self
            .execute(self.client.get(url).query(&params).timeout(timeout))
            .await?;

        let meta = QueryMeta {
            last_index: header_value(&response, INDEX_HEADER)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            known_leader: header_value(&response, KNOWN_LEADER_HEADER).as_deref() == Some("true"),
        };

        let entries: Vec<ServiceEntry> = response
            .json()
            .await
            .map_err(|e| FlareError::backend("invalid health service response").with_details(e.to_string()))?;

        let services: Vec<Service> = entries
            .iter()
            .filter(|entry| entry.Service.Service == name)
            .filter(|entry| !entry.is_critical())
            .map(Self::build_service)
            .collect();

        debug!(
            service = %name,
            instances = services.len(),
            index = meta.last_index,
            "Consul health query completed"
        );

        options.notify(&meta);
        Ok(services)
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let response = self
            .execute(
                self.client
                    .get(self.url("/v1/catalog/services"))
                    .timeout(self.timeout),
            )
            .await?;
        let catalog: BTreeMap<String, Vec<String>> = response
            .json()
            .await
            .map_err(|e| FlareError::backend("invalid catalog response").with_details(e.to_string()))?;

        Ok(catalog.into_keys().map(Service::new).collect())
    }
}

fn build_check(options: &RegisterOptions) -> Option<AgentServiceCheck> {
    if let Some(check) = options.probe_check() {
        let mut agent_check = AgentServiceCheck {
            Interval: Some(go_duration(check.interval)),
            Timeout: Some(go_duration(check.timeout)),
            DeregisterCriticalServiceAfter: Some(go_duration(deregister_after(check.interval))),
            ..Default::default()
        };
        match &check.target {
            CheckTarget::Tcp(addr) => agent_check.TCP = Some(addr.clone()),
            CheckTarget::Http(url) => agent_check.HTTP = Some(url.clone()),
        }
        return Some(agent_check);
    }

    if options.ttl.is_zero() {
        return None;
    }
    Some(AgentServiceCheck {
        TTL: Some(go_duration(options.ttl)),
        DeregisterCriticalServiceAfter: Some(go_duration(deregister_after(options.ttl))),
        ..Default::default()
    })
}

/// 阻塞查询的 HTTP 超时：Consul 会在 wait 基础上增加最多 wait/16 的抖动
fn blocking_timeout(wait: Duration) -> Duration {
    wait + wait / 16 + Duration::from_secs(5)
}

fn header_value(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// 补全 scheme 与默认端口
pub fn normalize_address(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    let (scheme, rest) = match address.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("http", address),
    };

    let has_port = match rest.rsplit_once(':') {
        Some((host, port)) => {
            port.parse::<u16>().is_ok() && (!host.contains(':') || host.ends_with(']'))
        }
        None => false,
    };

    if has_port {
        format!("{}://{}", scheme, rest)
    } else if rest.contains(':') && !rest.starts_with('[') {
        format!("{}://[{}]:{}", scheme, rest, DEFAULT_PORT)
    } else {
        format!("{}://{}:{}", scheme, rest, DEFAULT_PORT)
    }
}

fn split_host_port(address: &str) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.trim_start_matches('[').trim_end_matches(']').to_string(), port),
            Err(_) => (address.to_string(), 0),
        },
        None => (address.to_string(), 0),
    }
}
