//! 注册记录的构建、带重试的注册与回滚

use super::service_info::ServiceInfo;
use crate::error::{FlareError, Result};
use crate::registry::{Node, RegisterOptions, Registry, Service};
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};
use crate::utils::join_host_port;
use tracing::{error, info, warn};

/// 服务器需要在注册中心保活的一条记录
#[derive(Debug, Clone)]
pub struct RegistrationRecord {
    /// `<package>.<service>`
    pub key: String,
    pub service: Service,
    pub fingerprint: u64,
    pub registered: bool,
}

impl RegistrationRecord {
    pub fn node_id(&self) -> &str {
        self.service.first_node().map(|n| n.id.as_str()).unwrap_or_default()
    }
}

/// 每个服务一条记录，`Node.id = <serviceName>:<host>:<port>`
pub(crate) fn build_records(services: &[ServiceInfo], host: &str, port: u16) -> Vec<RegistrationRecord> {
    services
        .iter()
        .map(|info| {
            let node = Node {
                id: format!("{}:{}:{}", info.service_name, host, port),
                address: join_host_port(host, port),
                metadata: info.node_metadata.clone(),
            };
            let service = Service {
                name: info.service_name.clone(),
                version: info.version.clone(),
                metadata: info.service_metadata.clone(),
                endpoints: info.endpoints(),
                nodes: vec![node],
            };
            RegistrationRecord {
                key: info.key(),
                fingerprint: service.fingerprint(),
                service,
                registered: false,
            }
        })
        .collect()
}

/// 带指数退避的注册
pub(crate) async fn register_with_retry(
    registry: &dyn Registry,
    record: &mut RegistrationRecord,
    options: &RegisterOptions,
    policy: &ExponentialBackoffPolicy,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match registry.register(&record.service, options).await {
            Ok(()) => {
                record.registered = true;
                info!(
                    service = %record.key,
                    node_id = %record.node_id(),
                    attempt,
                    "✅ Service registered"
                );
                return Ok(());
            }
            Err(e) if policy.should_retry(attempt, &e) => {
                let delay = policy.backoff_duration(attempt);
                warn!(
                    service = %record.key,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "⚠️ Service registration failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(service = %record.key, attempt, error = %e, "❌ Service registration failed");
                return Err(FlareError::registration_failed(format!(
                    "failed to register {} after {} attempts",
                    record.key, attempt
                ))
                .with_details(e.to_string()));
            }
        }
    }
}

/// 心跳：每条记录尝试一次，失败只记录日志
pub(crate) async fn refresh_all(
    registry: &dyn Registry,
    records: &mut [RegistrationRecord],
    options: &RegisterOptions,
) {
    for record in records.iter_mut() {
        match registry.register(&record.service, options).await {
            Ok(()) => record.registered = true,
            Err(e) => {
                warn!(service = %record.key, node_id = %record.node_id(), error = %e, "⚠️ Heartbeat registration failed");
            }
        }
    }
}

/// 注销所有已成功注册的记录，失败只记录日志
pub(crate) async fn deregister_all(registry: &dyn Registry, records: &mut [RegistrationRecord]) {
    for record in records.iter_mut().filter(|r| r.registered) {
        match registry.deregister(&record.service).await {
            Ok(()) => {
                record.registered = false;
                info!(service = %record.key, node_id = %record.node_id(), "Service deregistered");
            }
            Err(e) => {
                warn!(service = %record.key, node_id = %record.node_id(), error = %e, "⚠️ Failed to deregister service");
            }
        }
    }
}
