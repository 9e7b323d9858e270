//! Consul HTTP API 报文

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const HEALTH_CRITICAL: &str = "critical";
pub const HEALTH_PASSING: &str = "passing";

#[allow(non_snake_case)]
#[derive(Debug, Serialize)]
pub struct AgentServiceRegistration {
    pub ID: String,
    pub Name: String,
    pub Tags: Vec<String>,
    pub Port: u16,
    pub Address: String,
    pub Meta: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub Check: Option<AgentServiceCheck>,
}

#[allow(non_snake_case)]
#[derive(Debug, Default, Serialize)]
pub struct AgentServiceCheck {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub TCP: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub HTTP: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub TTL: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub Interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub Timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub DeregisterCriticalServiceAfter: Option<String>,
}

/// `/v1/health/service/{service}` 返回的条目
#[allow(non_snake_case)]
#[derive(Debug, Deserialize)]
pub struct ServiceEntry {
    #[serde(default)]
    pub Node: Option<CatalogNode>,
    pub Service: AgentService,
    #[serde(default)]
    pub Checks: Option<Vec<HealthCheck>>,
}

#[allow(non_snake_case)]
#[derive(Debug, Default, Deserialize)]
pub struct CatalogNode {
    #[serde(default)]
    pub Node: String,
    #[serde(default)]
    pub Address: String,
}

#[allow(non_snake_case)]
#[derive(Debug, Default, Deserialize)]
pub struct AgentService {
    #[serde(default)]
    pub ID: String,
    #[serde(default)]
    pub Service: String,
    #[serde(default)]
    pub Tags: Option<Vec<String>>,
    #[serde(default)]
    pub Address: String,
    #[serde(default)]
    pub Port: u16,
    #[serde(default)]
    pub Meta: Option<BTreeMap<String, String>>,
}

#[allow(non_snake_case)]
#[derive(Debug, Default, Deserialize)]
pub struct HealthCheck {
    #[serde(default)]
    pub CheckID: String,
    #[serde(default)]
    pub Status: String,
    #[serde(default)]
    pub ServiceID: String,
}

impl ServiceEntry {
    pub fn is_critical(&self) -> bool {
        self.Checks
            .iter()
            .flatten()
            .any(|check| check.Status == HEALTH_CRITICAL)
    }

    /// 实例地址，缺省时回退到节点地址
    pub fn host(&self) -> &str {
        if !self.Service.Address.is_empty() {
            return &self.Service.Address;
        }
        self.Node.as_ref().map(|n| n.Address.as_str()).unwrap_or("")
    }
}
