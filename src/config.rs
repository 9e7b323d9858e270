//! 配置模块
//!
//! 所有字段都带有默认值，空文件即为合法配置。

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub registry: RegistryConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub log: LogConfig,
}

impl Config {
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path))?;
        Ok(config)
    }
}

/// 注册中心配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_type")]
    pub registry_type: String, // consul, memory
    #[serde(default = "default_registry_addrs")]
    pub addrs: Vec<String>,
    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,
}

fn default_registry_type() -> String {
    "consul".to_string()
}

fn default_registry_addrs() -> Vec<String> {
    vec!["127.0.0.1:8500".to_string()]
}

fn default_registry_timeout() -> u64 {
    10
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry_type: default_registry_type(),
            addrs: default_registry_addrs(),
            timeout_secs: default_registry_timeout(),
        }
    }
}

/// 服务端配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 对外公布的主机地址，为空时使用 bind_host
    pub host: String,
    pub bind_host: String,
    /// 0 表示在端口范围内随机选择
    pub port: u16,
    /// 0 表示 port + 1
    pub http_port: u16,
    pub port_range_min: u16,
    pub port_range_max: u16,
    pub port_attempts: u32,
    pub register_interval_secs: u64,
    pub register_ttl_secs: u64,
    pub register_attempts: u32,
    pub check_interval_secs: u64,
    pub check_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub max_concurrent_streams: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            bind_host: "0.0.0.0".to_string(),
            port: 0,
            http_port: 0,
            port_range_min: 20000,
            port_range_max: 50000,
            port_attempts: 100,
            register_interval_secs: 10,
            register_ttl_secs: 90,
            register_attempts: 3,
            check_interval_secs: 10,
            check_timeout_secs: 5,
            shutdown_timeout_secs: 10,
            max_concurrent_streams: None,
        }
    }
}

/// 客户端配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// 长轮询等待时间
    pub watch_wait_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
            watch_wait_secs: 60,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: String, // text, json
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}
