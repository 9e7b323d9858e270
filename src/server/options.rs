//! 服务端参数

use crate::config::ServerConfig;
use crate::error::{FlareError, Result};
use crate::registry::Registry;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct ServerOptions {
    pub registry: Arc<dyn Registry>,
    /// 对外公布的主机，为空时使用监听地址（未指定地址公布为回环地址）
    pub host: Option<String>,
    pub bind_host: IpAddr,
    /// 0 表示在端口范围内随机选择
    pub port: u16,
    /// 0 表示 port + 1
    pub http_port: u16,
    pub port_range: (u16, u16),
    pub port_attempts: u32,
    /// 心跳（重复注册）间隔
    pub register_interval: Duration,
    pub register_ttl: Duration,
    pub register_attempts: usize,
    /// 注册失败后的首次退避时间，之后按 2 倍递增
    pub register_backoff: Duration,
    pub check_interval: Duration,
    pub check_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_concurrent_streams: Option<u32>,
}

impl ServerOptions {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        let defaults = ServerConfig::default();
        Self {
            registry,
            host: None,
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: defaults.port,
            http_port: defaults.http_port,
            port_range: (defaults.port_range_min, defaults.port_range_max),
            port_attempts: defaults.port_attempts,
            register_interval: Duration::from_secs(defaults.register_interval_secs),
            register_ttl: Duration::from_secs(defaults.register_ttl_secs),
            register_attempts: defaults.register_attempts as usize,
            register_backoff: Duration::from_secs(1),
            check_interval: Duration::from_secs(defaults.check_interval_secs),
            check_timeout: Duration::from_secs(defaults.check_timeout_secs),
            shutdown_timeout: Duration::from_secs(defaults.shutdown_timeout_secs),
            max_concurrent_streams: defaults.max_concurrent_streams,
        }
    }

    pub fn from_config(registry: Arc<dyn Registry>, config: &ServerConfig) -> Result<Self> {
        let bind_host: IpAddr = config.bind_host.parse().map_err(|e| {
            FlareError::configuration(format!("invalid bind_host '{}': {}", config.bind_host, e))
        })?;

        Ok(Self {
            registry,
            host: Some(config.host.clone()).filter(|h| !h.is_empty()),
            bind_host,
            port: config.port,
            http_port: config.http_port,
            port_range: (config.port_range_min, config.port_range_max),
            port_attempts: config.port_attempts,
            register_interval: Duration::from_secs(config.register_interval_secs),
            register_ttl: Duration::from_secs(config.register_ttl_secs),
            register_attempts: config.register_attempts.max(1) as usize,
            register_backoff: Duration::from_secs(1),
            check_interval: Duration::from_secs(config.check_interval_secs),
            check_timeout: Duration::from_secs(config.check_timeout_secs),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            max_concurrent_streams: config.max_concurrent_streams,
        })
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_bind_host(mut self, bind_host: IpAddr) -> Self {
        self.bind_host = bind_host;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_http_port(mut self, http_port: u16) -> Self {
        self.http_port = http_port;
        self
    }

    pub fn with_port_range(mut self, min: u16, max: u16) -> Self {
        self.port_range = (min, max);
        self
    }

    pub fn with_register_interval(mut self, interval: Duration) -> Self {
        self.register_interval = interval;
        self
    }

    pub fn with_register_ttl(mut self, ttl: Duration) -> Self {
        self.register_ttl = ttl;
        self
    }

    pub fn with_register_attempts(mut self, attempts: usize) -> Self {
        self.register_attempts = attempts.max(1);
        self
    }

    pub fn with_register_backoff(mut self, backoff: Duration) -> Self {
        self.register_backoff = backoff;
        self
    }

    pub fn with_checks(mut self, interval: Duration, timeout: Duration) -> Self {
        self.check_interval = interval;
        self.check_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_streams(mut self, max: u32) -> Self {
        self.max_concurrent_streams = Some(max);
        self
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("registry", &self.registry.name())
            .field("host", &self.host)
            .field("bind_host", &self.bind_host)
            .field("port", &self.port)
            .field("http_port", &self.http_port)
            .field("register_interval", &self.register_interval)
            .field("register_ttl", &self.register_ttl)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}
