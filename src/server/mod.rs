//! gRPC 服务端模块
//!
//! `GrpcServer` 负责完整的服务生命周期：
//!
//! 1. 绑定主端口（配置端口或在端口范围内随机选择）和状态端口（默认主端口 + 1）
//! 2. 启动状态 HTTP 服务，健康状态置为 NOT_SERVING
//! 3. 挂载所有服务并开始接收 RPC 连接
//! 4. 为每个服务构建注册记录并带重试注册；任一失败则回滚已成功的注册并关闭所有监听
//! 5. 全部成功后健康状态置为 SERVING，并启动心跳任务周期性重复注册
//!
//! `stop` 通知心跳任务退出：先注销所有记录，再在超时时间内优雅关闭传输层，
//! 超时则强制终止。

mod dispatch;
pub mod options;
pub mod registration;
pub mod service_info;

pub use options::ServerOptions;
pub use registration::RegistrationRecord;
pub use service_info::{RpcHandler, ServiceInfo};

use crate::error::{ErrorCode, FlareError, Result, ResultExt};
use crate::health::{HealthService, HealthStatus, OVERALL, status_router};
use crate::registry::{CheckSpec, RegisterOptions, Registry};
use crate::retry::ExponentialBackoffPolicy;
use crate::utils::{advertised_ip, bind_in_range, join_host_port, wait_for_server_ready};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{error, info, warn};

/// 服务器生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    /// 监听已建立、服务已挂载，尚未完成注册
    Configured,
    Serving,
    Draining,
    Stopped,
}

/// 主端口与状态端口上的后台服务
struct Transport {
    shutdown: CancellationToken,
    rpc: JoinHandle<std::result::Result<(), tonic::transport::Error>>,
    status: JoinHandle<std::io::Result<()>>,
}

impl Transport {
    /// 在超时时间内等待优雅关闭，超时则强制终止
    async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown.cancel();

        let Transport { rpc, status, .. } = self;
        let rpc_abort = rpc.abort_handle();
        let status_abort = status.abort_handle();

        match tokio::time::timeout(timeout, async { (rpc.await, status.await) }).await {
            Ok((rpc_result, status_result)) => {
                if let Ok(Err(e)) = status_result {
                    warn!(error = %e, "⚠️ Status server exited with error");
                }
                match rpc_result {
                    Ok(Ok(())) => {
                        info!("✅ gRPC transport stopped gracefully");
                        Ok(())
                    }
                    Ok(Err(e)) => Err(FlareError::from(e)),
                    Err(e) => Err(FlareError::system(format!("gRPC serve task failed: {}", e))),
                }
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "⚠️ Graceful shutdown timed out, forcing stop");
                rpc_abort.abort();
                status_abort.abort();
                Ok(())
            }
        }
    }
}

struct RunningServer {
    local_addr: SocketAddr,
    http_addr: SocketAddr,
    advertised: String,
    records: Arc<Mutex<Vec<RegistrationRecord>>>,
    exit: CancellationToken,
    heartbeat: JoinHandle<Result<()>>,
}

/// 带服务注册的 gRPC 服务器
pub struct GrpcServer {
    options: ServerOptions,
    health: Arc<HealthService>,
    /// 同时作为 start/stop 的串行化锁
    running: RwLock<Option<RunningServer>>,
    state: std::sync::Mutex<ServerState>,
}

impl GrpcServer {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            health: Arc::new(HealthService::new()),
            running: RwLock::new(None),
            state: std::sync::Mutex::new(ServerState::Created),
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn health(&self) -> Arc<HealthService> {
        self.health.clone()
    }

    pub fn state(&self) -> ServerState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ServerState::Stopped)
    }

    fn set_state(&self, state: ServerState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    pub async fn is_started(&self) -> bool {
        self.running.read().await.is_some()
    }

    /// 主端口实际监听地址
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.read().await.as_ref().map(|r| r.local_addr)
    }

    /// 状态端口实际监听地址
    pub async fn http_addr(&self) -> Option<SocketAddr> {
        self.running.read().await.as_ref().map(|r| r.http_addr)
    }

    /// 注册到注册中心的 `host:port`
    pub async fn advertised_address(&self) -> Option<String> {
        self.running.read().await.as_ref().map(|r| r.advertised.clone())
    }

    /// 当前注册记录快照
    pub async fn registrations(&self) -> Vec<RegistrationRecord> {
        let records = match self.running.read().await.as_ref() {
            Some(running) => running.records.clone(),
            None => return Vec::new(),
        };
        let records = records.lock().await;
        records.clone()
    }

    /// 启动服务器；已经启动时直接返回
    pub async fn start(&self, services: Vec<ServiceInfo>) -> Result<()> {
        let mut running = self.running.write().await;
        if running.is_some() {
            info!("Server already started, skipping");
            return Ok(());
        }
        if services.is_empty() {
            return Err(FlareError::configuration("no services to serve"));
        }

        let listener = self.bind_primary().await?;
        let local_addr = listener
            .local_addr()
            .into_flare(ErrorCode::ConnectionFailed, "failed to read local address")?;

        let http_port = match self.options.http_port {
            0 => local_addr.port().checked_add(1).ok_or_else(|| {
                FlareError::configuration(format!("no status port available after {}", local_addr.port()))
            })?,
            port => port,
        };
        let status_listener = TcpListener::bind(SocketAddr::new(self.options.bind_host, http_port))
            .await
            .map_err(|e| {
                FlareError::connection_failed(format!("failed to bind status port {}: {}", http_port, e))
            })?;
        let http_addr = status_listener
            .local_addr()
            .into_flare(ErrorCode::ConnectionFailed, "failed to read status address")?;

        let transport = self.spawn_transport(&services, listener, status_listener).await;
        self.set_state(ServerState::Configured);

        let host = advertised_host(self.options.host.as_deref(), local_addr);
        let advertised = join_host_port(&host, local_addr.port());

        info!(
            address = %local_addr,
            status_address = %http_addr,
            advertised = %advertised,
            services = services.len(),
            "🚀 gRPC server listening"
        );

        let ready_addr = SocketAddr::new(advertised_ip(local_addr.ip()), local_addr.port());
        if let Err(e) = wait_for_server_ready(ready_addr).await {
            error!(error = %e, "❌ gRPC server did not become ready");
            self.abort_start(transport).await;
            return Err(e);
        }

        let register_options = self.register_options(&host, local_addr.port(), http_addr.port());
        let mut records = registration::build_records(&services, &host, local_addr.port());
        let policy = ExponentialBackoffPolicy::new(
            self.options.register_attempts,
            self.options.register_backoff,
            self.options.register_backoff * 4,
        );

        let registry = self.options.registry.as_ref();
        for index in 0..records.len() {
            if let Err(e) =
                registration::register_with_retry(registry, &mut records[index], &register_options, &policy).await
            {
                error!(error = %e, "❌ Registration failed, rolling back");
                registration::deregister_all(registry, &mut records).await;
                self.abort_start(transport).await;
                return Err(e);
            }
        }

        self.health.set_serving().await;
        self.set_state(ServerState::Serving);

        let records = Arc::new(Mutex::new(records));
        let exit = CancellationToken::new();
        let heartbeat = tokio::spawn(run_heartbeat(Heartbeat {
            registry: self.options.registry.clone(),
            records: records.clone(),
            options: register_options,
            interval: self.options.register_interval,
            shutdown_timeout: self.options.shutdown_timeout,
            exit: exit.clone(),
            transport,
        }));

        info!(advertised = %advertised, "✅ Server is serving");
        *running = Some(RunningServer {
            local_addr,
            http_addr,
            advertised,
            records,
            exit,
            heartbeat,
        });
        Ok(())
    }

    /// 停止服务器；未启动时直接返回
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.write().await;
        let Some(server) = running.take() else {
            return Ok(());
        };

        info!(advertised = %server.advertised, "Stopping server");
        self.set_state(ServerState::Draining);
        self.health.set_not_serving().await;
        server.exit.cancel();

        let result = match server.heartbeat.await {
            Ok(result) => result,
            Err(e) => Err(FlareError::system(format!("heartbeat task failed: {}", e))),
        };

        self.set_state(ServerState::Stopped);
        info!(advertised = %server.advertised, "Server stopped");
        result
    }

    async fn bind_primary(&self) -> Result<TcpListener> {
        let host = self.options.bind_host;
        if self.options.port != 0 {
            return TcpListener::bind(SocketAddr::new(host, self.options.port))
                .await
                .map_err(|e| {
                    FlareError::connection_failed(format!(
                        "failed to bind {}:{}: {}",
                        host, self.options.port, e
                    ))
                });
        }
        let (min, max) = self.options.port_range;
        bind_in_range(host, min, max, self.options.port_attempts).await
    }

    async fn spawn_transport(
        &self,
        services: &[ServiceInfo],
        listener: TcpListener,
        status_listener: TcpListener,
    ) -> Transport {
        let shutdown = CancellationToken::new();

        let status = {
            let router = status_router(self.health.clone());
            let signal = shutdown.clone().cancelled_owned();
            tokio::spawn(async move {
                axum::serve(status_listener, router)
                    .with_graceful_shutdown(signal)
                    .await
            })
        };

        self.health.set_status(OVERALL, HealthStatus::NotServing).await;
        for service in services {
            self.health.set_status(service.key(), HealthStatus::NotServing).await;
        }

        let mut builder = Server::builder();
        if let Some(max_streams) = self.options.max_concurrent_streams {
            builder = builder.max_concurrent_streams(Some(max_streams));
        }
        let router = builder.add_routes(dispatch::build_routes(services));
        let incoming = TcpListenerStream::new(listener);
        let signal = shutdown.clone().cancelled_owned();
        let rpc = tokio::spawn(async move { router.serve_with_incoming_shutdown(incoming, signal).await });

        Transport {
            shutdown,
            rpc,
            status,
        }
    }

    fn register_options(&self, host: &str, port: u16, http_port: u16) -> RegisterOptions {
        let interval = self.options.check_interval;
        let timeout = self.options.check_timeout;
        RegisterOptions::default()
            .with_ttl(self.options.register_ttl)
            .with_tcp_check(CheckSpec::tcp(join_host_port(host, port), interval, timeout))
            .with_http_check(CheckSpec::http(
                format!("http://{}/status", join_host_port(host, http_port)),
                interval,
                timeout,
            ))
    }

    async fn abort_start(&self, transport: Transport) {
        if let Err(e) = transport.shutdown(self.options.shutdown_timeout).await {
            warn!(error = %e, "⚠️ Transport shutdown after failed start reported an error");
        }
        self.health.set_not_serving().await;
        self.set_state(ServerState::Created);
    }
}

/// 为空或为未指定地址时使用监听地址，未指定的监听地址公布为回环地址
fn advertised_host(configured: Option<&str>, local_addr: SocketAddr) -> String {
    match configured.map(str::trim).filter(|h| !h.is_empty()) {
        Some(host) => match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            Ok(ip) if ip.is_unspecified() => advertised_ip(ip).to_string(),
            _ => host.to_string(),
        },
        None => advertised_ip(local_addr.ip()).to_string(),
    }
}

struct Heartbeat {
    registry: Arc<dyn Registry>,
    records: Arc<Mutex<Vec<RegistrationRecord>>>,
    options: RegisterOptions,
    interval: Duration,
    shutdown_timeout: Duration,
    exit: CancellationToken,
    transport: Transport,
}

async fn run_heartbeat(heartbeat: Heartbeat) -> Result<()> {
    let Heartbeat {
        registry,
        records,
        options,
        interval,
        shutdown_timeout,
        exit,
        transport,
    } = heartbeat;

    // 间隔为 0 时关闭心跳
    if interval.is_zero() {
        exit.cancelled().await;
    }
    let period = interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while !exit.is_cancelled() {
        tokio::select! {
            _ = exit.cancelled() => break,
            _ = ticker.tick() => {
                let mut records = records.lock().await;
                registration::refresh_all(registry.as_ref(), &mut records, &options).await;
            }
        }
    }

    {
        let mut records = records.lock().await;
        registration::deregister_all(registry.as_ref(), &mut records).await;
    }

    transport.shutdown(shutdown_timeout).await
}
