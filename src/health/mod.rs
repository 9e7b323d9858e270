//! 健康检查模块
//!
//! 空字符串键表示整个服务器的状态，与 gRPC health 协议约定一致。

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 服务器整体状态使用的键
pub const OVERALL: &str = "";

/// `/status` 的固定响应
pub const STATUS_OK: &str = "status ok!";

/// 健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Serving,
    NotServing,
}

/// 健康检查服务
pub struct HealthService {
    statuses: Arc<RwLock<HashMap<String, HealthStatus>>>,
}

impl HealthService {
    pub fn new() -> Self {
        Self {
            statuses: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn set_status(&self, service: impl Into<String>, status: HealthStatus) {
        let mut statuses = self.statuses.write().await;
        statuses.insert(service.into(), status);
    }

    pub async fn get_status(&self, service: &str) -> HealthStatus {
        let statuses = self.statuses.read().await;
        statuses
            .get(service)
            .copied()
            .unwrap_or(HealthStatus::Unknown)
    }

    pub async fn is_serving(&self) -> bool {
        self.get_status(OVERALL).await == HealthStatus::Serving
    }

    pub async fn set_serving(&self) {
        let mut statuses = self.statuses.write().await;
        for status in statuses.values_mut() {
            *status = HealthStatus::Serving;
        }
    }

    pub async fn set_not_serving(&self) {
        let mut statuses = self.statuses.write().await;
        for status in statuses.values_mut() {
            *status = HealthStatus::NotServing;
        }
    }
}

impl Default for HealthService {
    fn default() -> Self {
        Self::new()
    }
}

/// 状态端口路由：`/status` 恒为 200，`/health` 反映整体健康状态
pub fn status_router(health: Arc<HealthService>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/health", get(health_check))
        .with_state(health)
}

async fn status() -> &'static str {
    STATUS_OK
}

async fn health_check(State(health): State<Arc<HealthService>>) -> (StatusCode, &'static str) {
    if health.is_serving().await {
        (StatusCode::OK, "SERVING")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT_SERVING")
    }
}
