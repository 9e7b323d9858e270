//! 负载均衡模块
//!
//! 连接池的就绪连接集合每次变化都会重新构建一个 `Picker`，
//! `Picker` 本身只持有不可变的连接快照和一个原子计数器。

use crate::error::{FlareError, Result};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tonic::metadata::MetadataMap;
use tracing::info;

/// 轮询均衡器名称
pub const ROUND_ROBIN: &str = "z_round_robin";

/// 计数器超过该值后归零
const WRAP_THRESHOLD: u32 = 100_000_000;

/// 单次选择的调用信息
#[derive(Debug, Clone, Copy)]
pub struct PickInfo<'a> {
    /// 完整方法路径，如 `/api.Greeter/SayHello`
    pub method: &'a str,
    pub metadata: Option<&'a MetadataMap>,
}

impl<'a> PickInfo<'a> {
    pub fn new(method: &'a str) -> Self {
        Self {
            method,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: &'a MetadataMap) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// 调用元数据中是否携带 `gray: true`
    pub fn is_gray(&self) -> bool {
        self.metadata
            .and_then(|md| md.get("gray"))
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

/// 连接选择器
pub trait Picker<T>: Send + Sync {
    fn pick(&self, info: &PickInfo<'_>) -> Result<T>;
}

/// 选择器构建器
pub trait PickerBuilder<T>: Send + Sync {
    fn name(&self) -> &str;
    fn build(&self, ready: Vec<T>) -> Arc<dyn Picker<T>>;
}

/// 轮询选择器
pub struct RoundRobinPicker<T> {
    conns: Vec<T>,
    next: AtomicU32,
}

impl<T> RoundRobinPicker<T> {
    /// 起始位置随机，避免多个客户端同时重建时集中打到第一个实例
    pub fn new(conns: Vec<T>) -> Self {
        let start = if conns.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..conns.len()) as u32
        };
        Self {
            conns,
            next: AtomicU32::new(start),
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

impl<T> Picker<T> for RoundRobinPicker<T>
where
    T: Clone + Send + Sync,
{
    fn pick(&self, info: &PickInfo<'_>) -> Result<T> {
        if self.conns.is_empty() {
            return Err(FlareError::unavailable("no ready connection available"));
        }

        // 灰度路由暂未实现，仅记录
        if info.is_gray() {
            info!(method = %info.method, "Gray request detected");
        }

        let next = self.next.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if next > WRAP_THRESHOLD {
            self.next.store(0, Ordering::Relaxed);
        }
        let index = next as usize % self.conns.len();
        Ok(self.conns[index].clone())
    }
}

/// 轮询选择器构建器
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinBuilder;

impl<T> PickerBuilder<T> for RoundRobinBuilder
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        ROUND_ROBIN
    }

    fn build(&self, ready: Vec<T>) -> Arc<dyn Picker<T>> {
        Arc::new(RoundRobinPicker::new(ready))
    }
}
