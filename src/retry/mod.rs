//! 重试策略模块

pub mod exponential;
pub mod step;

pub use exponential::ExponentialBackoffPolicy;
pub use step::StepBackoffPolicy;

use crate::error::FlareError;
use std::time::Duration;

/// 重试策略 trait
///
/// `attempt` 从 1 开始计数，表示已经失败的次数。
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, attempt: usize, error: &FlareError) -> bool;
    fn backoff_duration(&self, attempt: usize) -> Duration;
    fn max_attempts(&self) -> usize;
}
