use super::RetryPolicy;
use crate::error::FlareError;
use std::time::Duration;

/// 线性步进退避
///
/// 第 n 次连续失败后等待 `n * step`；失败次数达到 `ceiling_after` 后固定等待 `ceiling`。
/// 不限制重试次数，用于需要一直运行的后台循环。
#[derive(Debug, Clone)]
pub struct StepBackoffPolicy {
    step: Duration,
    ceiling_after: usize,
    ceiling: Duration,
}

impl StepBackoffPolicy {
    pub fn new(step: Duration, ceiling_after: usize, ceiling: Duration) -> Self {
        Self {
            step,
            ceiling_after,
            ceiling,
        }
    }
}

impl Default for StepBackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), 5, Duration::from_secs(60))
    }
}

impl RetryPolicy for StepBackoffPolicy {
    fn should_retry(&self, _attempt: usize, _error: &FlareError) -> bool {
        true
    }

    fn backoff_duration(&self, attempt: usize) -> Duration {
        if attempt >= self.ceiling_after {
            return self.ceiling;
        }
        self.step.saturating_mul(attempt as u32)
    }

    fn max_attempts(&self) -> usize {
        usize::MAX
    }
}
