//! 重试退避策略
//!
//! 队列对失败任务重新入队前的等待时间计算。是否重试、重试几次由队列的
//! attempts 配置决定，这里只负责指数退避。

use std::time::Duration;

/// 指数退避策略
///
/// 首次重试等待 `initial_delay`，之后每次乘以 `multiplier`，不超过 `max_delay`。
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次执行）
    pub max_retries: u32,
    /// 首次重试前的等待时间
    pub initial_delay: Duration,
    /// 退避时间上限
    pub max_delay: Duration,
    /// 每次重试的退避倍数
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 默认不重试；退避参数为 1 秒起步、倍数 2.0、上限 30 秒
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 由“总尝试次数”构造（kue 风格的 attempts，1 表示只执行一次）
    pub fn from_attempts(attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries: attempts.saturating_sub(1),
            initial_delay,
            ..Self::default()
        }
    }

    /// 总尝试次数（首次执行 + 重试）
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// 计算第 N 次重试的等待时间（attempt 从 0 开始）
    ///
    /// 公式: initial_delay * multiplier^attempt，结果不超过 max_delay。
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// 已失败 `attempt` 次（从 0 开始计数的重试轮次）后是否还应重试
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
