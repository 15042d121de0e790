//! EAGAIN 重试策略：指数退避（2, 4, 8, 16 秒），最多 4 次
//!
//! RetryPolicy 是不可变配置；RetryState 随每次调用显式传递，重试次数与累计退避时间对调用方可见。

use std::time::Duration;

use super::error::MAX_RETRIES;

/// 退避配置：第 k 次重试前等待 initial_delay * 2^(k-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            initial_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
        }
    }

    /// 第 retry 次重试（从 1 开始）之前的等待时间
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.initial_delay.saturating_mul(1u32 << exponent)
    }

    /// 用尽全部重试时的累计等待时间
    pub fn worst_case_delay(&self) -> Duration {
        (1..=self.max_retries)
            .map(|k| self.delay_for(k))
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(d))
    }
}

/// 单次调用（或单个游标位置）上的重试进度
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    retries: u32,
    total_delay: Duration,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已执行的重试次数
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// 已安排的退避时间总和
    pub fn total_delay(&self) -> Duration {
        self.total_delay
    }

    /// 申请下一次重试：返回需等待的时间；重试已用尽则返回 None（状态不变）
    pub fn next_delay(&mut self, policy: &RetryPolicy) -> Option<Duration> {
        if self.retries >= policy.max_retries {
            return None;
        }
        self.retries += 1;
        let delay = policy.delay_for(self.retries);
        self.total_delay = self.total_delay.saturating_add(delay);
        Some(delay)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delays_are_powers_of_two() {
        let policy = RetryPolicy::default();
        for k in 1..=4 {
            assert_eq!(policy.delay_for(k), Duration::from_secs(1 << k));
        }
        assert_eq!(policy.worst_case_delay(), Duration::from_secs(30));
    }

    #[test]
    fn test_state_caps_at_max_retries() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::new();
        let delays: Vec<_> = std::iter::from_fn(|| state.next_delay(&policy)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ]
        );
        assert_eq!(state.retries(), 4);
        assert_eq!(state.total_delay(), Duration::from_secs(30));
        assert_eq!(state.next_delay(&policy), None);
        assert_eq!(state.retries(), 4);
    }

    #[test]
    fn test_reset() {
        let policy = RetryPolicy::new(2, Duration::from_millis(100));
        let mut state = RetryState::new();
        state.next_delay(&policy);
        state.next_delay(&policy);
        assert_eq!(state.next_delay(&policy), None);
        state.reset();
        assert_eq!(state.next_delay(&policy), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_zero_retries() {
        let policy = RetryPolicy::new(0, Duration::from_secs(2));
        assert_eq!(RetryState::new().next_delay(&policy), None);
        assert_eq!(policy.worst_case_delay(), Duration::ZERO);
    }
}
