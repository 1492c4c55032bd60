use std::time::Duration;

/// 重投配置
#[derive(Clone, Copy, Debug)]
pub struct RedeliveryConfig {
    /// 工作者轮询间隔
    pub poll_interval: Duration,
    /// 最大分发次数（含首次），达到后进入死信
    pub max_attempts: u32,
    /// 退避基数
    pub backoff_base: Duration,
    /// 退避上限
    pub backoff_cap: Duration,
    /// `Pending` 记录被视为遗留（发布方崩溃）前的等待时间
    pub grace_interval: Duration,
    /// 单轮认领的最大记录数
    pub batch_size: usize,
    /// 认领租约时长
    pub claim_lease: Duration,
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(60),
            grace_interval: Duration::from_secs(30),
            batch_size: 100,
            claim_lease: Duration::from_secs(30),
        }
    }
}

impl RedeliveryConfig {
    /// 第 `attempts` 次失败后的等待时间：`min(base * 2^(attempts-1), cap)`
    pub fn backoff(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let cfg = RedeliveryConfig {
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(1),
            ..Default::default()
        };
        let waits: Vec<_> = (1..=6).map(|n| cfg.backoff(n).as_millis()).collect();
        assert_eq!(waits, [100, 200, 400, 800, 1000, 1000]);
        assert_eq!(cfg.backoff(0), Duration::ZERO);
        assert_eq!(cfg.backoff(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn zero_base_never_waits() {
        let cfg = RedeliveryConfig {
            backoff_base: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(cfg.backoff(3), Duration::ZERO);
    }
}
