//! 最小データレート

use std::time::Duration;

/// 最小データレート
///
/// 猶予期間が過ぎた後、平均転送レートが `bytes_per_second` を下回ると
/// 読み込み・書き込みはタイムアウトとみなされる。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinDataRate {
    pub bytes_per_second: f64,
    pub grace_period: Duration,
}

impl MinDataRate {
    pub fn new(bytes_per_second: f64, grace_period: Duration) -> Self {
        debug_assert!(bytes_per_second > 0.0, "bytes_per_second must be positive");
        Self { bytes_per_second, grace_period }
    }

    /// `bytes` を最小レートで転送するのにかかる時間
    pub fn time_to_transfer(&self, bytes: u64) -> Duration {
        Duration::from_secs_f64(bytes as f64 / self.bytes_per_second)
    }

    /// 1 回の書き込みに許される時間 (猶予期間と転送時間の大きい方)
    pub fn write_allowance(&self, bytes: u64) -> Duration {
        self.time_to_transfer(bytes).max(self.grace_period)
    }
}
