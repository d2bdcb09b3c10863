//! # タイムアウト・データレート制御
//!
//! HTTP/1.1 と HTTP/2 で共通のタイムアウト判定エンジン。
//!
//! - `control`: コネクション単位の状態と `tick` 判定
//! - `rate`: 最小データレート
//! - `debugger`: デバッガ検出 (アタッチ中は判定しない)
//! - `heartbeat`: 全コネクションを定期的にティックする monoio タスク

pub mod control;
pub mod debugger;
pub mod heartbeat;
pub mod rate;

use std::fmt;
use std::time::Duration;

pub use control::{TimeoutControl, WriteTimingHandle};
pub use debugger::{Debugger, FixedDebugger, ProcessDebugger};
pub use heartbeat::Heartbeat;
pub use rate::MinDataRate;

/// ハートビート間隔
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// タイムアウトの理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    None,
    KeepAlive,
    RequestHeaders,
    ReadDataRate,
    WriteDataRate,
    RequestBodyDrain,
    /// アプリケーションが明示的に設定したタイムアウト
    TimeoutFeature,
}

impl fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::None => "no timeout",
            Self::KeepAlive => "keep-alive timeout",
            Self::RequestHeaders => "Reading the request headers timed out",
            Self::ReadDataRate => "Reading the request body timed out due to data arriving too slowly",
            Self::WriteDataRate => "The response was written too slowly",
            Self::RequestBodyDrain => "Draining the request body timed out",
            Self::TimeoutFeature => "The request timed out",
        };
        f.write_str(msg)
    }
}

/// タイムアウト発生時のコールバック
pub trait TimeoutHandler {
    fn on_timeout(&self, reason: TimeoutReason);
}

impl<F: Fn(TimeoutReason)> TimeoutHandler for F {
    fn on_timeout(&self, reason: TimeoutReason) {
        self(reason)
    }
}
