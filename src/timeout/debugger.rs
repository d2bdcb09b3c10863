//! デバッガ検出
//!
//! デバッガがアタッチされている間はタイムアウト判定を行わない。

use std::fs;

/// デバッガの状態を問い合わせる
pub trait Debugger {
    fn is_attached(&self) -> bool;
}

/// プロセスの実際のデバッガ状態
///
/// Linux では `/proc/self/status` の `TracerPid` が 0 以外ならアタッチ中。
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessDebugger;

impl Debugger for ProcessDebugger {
    fn is_attached(&self) -> bool {
        match fs::read_to_string("/proc/self/status") {
            Ok(status) => tracer_pid(&status).is_some_and(|pid| pid != 0),
            Err(_) => false,
        }
    }
}

fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|v| v.trim().parse().ok())
}

/// 固定値を返すデバッガ (テスト用)
#[derive(Debug, Clone, Copy)]
pub struct FixedDebugger(pub bool);

impl Debugger for FixedDebugger {
    fn is_attached(&self) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracer_pid_parsing() {
        let status = "Name:\tzerocopy-h2\nState:\tS (sleeping)\nTracerPid:\t4242\nUid:\t0\n";
        assert_eq!(tracer_pid(status), Some(4242));
        assert_eq!(tracer_pid("TracerPid:\t0\n"), Some(0));
        assert_eq!(tracer_pid("Name:\tx\n"), None);
    }

    #[test]
    fn test_fixed_debugger() {
        assert!(FixedDebugger(true).is_attached());
        assert!(!FixedDebugger(false).is_attached());
    }
}
