//! # コネクション単位のタイムアウト制御
//!
//! 固定タイムアウト、リクエストボディの最小読み込みレート、レスポンスの
//! 最小書き込みレートを 1 つの状態としてまとめ、ハートビートの `tick` ごとに判定します。
//!
//! 状態はすべて 1 つの `Mutex` の内側にあり、I/O 側からのバイト数報告と
//! `tick` が競合しても整合したスナップショットで判定されます。
//! ハンドラはロックを解放してから呼び出すため、ハンドラ内から
//! `cancel_timeout` などを呼んでもデッドロックしません。

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::debugger::{Debugger, ProcessDebugger};
use super::rate::MinDataRate;
use super::{TimeoutHandler, TimeoutReason, HEARTBEAT_INTERVAL};

/// 書き込み計測のハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteTimingHandle(u64);

#[derive(Debug)]
struct TimeoutState {
    last_timestamp: Instant,

    // 固定タイムアウト
    timeout_deadline: Option<Instant>,
    timeout_reason: TimeoutReason,

    // 読み込みレート
    read_rate: Option<MinDataRate>,
    /// ボディを受信中のリクエスト数 (HTTP/2 では複数)
    concurrent_request_bodies: u32,
    /// バックプレッシャーで一時停止中のボディ数
    paused_request_bodies: u32,
    /// 次のティックで一時停止に数えるボディ数
    pending_pauses: u32,
    read_timing_elapsed: Duration,
    read_timing_bytes: u64,
    read_timed_out: bool,

    // 書き込みレート
    next_write_id: u64,
    in_flight_writes: Vec<(WriteTimingHandle, Instant)>,
    write_timed_out: bool,
}

impl TimeoutState {
    fn new(now: Instant) -> Self {
        Self {
            last_timestamp: now,
            timeout_deadline: None,
            timeout_reason: TimeoutReason::None,
            read_rate: None,
            concurrent_request_bodies: 0,
            paused_request_bodies: 0,
            pending_pauses: 0,
            read_timing_elapsed: Duration::ZERO,
            read_timing_bytes: 0,
            read_timed_out: false,
            next_write_id: 0,
            in_flight_writes: Vec::new(),
            write_timed_out: false,
        }
    }

    /// 一時停止していないボディが 1 つでもあれば読み込みを計測する
    fn is_timing_reads(&self) -> bool {
        self.concurrent_request_bodies > self.paused_request_bodies
    }

    /// 要求された一時停止を反映する
    fn apply_pending_pauses(&mut self) {
        self.paused_request_bodies =
            (self.paused_request_bodies + self.pending_pauses).min(self.concurrent_request_bodies);
        self.pending_pauses = 0;
    }

    /// 最も遅い書き込み期限
    fn write_deadline(&self) -> Option<Instant> {
        self.in_flight_writes.iter().map(|(_, deadline)| *deadline).max()
    }
}

/// タイムアウト制御
pub struct TimeoutControl {
    state: Mutex<TimeoutState>,
    handler: Box<dyn TimeoutHandler>,
    debugger: Box<dyn Debugger>,
}

impl TimeoutControl {
    /// プロセスのデバッガ状態を参照する制御を作成
    pub fn new(handler: impl TimeoutHandler + 'static, now: Instant) -> Self {
        Self::with_debugger(handler, ProcessDebugger, now)
    }

    pub fn with_debugger(
        handler: impl TimeoutHandler + 'static,
        debugger: impl Debugger + 'static,
        now: Instant,
    ) -> Self {
        Self {
            state: Mutex::new(TimeoutState::new(now)),
            handler: Box::new(handler),
            debugger: Box::new(debugger),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimeoutState> {
        // ハンドラはロック外で呼ぶため、パニックで汚染されても状態は一貫している
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 最後に `tick` された時刻
    pub fn last_timestamp(&self) -> Instant {
        self.lock().last_timestamp
    }

    /// ハートビートごとの判定
    pub fn tick(&self, now: Instant) {
        let mut fired = Vec::with_capacity(3);
        {
            let mut state = self.lock();
            self.check_for_timeout(&mut state, now, &mut fired);
            self.check_for_read_data_rate(&mut state, now, &mut fired);
            self.check_for_write_data_rate(&mut state, now, &mut fired);
            state.last_timestamp = now;
        }

        for reason in fired {
            ftlog::debug!("[Timeout] {:?} timeout fired", reason);
            self.handler.on_timeout(reason);
        }
    }

    fn check_for_timeout(&self, state: &mut TimeoutState, now: Instant, fired: &mut Vec<TimeoutReason>) {
        let Some(deadline) = state.timeout_deadline else {
            return;
        };
        if now > deadline && !self.debugger.is_attached() {
            let reason = state.timeout_reason;
            state.timeout_deadline = None;
            state.timeout_reason = TimeoutReason::None;
            fired.push(reason);
        }
    }

    fn check_for_read_data_rate(&self, state: &mut TimeoutState, now: Instant, fired: &mut Vec<TimeoutReason>) {
        // ボディのドレイン中は短い固定タイムアウトが設定されているのでレートは見ない
        let timing = state.timeout_deadline.is_none() && state.is_timing_reads() && !state.read_timed_out;
        if let (true, Some(rate)) = (timing, state.read_rate) {
            let since_last = now.saturating_duration_since(state.last_timestamp);
            // ティック間隔が大きく空いた分はリソース不足とみなし、レート計算に含めない
            state.read_timing_elapsed += since_last.min(HEARTBEAT_INTERVAL);

            if state.read_timing_elapsed > rate.grace_period {
                let elapsed_secs = state.read_timing_elapsed.as_secs_f64();
                let observed = state.read_timing_bytes as f64 / elapsed_secs;
                if observed < rate.bytes_per_second && !self.debugger.is_attached() {
                    state.read_timed_out = true;
                    fired.push(TimeoutReason::ReadDataRate);
                }
            }
        }

        // 一時停止は少なくとも 1 回のティックを経てから反映する
        state.apply_pending_pauses();
    }

    fn check_for_write_data_rate(&self, state: &mut TimeoutState, now: Instant, fired: &mut Vec<TimeoutReason>) {
        if state.write_timed_out {
            return;
        }
        let Some(deadline) = state.write_deadline() else {
            return;
        };
        if now > deadline && !self.debugger.is_attached() {
            state.write_timed_out = true;
            fired.push(TimeoutReason::WriteDataRate);
        }
    }

    // ====================
    // 固定タイムアウト
    // ====================

    /// タイムアウトを設定 (別のタイムアウトが設定されていないこと)
    pub fn set_timeout(&self, timeout: Duration, reason: TimeoutReason) {
        let mut state = self.lock();
        debug_assert!(
            state.timeout_deadline.is_none(),
            "Concurrent timeouts are not supported: {:?} is already set",
            state.timeout_reason
        );
        Self::assign_timeout(&mut state, timeout, reason);
    }

    /// 既存のタイムアウトを置き換える
    pub fn reset_timeout(&self, timeout: Duration, reason: TimeoutReason) {
        let mut state = self.lock();
        Self::assign_timeout(&mut state, timeout, reason);
    }

    fn assign_timeout(state: &mut TimeoutState, timeout: Duration, reason: TimeoutReason) {
        // 次のティック直前に呼ばれてもよいようハートビート 1 回分を加える
        state.timeout_deadline = Some(state.last_timestamp + timeout + HEARTBEAT_INTERVAL);
        state.timeout_reason = reason;
    }

    pub fn cancel_timeout(&self) {
        let mut state = self.lock();
        state.timeout_deadline = None;
        state.timeout_reason = TimeoutReason::None;
    }

    /// 現在設定されているタイムアウトの理由
    pub fn timer_reason(&self) -> TimeoutReason {
        self.lock().timeout_reason
    }

    // ====================
    // 読み込みレート
    // ====================

    /// リクエストボディの受信開始
    ///
    /// 最初のボディで計測値をリセットし、以降は同時に受信中のボディ全体で共有する。
    pub fn start_timing_reads(&self, rate: MinDataRate) {
        let mut state = self.lock();
        state.read_rate = Some(rate);
        state.concurrent_request_bodies += 1;
        if state.concurrent_request_bodies == 1 {
            state.read_timing_elapsed = Duration::ZERO;
            state.read_timing_bytes = 0;
            state.paused_request_bodies = 0;
            state.pending_pauses = 0;
        }
    }

    /// リクエストボディの受信終了 (一時停止中のボディは先に再開すること)
    pub fn stop_timing_reads(&self) {
        let mut state = self.lock();
        state.concurrent_request_bodies = state.concurrent_request_bodies.saturating_sub(1);
        if state.concurrent_request_bodies == 0 {
            state.paused_request_bodies = 0;
            state.pending_pauses = 0;
        }
    }

    /// ボディ 1 つ分の計測を一時停止 (次のティックで反映)
    ///
    /// 他のボディが受信中なら計測は続く。
    pub fn pause_timing_reads(&self) {
        let mut state = self.lock();
        if state.paused_request_bodies + state.pending_pauses < state.concurrent_request_bodies {
            state.pending_pauses += 1;
        }
    }

    /// ボディ 1 つ分の計測を再開。次のティックより前なら一時停止は記録されない
    pub fn resume_timing_reads(&self) {
        let mut state = self.lock();
        if state.pending_pauses > 0 {
            state.pending_pauses -= 1;
        } else {
            state.paused_request_bodies = state.paused_request_bodies.saturating_sub(1);
        }
    }

    pub fn bytes_read(&self, count: u64) {
        let mut state = self.lock();
        state.read_timing_bytes = state.read_timing_bytes.saturating_add(count);
    }

    // ====================
    // 書き込みレート
    // ====================

    /// `bytes` の書き込み開始
    ///
    /// 期限は `最後のティック + ハートビート + max(猶予期間, bytes / レート)`。
    pub fn start_timing_write(&self, rate: MinDataRate, bytes: u64) -> WriteTimingHandle {
        let mut state = self.lock();
        let deadline = state.last_timestamp + HEARTBEAT_INTERVAL + rate.write_allowance(bytes);
        let handle = WriteTimingHandle(state.next_write_id);
        state.next_write_id += 1;
        state.in_flight_writes.push((handle, deadline));
        handle
    }

    /// 書き込み完了。他の書き込みの期限には影響しない
    pub fn stop_timing_write(&self, handle: WriteTimingHandle) {
        let mut state = self.lock();
        state.in_flight_writes.retain(|(h, _)| *h != handle);
    }

    /// 書き込み中の件数
    pub fn in_flight_writes(&self) -> usize {
        self.lock().in_flight_writes.len()
    }
}

impl std::fmt::Debug for TimeoutControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutControl").field("state", &*self.lock()).finish()
    }
}
