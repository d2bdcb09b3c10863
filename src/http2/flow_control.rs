//! # フロー制御 (RFC 7540 Section 5.2, 6.9)
//!
//! - [`OutputFlowControl`]: クライアントが広告した送信ウィンドウ (コネクション + ストリーム)
//! - [`InputFlowControl`]: こちらが広告した受信ウィンドウと WINDOW_UPDATE の発行判断
//!
//! 送信ウィンドウは読み込みループ (WINDOW_UPDATE / SETTINGS) が増やし、
//! ストリームタスクの書き込みパスが [`acquire_window`] で消費します。
//! ウィンドウが足りない書き込みは増えるか中断されるまで待機します。

use std::cell::RefCell;
use std::collections::HashMap;

use futures::channel::oneshot;
use futures::future::{self, Either};

use super::error::{Http2Error, Http2ErrorCode, Http2Result};
use super::settings::defaults;
use crate::http::{AbortReason, AbortToken};

const MAX_WINDOW: i64 = defaults::MAX_WINDOW_SIZE as i64;

// ====================
// 送信側
// ====================

/// 送信ウィンドウ
#[derive(Debug)]
pub struct OutputFlowControl {
    connection: i64,
    streams: HashMap<u32, i64>,
    /// ウィンドウ待ちの書き込み
    waiters: Vec<oneshot::Sender<()>>,
}

impl Default for OutputFlowControl {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputFlowControl {
    pub fn new() -> Self {
        Self {
            connection: defaults::INITIAL_WINDOW_SIZE as i64,
            streams: HashMap::new(),
            waiters: Vec::new(),
        }
    }

    pub fn connection_window(&self) -> i64 {
        self.connection
    }

    pub fn stream_window(&self, stream_id: u32) -> Option<i64> {
        self.streams.get(&stream_id).copied()
    }

    /// ストリームの送信ウィンドウを作成 (クライアントの INITIAL_WINDOW_SIZE)
    pub fn open_stream(&mut self, stream_id: u32, initial: u32) {
        self.streams.insert(stream_id, initial as i64);
    }

    pub fn close_stream(&mut self, stream_id: u32) {
        if self.streams.remove(&stream_id).is_some() {
            // 待機中の書き込みに閉じたことを気付かせる
            self.wake_all();
        }
    }

    /// コネクションの WINDOW_UPDATE
    pub fn update_connection(&mut self, increment: u32) -> Http2Result<()> {
        let next = self.connection + increment as i64;
        if next > MAX_WINDOW {
            return Err(Http2Error::flow_control_error("connection window exceeds 2^31-1"));
        }
        self.connection = next;
        self.wake_all();
        Ok(())
    }

    /// ストリームの WINDOW_UPDATE。閉じたストリームへの更新は無視する
    pub fn update_stream(&mut self, stream_id: u32, increment: u32) -> Http2Result<()> {
        let Some(window) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        let next = *window + increment as i64;
        if next > MAX_WINDOW {
            return Err(Http2Error::stream_error(
                stream_id,
                Http2ErrorCode::FlowControlError,
                "stream window exceeds 2^31-1",
            ));
        }
        *window = next;
        self.wake_all();
        Ok(())
    }

    /// SETTINGS_INITIAL_WINDOW_SIZE の変化を全ストリームに反映
    ///
    /// ウィンドウは負になってもよいが、上限を超えたらコネクションエラー。
    pub fn apply_initial_window_delta(&mut self, delta: i64) -> Http2Result<()> {
        if delta == 0 {
            return Ok(());
        }
        for window in self.streams.values() {
            if *window + delta > MAX_WINDOW {
                return Err(Http2Error::flow_control_error(
                    "SETTINGS_INITIAL_WINDOW_SIZE change overflows a stream window",
                ));
            }
        }
        for window in self.streams.values_mut() {
            *window += delta;
        }
        if delta > 0 {
            self.wake_all();
        }
        Ok(())
    }

    /// 使えるだけのウィンドウを確保する
    ///
    /// ストリームが閉じていれば `None`。ウィンドウがなければ `Some(0)`。
    pub fn try_reserve(&mut self, stream_id: u32, want: usize) -> Option<usize> {
        let stream = *self.streams.get(&stream_id)?;
        let available = stream.min(self.connection).max(0);
        let n = (want as i64).min(available);
        if n > 0 {
            self.connection -= n;
            if let Some(window) = self.streams.get_mut(&stream_id) {
                *window -= n;
            }
        }
        Some(n as usize)
    }

    fn wait(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        rx
    }

    fn wake_all(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

/// `want` バイトまでの送信ウィンドウを待って確保する
///
/// 1 以上のバイト数を返す。ストリームが中断・クローズされたらその理由でエラー。
pub async fn acquire_window(
    flow: &RefCell<OutputFlowControl>,
    stream_id: u32,
    want: usize,
    abort: &AbortToken,
) -> Result<usize, AbortReason> {
    loop {
        if let Some(reason) = abort.reason() {
            return Err(reason);
        }
        let rx = {
            let mut flow = flow.borrow_mut();
            match flow.try_reserve(stream_id, want) {
                None => return Err(AbortReason::Reset(Http2ErrorCode::StreamClosed)),
                Some(n) if n > 0 => return Ok(n),
                Some(_) => flow.wait(),
            }
        };

        let aborted = abort.aborted();
        futures::pin_mut!(aborted);
        if let Either::Right((reason, _)) = future::select(rx, aborted).await {
            return Err(reason);
        }
    }
}

// ====================
// 受信側
// ====================

/// 受信ウィンドウ
///
/// アプリケーションが読み出した (または捨てた) バイト数が広告済みウィンドウの
/// 半分に達したところでまとめて WINDOW_UPDATE を返す。
#[derive(Debug, Clone)]
pub struct InputFlowControl {
    /// クライアントがまだ送ってよいバイト数
    window: i64,
    /// 広告するウィンドウサイズ
    target: u32,
    /// 消費済みで未返却のバイト数
    unacked: u32,
}

impl InputFlowControl {
    pub fn new(target: u32) -> Self {
        Self { window: target as i64, target, unacked: 0 }
    }

    pub fn window(&self) -> i64 {
        self.window
    }

    /// DATA フレームを受信。ウィンドウを超えていれば `false`
    pub fn on_data(&mut self, len: u32) -> bool {
        if len as i64 > self.window {
            return false;
        }
        self.window -= len as i64;
        true
    }

    /// `n` バイトが消費された。WINDOW_UPDATE を送るべきなら増分を返す
    pub fn on_consumed(&mut self, n: u32) -> Option<u32> {
        if n == 0 {
            return None;
        }
        self.unacked = self.unacked.saturating_add(n);
        if self.unacked < self.target / 2 {
            return None;
        }
        let increment = self.unacked;
        self.unacked = 0;
        self.window += increment as i64;
        Some(increment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run<F: std::future::Future>(f: F) -> F::Output {
        monoio::RuntimeBuilder::<monoio::LegacyDriver>::new()
            .enable_timer()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn test_reserve_limited_by_both_windows() {
        let mut flow = OutputFlowControl::new();
        flow.open_stream(1, 100);
        assert_eq!(flow.try_reserve(1, 150), Some(100));
        assert_eq!(flow.stream_window(1), Some(0));
        assert_eq!(flow.connection_window(), 65_435);
        assert_eq!(flow.try_reserve(1, 10), Some(0));
        assert_eq!(flow.try_reserve(3, 10), None);
    }

    #[test]
    fn test_window_update_overflow() {
        let mut flow = OutputFlowControl::new();
        flow.open_stream(1, defaults::MAX_WINDOW_SIZE);
        let err = flow.update_stream(1, 1).unwrap_err();
        assert_eq!(err.rst_stream_id(), Some(1));
        assert_eq!(err.error_code(), Http2ErrorCode::FlowControlError);

        let err = flow.update_connection(defaults::MAX_WINDOW_SIZE).unwrap_err();
        assert!(err.should_goaway());
        // 閉じたストリームへの更新は無視
        assert!(flow.update_stream(7, 10).is_ok());
    }

    #[test]
    fn test_initial_window_delta_may_go_negative() {
        let mut flow = OutputFlowControl::new();
        flow.open_stream(1, 65_535);
        assert_eq!(flow.try_reserve(1, 60_000), Some(60_000));
        flow.apply_initial_window_delta(-65_535 + 1_000).unwrap();
        assert_eq!(flow.stream_window(1), Some(5_535 - 64_535));
        assert_eq!(flow.try_reserve(1, 1), Some(0));
        flow.open_stream(3, 100);
        assert!(flow.apply_initial_window_delta(defaults::MAX_WINDOW_SIZE as i64).is_err());
    }

    #[test]
    fn test_acquire_waits_for_update() {
        run(async {
            let flow = std::rc::Rc::new(RefCell::new(OutputFlowControl::new()));
            flow.borrow_mut().open_stream(1, 0);
            let abort = AbortToken::new();

            let updater = flow.clone();
            monoio::spawn(async move {
                monoio::time::sleep(std::time::Duration::from_millis(5)).await;
                updater.borrow_mut().update_stream(1, 10).unwrap();
            });

            let n = acquire_window(&flow, 1, 100, &abort).await.unwrap();
            assert_eq!(n, 10);
        });
    }

    #[test]
    fn test_acquire_aborted_and_closed() {
        run(async {
            let flow = RefCell::new(OutputFlowControl::new());
            flow.borrow_mut().open_stream(1, 0);
            let abort = AbortToken::new();
            abort.abort(AbortReason::Reset(Http2ErrorCode::Cancel));
            assert_eq!(
                acquire_window(&flow, 1, 10, &abort).await,
                Err(AbortReason::Reset(Http2ErrorCode::Cancel))
            );

            let abort = AbortToken::new();
            assert_eq!(
                acquire_window(&flow, 3, 10, &abort).await,
                Err(AbortReason::Reset(Http2ErrorCode::StreamClosed))
            );
        });
    }

    #[test]
    fn test_input_window_updates_at_half() {
        let mut input = InputFlowControl::new(100);
        assert!(input.on_data(60));
        assert!(!input.on_data(41));
        assert_eq!(input.on_consumed(30), None);
        assert_eq!(input.on_consumed(20), Some(50));
        assert_eq!(input.window(), 90);
        assert!(input.on_data(90));
    }
}
