//! # リクエストボディパイプ
//!
//! プロトコル側 ([`BodySender`]) が受信したボディを書き込み、
//! アプリケーション側 ([`RequestBody`]) が読み出すシングルスレッドのパイプです。
//!
//! - 読み込みレートの計測 (`start_timing_reads` / `bytes_read`) はパイプが行う
//! - バッファが容量に達したら計測を一時停止し、読み出されて空きができたら再開する
//! - 読み出したバイト数は [`BodyFlowControl`] に通知される (HTTP/2 の WINDOW_UPDATE)
//! - 中断されると待機中の読み込みは中断理由でエラーになる

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use futures::channel::oneshot;
use futures::future::LocalBoxFuture;

use super::{AbortReason, AbortToken};
use crate::timeout::{MinDataRate, TimeoutControl};

/// 読み出されたボディのバイト数を受け取る
pub trait BodyFlowControl {
    fn on_consumed(&self, bytes: usize) -> LocalBoxFuture<'static, ()>;
}

struct BodyPipe {
    chunks: VecDeque<Vec<u8>>,
    buffered: usize,
    capacity: usize,
    received: u64,
    /// 読まれずに捨てられたバイト数 (未回収分)
    discarded: usize,
    end: bool,
    trailers: Vec<(String, String)>,
    /// データ到着待ちのリーダー
    read_waiter: Option<oneshot::Sender<()>>,
    /// 空き待ちのライター
    space_waiter: Option<oneshot::Sender<()>>,
    timing: Option<Rc<TimeoutControl>>,
    timing_paused: bool,
    flow_control: Option<Rc<dyn BodyFlowControl>>,
}

impl BodyPipe {
    fn wake_reader(&mut self) {
        if let Some(tx) = self.read_waiter.take() {
            let _ = tx.send(());
        }
    }

    fn wake_writer(&mut self) {
        if let Some(tx) = self.space_waiter.take() {
            let _ = tx.send(());
        }
    }

    fn stop_timing(&mut self) {
        if let Some(control) = self.timing.take() {
            if std::mem::take(&mut self.timing_paused) {
                control.resume_timing_reads();
            }
            control.stop_timing_reads();
        }
    }
}

/// パイプを作成
///
/// `capacity` を超えて書き込むこともできるが、その間は読み込みレートを計測しない。
pub fn body_pipe(capacity: usize, abort: AbortToken) -> (BodySender, RequestBody) {
    let pipe = Rc::new(RefCell::new(BodyPipe {
        chunks: VecDeque::new(),
        buffered: 0,
        capacity: capacity.max(1),
        received: 0,
        discarded: 0,
        end: false,
        trailers: Vec::new(),
        read_waiter: None,
        space_waiter: None,
        timing: None,
        timing_paused: false,
        flow_control: None,
    }));

    let weak: Weak<RefCell<BodyPipe>> = Rc::downgrade(&pipe);
    abort.on_abort(move |_| {
        if let Some(pipe) = weak.upgrade() {
            let mut pipe = pipe.borrow_mut();
            pipe.stop_timing();
            pipe.wake_reader();
            pipe.wake_writer();
        }
    });

    (
        BodySender { pipe: pipe.clone(), abort: abort.clone() },
        RequestBody { pipe, abort },
    )
}

// ====================
// プロトコル側
// ====================

/// ボディの書き込み側
pub struct BodySender {
    pipe: Rc<RefCell<BodyPipe>>,
    abort: AbortToken,
}

impl BodySender {
    /// 読み込みレートの計測を開始
    pub fn start_timing(&self, control: Rc<TimeoutControl>, rate: MinDataRate) {
        let mut pipe = self.pipe.borrow_mut();
        if pipe.end || self.abort.is_aborted() || pipe.timing.is_some() {
            return;
        }
        control.start_timing_reads(rate);
        pipe.timing = Some(control);
    }

    /// 読み出し量の通知先を設定
    pub fn set_flow_control(&self, flow_control: Rc<dyn BodyFlowControl>) {
        self.pipe.borrow_mut().flow_control = Some(flow_control);
    }

    /// 受信したデータを追加
    pub fn push(&self, data: Vec<u8>) {
        if data.is_empty() || self.abort.is_aborted() {
            return;
        }
        let reader_dropped = self.reader_dropped();
        let mut pipe = self.pipe.borrow_mut();
        if pipe.end {
            return;
        }
        let len = data.len();
        pipe.received += len as u64;
        if reader_dropped {
            // 読み手がいないので捨てる (残りボディの読み捨て)
            pipe.discarded += len;
            if let Some(control) = &pipe.timing {
                control.bytes_read(len as u64);
            }
            return;
        }
        pipe.buffered += len;
        pipe.chunks.push_back(data);

        if let Some(control) = &pipe.timing {
            control.bytes_read(len as u64);
            if pipe.buffered >= pipe.capacity && !pipe.timing_paused {
                control.pause_timing_reads();
                pipe.timing_paused = true;
            }
        }
        pipe.wake_reader();
    }

    /// ボディの終端 (トレーラー付き)
    pub fn finish(&self, trailers: Vec<(String, String)>) {
        let mut pipe = self.pipe.borrow_mut();
        if pipe.end {
            return;
        }
        pipe.end = true;
        pipe.trailers = trailers;
        pipe.stop_timing();
        pipe.wake_reader();
    }

    pub fn is_finished(&self) -> bool {
        self.pipe.borrow().end
    }

    /// これまでに受信したバイト数
    pub fn received(&self) -> u64 {
        self.pipe.borrow().received
    }

    pub fn buffered(&self) -> usize {
        self.pipe.borrow().buffered
    }

    pub fn is_full(&self) -> bool {
        let pipe = self.pipe.borrow();
        pipe.buffered >= pipe.capacity
    }

    /// 読まれずに捨てられたバイト数を取り出す
    pub fn take_discarded(&self) -> usize {
        std::mem::take(&mut self.pipe.borrow_mut().discarded)
    }

    /// アプリケーション側の [`RequestBody`] が破棄されたか
    pub fn reader_dropped(&self) -> bool {
        Rc::strong_count(&self.pipe) == 1
    }

    /// バッファに空きができるまで待つ (中断されても戻る)
    pub async fn wait_for_space(&self) {
        loop {
            let rx = {
                let mut pipe = self.pipe.borrow_mut();
                if pipe.buffered < pipe.capacity || self.abort.is_aborted() || Rc::strong_count(&self.pipe) == 1 {
                    return;
                }
                let (tx, rx) = oneshot::channel();
                pipe.space_waiter = Some(tx);
                rx
            };
            let _ = rx.await;
        }
    }

    pub fn abort_token(&self) -> &AbortToken {
        &self.abort
    }
}

impl Drop for BodySender {
    fn drop(&mut self) {
        let mut pipe = self.pipe.borrow_mut();
        pipe.stop_timing();
        if !pipe.end {
            pipe.wake_reader();
        }
    }
}

// ====================
// アプリケーション側
// ====================

/// リクエストボディ
pub struct RequestBody {
    pipe: Rc<RefCell<BodyPipe>>,
    abort: AbortToken,
}

impl RequestBody {
    /// ボディを持たないリクエスト用
    pub fn empty(abort: AbortToken) -> Self {
        let (sender, body) = body_pipe(1, abort);
        sender.finish(Vec::new());
        body
    }

    /// 次のチャンクを読む。終端なら `None`
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>, AbortReason> {
        loop {
            let rx = {
                let mut pipe = self.pipe.borrow_mut();
                if let Some(reason) = self.abort.reason() {
                    return Err(reason);
                }
                if let Some(chunk) = pipe.chunks.pop_front() {
                    pipe.buffered -= chunk.len();
                    if pipe.timing_paused && pipe.buffered < pipe.capacity {
                        pipe.timing_paused = false;
                        if let Some(control) = &pipe.timing {
                            control.resume_timing_reads();
                        }
                    }
                    pipe.wake_writer();
                    let flow_control = pipe.flow_control.clone();
                    drop(pipe);

                    if let Some(flow_control) = flow_control {
                        flow_control.on_consumed(chunk.len()).await;
                    }
                    return Ok(Some(chunk));
                }
                if pipe.end {
                    return Ok(None);
                }
                if Rc::strong_count(&self.pipe) == 1 {
                    // 書き込み側が終端を送らずに消えた
                    return Err(AbortReason::ConnectionAborted(
                        "The request body ended unexpectedly".to_string(),
                    ));
                }
                let (tx, rx) = oneshot::channel();
                pipe.read_waiter = Some(tx);
                rx
            };
            let _ = rx.await;
        }
    }

    /// 終端まで読んで連結する
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, AbortReason> {
        let mut body = Vec::new();
        while let Some(chunk) = self.read().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    /// 読み出して捨てる。読んだバイト数を返す
    pub async fn drain(&mut self) -> Result<u64, AbortReason> {
        let mut total = 0u64;
        while let Some(chunk) = self.read().await? {
            total += chunk.len() as u64;
        }
        Ok(total)
    }

    /// 終端まで受信済みか
    pub fn is_complete(&self) -> bool {
        let pipe = self.pipe.borrow();
        pipe.end && pipe.chunks.is_empty()
    }

    /// リクエストトレーラー (終端後に有効)
    pub fn trailers(&self) -> Vec<(String, String)> {
        self.pipe.borrow().trailers.clone()
    }

    /// これまでに受信したバイト数
    pub fn received(&self) -> u64 {
        self.pipe.borrow().received
    }
}

impl Drop for RequestBody {
    fn drop(&mut self) {
        let mut pipe = self.pipe.borrow_mut();
        pipe.chunks.clear();
        pipe.discarded += pipe.buffered;
        pipe.buffered = 0;
        if std::mem::take(&mut pipe.timing_paused) {
            if let Some(control) = &pipe.timing {
                control.resume_timing_reads();
            }
        }
        pipe.wake_writer();
    }
}
