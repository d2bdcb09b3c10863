//! # HTTP/2 コネクション管理 (RFC 7540)
//!
//! 1 本の読み込みループがフレームを順に解析してストリームに振り分け、
//! 各ストリームのアプリケーションは別の monoio タスクで動きます。
//!
//! ## 状態
//!
//! `Preface → SettingsExchanged → Active → (GOAWAY 送信 | GOAWAY 受信) → Closed`
//!
//! - 読み込みループ: プリフェース、HEADERS + CONTINUATION の連続性、フレームの検証
//! - [`ConnectionCore`]: ストリームタスク・タイムアウトハンドラと共有する状態
//! - コネクションエラーでは最後に処理したストリーム ID 付きの GOAWAY を送り、全ストリームを中断する
//! - ストリームエラーでは RST_STREAM を送り、コネクションは継続する

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use time::OffsetDateTime;

use super::error::{Http2Error, Http2ErrorCode, Http2Result};
use super::flow_control::InputFlowControl;
use super::frame::{Frame, FrameDecoder, PrioritySpec};
use super::hpack::{HpackDecoder, HpackError};
use super::settings::{defaults, Http2Settings, PeerSettings};
use super::stream::{validate_request_headers, validate_trailers, RequestHead, StreamManager};
use super::writer::{FrameWriter, Http2Output, Http2Sink};
use crate::config::ServerLimits;
use crate::http::{
    body_pipe, log_access, AbortReason, AbortToken, Application, BodyFlowControl, HttpContext, Request,
    RequestBody, ResponseSink, ResponseWriter,
};
use crate::timeout::{Debugger, Heartbeat, ProcessDebugger, TimeoutControl, TimeoutReason};
use crate::transport::{buf_put, read_or_abort, BoxWrite, ReadOutcome, TransportRead, TransportWrite};

/// RST_STREAM を送ったあと、遅れて届くフレームを無視するために覚えておくストリーム数
const MAX_RECENTLY_RESET: usize = 128;

// ====================
// 共有状態
// ====================

/// 読み込みループ以外からも触る可変状態
struct ConnectionState {
    streams: StreamManager,
    peer: PeerSettings,
    /// コネクションの受信ウィンドウ
    input: InputFlowControl,
    /// 実行中のストリームタスク数
    active: usize,
    /// ヘッダーブロックを受信中か
    header_block_open: bool,
    goaway_sent: bool,
    /// GOAWAY 送信後、ストリームの完了を待っている
    draining: bool,
    /// 全ストリームを中断済み
    aborted: bool,
    /// こちらからリセットしたストリーム
    recently_reset: VecDeque<u32>,
}

impl ConnectionState {
    fn remember_reset(&mut self, stream_id: u32) {
        if self.recently_reset.len() >= MAX_RECENTLY_RESET {
            self.recently_reset.pop_front();
        }
        self.recently_reset.push_back(stream_id);
    }

    fn was_reset(&self, stream_id: u32) -> bool {
        self.recently_reset.contains(&stream_id)
    }
}

/// 読み込みループ・ストリームタスク・タイムアウトハンドラが共有するコネクション
pub struct ConnectionCore {
    output: Rc<Http2Output>,
    control: Rc<TimeoutControl>,
    state: RefCell<ConnectionState>,
    /// コネクションを閉じるシグナル
    close: AbortToken,
    settings: Http2Settings,
    limits: ServerLimits,
}

impl ConnectionCore {
    fn new(out: BoxWrite, settings: Http2Settings, limits: ServerLimits, debugger: impl Debugger + 'static) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<ConnectionCore>| {
            let handler = weak.clone();
            let control = Rc::new(TimeoutControl::with_debugger(
                move |reason: TimeoutReason| {
                    if let Some(core) = handler.upgrade() {
                        core.on_timeout(reason);
                    }
                },
                debugger,
                Instant::now(),
            ));
            let close = AbortToken::new();
            let writer = FrameWriter::new(out, control.clone(), limits.min_response_data_rate, close.clone());

            Self {
                output: Rc::new(Http2Output::new(writer)),
                control,
                state: RefCell::new(ConnectionState {
                    streams: StreamManager::new(),
                    peer: PeerSettings::default(),
                    input: InputFlowControl::new(settings.connection_window_size),
                    active: 0,
                    header_block_open: false,
                    goaway_sent: false,
                    draining: false,
                    aborted: false,
                    recently_reset: VecDeque::new(),
                }),
                close,
                settings,
                limits,
            }
        })
    }

    fn on_timeout(self: &Rc<Self>, reason: TimeoutReason) {
        match reason {
            TimeoutReason::KeepAlive => {
                ftlog::debug!("[HTTP/2] Keep-alive timeout");
                self.stop_processing_next_request();
            }
            TimeoutReason::RequestHeaders | TimeoutReason::ReadDataRate => {
                ftlog::warn!("[HTTP/2] {}", reason);
                self.abort_connection(Http2ErrorCode::InternalError, AbortReason::Timeout(reason), true);
            }
            TimeoutReason::WriteDataRate => {
                ftlog::warn!("[HTTP/2] {}", reason);
                // 出力が詰まっているので GOAWAY は送らない
                self.abort_connection(Http2ErrorCode::InternalError, AbortReason::Timeout(reason), false);
            }
            _ => {}
        }
    }

    /// GOAWAY(NO_ERROR) を送り、実行中のストリームが終わったら閉じる
    pub fn stop_processing_next_request(self: &Rc<Self>) {
        {
            let mut state = self.state.borrow_mut();
            if state.goaway_sent || state.aborted || self.close.is_aborted() {
                return;
            }
            state.goaway_sent = true;
            state.draining = true;
        }
        if self.control.timer_reason() == TimeoutReason::KeepAlive {
            self.control.cancel_timeout();
        }

        let core = self.clone();
        monoio::spawn(async move {
            core.write_goaway(Http2ErrorCode::NoError).await;
            core.close_if_drained();
        });
    }

    /// 全ストリームを中断してコネクションを閉じる
    fn abort_connection(self: &Rc<Self>, code: Http2ErrorCode, reason: AbortReason, send_goaway: bool) {
        let streams = {
            let mut state = self.state.borrow_mut();
            if state.aborted {
                return;
            }
            state.aborted = true;
            state.streams.reset_all(reason.clone())
        };
        drop(streams);

        if send_goaway {
            let core = self.clone();
            monoio::spawn(async move {
                core.write_goaway(code).await;
                core.close.abort(reason);
            });
        } else {
            self.close.abort(reason);
        }
    }

    async fn write_goaway(&self, code: Http2ErrorCode) {
        let last_stream_id = {
            let mut state = self.state.borrow_mut();
            state.goaway_sent = true;
            state.streams.highest_stream_id()
        };
        ftlog::debug!("[HTTP/2] Sending GOAWAY last_stream_id={} error={}", last_stream_id, code);
        let mut writer = self.output.writer.lock().await;
        if let Err(e) = writer.write_goaway(last_stream_id, code).await {
            ftlog::debug!("[HTTP/2] Failed to send GOAWAY: {}", e);
        }
    }

    fn close_if_drained(&self) {
        let done = {
            let state = self.state.borrow();
            state.draining && state.active == 0
        };
        if done {
            self.close
                .abort(AbortReason::ConnectionAborted("The connection was shut down gracefully".to_string()));
        }
    }

    /// 実行中のストリームがなければ KeepAlive タイムアウトを設定
    fn update_keep_alive(&self) {
        let idle = {
            let state = self.state.borrow();
            state.active == 0 && !state.header_block_open && !state.draining && !state.aborted
        };
        if idle {
            self.control
                .reset_timeout(self.limits.keep_alive_timeout, TimeoutReason::KeepAlive);
        }
    }

    async fn write_window_updates(&self, connection: Option<u32>, stream: Option<(u32, u32)>) {
        if connection.is_none() && stream.is_none() {
            return;
        }
        let mut writer = self.output.writer.lock().await;
        if let Some(increment) = connection {
            let _ = writer.write_window_update(0, increment).await;
        }
        if let Some((stream_id, increment)) = stream {
            let _ = writer.write_window_update(stream_id, increment).await;
        }
    }

    /// アプリケーションに届かなかったバイトをコネクションウィンドウに返す
    async fn credit_connection(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let increment = self.state.borrow_mut().input.on_consumed(bytes as u32);
        self.write_window_updates(increment, None).await;
    }

    /// アプリケーションがボディを読んだ
    async fn on_body_consumed(&self, stream_id: u32, bytes: usize) {
        let (connection, stream) = {
            let mut state = self.state.borrow_mut();
            let stream = state
                .streams
                .get_mut(stream_id)
                .filter(|s| s.state().is_receiving())
                .and_then(|s| s.input().on_consumed(bytes as u32))
                .map(|increment| (stream_id, increment));
            (state.input.on_consumed(bytes as u32), stream)
        };
        self.write_window_updates(connection, stream).await;
    }

    /// ストリームをリセットし RST_STREAM を送る
    async fn reset_stream(&self, stream_id: u32, code: Http2ErrorCode, reason: AbortReason) {
        let unread = {
            let mut state = self.state.borrow_mut();
            state.remember_reset(stream_id);
            match state.streams.remove(stream_id) {
                Some(mut stream) => {
                    let unread = stream.body().map(|b| b.buffered()).unwrap_or(0) + stream.take_discarded();
                    stream.reset(reason);
                    unread
                }
                None => 0,
            }
        };
        self.output.flow.borrow_mut().close_stream(stream_id);

        ftlog::debug!("[HTTP/2] Sending RST_STREAM stream={} error={}", stream_id, code);
        {
            let mut writer = self.output.writer.lock().await;
            if let Err(e) = writer.write_rst_stream(stream_id, code).await {
                ftlog::debug!("[HTTP/2] Failed to send RST_STREAM: {}", e);
            }
        }
        self.credit_connection(unread).await;
    }

    /// ストリームタスクの終了処理
    async fn complete_stream(&self, stream_id: u32, failure: Option<AbortReason>) {
        let (rst, discarded) = {
            let mut state = self.state.borrow_mut();
            state.active = state.active.saturating_sub(1);
            match state.streams.remove(stream_id) {
                Some(mut stream) => {
                    let discarded = stream.take_discarded();
                    let rst = match failure {
                        Some(reason) => {
                            let code = reason.error_code();
                            stream.reset(reason);
                            Some(code)
                        }
                        None => {
                            stream.send_end_stream();
                            if stream.state().is_receiving() {
                                // レスポンス完了後の残りボディは不要
                                stream.reset(AbortReason::Reset(Http2ErrorCode::NoError));
                                Some(Http2ErrorCode::NoError)
                            } else {
                                None
                            }
                        }
                    };
                    if rst.is_some() {
                        state.remember_reset(stream_id);
                    }
                    (rst, discarded)
                }
                None => (None, 0),
            }
        };
        self.output.flow.borrow_mut().close_stream(stream_id);

        if let Some(code) = rst {
            let mut writer = self.output.writer.lock().await;
            if let Err(e) = writer.write_rst_stream(stream_id, code).await {
                ftlog::debug!("[HTTP/2] Failed to send RST_STREAM: {}", e);
            }
        }
        self.credit_connection(discarded).await;

        self.close_if_drained();
        self.update_keep_alive();
    }
}

/// ボディの読み出しを WINDOW_UPDATE に変換する
struct StreamBodyFlow {
    stream_id: u32,
    core: Weak<ConnectionCore>,
}

impl BodyFlowControl for StreamBodyFlow {
    fn on_consumed(&self, bytes: usize) -> LocalBoxFuture<'static, ()> {
        let core = self.core.clone();
        let stream_id = self.stream_id;
        async move {
            if let Some(core) = core.upgrade() {
                core.on_body_consumed(stream_id, bytes).await;
            }
        }
        .boxed_local()
    }
}

/// 1 ストリーム分のアプリケーション実行
async fn run_stream<A: Application>(
    core: Rc<ConnectionCore>,
    app: Rc<A>,
    stream_id: u32,
    request: Request,
    body: RequestBody,
    abort: AbortToken,
) {
    let start_time = OffsetDateTime::now_utc();
    let is_head = request.method == "HEAD";
    let sink = Http2Sink::new(stream_id, core.output.clone(), abort.clone());
    let response = ResponseWriter::new(ResponseSink::Http2(sink), abort.clone(), is_head);
    let mut ctx = HttpContext::new(request, body, response, abort);

    let result = app.handle(&mut ctx).await;
    let outcome = ctx.response.complete(result).await;
    let req_body_size = ctx.body.received();
    let request = ctx.into_request();

    let failure = match outcome {
        Ok((status, resp_body_size)) => {
            log_access(&request, req_body_size, status, resp_body_size, start_time);
            None
        }
        Err(reason) => {
            ftlog::debug!("[HTTP/2] Stream {} aborted: {}", stream_id, reason);
            Some(reason)
        }
    };
    core.complete_stream(stream_id, failure).await;
}

// ====================
// 読み込みループ
// ====================

/// ヘッダーブロックの用途
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderBlockKind {
    /// 新しいリクエスト
    Request,
    /// 受信中のストリームのトレーラー
    Trailers,
    /// HPACK の状態を保つためにデコードだけする
    Ignored,
}

/// END_HEADERS 待ちのヘッダーブロック
struct PendingHeaders {
    stream_id: u32,
    end_stream: bool,
    kind: HeaderBlockKind,
    /// PRIORITY が自分自身に依存していた
    self_dependent: bool,
    fields: Vec<(Vec<u8>, Vec<u8>)>,
    continuations: u32,
}

/// 中断・タイムアウト制御用のハンドル
#[derive(Clone)]
pub struct Http2ConnectionHandle {
    core: Weak<ConnectionCore>,
}

impl Http2ConnectionHandle {
    /// 新しいストリームの受け付けを止め、実行中のストリームが終わったら閉じる
    pub fn stop_processing_next_request(&self) {
        if let Some(core) = self.core.upgrade() {
            core.stop_processing_next_request();
        }
    }

    /// 直ちにコネクションを閉じる
    pub fn abort(&self) {
        if let Some(core) = self.core.upgrade() {
            core.abort_connection(
                Http2ErrorCode::NoError,
                AbortReason::ConnectionAborted("The connection was aborted by the server".to_string()),
                false,
            );
        }
    }
}

/// HTTP/2 コネクション (サーバー側)
pub struct Http2Connection<R, A> {
    reader: R,
    app: Rc<A>,
    core: Rc<ConnectionCore>,
    /// 未処理の受信データ
    buf: Vec<u8>,
    decoder: FrameDecoder,
    hpack: HpackDecoder,
    header_block: Option<PendingHeaders>,
    /// RST_STREAM のレート計測 (窓の開始時刻, 件数)
    rst_window: (Instant, u32),
}

impl<R: TransportRead, A: Application> Http2Connection<R, A> {
    pub fn new<W: TransportWrite + 'static>(
        reader: R,
        writer: W,
        app: Rc<A>,
        settings: Http2Settings,
        limits: ServerLimits,
    ) -> Self {
        Self::with_debugger(reader, writer, app, settings, limits, ProcessDebugger)
    }

    pub fn with_debugger<W: TransportWrite + 'static>(
        reader: R,
        writer: W,
        app: Rc<A>,
        settings: Http2Settings,
        limits: ServerLimits,
        debugger: impl Debugger + 'static,
    ) -> Self {
        Self::with_buffered(reader, Box::new(writer), app, settings, limits, debugger, Vec::new())
    }

    /// プロトコル判定のために先読みしたデータを引き継いで作成
    pub(crate) fn with_buffered(
        reader: R,
        writer: BoxWrite,
        app: Rc<A>,
        settings: Http2Settings,
        limits: ServerLimits,
        debugger: impl Debugger + 'static,
        buffered: Vec<u8>,
    ) -> Self {
        let mut hpack = HpackDecoder::new(settings.header_table_size as usize, settings.max_request_header_field_size);
        hpack.set_max_header_list_size(settings.max_header_list_size as usize);
        let decoder = FrameDecoder::new(settings.max_frame_size);
        let core = ConnectionCore::new(writer, settings, limits, debugger);

        Self {
            reader,
            app,
            core,
            buf: buffered,
            decoder,
            hpack,
            header_block: None,
            rst_window: (Instant::now(), 0),
        }
    }

    /// このコネクションのタイムアウト制御
    pub fn timeout_control(&self) -> Rc<TimeoutControl> {
        self.core.control.clone()
    }

    /// ハートビートに登録
    pub fn register(&self, heartbeat: &Heartbeat) {
        heartbeat.register(&self.core.control);
    }

    pub fn handle(&self) -> Http2ConnectionHandle {
        Http2ConnectionHandle { core: Rc::downgrade(&self.core) }
    }

    /// GOAWAY(NO_ERROR) を送って新しいストリームの受け付けを止める
    pub fn stop_processing_next_request(&self) {
        self.core.stop_processing_next_request();
    }

    /// コネクションが閉じるまでフレームを処理する
    pub async fn run(mut self) {
        let result = self.serve().await;
        let core = self.core.clone();

        let reason = match result {
            Ok(()) => AbortReason::ConnectionAborted("The connection was closed".to_string()),
            Err(e) if e.should_goaway() => {
                ftlog::warn!("[HTTP/2] Connection error: {}", e);
                if !core.state.borrow().aborted {
                    core.write_goaway(e.error_code()).await;
                }
                AbortReason::ConnectionAborted(e.to_string())
            }
            Err(e) => {
                ftlog::debug!("[HTTP/2] Connection ended: {}", e);
                AbortReason::ConnectionAborted(e.to_string())
            }
        };

        let streams = {
            let mut state = core.state.borrow_mut();
            state.aborted = true;
            state.streams.reset_all(reason.clone())
        };
        drop(streams);
        core.control.cancel_timeout();
        core.output.writer.lock().await.shutdown().await;
        core.close.abort(reason);
        ftlog::debug!("[HTTP/2] Connection closed");
    }

    /// 追加のデータを読み込む。コネクションが終わったら `None`
    async fn fill_buf(&mut self) -> Http2Result<Option<()>> {
        match read_or_abort(&mut self.reader, &self.core.close).await {
            ReadOutcome::Data(data) => {
                self.buf.extend_from_slice(&data);
                buf_put(data);
                Ok(Some(()))
            }
            ReadOutcome::Eof => {
                let active = self.core.state.borrow().active;
                if active > 0 || !self.buf.is_empty() {
                    return Err(Http2Error::ConnectionClosed);
                }
                Ok(None)
            }
            ReadOutcome::Aborted => Ok(None),
            ReadOutcome::Error(e) => Err(e.into()),
        }
    }

    async fn serve(&mut self) -> Http2Result<()> {
        let core = self.core.clone();
        core.control
            .reset_timeout(core.limits.request_headers_timeout, TimeoutReason::RequestHeaders);

        // プリフェース
        let preface = defaults::CONNECTION_PREFACE;
        while self.buf.len() < preface.len() {
            if !self.buf.is_empty() && !preface.starts_with(&self.buf) {
                return Err(Http2Error::InvalidPreface);
            }
            if self.fill_buf().await?.is_none() {
                return Ok(());
            }
        }
        if &self.buf[..preface.len()] != preface {
            return Err(Http2Error::InvalidPreface);
        }
        self.buf.drain(..preface.len());

        self.send_server_settings().await?;

        // 最初のフレームは SETTINGS
        let first = loop {
            if let Some((frame, used)) = self.decoder.read_frame(&self.buf)? {
                self.buf.drain(..used);
                break frame;
            }
            if self.fill_buf().await?.is_none() {
                return Ok(());
            }
        };
        if !matches!(first, Frame::Settings { ack: false, .. }) {
            return Err(Http2Error::protocol_error(format!(
                "the first frame must be SETTINGS, got {}",
                first.name()
            )));
        }
        core.control.cancel_timeout();
        self.process_frame(first).await?;
        core.update_keep_alive();

        loop {
            let mut pos = 0;
            let processed = loop {
                match self.decoder.read_frame(&self.buf[pos..]) {
                    Ok(Some((frame, used))) => {
                        pos += used;
                        if let Err(e) = self.dispatch(frame).await {
                            break Err(e);
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(Http2Error::StreamError(stream_id, code, msg)) if self.header_block.is_none() => {
                        // フレーム自体は読み飛ばしてストリームだけリセット
                        let Some(header) = self.decoder.peek_header(&self.buf[pos..])? else {
                            break Ok(());
                        };
                        pos += super::frame::FrameHeader::SIZE + header.length as usize;
                        ftlog::debug!("[HTTP/2] Stream {} error: {}", stream_id, msg);
                        core.reset_stream(stream_id, code, AbortReason::Reset(code)).await;
                    }
                    Err(Http2Error::StreamError(_, _, msg)) => {
                        break Err(Http2Error::protocol_error(format!("frame inside a header block: {}", msg)));
                    }
                    Err(e) => break Err(e),
                }
            };
            self.buf.drain(..pos);
            processed?;

            if self.fill_buf().await?.is_none() {
                return Ok(());
            }
        }
    }

    async fn send_server_settings(&mut self) -> Http2Result<()> {
        let settings = &self.core.settings;
        let entries = settings.non_default_entries();
        let window_delta = settings.connection_window_size.saturating_sub(defaults::INITIAL_WINDOW_SIZE);

        let mut writer = self.core.output.writer.lock().await;
        writer.write_settings(&entries).await?;
        if window_delta > 0 {
            writer.write_window_update(0, window_delta).await?;
        }
        Ok(())
    }

    /// フレームを処理し、ストリームエラーなら RST_STREAM を送る
    async fn dispatch(&mut self, frame: Frame) -> Http2Result<()> {
        match self.process_frame(frame).await {
            Err(Http2Error::StreamError(stream_id, code, msg)) => {
                ftlog::debug!("[HTTP/2] Stream {} error: {}", stream_id, msg);
                self.core.reset_stream(stream_id, code, AbortReason::Reset(code)).await;
                Ok(())
            }
            other => other,
        }
    }

    async fn process_frame(&mut self, frame: Frame) -> Http2Result<()> {
        // ヘッダーブロックの途中には同じストリームの CONTINUATION しか来ない
        if let Some(pending) = &self.header_block {
            match &frame {
                Frame::Continuation { stream_id, .. } if *stream_id == pending.stream_id => {}
                other => {
                    return Err(Http2Error::protocol_error(format!(
                        "expected CONTINUATION for stream {}, got {} on stream {}",
                        pending.stream_id,
                        other.name(),
                        other.stream_id()
                    )));
                }
            }
        }

        match frame {
            Frame::Data { stream_id, end_stream, data, flow_controlled_length } => {
                self.on_data(stream_id, end_stream, data, flow_controlled_length).await
            }
            Frame::Headers { stream_id, end_stream, end_headers, priority, header_block } => {
                self.on_headers(stream_id, end_stream, end_headers, priority, header_block).await
            }
            Frame::Continuation { stream_id, end_headers, header_block } => {
                self.on_continuation(stream_id, end_headers, header_block).await
            }
            Frame::Priority { stream_id, priority } => {
                if priority.dependency == stream_id {
                    return Err(Http2Error::stream_error(
                        stream_id,
                        Http2ErrorCode::ProtocolError,
                        "stream depends on itself",
                    ));
                }
                Ok(())
            }
            Frame::RstStream { stream_id, error_code } => self.on_rst_stream(stream_id, error_code).await,
            Frame::Settings { ack, settings } => self.on_settings(ack, settings).await,
            Frame::Ping { ack, data } => {
                if !ack {
                    self.core.output.writer.lock().await.write_ping_ack(&data).await?;
                }
                Ok(())
            }
            Frame::GoAway { last_stream_id, error_code, .. } => {
                self.on_goaway(last_stream_id, error_code).await;
                Ok(())
            }
            Frame::WindowUpdate { stream_id, increment } => self.on_window_update(stream_id, increment),
            Frame::Unknown { frame_type, .. } => {
                ftlog::debug!("[HTTP/2] Ignoring unknown frame type 0x{:x}", frame_type);
                Ok(())
            }
        }
    }

    // ====================
    // DATA
    // ====================

    async fn on_data(&mut self, stream_id: u32, end_stream: bool, data: Vec<u8>, flow_len: u32) -> Http2Result<()> {
        let core = self.core.clone();
        let len = data.len() as u32;
        let padding = flow_len - len;

        let (connection_update, stream_update, result) = {
            let mut state = core.state.borrow_mut();
            if state.streams.is_idle(stream_id) {
                return Err(Http2Error::protocol_error(format!("DATA on idle stream {}", stream_id)));
            }
            if !state.input.on_data(flow_len) {
                return Err(Http2Error::flow_control_error("DATA exceeds the connection receive window"));
            }

            // パディングとアプリケーションに届かないバイトはすぐに返す
            let mut credit = padding;
            let mut stream_update = None;
            let was_reset = state.was_reset(stream_id);
            let result = match state.streams.get_mut(stream_id) {
                Some(stream) if stream.state().is_receiving() => {
                    if !stream.input().on_data(flow_len) {
                        return Err(Http2Error::flow_control_error(format!(
                            "DATA exceeds the receive window of stream {}",
                            stream_id
                        )));
                    }
                    stream_update = stream.input().on_consumed(padding).map(|inc| (stream_id, inc));
                    let result = stream.recv_data(data, end_stream);
                    if result.is_err() {
                        credit += len;
                    }
                    result
                }
                Some(_) => {
                    credit += len;
                    Err(Http2Error::stream_closed(stream_id))
                }
                None if was_reset => {
                    credit += len;
                    Ok(())
                }
                None => {
                    credit += len;
                    Err(Http2Error::stream_closed(stream_id))
                }
            };
            (state.input.on_consumed(credit), stream_update, result)
        };

        core.write_window_updates(connection_update, stream_update).await;
        result
    }

    // ====================
    // HEADERS / CONTINUATION
    // ====================

    async fn on_headers(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        end_headers: bool,
        priority: Option<PrioritySpec>,
        block: Vec<u8>,
    ) -> Http2Result<()> {
        let kind = {
            let state = self.core.state.borrow();
            match state.streams.get(stream_id) {
                Some(stream) if stream.state().is_receiving() => {
                    if !end_stream {
                        return Err(Http2Error::protocol_error(format!(
                            "trailers on stream {} without END_STREAM",
                            stream_id
                        )));
                    }
                    HeaderBlockKind::Trailers
                }
                Some(_) => {
                    return Err(Http2Error::connection_error(
                        Http2ErrorCode::StreamClosed,
                        format!("HEADERS on half-closed stream {}", stream_id),
                    ));
                }
                None if state.was_reset(stream_id) => HeaderBlockKind::Ignored,
                None if !state.streams.is_idle(stream_id) => {
                    return Err(Http2Error::connection_error(
                        Http2ErrorCode::StreamClosed,
                        format!("HEADERS on closed stream {}", stream_id),
                    ));
                }
                None if stream_id % 2 == 0 => {
                    return Err(Http2Error::protocol_error(format!(
                        "HEADERS on even-numbered stream {}",
                        stream_id
                    )));
                }
                None if state.goaway_sent => HeaderBlockKind::Ignored,
                None => HeaderBlockKind::Request,
            }
        };

        self.header_block = Some(PendingHeaders {
            stream_id,
            end_stream,
            kind,
            self_dependent: priority.is_some_and(|p| p.dependency == stream_id),
            fields: Vec::new(),
            continuations: 0,
        });

        if !end_headers {
            self.core.state.borrow_mut().header_block_open = true;
            self.core
                .control
                .reset_timeout(self.core.limits.request_headers_timeout, TimeoutReason::RequestHeaders);
        }
        self.decode_fragment(&block, end_headers)?;
        if end_headers {
            self.finish_header_block().await?;
        }
        Ok(())
    }

    async fn on_continuation(&mut self, stream_id: u32, end_headers: bool, block: Vec<u8>) -> Http2Result<()> {
        let Some(pending) = self.header_block.as_mut() else {
            return Err(Http2Error::protocol_error(format!(
                "CONTINUATION without HEADERS on stream {}",
                stream_id
            )));
        };
        pending.continuations += 1;
        if pending.continuations > self.core.settings.max_continuation_frames {
            return Err(Http2Error::connection_error(
                Http2ErrorCode::EnhanceYourCalm,
                format!("more than {} CONTINUATION frames", self.core.settings.max_continuation_frames),
            ));
        }
        self.decode_fragment(&block, end_headers)?;
        if end_headers {
            self.finish_header_block().await?;
        }
        Ok(())
    }

    fn decode_fragment(&mut self, fragment: &[u8], end_headers: bool) -> Http2Result<()> {
        let Some(pending) = self.header_block.as_mut() else {
            return Ok(());
        };
        match self.hpack.decode(fragment, end_headers, &mut pending.fields) {
            Ok(()) => Ok(()),
            Err(HpackError::HeaderListTooLarge(max)) => Err(Http2Error::protocol_error(format!(
                "request headers exceed {} bytes",
                max
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn finish_header_block(&mut self) -> Http2Result<()> {
        let Some(pending) = self.header_block.take() else {
            return Ok(());
        };
        let core = self.core.clone();
        core.state.borrow_mut().header_block_open = false;
        if core.control.timer_reason() == TimeoutReason::RequestHeaders {
            core.control.cancel_timeout();
        }

        let stream_id = pending.stream_id;
        let result = match pending.kind {
            HeaderBlockKind::Ignored => Ok(()),
            HeaderBlockKind::Trailers => {
                let trailers = validate_trailers(stream_id, pending.fields)?;
                let mut state = core.state.borrow_mut();
                match state.streams.get_mut(stream_id) {
                    Some(stream) => stream.recv_trailers(trailers),
                    None => Ok(()),
                }
            }
            HeaderBlockKind::Request => {
                if pending.self_dependent {
                    core.state.borrow_mut().streams.skip(stream_id);
                    Err(Http2Error::stream_error(
                        stream_id,
                        Http2ErrorCode::ProtocolError,
                        "stream depends on itself",
                    ))
                } else {
                    match validate_request_headers(stream_id, pending.fields) {
                        Ok(head) => self.start_stream(stream_id, head, pending.end_stream),
                        Err(e) => {
                            core.state.borrow_mut().streams.skip(stream_id);
                            Err(e)
                        }
                    }
                }
            }
        };

        core.update_keep_alive();
        result
    }

    /// リクエストヘッダーが揃ったストリームのアプリケーションを起動
    fn start_stream(&mut self, stream_id: u32, head: RequestHead, end_stream: bool) -> Http2Result<()> {
        let core = self.core.clone();
        let mut state = core.state.borrow_mut();

        if state.active >= core.settings.max_concurrent_streams as usize {
            state.streams.skip(stream_id);
            state.remember_reset(stream_id);
            ftlog::warn!("[HTTP/2] Refusing stream {}: too many concurrent streams", stream_id);
            return Err(Http2Error::stream_error(
                stream_id,
                Http2ErrorCode::RefusedStream,
                "max concurrent streams exceeded",
            ));
        }

        let peer_window = state.peer.initial_window_size;
        let stream = state.streams.accept(stream_id, core.settings.initial_window_size)?;
        let abort = stream.abort_token().clone();

        let (sender, body) = if end_stream {
            (None, RequestBody::empty(abort.clone()))
        } else {
            let (sender, body) = body_pipe(core.settings.initial_window_size as usize, abort.clone());
            if let Some(rate) = core.limits.min_request_body_data_rate {
                sender.start_timing(core.control.clone(), rate);
            }
            sender.set_flow_control(Rc::new(StreamBodyFlow { stream_id, core: Rc::downgrade(&core) }));
            (Some(sender), body)
        };
        stream.open(sender, head.content_length)?;

        state.active += 1;
        drop(state);

        core.output.flow.borrow_mut().open_stream(stream_id, peer_window);
        if core.control.timer_reason() == TimeoutReason::KeepAlive {
            core.control.cancel_timeout();
        }

        ftlog::debug!(
            "[HTTP/2] Stream {} opened: {} {}",
            stream_id,
            head.request.method,
            head.request.raw_target
        );
        monoio::spawn(run_stream(core, self.app.clone(), stream_id, head.request, body, abort));
        Ok(())
    }

    // ====================
    // 制御フレーム
    // ====================

    async fn on_rst_stream(&mut self, stream_id: u32, error_code: u32) -> Http2Result<()> {
        let now = Instant::now();
        if now.duration_since(self.rst_window.0) >= Duration::from_secs(1) {
            self.rst_window = (now, 0);
        }
        self.rst_window.1 += 1;
        if self.rst_window.1 > self.core.settings.max_rst_stream_per_second {
            return Err(Http2Error::connection_error(
                Http2ErrorCode::EnhanceYourCalm,
                "too many RST_STREAM frames",
            ));
        }

        let core = self.core.clone();
        let code = Http2ErrorCode::from_u32(error_code);
        let unread = {
            let mut state = core.state.borrow_mut();
            if state.streams.is_idle(stream_id) {
                return Err(Http2Error::protocol_error(format!("RST_STREAM on idle stream {}", stream_id)));
            }
            match state.streams.remove(stream_id) {
                Some(mut stream) => {
                    ftlog::debug!("[HTTP/2] Stream {} reset by client: {}", stream_id, code);
                    let unread = stream.body().map(|b| b.buffered()).unwrap_or(0) + stream.take_discarded();
                    stream.reset(AbortReason::Reset(code));
                    unread
                }
                None => 0,
            }
        };
        core.output.flow.borrow_mut().close_stream(stream_id);
        core.credit_connection(unread).await;
        Ok(())
    }

    async fn on_settings(&mut self, ack: bool, entries: Vec<(u16, u32)>) -> Http2Result<()> {
        if ack {
            return Ok(());
        }
        let core = self.core.clone();
        let (delta, max_frame_size) = {
            let mut state = core.state.borrow_mut();
            let delta = state.peer.apply(&entries)?;
            (delta, state.peer.max_frame_size)
        };
        core.output.flow.borrow_mut().apply_initial_window_delta(delta)?;
        if max_frame_size != core.output.max_frame_size.get() {
            core.output.set_max_frame_size(max_frame_size).await;
        }
        core.output.writer.lock().await.write_settings_ack().await?;
        Ok(())
    }

    async fn on_goaway(&mut self, last_stream_id: u32, error_code: u32) {
        let code = Http2ErrorCode::from_u32(error_code);
        ftlog::debug!("[HTTP/2] GOAWAY received last_stream_id={} error={}", last_stream_id, code);

        let core = self.core.clone();
        let (streams, send) = {
            let mut state = core.state.borrow_mut();
            state.draining = true;
            (state.streams.reset_all(AbortReason::GoAway), !state.goaway_sent)
        };
        for stream in &streams {
            core.output.flow.borrow_mut().close_stream(stream.id());
        }
        drop(streams);

        if send {
            core.write_goaway(Http2ErrorCode::NoError).await;
        }
        core.close_if_drained();
    }

    fn on_window_update(&mut self, stream_id: u32, increment: u32) -> Http2Result<()> {
        if stream_id == 0 {
            return self.core.output.flow.borrow_mut().update_connection(increment);
        }
        if self.core.state.borrow().streams.is_idle(stream_id) {
            return Err(Http2Error::protocol_error(format!("WINDOW_UPDATE on idle stream {}", stream_id)));
        }
        self.core.output.flow.borrow_mut().update_stream(stream_id, increment)
    }
}
