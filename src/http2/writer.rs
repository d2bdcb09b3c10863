//! # HTTP/2 フレーム出力
//!
//! コネクション上の全フレームは [`FrameWriter`] を通して 1 フレーム (ヘッダーブロックなら
//! HEADERS + CONTINUATION 一式) ずつ書き込まれます。ロックを保持したまま
//! ブロック全体を書くので、他のストリームのフレームが割り込むことはありません。
//!
//! 書き込みは全て書き込みレートの計測対象になり、コネクションの終了シグナルと
//! 競合させます。途中で打ち切られた書き込みがあるとフレーム境界が壊れるため、
//! それ以降の書き込みは全て失敗させます。

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;

use futures::future::{self, Either};
use futures::lock::Mutex;

use super::error::{Http2Error, Http2ErrorCode, Http2Result};
use super::flow_control::{acquire_window, OutputFlowControl};
use super::frame::FrameEncoder;
use super::hpack::{HeaderField, HpackEncoder};
use super::settings::defaults;
use crate::http::{AbortReason, AbortToken};
use crate::timeout::{MinDataRate, TimeoutControl};
use crate::transport::{write_timed, BoxWrite};

/// HTTP/2 では送ってはいけないコネクション固有ヘッダー
const CONNECTION_SPECIFIC_HEADERS: &[&str] =
    &["connection", "keep-alive", "proxy-connection", "transfer-encoding", "upgrade"];

/// フレームの書き込み口
pub struct FrameWriter {
    out: BoxWrite,
    hpack: HpackEncoder,
    encoder: FrameEncoder,
    control: Rc<TimeoutControl>,
    rate: Option<MinDataRate>,
    close: AbortToken,
    closed: bool,
}

impl FrameWriter {
    pub fn new(out: BoxWrite, control: Rc<TimeoutControl>, rate: Option<MinDataRate>, close: AbortToken) -> Self {
        Self {
            out,
            hpack: HpackEncoder::new(),
            encoder: FrameEncoder::new(defaults::MAX_FRAME_SIZE),
            control,
            rate,
            close,
            closed: false,
        }
    }

    /// クライアントの SETTINGS_MAX_FRAME_SIZE
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.encoder.set_max_frame_size(size);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn write(&mut self, buf: Vec<u8>) -> io::Result<()> {
        if self.closed || self.close.is_aborted() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "HTTP/2 output is closed"));
        }
        let write = write_timed(&mut self.out, &self.control, self.rate, buf);
        let aborted = self.close.aborted();
        futures::pin_mut!(write, aborted);
        let result = match future::select(write, aborted).await {
            Either::Left((result, _)) => result,
            Either::Right(_) => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")),
        };
        if result.is_err() {
            self.closed = true;
        }
        result
    }

    pub async fn write_settings(&mut self, entries: &[(u16, u32)]) -> io::Result<()> {
        let buf = self.encoder.encode_settings(entries, false);
        self.write(buf).await
    }

    pub async fn write_settings_ack(&mut self) -> io::Result<()> {
        let buf = self.encoder.encode_settings_ack();
        self.write(buf).await
    }

    pub async fn write_ping_ack(&mut self, data: &[u8; 8]) -> io::Result<()> {
        let buf = self.encoder.encode_ping(data, true);
        self.write(buf).await
    }

    pub async fn write_window_update(&mut self, stream_id: u32, increment: u32) -> io::Result<()> {
        let buf = self.encoder.encode_window_update(stream_id, increment);
        self.write(buf).await
    }

    pub async fn write_rst_stream(&mut self, stream_id: u32, code: Http2ErrorCode) -> io::Result<()> {
        let buf = self.encoder.encode_rst_stream(stream_id, code.as_u32());
        self.write(buf).await
    }

    pub async fn write_goaway(&mut self, last_stream_id: u32, code: Http2ErrorCode) -> io::Result<()> {
        let buf = self.encoder.encode_goaway(last_stream_id, code.as_u32(), &[]);
        self.write(buf).await
    }

    /// ヘッダーブロック (HEADERS + 必要な数の CONTINUATION)
    ///
    /// `status` が `None` ならトレーラー。
    pub async fn write_headers(
        &mut self,
        stream_id: u32,
        status: Option<u16>,
        headers: Vec<HeaderField>,
        end_stream: bool,
    ) -> Http2Result<()> {
        let buf = self
            .encoder
            .encode_header_block(&mut self.hpack, stream_id, status, headers, end_stream)
            .map_err(|e| Http2Error::stream_error(stream_id, Http2ErrorCode::InternalError, e.to_string()))?;
        self.write(buf).await?;
        Ok(())
    }

    /// DATA フレーム (`data` は最大フレームサイズ以下)
    pub async fn write_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) -> io::Result<()> {
        let buf = self.encoder.encode_data(stream_id, data, end_stream);
        self.write(buf).await
    }

    pub async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.out.flush_boxed().await;
        let _ = self.out.shutdown_boxed().await;
    }
}

// ====================
// ストリームとの共有部分
// ====================

/// ストリームタスクと読み込みループが共有する送信側の状態
pub struct Http2Output {
    pub writer: Mutex<FrameWriter>,
    pub flow: RefCell<OutputFlowControl>,
    /// クライアントが受け付ける最大フレームサイズ
    pub max_frame_size: Cell<u32>,
}

impl Http2Output {
    pub fn new(writer: FrameWriter) -> Self {
        Self {
            writer: Mutex::new(writer),
            flow: RefCell::new(OutputFlowControl::new()),
            max_frame_size: Cell::new(defaults::MAX_FRAME_SIZE),
        }
    }

    /// クライアントの SETTINGS_MAX_FRAME_SIZE を反映
    pub async fn set_max_frame_size(&self, size: u32) {
        self.max_frame_size.set(size);
        self.writer.lock().await.set_max_frame_size(size);
    }
}

fn connection_aborted<E: std::fmt::Display>(e: E) -> AbortReason {
    AbortReason::ConnectionAborted(e.to_string())
}

/// HTTP/2 ストリームのレスポンス出力先
pub struct Http2Sink {
    stream_id: u32,
    output: Rc<Http2Output>,
    abort: AbortToken,
}

impl Http2Sink {
    pub fn new(stream_id: u32, output: Rc<Http2Output>, abort: AbortToken) -> Self {
        Self { stream_id, output, abort }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    fn check_abort(&self) -> Result<(), AbortReason> {
        match self.abort.reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// レスポンスヘッダーを送信
    pub async fn start(
        &mut self,
        status: u16,
        headers: &[(String, String)],
        end_stream: bool,
    ) -> Result<(), AbortReason> {
        let fields = headers
            .iter()
            .filter(|(name, _)| !CONNECTION_SPECIFIC_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)))
            .map(|(name, value)| HeaderField::new(name.to_ascii_lowercase().into_bytes(), value.as_bytes().to_vec()))
            .collect();

        let mut writer = self.output.writer.lock().await;
        self.check_abort()?;
        match writer.write_headers(self.stream_id, Some(status), fields, end_stream).await {
            Ok(()) => Ok(()),
            Err(Http2Error::StreamError(_, _, msg)) => {
                ftlog::error!("[HTTP/2] Stream {} response headers rejected: {}", self.stream_id, msg);
                self.abort.abort(AbortReason::Application);
                Err(AbortReason::Application)
            }
            Err(e) => Err(connection_aborted(e)),
        }
    }

    /// ボディを送信。送信ウィンドウが空いている分ずつ DATA フレームにする
    pub async fn data(&mut self, data: &[u8], end_stream: bool) -> Result<(), AbortReason> {
        if data.is_empty() {
            if end_stream {
                let mut writer = self.output.writer.lock().await;
                self.check_abort()?;
                writer.write_data(self.stream_id, &[], true).await.map_err(connection_aborted)?;
            }
            return Ok(());
        }

        let mut rest = data;
        while !rest.is_empty() {
            let want = rest.len().min(self.output.max_frame_size.get() as usize);
            let n = acquire_window(&self.output.flow, self.stream_id, want, &self.abort).await?;
            let (chunk, tail) = rest.split_at(n);
            let mut writer = self.output.writer.lock().await;
            self.check_abort()?;
            writer
                .write_data(self.stream_id, chunk, end_stream && tail.is_empty())
                .await
                .map_err(connection_aborted)?;
            rest = tail;
        }
        Ok(())
    }

    /// レスポンスを終える。トレーラーがあれば END_STREAM 付き HEADERS で送る
    pub async fn end(&mut self, trailers: &[(String, String)]) -> Result<(), AbortReason> {
        if trailers.is_empty() {
            return self.data(&[], true).await;
        }
        let fields = trailers
            .iter()
            .map(|(name, value)| HeaderField::new(name.to_ascii_lowercase().into_bytes(), value.as_bytes().to_vec()))
            .collect();
        let mut writer = self.output.writer.lock().await;
        self.check_abort()?;
        writer
            .write_headers(self.stream_id, None, fields, true)
            .await
            .map_err(connection_aborted)
    }
}
