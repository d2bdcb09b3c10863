//! テスト用共通ヘルパーモジュール
//!
//! メモリ上の双方向ストリームで HTTP/2 のフレームを直接やり取りするクライアントと、
//! テスト用のアプリケーションを提供します。

#![allow(dead_code)]

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use zerocopy_h2::http::AbortReason;
use zerocopy_h2::http2::frame::{Frame, FrameDecoder, FrameEncoder, FrameHeader, FrameType};
use zerocopy_h2::http2::hpack::{HeaderField, HpackDecoder, HpackEncoder};
use zerocopy_h2::http2::settings::defaults::CONNECTION_PREFACE;
use zerocopy_h2::transport::{MemoryReader, MemoryStream, MemoryWriter, TransportRead, TransportWrite};
use zerocopy_h2::{AppError, Application, HttpContext};

/// フレームを待つ最大時間
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// タイマー付きの monoio ランタイムで実行
pub fn run<F: Future>(f: F) -> F::Output {
    monoio::RuntimeBuilder::<monoio::LegacyDriver>::new()
        .enable_timer()
        .build()
        .unwrap()
        .block_on(f)
}

// ====================
// テスト用アプリケーション
// ====================

/// GET には "hello"、それ以外にはボディをそのまま返す
pub struct EchoApp;

impl Application for EchoApp {
    async fn handle(&self, ctx: &mut HttpContext) -> Result<(), AppError> {
        if ctx.request.method == "GET" {
            ctx.response.set_content_length(5)?;
            ctx.response.write(b"hello").await?;
            return Ok(());
        }
        let body = ctx.body.read_to_end().await?;
        ctx.response.set_content_length(body.len() as u64)?;
        ctx.response.write(&body).await?;
        Ok(())
    }
}

/// 指定サイズのボディを返す
pub struct LargeApp(pub usize);

impl Application for LargeApp {
    async fn handle(&self, ctx: &mut HttpContext) -> Result<(), AppError> {
        let body = vec![b'x'; self.0];
        ctx.response.write(&body).await?;
        Ok(())
    }
}

/// 中断されるまで応答しない。受け取った中断理由を記録する
#[derive(Default, Clone)]
pub struct HangingApp {
    pub started: Rc<RefCell<Vec<String>>>,
    pub aborted: Rc<RefCell<Vec<AbortReason>>>,
}

impl Application for HangingApp {
    async fn handle(&self, ctx: &mut HttpContext) -> Result<(), AppError> {
        self.started.borrow_mut().push(ctx.request.path.clone());
        let reason = ctx.abort_token().aborted().await;
        self.aborted.borrow_mut().push(reason);
        Ok(())
    }
}

// ====================
// HTTP/2 クライアント
// ====================

/// 受信したレスポンス
#[derive(Debug, Default)]
pub struct H2Response {
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub trailers: Vec<(String, String)>,
    /// RST_STREAM で終わった場合のエラーコード
    pub reset: Option<u32>,
}

/// フレーム単位で操作する HTTP/2 クライアント
pub struct H2Client {
    reader: MemoryReader,
    writer: MemoryWriter,
    buf: Vec<u8>,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
    hpack: HpackEncoder,
    hpack_decoder: HpackDecoder,
}

impl H2Client {
    pub fn new(stream: MemoryStream) -> Self {
        let (reader, writer) = stream.split();
        Self {
            reader,
            writer,
            buf: Vec::new(),
            decoder: FrameDecoder::new((1 << 24) - 1),
            encoder: FrameEncoder::new(16_384),
            hpack: HpackEncoder::new(),
            hpack_decoder: HpackDecoder::default(),
        }
    }

    pub fn encoder(&self) -> &FrameEncoder {
        &self.encoder
    }

    pub async fn send(&mut self, bytes: Vec<u8>) {
        let (res, _) = self.writer.write_all(bytes).await;
        res.unwrap();
    }

    /// 書き込み方向を閉じる
    pub async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }

    /// プリフェースと SETTINGS を送り、サーバーの SETTINGS ACK まで読む
    ///
    /// サーバーの SETTINGS とコネクション WINDOW_UPDATE の増分を返す。
    pub async fn handshake(&mut self) -> (Vec<(u16, u32)>, u32) {
        self.handshake_with(&[]).await
    }

    pub async fn handshake_with(&mut self, settings: &[(u16, u32)]) -> (Vec<(u16, u32)>, u32) {
        let mut out = CONNECTION_PREFACE.to_vec();
        out.extend(self.encoder.encode_settings(settings, false));
        self.send(out).await;

        let mut server_settings = None;
        let mut window_update = 0;
        loop {
            match self.read_frame().await.expect("connection closed during handshake") {
                Frame::Settings { ack: false, settings } => {
                    server_settings = Some(settings);
                    let ack = self.encoder.encode_settings_ack();
                    self.send(ack).await;
                }
                Frame::Settings { ack: true, .. } => break,
                Frame::WindowUpdate { stream_id: 0, increment } => window_update += increment,
                other => panic!("unexpected frame during handshake: {:?}", other),
            }
        }
        (server_settings.expect("server SETTINGS"), window_update)
    }

    /// リクエストヘッダーを HPACK でエンコード
    pub fn header_block(&mut self, fields: &[(&str, &str)]) -> Vec<u8> {
        let fields: Vec<HeaderField> = fields.iter().map(|(n, v)| HeaderField::new(*n, *v)).collect();
        let mut buf = vec![0u8; 16_384];
        let (done, written) = self.hpack.begin_encode_trailers(fields, &mut buf).unwrap();
        assert!(done, "header block too large for a single frame");
        buf.truncate(written);
        buf
    }

    pub async fn send_headers(&mut self, stream_id: u32, fields: &[(&str, &str)], end_stream: bool) {
        let block = self.header_block(fields);
        let frame = self.encoder.encode_headers(stream_id, &block, end_stream, true, None);
        self.send(frame).await;
    }

    /// GET リクエストを送る
    pub async fn send_get(&mut self, stream_id: u32, path: &str) {
        self.send_headers(
            stream_id,
            &[(":method", "GET"), (":scheme", "http"), (":authority", "localhost"), (":path", path)],
            true,
        )
        .await;
    }

    pub async fn send_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) {
        let frame = self.encoder.encode_data(stream_id, data, end_stream);
        self.send(frame).await;
    }

    /// 次のフレームを読む。EOF なら `None`
    pub async fn read_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some((frame, used)) = self.decoder.read_frame(&self.buf).unwrap() {
                self.buf.drain(..used);
                return Some(frame);
            }
            let read = monoio::time::timeout(READ_TIMEOUT, self.reader.read(Vec::with_capacity(65_536)))
                .await
                .expect("timed out waiting for a frame");
            let (res, chunk) = read;
            if res.unwrap() == 0 {
                return None;
            }
            self.buf.extend_from_slice(&chunk);
        }
    }

    /// GOAWAY を受信するまで読み進める。(last_stream_id, error_code)
    pub async fn expect_goaway(&mut self) -> (u32, u32) {
        loop {
            match self.read_frame().await {
                Some(Frame::GoAway { last_stream_id, error_code, .. }) => return (last_stream_id, error_code),
                Some(_) => continue,
                None => panic!("connection closed without GOAWAY"),
            }
        }
    }

    /// RST_STREAM を受信するまで読み進めてエラーコードを返す
    pub async fn expect_rst(&mut self, stream_id: u32) -> u32 {
        loop {
            match self.read_frame().await {
                Some(Frame::RstStream { stream_id: id, error_code }) if id == stream_id => return error_code,
                Some(Frame::GoAway { error_code, .. }) => panic!("unexpected GOAWAY (error {})", error_code),
                Some(_) => continue,
                None => panic!("connection closed without RST_STREAM"),
            }
        }
    }

    /// 接続が閉じられるまで読み捨てる
    pub async fn expect_eof(&mut self) {
        while self.read_frame().await.is_some() {}
    }

    /// ストリームが終わるまでレスポンスを読む
    ///
    /// 受信した DATA はすぐに WINDOW_UPDATE で返す。
    pub async fn read_response(&mut self, stream_id: u32) -> H2Response {
        let mut response = H2Response::default();
        let mut block = Vec::new();
        loop {
            let frame = self.read_frame().await.expect("connection closed before the response ended");
            match frame {
                Frame::Headers { stream_id: id, end_stream, end_headers, header_block, .. } if id == stream_id => {
                    block = header_block;
                    if end_headers {
                        self.finish_headers(&mut response, &block);
                    } else {
                        continue;
                    }
                    if end_stream {
                        return response;
                    }
                }
                Frame::Continuation { stream_id: id, end_headers, header_block } if id == stream_id => {
                    block.extend_from_slice(&header_block);
                    if end_headers {
                        self.finish_headers(&mut response, &block);
                    }
                }
                Frame::Data { stream_id: id, end_stream, data, flow_controlled_length } if id == stream_id => {
                    response.body.extend_from_slice(&data);
                    if flow_controlled_length > 0 {
                        let mut updates = self.encoder.encode_window_update(0, flow_controlled_length);
                        if !end_stream {
                            updates.extend(self.encoder.encode_window_update(stream_id, flow_controlled_length));
                        }
                        self.send(updates).await;
                    }
                    if end_stream {
                        return response;
                    }
                }
                Frame::RstStream { stream_id: id, error_code } if id == stream_id => {
                    response.reset = Some(error_code);
                    return response;
                }
                Frame::GoAway { error_code, .. } => panic!("unexpected GOAWAY (error {})", error_code),
                _ => {}
            }
        }
    }

    fn finish_headers(&mut self, response: &mut H2Response, block: &[u8]) {
        let mut fields: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        self.hpack_decoder.decode(block, true, &mut fields).unwrap();
        let fields: Vec<(String, String)> = fields
            .into_iter()
            .map(|(n, v)| (String::from_utf8(n).unwrap(), String::from_utf8(v).unwrap()))
            .collect();

        if response.status.is_none() {
            for (name, value) in fields {
                if name == ":status" {
                    response.status = Some(value.parse().unwrap());
                } else {
                    response.headers.push((name, value));
                }
            }
        } else {
            response.trailers = fields;
        }
    }
}

/// 任意のフレームを組み立てる (不正なフレームの送信用)
pub fn raw_frame(frame_type: FrameType, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader::new(frame_type, flags, stream_id, payload.len() as u32);
    let mut buf = [0u8; FrameHeader::SIZE];
    header.encode(&mut buf);
    let mut out = buf.to_vec();
    out.extend_from_slice(payload);
    out
}

// ====================
// HTTP/1.1
// ====================

/// EOF まで読み込んで文字列にする
pub async fn read_to_eof(reader: &mut MemoryReader) -> String {
    let mut out = Vec::new();
    loop {
        let (res, buf) = monoio::time::timeout(READ_TIMEOUT, reader.read(Vec::with_capacity(4096)))
            .await
            .expect("timed out waiting for data");
        if res.unwrap() == 0 {
            break;
        }
        out.extend_from_slice(&buf);
    }
    String::from_utf8(out).unwrap()
}

/// `needle` を含むまで読み込む
pub async fn read_until(reader: &mut MemoryReader, needle: &str) -> String {
    let mut out = Vec::new();
    loop {
        let text = String::from_utf8_lossy(&out).to_string();
        if text.contains(needle) {
            return text;
        }
        let (res, buf) = monoio::time::timeout(READ_TIMEOUT, reader.read(Vec::with_capacity(4096)))
            .await
            .expect("timed out waiting for data");
        if res.unwrap() == 0 {
            return text;
        }
        out.extend_from_slice(&buf);
    }
}
