//! # レスポンス出力
//!
//! アプリケーションが書き込んだステータス・ヘッダー・ボディを
//! プロトコルごとの出力先 ([`ResponseSink`]) に流します。
//!
//! Content-Length が宣言されている場合、書き込んだバイト数が宣言と一致することを検証します。
//!
//! - 多すぎる書き込みはその場でエラー
//! - 完了時に不足していれば、ヘッダー送信前なら 500、送信後ならストリームを中断

use super::{AbortReason, AbortToken, AppError};
use crate::http1::Http1Sink;
use crate::http2::writer::Http2Sink;

/// プロトコルごとのレスポンス出力先
pub enum ResponseSink {
    Http1(Http1Sink),
    Http2(Http2Sink),
}

impl ResponseSink {
    async fn start(
        &mut self,
        status: u16,
        headers: &[(String, String)],
        content_length: Option<u64>,
        end_stream: bool,
    ) -> Result<(), AbortReason> {
        match self {
            Self::Http1(sink) => sink.start(status, headers, content_length, end_stream).await,
            Self::Http2(sink) => sink.start(status, headers, end_stream).await,
        }
    }

    async fn data(&mut self, data: &[u8]) -> Result<(), AbortReason> {
        match self {
            Self::Http1(sink) => sink.data(data).await,
            Self::Http2(sink) => sink.data(data, false).await,
        }
    }

    async fn end(&mut self, trailers: &[(String, String)]) -> Result<(), AbortReason> {
        match self {
            Self::Http1(sink) => sink.end(trailers).await,
            Self::Http2(sink) => sink.end(trailers).await,
        }
    }

    async fn flush(&mut self) -> Result<(), AbortReason> {
        match self {
            Self::Http1(sink) => sink.flush().await,
            Self::Http2(_) => Ok(()),
        }
    }
}

/// レスポンスの書き込み口
pub struct ResponseWriter {
    status: u16,
    headers: Vec<(String, String)>,
    trailers: Vec<(String, String)>,
    content_length: Option<u64>,
    bytes_written: u64,
    started: bool,
    ended: bool,
    is_head: bool,
    sink: ResponseSink,
    abort: AbortToken,
}

impl ResponseWriter {
    pub fn new(sink: ResponseSink, abort: AbortToken, is_head: bool) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            trailers: Vec::new(),
            content_length: None,
            bytes_written: 0,
            started: false,
            ended: false,
            is_head,
            sink,
            abort,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) -> Result<(), AppError> {
        self.ensure_not_started()?;
        self.status = status;
        Ok(())
    }

    /// ヘッダーを追加。`content-length` は宣言値としても記録する
    pub fn append_header(&mut self, name: &str, value: &str) -> Result<(), AppError> {
        self.ensure_not_started()?;
        if name.eq_ignore_ascii_case("content-length") {
            let len = value
                .trim()
                .parse()
                .map_err(|_| AppError::msg(format!("Invalid Content-Length: '{}'", value)))?;
            self.set_content_length(len)?;
            return Ok(());
        }
        self.headers.push((name.to_ascii_lowercase(), value.to_string()));
        Ok(())
    }

    pub fn set_content_length(&mut self, len: u64) -> Result<(), AppError> {
        self.ensure_not_started()?;
        self.headers.retain(|(n, _)| n != "content-length");
        self.headers.push(("content-length".to_string(), len.to_string()));
        self.content_length = Some(len);
        Ok(())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// トレーラーを追加 (ボディの後に送られる)
    pub fn append_trailer(&mut self, name: &str, value: &str) {
        self.trailers.push((name.to_ascii_lowercase(), value.to_string()));
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn has_started(&self) -> bool {
        self.started
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn sink(&self) -> &ResponseSink {
        &self.sink
    }

    fn ensure_not_started(&self) -> Result<(), AppError> {
        if self.started {
            return Err(AppError::msg("Headers are read-only, response has already started."));
        }
        Ok(())
    }

    fn check_abort(&self) -> Result<(), AbortReason> {
        match self.abort.reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    async fn start(&mut self, end_stream: bool) -> Result<(), AbortReason> {
        self.check_abort()?;
        let end_stream = end_stream || (self.is_head && self.trailers.is_empty());
        self.started = true;
        let headers = std::mem::take(&mut self.headers);
        let result = self.sink.start(self.status, &headers, self.content_length, end_stream).await;
        self.headers = headers;
        if end_stream {
            self.ended = true;
        }
        result
    }

    /// ボディを書き込む。未送信ならヘッダーも送る
    pub async fn write(&mut self, data: &[u8]) -> Result<(), AppError> {
        if self.ended {
            if self.is_head {
                return Ok(());
            }
            return Err(AppError::msg("The response has already completed."));
        }
        if let Some(expected) = self.content_length {
            let total = self.bytes_written + data.len() as u64;
            if total > expected && !self.is_head {
                return Err(AppError::msg(format!(
                    "Response Content-Length mismatch: too many bytes written ({} of {}).",
                    total, expected
                )));
            }
        }
        if self.is_head {
            // HEAD ではボディを送らないので、ヘッダーだけで完了させる
            if !self.started {
                self.start(true).await?;
            }
            return Ok(());
        }
        if !self.started {
            self.start(false).await?;
        }
        if data.is_empty() {
            return Ok(());
        }
        self.check_abort()?;
        self.sink.data(data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// ヘッダーを送信し、出力をフラッシュする
    pub async fn flush(&mut self) -> Result<(), AppError> {
        if !self.started {
            self.start(false).await?;
        }
        self.sink.flush().await?;
        Ok(())
    }

    /// アプリケーション終了後にレスポンスを完了させる
    ///
    /// 成功時は `(ステータス, ボディのバイト数)` を返す。
    pub async fn complete(&mut self, result: Result<(), AppError>) -> Result<(u16, u64), AbortReason> {
        self.check_abort()?;

        if let Err(e) = result {
            ftlog::error!("Unhandled application error: {}", e);
            if self.ended {
                return Ok((self.status, self.bytes_written));
            }
            if self.started {
                self.abort.abort(AbortReason::Application);
                return Err(AbortReason::Application);
            }
            self.reset_to_error();
            self.start(true).await?;
            return Ok((self.status, 0));
        }

        if self.ended {
            return Ok((self.status, self.bytes_written));
        }

        if let Some(expected) = self.content_length {
            if self.bytes_written < expected && !self.is_head {
                let msg = format!(
                    "Response Content-Length mismatch: too few bytes written ({} of {}).",
                    self.bytes_written, expected
                );
                ftlog::error!("{}", msg);
                if self.started {
                    self.abort.abort(AbortReason::Application);
                    return Err(AbortReason::Application);
                }
                self.reset_to_error();
                self.start(true).await?;
                return Ok((self.status, 0));
            }
        }

        if !self.started {
            let end_stream = self.trailers.is_empty();
            self.start(end_stream).await?;
            if end_stream {
                return Ok((self.status, 0));
            }
        }

        let trailers = std::mem::take(&mut self.trailers);
        self.sink.end(&trailers).await?;
        self.ended = true;
        Ok((self.status, self.bytes_written))
    }

    fn reset_to_error(&mut self) {
        self.status = 500;
        self.headers.clear();
        self.trailers.clear();
        self.headers.push(("content-length".to_string(), "0".to_string()));
        self.content_length = Some(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpVersion;
    use crate::timeout::{FixedDebugger, TimeoutControl, TimeoutReason};
    use crate::transport::{duplex, BoxWrite, MemoryReader, TransportRead};
    use futures::lock::Mutex;
    use std::rc::Rc;
    use std::time::Instant;

    fn run<F: std::future::Future>(f: F) -> F::Output {
        monoio::RuntimeBuilder::<monoio::LegacyDriver>::new()
            .enable_timer()
            .build()
            .unwrap()
            .block_on(f)
    }

    fn writer(is_head: bool) -> (ResponseWriter, MemoryReader, AbortToken) {
        let (a, b) = duplex();
        let (_a_r, a_w) = a.split();
        let (b_r, _b_w) = b.split();
        let out: BoxWrite = Box::new(a_w);
        let control = Rc::new(TimeoutControl::with_debugger(
            |_: TimeoutReason| {},
            FixedDebugger(false),
            Instant::now(),
        ));
        let sink = Http1Sink::new(Rc::new(Mutex::new(out)), control, None, HttpVersion::Http11, true);
        let abort = AbortToken::new();
        (ResponseWriter::new(ResponseSink::Http1(sink), abort.clone(), is_head), b_r, abort)
    }

    async fn read_all(reader: &mut MemoryReader, writer: ResponseWriter) -> String {
        drop(writer);
        let mut out = Vec::new();
        loop {
            let (res, buf) = reader.read(Vec::with_capacity(4096)).await;
            if res.unwrap() == 0 {
                break;
            }
            out.extend_from_slice(&buf);
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_fixed_length_response() {
        run(async {
            let (mut w, mut r, _) = writer(false);
            w.append_header("Content-Length", "5").unwrap();
            w.write(b"hello").await.unwrap();
            assert_eq!(w.complete(Ok(())).await, Ok((200, 5)));
            let out = read_all(&mut r, w).await;
            assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(out.contains("content-length: 5\r\n"));
            assert!(out.ends_with("\r\n\r\nhello"));
        });
    }

    #[test]
    fn test_too_many_bytes_written() {
        run(async {
            let (mut w, _r, _) = writer(false);
            w.set_content_length(3).unwrap();
            let err = w.write(b"hello").await.unwrap_err();
            assert_eq!(
                err.to_string(),
                "Response Content-Length mismatch: too many bytes written (5 of 3)."
            );
        });
    }

    #[test]
    fn test_too_few_bytes_after_start_aborts() {
        run(async {
            let (mut w, _r, abort) = writer(false);
            w.set_content_length(10).unwrap();
            w.write(b"hello").await.unwrap();
            assert_eq!(w.complete(Ok(())).await, Err(AbortReason::Application));
            assert_eq!(abort.reason(), Some(AbortReason::Application));
        });
    }

    #[test]
    fn test_too_few_bytes_before_start_is_500() {
        run(async {
            let (mut w, mut r, _) = writer(false);
            w.set_content_length(10).unwrap();
            assert_eq!(w.complete(Ok(())).await, Ok((500, 0)));
            let out = read_all(&mut r, w).await;
            assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
            assert!(out.contains("content-length: 0\r\n"));
        });
    }

    #[test]
    fn test_app_error_before_start_is_500() {
        run(async {
            let (mut w, mut r, _) = writer(false);
            w.append_header("x-custom", "1").unwrap();
            assert_eq!(w.complete(Err("boom".into())).await, Ok((500, 0)));
            let out = read_all(&mut r, w).await;
            assert!(out.starts_with("HTTP/1.1 500"));
            assert!(!out.contains("x-custom"));
        });
    }

    #[test]
    fn test_app_error_after_start_aborts() {
        run(async {
            let (mut w, _r, abort) = writer(false);
            w.write(b"partial").await.unwrap();
            assert_eq!(w.complete(Err("boom".into())).await, Err(AbortReason::Application));
            assert!(abort.is_aborted());
        });
    }

    #[test]
    fn test_chunked_when_length_unknown() {
        run(async {
            let (mut w, mut r, _) = writer(false);
            w.write(b"abc").await.unwrap();
            w.write(b"de").await.unwrap();
            assert!(w.append_header("x-late", "1").is_err());
            assert_eq!(w.complete(Ok(())).await, Ok((200, 5)));
            let out = read_all(&mut r, w).await;
            assert!(out.contains("transfer-encoding: chunked\r\n"));
            assert!(out.ends_with("\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n"));
        });
    }

    #[test]
    fn test_head_discards_body() {
        run(async {
            let (mut w, mut r, _) = writer(true);
            w.set_content_length(5).unwrap();
            w.write(b"hello").await.unwrap();
            assert_eq!(w.complete(Ok(())).await, Ok((200, 0)));
            let out = read_all(&mut r, w).await;
            assert!(out.ends_with("content-length: 5\r\n\r\n"));
        });
    }

    #[test]
    fn test_write_after_abort_fails() {
        run(async {
            let (mut w, _r, abort) = writer(false);
            abort.abort(AbortReason::Reset(crate::http2::Http2ErrorCode::Cancel));
            assert!(w.write(b"x").await.is_err());
            assert_eq!(
                w.complete(Ok(())).await,
                Err(AbortReason::Reset(crate::http2::Http2ErrorCode::Cancel))
            );
        });
    }
}
