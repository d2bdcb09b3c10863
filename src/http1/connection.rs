//! # HTTP/1.1 コネクション
//!
//! 1 コネクション上のリクエストを順番に処理する keep-alive ループです。
//!
//! - 次のリクエストの最初のバイトまでは KeepAlive タイムアウト
//! - ヘッダー部が揃うまでは RequestHeaders タイムアウト (発火時は 408)
//! - ボディの受信はアプリケーションと並行して行い、読み込みレートを計測する
//! - レスポンス後に残ったボディは RequestBodyDrain タイムアウトの間だけ読み捨てる

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Instant;

use futures::future::{self, Either};
use futures::lock::Mutex;
use httparse::Status;
use time::OffsetDateTime;

use super::chunked::ChunkedDecoder;
use super::sink::Http1Sink;
use super::{
    is_chunked_encoding, ERR_MSG_BAD_REQUEST, ERR_MSG_HEADERS_TOO_LARGE, ERR_MSG_NOT_IMPLEMENTED,
    ERR_MSG_PAYLOAD_TOO_LARGE, ERR_MSG_REQUEST_TIMEOUT, MSG_CONTINUE,
};
use crate::config::ServerLimits;
use crate::http::{
    body_pipe, log_access, parse_target, AbortReason, AbortToken, Application, BodySender, HttpContext,
    HttpVersion, Request, RequestBody, ResponseSink, ResponseWriter,
};
use crate::timeout::{Debugger, Heartbeat, ProcessDebugger, TimeoutControl, TimeoutReason};
use crate::transport::{buf_put, read_or_abort, write_timed, BoxWrite, ReadOutcome, TransportRead, TransportWrite};

/// 1 リクエストあたりのヘッダー数上限
const MAX_HEADERS: usize = 100;
/// ボディパイプの容量 (これを超えると読み込みを止める)
const BODY_PIPE_CAPACITY: usize = 64 * 1024;

/// タイムアウトハンドラとループが共有する状態
#[derive(Default)]
struct Http1Shared {
    /// コネクションを閉じるシグナル
    close: AbortToken,
    /// 処理中のリクエスト
    current: RefCell<Option<AbortToken>>,
    timed_out: Cell<Option<TimeoutReason>>,
}

impl Http1Shared {
    fn on_timeout(&self, reason: TimeoutReason) {
        if self.timed_out.get().is_some() {
            return;
        }
        match reason {
            TimeoutReason::KeepAlive => ftlog::debug!("[HTTP/1.1] Keep-alive timeout"),
            _ => ftlog::warn!("[HTTP/1.1] {}", reason),
        }
        self.timed_out.set(Some(reason));
        let current = self.current.borrow().clone();
        if let Some(request) = current {
            request.abort(AbortReason::Timeout(reason));
        }
        self.close.abort(AbortReason::Timeout(reason));
    }
}

/// 解析済みのリクエストヘッダー部
struct ParsedHead {
    method: String,
    target: String,
    version: HttpVersion,
    headers: Vec<(String, String)>,
}

enum HeadError {
    TooLarge,
    Malformed,
}

/// リクエストボディの長さの決め方
enum BodyKind {
    None,
    Length(u64),
    Chunked(ChunkedDecoder),
}

/// HTTP/1.1 コネクション
pub struct Http1Connection<R, A> {
    reader: R,
    writer: Rc<Mutex<BoxWrite>>,
    app: Rc<A>,
    limits: ServerLimits,
    control: Rc<TimeoutControl>,
    shared: Rc<Http1Shared>,
    /// 未処理の受信データ (パイプライン化された次のリクエストを含む)
    buf: Vec<u8>,
}

impl<R: TransportRead, A: Application> Http1Connection<R, A> {
    pub fn new<W: TransportWrite + 'static>(reader: R, writer: W, app: Rc<A>, limits: ServerLimits) -> Self {
        Self::with_debugger(reader, writer, app, limits, ProcessDebugger)
    }

    pub fn with_debugger<W: TransportWrite + 'static>(
        reader: R,
        writer: W,
        app: Rc<A>,
        limits: ServerLimits,
        debugger: impl Debugger + 'static,
    ) -> Self {
        Self::with_buffered(reader, Box::new(writer), app, limits, debugger, Vec::new())
    }

    /// プロトコル判定のために先読みしたデータを引き継いで作成
    pub(crate) fn with_buffered(
        reader: R,
        writer: BoxWrite,
        app: Rc<A>,
        limits: ServerLimits,
        debugger: impl Debugger + 'static,
        buffered: Vec<u8>,
    ) -> Self {
        let shared = Rc::new(Http1Shared::default());
        let weak: Weak<Http1Shared> = Rc::downgrade(&shared);
        let control = Rc::new(TimeoutControl::with_debugger(
            move |reason: TimeoutReason| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_timeout(reason);
                }
            },
            debugger,
            Instant::now(),
        ));

        Self {
            reader,
            writer: Rc::new(Mutex::new(writer)),
            app,
            limits,
            control,
            shared,
            buf: buffered,
        }
    }

    /// このコネクションのタイムアウト制御
    pub fn timeout_control(&self) -> Rc<TimeoutControl> {
        self.control.clone()
    }

    /// ハートビートに登録
    pub fn register(&self, heartbeat: &Heartbeat) {
        heartbeat.register(&self.control);
    }

    /// コネクションを閉じる (処理中のリクエストは中断される)
    pub fn close_handle(&self) -> AbortToken {
        self.shared.close.clone()
    }

    /// コネクションが閉じるまでリクエストを処理する
    pub async fn run(mut self) {
        while let Some(head) = self.read_head().await {
            if !self.process_request(head).await {
                break;
            }
        }

        self.control.cancel_timeout();
        let mut writer = self.writer.lock().await;
        let _ = writer.flush_boxed().await;
        let _ = writer.shutdown_boxed().await;
        ftlog::debug!("[HTTP/1.1] Connection closed");
    }

    async fn respond_error(&self, msg: &'static [u8]) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = write_timed(&mut *writer, &self.control, self.limits.min_response_data_rate, msg.to_vec()).await {
            ftlog::debug!("[HTTP/1.1] Failed to write error response: {}", e);
        }
    }

    // ====================
    // ヘッダー部の受信
    // ====================

    async fn read_head(&mut self) -> Option<ParsedHead> {
        if self.buf.is_empty() {
            self.control.reset_timeout(self.limits.keep_alive_timeout, TimeoutReason::KeepAlive);
        } else {
            self.control.reset_timeout(self.limits.request_headers_timeout, TimeoutReason::RequestHeaders);
        }

        loop {
            if !self.buf.is_empty() {
                match parse_head(&self.buf, self.limits.max_request_header_bytes) {
                    Ok(Some((head, len))) => {
                        self.buf.drain(..len);
                        self.control.cancel_timeout();
                        return Some(head);
                    }
                    Ok(None) => {}
                    Err(HeadError::TooLarge) => {
                        ftlog::warn!("[HTTP/1.1] Request headers too large");
                        self.control.cancel_timeout();
                        self.respond_error(ERR_MSG_HEADERS_TOO_LARGE).await;
                        return None;
                    }
                    Err(HeadError::Malformed) => {
                        ftlog::warn!("[HTTP/1.1] Malformed request headers");
                        self.control.cancel_timeout();
                        self.respond_error(ERR_MSG_BAD_REQUEST).await;
                        return None;
                    }
                }
            }

            match read_or_abort(&mut self.reader, &self.shared.close).await {
                ReadOutcome::Data(data) => {
                    if self.buf.is_empty() && self.control.timer_reason() == TimeoutReason::KeepAlive {
                        self.control
                            .reset_timeout(self.limits.request_headers_timeout, TimeoutReason::RequestHeaders);
                    }
                    self.buf.extend_from_slice(&data);
                    buf_put(data);
                }
                ReadOutcome::Eof => {
                    if !self.buf.is_empty() {
                        ftlog::debug!("[HTTP/1.1] Connection closed with an incomplete request");
                    }
                    return None;
                }
                ReadOutcome::Aborted => {
                    if self.shared.timed_out.get() == Some(TimeoutReason::RequestHeaders) {
                        self.respond_error(ERR_MSG_REQUEST_TIMEOUT).await;
                    }
                    return None;
                }
                ReadOutcome::Error(e) => {
                    ftlog::debug!("[HTTP/1.1] Read error: {}", e);
                    return None;
                }
            }
        }
    }

    // ====================
    // リクエスト処理
    // ====================

    /// 1 リクエストを処理する。keep-alive を続けるなら `true`
    async fn process_request(&mut self, head: ParsedHead) -> bool {
        let ParsedHead { method, target, version, headers } = head;

        let target = match parse_target(&method, &target) {
            Ok(target) => target,
            Err(e) => {
                ftlog::warn!("[HTTP/1.1] {}", e);
                self.respond_error(ERR_MSG_BAD_REQUEST).await;
                return false;
            }
        };

        let mut hosts = headers.iter().filter(|(n, _)| n == "host");
        let authority = match (hosts.next(), hosts.next()) {
            (Some((_, host)), None) => host.clone(),
            (None, None) if version == HttpVersion::Http10 => String::new(),
            _ => {
                ftlog::warn!("[HTTP/1.1] Missing or duplicate Host header");
                self.respond_error(ERR_MSG_BAD_REQUEST).await;
                return false;
            }
        };

        let kind = match body_kind(&headers, version) {
            Ok(kind) => kind,
            Err(msg) => {
                ftlog::warn!("[HTTP/1.1] Bad request: {}", msg);
                let response = if msg == NOT_IMPLEMENTED { ERR_MSG_NOT_IMPLEMENTED } else { ERR_MSG_BAD_REQUEST };
                self.respond_error(response).await;
                return false;
            }
        };
        if let BodyKind::Length(len) = kind {
            if len > self.limits.max_request_body_size {
                ftlog::warn!("[HTTP/1.1] Request body too large: {}", len);
                self.respond_error(ERR_MSG_PAYLOAD_TOO_LARGE).await;
                return false;
            }
        }

        let wants_close = connection_has_token(&headers, "close");
        let keep_alive = match version {
            HttpVersion::Http10 => connection_has_token(&headers, "keep-alive") && !wants_close,
            _ => !wants_close,
        };
        let expects_continue = headers
            .iter()
            .any(|(n, v)| n == "expect" && v.eq_ignore_ascii_case("100-continue"));

        let request = Request {
            method,
            scheme: "http".to_string(),
            authority,
            path: target.path,
            raw_target: target.raw_target,
            query_string: target.query_string,
            version,
            headers,
        };

        if expects_continue && !matches!(kind, BodyKind::None) {
            self.respond_error(MSG_CONTINUE).await;
        }

        let abort = AbortToken::new();
        *self.shared.current.borrow_mut() = Some(abort.clone());

        let (sender, body) = match kind {
            BodyKind::None => (None, RequestBody::empty(abort.clone())),
            _ => {
                let (sender, body) = body_pipe(BODY_PIPE_CAPACITY, abort.clone());
                if let Some(rate) = self.limits.min_request_body_data_rate {
                    sender.start_timing(self.control.clone(), rate);
                }
                (Some(sender), body)
            }
        };

        let sink = Http1Sink::new(
            self.writer.clone(),
            self.control.clone(),
            self.limits.min_response_data_rate,
            version,
            keep_alive,
        )
        .with_abort(abort.clone());
        let keep_alive_handle = sink.keep_alive_handle();
        let is_head = request.method == "HEAD";
        let response = ResponseWriter::new(ResponseSink::Http1(sink), abort.clone(), is_head);
        let ctx = HttpContext::new(request, body, response, abort.clone());
        let start_time = OffsetDateTime::now_utc();

        let (outcome, request, pump_result) = {
            let app = self.app.clone();
            let app_fut = async move {
                let mut ctx = ctx;
                let result = app.handle(&mut ctx).await;
                let outcome = ctx.response.complete(result).await;
                (outcome, ctx.into_request())
            };
            let pump_fut = pump_body(&mut self.reader, &mut self.buf, sender, kind, self.limits.max_request_body_size);
            futures::pin_mut!(app_fut, pump_fut);

            match future::select(app_fut, pump_fut).await {
                Either::Left(((outcome, request), pump_fut)) => {
                    // 読まれなかったボディを読み捨てる
                    self.control
                        .reset_timeout(self.limits.request_body_drain_timeout, TimeoutReason::RequestBodyDrain);
                    let pump_result = pump_fut.await;
                    if self.control.timer_reason() == TimeoutReason::RequestBodyDrain {
                        self.control.cancel_timeout();
                    }
                    (outcome, request, pump_result)
                }
                Either::Right((pump_result, app_fut)) => {
                    let (outcome, request) = app_fut.await;
                    (outcome, request, pump_result)
                }
            }
        };

        *self.shared.current.borrow_mut() = None;

        let req_body_size = pump_result.as_ref().copied().unwrap_or(0);
        match &outcome {
            Ok((status, resp_body_size)) => {
                log_access(&request, req_body_size, *status, *resp_body_size, start_time);
            }
            Err(reason) => {
                ftlog::debug!("[HTTP/1.1] Request aborted: {}", reason);
            }
        }

        if let Err(reason) = &pump_result {
            ftlog::debug!("[HTTP/1.1] Request body not completed: {}", reason);
        }

        outcome.is_ok()
            && pump_result.is_ok()
            && keep_alive_handle.get()
            && !abort.is_aborted()
            && !self.shared.close.is_aborted()
    }
}

// ====================
// ボディの受信
// ====================

/// 受信データをボディパイプに流す。戻り値は受信したボディのバイト数
async fn pump_body<R: TransportRead>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    sender: Option<BodySender>,
    mut kind: BodyKind,
    max_body_size: u64,
) -> Result<u64, AbortReason> {
    let sender = match sender {
        Some(sender) => sender,
        None => return Ok(0),
    };
    let abort = sender.abort_token().clone();

    let result = loop {
        if !buf.is_empty() {
            match &mut kind {
                BodyKind::None => break Ok(0),
                BodyKind::Length(remaining) => {
                    let n = (*remaining).min(buf.len() as u64) as usize;
                    sender.push(buf.drain(..n).collect());
                    *remaining -= n as u64;
                    if *remaining == 0 {
                        sender.finish(Vec::new());
                        break Ok(sender.received());
                    }
                }
                BodyKind::Chunked(decoder) => {
                    let mut out = Vec::new();
                    match decoder.decode(buf, &mut out) {
                        Ok(consumed) => {
                            buf.drain(..consumed);
                            sender.push(out);
                            if sender.received() > max_body_size {
                                break Err(AbortReason::ConnectionAborted(
                                    "Request body too large".to_string(),
                                ));
                            }
                            if decoder.is_complete() {
                                sender.finish(decoder.take_trailers());
                                break Ok(sender.received());
                            }
                        }
                        Err(e) => break Err(AbortReason::ConnectionAborted(e.to_string())),
                    }
                }
            }
        }

        if let Some(reason) = abort.reason() {
            break Err(reason);
        }
        if sender.is_full() {
            sender.wait_for_space().await;
            continue;
        }

        match read_or_abort(reader, &abort).await {
            ReadOutcome::Data(data) => {
                buf.extend_from_slice(&data);
                buf_put(data);
            }
            ReadOutcome::Eof => {
                break Err(AbortReason::ConnectionAborted(
                    "Unexpected end of request content".to_string(),
                ));
            }
            ReadOutcome::Aborted => {
                break Err(abort.reason().unwrap_or(AbortReason::Application));
            }
            ReadOutcome::Error(e) => break Err(AbortReason::ConnectionAborted(e.to_string())),
        }
    };

    if let Err(reason) = &result {
        abort.abort(reason.clone());
    }
    result
}

// ====================
// ヘッダー解析
// ====================

const NOT_IMPLEMENTED: &str = "unsupported transfer coding";

fn parse_head(buf: &[u8], max_header_bytes: usize) -> Result<Option<(ParsedHead, usize)>, HeadError> {
    let mut headers_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers_storage);

    let len = match req.parse(buf) {
        Ok(Status::Complete(len)) => len,
        Ok(Status::Partial) => {
            if buf.len() > max_header_bytes {
                return Err(HeadError::TooLarge);
            }
            return Ok(None);
        }
        Err(httparse::Error::TooManyHeaders) => return Err(HeadError::TooLarge),
        Err(_) => return Err(HeadError::Malformed),
    };
    if len > max_header_bytes {
        return Err(HeadError::TooLarge);
    }

    let method = req.method.ok_or(HeadError::Malformed)?.to_string();
    let target = req.path.ok_or(HeadError::Malformed)?.to_string();
    let version = match req.version {
        Some(0) => HttpVersion::Http10,
        Some(1) => HttpVersion::Http11,
        _ => return Err(HeadError::Malformed),
    };

    let mut headers = Vec::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        if !super::is_valid_header_name(h.name.as_bytes()) || !super::is_valid_header_value(h.value) {
            return Err(HeadError::Malformed);
        }
        let value = std::str::from_utf8(h.value).map_err(|_| HeadError::Malformed)?;
        headers.push((h.name.to_ascii_lowercase(), value.trim().to_string()));
    }

    Ok(Some((ParsedHead { method, target, version, headers }, len)))
}

fn body_kind(headers: &[(String, String)], version: HttpVersion) -> Result<BodyKind, &'static str> {
    let transfer_encoding = headers.iter().find(|(n, _)| n == "transfer-encoding");
    let mut lengths = headers.iter().filter(|(n, _)| n == "content-length");

    if let Some((_, te)) = transfer_encoding {
        if lengths.next().is_some() {
            return Err("both Transfer-Encoding and Content-Length");
        }
        if version == HttpVersion::Http10 {
            return Err("Transfer-Encoding in HTTP/1.0 request");
        }
        if !is_chunked_encoding(te.as_bytes()) {
            return Err(NOT_IMPLEMENTED);
        }
        return Ok(BodyKind::Chunked(ChunkedDecoder::new()));
    }

    let mut content_length: Option<u64> = None;
    for (_, value) in lengths {
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err("invalid Content-Length");
        }
        let len: u64 = value.parse().map_err(|_| "invalid Content-Length")?;
        match content_length {
            Some(prev) if prev != len => return Err("conflicting Content-Length"),
            _ => content_length = Some(len),
        }
    }

    Ok(match content_length {
        None | Some(0) => BodyKind::None,
        Some(len) => BodyKind::Length(len),
    })
}

fn connection_has_token(headers: &[(String, String)], token: &str) -> bool {
    headers
        .iter()
        .filter(|(n, _)| n == "connection")
        .flat_map(|(_, v)| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_parse_head() {
        let buf = b"POST /a?b=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 3\r\n\r\nabc";
        let (head, len) = match parse_head(buf, 1024) {
            Ok(Some(parsed)) => parsed,
            _ => panic!("expected complete head"),
        };
        assert_eq!(head.method, "POST");
        assert_eq!(head.target, "/a?b=1");
        assert_eq!(head.version, HttpVersion::Http11);
        assert_eq!(head.headers[0], ("host".to_string(), "example.com".to_string()));
        assert_eq!(&buf[len..], b"abc");
    }

    #[test]
    fn test_parse_head_limits() {
        assert!(matches!(parse_head(b"GET / HTTP/1.1\r\nHost: a\r\n", 1024), Ok(None)));
        let long = format!("GET / HTTP/1.1\r\nX-Long: {}\r\n", "a".repeat(100));
        assert!(matches!(parse_head(long.as_bytes(), 64), Err(HeadError::TooLarge)));
        assert!(matches!(parse_head(b"GET / HTTP/1.1\r\nbad header\r\n\r\n", 1024), Err(HeadError::Malformed)));
    }

    #[test]
    fn test_body_kind() {
        assert!(matches!(body_kind(&headers(&[]), HttpVersion::Http11), Ok(BodyKind::None)));
        assert!(matches!(
            body_kind(&headers(&[("content-length", "12")]), HttpVersion::Http11),
            Ok(BodyKind::Length(12))
        ));
        assert!(matches!(
            body_kind(&headers(&[("content-length", "12"), ("content-length", "12")]), HttpVersion::Http11),
            Ok(BodyKind::Length(12))
        ));
        assert!(body_kind(&headers(&[("content-length", "12"), ("content-length", "13")]), HttpVersion::Http11).is_err());
        assert!(body_kind(&headers(&[("content-length", "-1")]), HttpVersion::Http11).is_err());
        assert!(matches!(
            body_kind(&headers(&[("transfer-encoding", "chunked")]), HttpVersion::Http11),
            Ok(BodyKind::Chunked(_))
        ));
        assert!(body_kind(
            &headers(&[("transfer-encoding", "chunked"), ("content-length", "3")]),
            HttpVersion::Http11
        )
        .is_err());
        assert_eq!(
            body_kind(&headers(&[("transfer-encoding", "gzip")]), HttpVersion::Http11).err(),
            Some(NOT_IMPLEMENTED)
        );
    }

    #[test]
    fn test_connection_tokens() {
        let h = headers(&[("connection", "Keep-Alive, Upgrade")]);
        assert!(connection_has_token(&h, "keep-alive"));
        assert!(connection_has_token(&h, "upgrade"));
        assert!(!connection_has_token(&h, "close"));
    }
}
