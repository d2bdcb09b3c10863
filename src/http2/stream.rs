//! # HTTP/2 ストリーム (RFC 7540 Section 5.1)
//!
//! ストリームの状態遷移、リクエストヘッダーの検証、
//! Content-Length と実際に受信した DATA の照合を行います。
//!
//! サーバープッシュは行わないので reserved 状態は持ちません。

use std::collections::HashMap;

use super::error::{Http2Error, Http2ErrorCode, Http2Result};
use super::flow_control::InputFlowControl;
use crate::http::{parse_target, AbortReason, AbortToken, BodySender, HttpVersion, Request, RequestTarget};
use crate::http1::{is_valid_header_name, is_valid_header_value};

/// HTTP/2 では受け付けないコネクション固有ヘッダー (Section 8.1.2.2)
const FORBIDDEN_HEADERS: &[&[u8]] = &[b"connection", b"keep-alive", b"proxy-connection", b"transfer-encoding", b"upgrade"];

/// ストリーム状態 (サーバー側)
///
/// ```text
///                          +--------+
///                  recv H  |        |
///               ,----------|  idle  |
///              /           |        |
///             v            +--------+
///      +----------+            |
///      |          |            | recv H + ES
///      |   open   |            |
///      |          |            v
///      +----------+      +----------+
///        |      |        |   half   |
///        |      |        |  closed  |
///        |      |        | (remote) |
///  send ES      recv ES  +----------+
///        |      |   ,---------'  |
///        v      v  v             | send ES /
///   +----------+ +--------+      | send R / recv R
///   |   half   | |        |<-----'
///   |  closed  | | closed |
///   | (local)  | |        |
///   +----------+ +--------+
///        |            ^
///        '------------'
///         recv ES / send R / recv R
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// アイドル状態
    Idle,
    /// オープン状態
    Open,
    /// ハーフクローズ (ローカル) - レスポンスを送り終えた
    HalfClosedLocal,
    /// ハーフクローズ (リモート) - リクエストを受け終えた
    HalfClosedRemote,
    /// クローズ状態
    Closed,
}

impl StreamState {
    /// DATA / トレーラーを受信できる状態か
    pub fn is_receiving(&self) -> bool {
        matches!(self, Self::Open | Self::HalfClosedLocal)
    }

    pub fn is_closed(&self) -> bool {
        *self == Self::Closed
    }
}

/// HTTP/2 ストリーム
pub struct Stream {
    id: u32,
    state: StreamState,
    abort: AbortToken,
    /// リクエストボディの書き込み側 (END_STREAM 付き HEADERS なら `None`)
    body: Option<BodySender>,
    /// ストリームの受信ウィンドウ
    input: InputFlowControl,
    /// 宣言された Content-Length
    expected_length: Option<u64>,
    /// 受信した DATA のバイト数 (パディングを除く)
    received: u64,
}

impl Stream {
    pub fn new(id: u32, receive_window: u32) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            abort: AbortToken::new(),
            body: None,
            input: InputFlowControl::new(receive_window),
            expected_length: None,
            received: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn abort_token(&self) -> &AbortToken {
        &self.abort
    }

    pub fn input(&mut self) -> &mut InputFlowControl {
        &mut self.input
    }

    pub fn body(&self) -> Option<&BodySender> {
        self.body.as_ref()
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// リクエストヘッダーを受信してストリームを開く
    ///
    /// `end_stream` ならボディなし。Content-Length が 0 以外ならここで不足が確定する。
    pub fn open(&mut self, body: Option<BodySender>, expected_length: Option<u64>) -> Http2Result<()> {
        if self.state != StreamState::Idle {
            return Err(Http2Error::stream_closed(self.id));
        }
        self.expected_length = expected_length;
        match body {
            Some(body) => {
                self.body = Some(body);
                self.state = StreamState::Open;
            }
            None => {
                self.state = StreamState::HalfClosedRemote;
                if matches!(expected_length, Some(n) if n > 0) {
                    return Err(self.content_length_error("less data than declared length"));
                }
            }
        }
        Ok(())
    }

    /// DATA フレームのペイロードを受信
    pub fn recv_data(&mut self, data: Vec<u8>, end_stream: bool) -> Http2Result<()> {
        if !self.state.is_receiving() {
            return Err(Http2Error::stream_closed(self.id));
        }

        self.received += data.len() as u64;
        if let Some(expected) = self.expected_length {
            if self.received > expected {
                return Err(self.content_length_error("more data than declared length"));
            }
            if end_stream && self.received < expected {
                return Err(self.content_length_error("less data than declared length"));
            }
        }

        if let Some(body) = &self.body {
            body.push(data);
        }
        if end_stream {
            self.finish_body(Vec::new());
        }
        Ok(())
    }

    /// トレーラー (END_STREAM 付きの 2 つ目の HEADERS) を受信
    pub fn recv_trailers(&mut self, trailers: Vec<(String, String)>) -> Http2Result<()> {
        if !self.state.is_receiving() {
            return Err(Http2Error::stream_closed(self.id));
        }
        if let Some(expected) = self.expected_length {
            if self.received < expected {
                return Err(self.content_length_error("less data than declared length"));
            }
        }
        self.finish_body(trailers);
        Ok(())
    }

    fn finish_body(&mut self, trailers: Vec<(String, String)>) {
        if let Some(body) = &self.body {
            body.finish(trailers);
        }
        self.state = match self.state {
            StreamState::HalfClosedLocal => StreamState::Closed,
            _ => StreamState::HalfClosedRemote,
        };
    }

    /// レスポンスの END_STREAM を送信した
    pub fn send_end_stream(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            _ => StreamState::Closed,
        };
    }

    /// RST_STREAM の送受信や GOAWAY でストリームを閉じる
    ///
    /// 中断理由は最初の 1 つだけが観測される。
    pub fn reset(&mut self, reason: AbortReason) {
        self.state = StreamState::Closed;
        self.abort.abort(reason);
    }

    /// 読まれずに捨てられたバイト数を取り出す
    pub fn take_discarded(&self) -> usize {
        self.body.as_ref().map(|body| body.take_discarded()).unwrap_or(0)
    }

    fn content_length_error(&mut self, msg: &'static str) -> Http2Error {
        self.reset(AbortReason::ContentLength(msg.to_string()));
        Http2Error::stream_error(self.id, Http2ErrorCode::ProtocolError, msg)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("received", &self.received)
            .field("expected_length", &self.expected_length)
            .finish()
    }
}

/// ストリームの集合
///
/// 最大 ID を記録し、それ以下で見つからない ID は閉じたストリームとみなす。
#[derive(Debug, Default)]
pub struct StreamManager {
    streams: HashMap<u32, Stream>,
    /// 受け付けた最大のクライアントストリーム ID
    highest_stream_id: u32,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn highest_stream_id(&self) -> u32 {
        self.highest_stream_id
    }

    /// 新しいクライアントストリームを登録
    ///
    /// ID は奇数かつこれまでの最大 ID より大きくなければならない。
    pub fn accept(&mut self, stream_id: u32, receive_window: u32) -> Http2Result<&mut Stream> {
        if stream_id % 2 == 0 {
            return Err(Http2Error::protocol_error(format!(
                "HEADERS on even-numbered stream {}",
                stream_id
            )));
        }
        if stream_id <= self.highest_stream_id {
            return Err(Http2Error::protocol_error(format!(
                "stream id {} is not greater than {}",
                stream_id, self.highest_stream_id
            )));
        }
        self.highest_stream_id = stream_id;
        Ok(self.streams.entry(stream_id).or_insert_with(|| Stream::new(stream_id, receive_window)))
    }

    /// ID を消費するだけで登録しない (REFUSED_STREAM 用)
    pub fn skip(&mut self, stream_id: u32) {
        self.highest_stream_id = self.highest_stream_id.max(stream_id);
    }

    pub fn get(&self, stream_id: u32) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    pub fn get_mut(&mut self, stream_id: u32) -> Option<&mut Stream> {
        self.streams.get_mut(&stream_id)
    }

    pub fn remove(&mut self, stream_id: u32) -> Option<Stream> {
        self.streams.remove(&stream_id)
    }

    /// クライアントがまだ開いていない ID か
    pub fn is_idle(&self, stream_id: u32) -> bool {
        stream_id > self.highest_stream_id
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.streams.keys().copied().collect()
    }

    /// 全ストリームを閉じて中断する
    pub fn reset_all(&mut self, reason: AbortReason) -> Vec<Stream> {
        let mut streams: Vec<Stream> = self.streams.drain().map(|(_, s)| s).collect();
        for stream in &mut streams {
            stream.reset(reason.clone());
        }
        streams
    }
}

// ====================
// リクエストヘッダーの検証
// ====================

/// 検証済みのリクエストヘッダー
#[derive(Debug)]
pub struct RequestHead {
    pub request: Request,
    pub content_length: Option<u64>,
}

#[derive(Default)]
struct PseudoHeaders {
    method: Option<String>,
    scheme: Option<String>,
    authority: Option<String>,
    path: Option<String>,
}

fn malformed(stream_id: u32, msg: impl Into<String>) -> Http2Error {
    Http2Error::stream_error(stream_id, Http2ErrorCode::ProtocolError, msg)
}

fn set_once(slot: &mut Option<String>, value: &[u8], name: &str, stream_id: u32) -> Http2Result<()> {
    if slot.is_some() {
        return Err(malformed(stream_id, format!("duplicate {} pseudo-header", name)));
    }
    *slot = Some(String::from_utf8_lossy(value).into_owned());
    Ok(())
}

/// 通常ヘッダーを検証して `(名前, 値)` に変換
fn check_regular_header(stream_id: u32, name: &[u8], value: &[u8]) -> Http2Result<(String, String)> {
    if !is_valid_header_name(name) {
        return Err(malformed(stream_id, "invalid header name"));
    }
    if name.iter().any(|b| b.is_ascii_uppercase()) {
        return Err(malformed(stream_id, "uppercase header name"));
    }
    if FORBIDDEN_HEADERS.contains(&name) {
        return Err(malformed(
            stream_id,
            format!("connection-specific header '{}'", String::from_utf8_lossy(name)),
        ));
    }
    if name == b"te" && value != b"trailers" {
        return Err(malformed(stream_id, "TE header other than 'trailers'"));
    }
    if !is_valid_header_value(value) {
        return Err(malformed(stream_id, "invalid header value"));
    }
    Ok((
        String::from_utf8_lossy(name).into_owned(),
        String::from_utf8_lossy(value).into_owned(),
    ))
}

/// デコード済みヘッダーリストから [`Request`] を組み立てる (Section 8.1.2)
pub fn validate_request_headers(stream_id: u32, fields: Vec<(Vec<u8>, Vec<u8>)>) -> Http2Result<RequestHead> {
    let mut pseudo = PseudoHeaders::default();
    let mut headers: Vec<(String, String)> = Vec::with_capacity(fields.len());
    let mut cookies: Vec<String> = Vec::new();
    let mut regular_seen = false;

    for (name, value) in fields {
        if name.first() == Some(&b':') {
            if regular_seen {
                return Err(malformed(stream_id, "pseudo-header after regular header"));
            }
            match name.as_slice() {
                b":method" => set_once(&mut pseudo.method, &value, ":method", stream_id)?,
                b":scheme" => set_once(&mut pseudo.scheme, &value, ":scheme", stream_id)?,
                b":authority" => set_once(&mut pseudo.authority, &value, ":authority", stream_id)?,
                b":path" => set_once(&mut pseudo.path, &value, ":path", stream_id)?,
                other => {
                    return Err(malformed(
                        stream_id,
                        format!("unknown pseudo-header '{}'", String::from_utf8_lossy(other)),
                    ));
                }
            }
            continue;
        }

        regular_seen = true;
        let (name, value) = check_regular_header(stream_id, &name, &value)?;
        if name == "cookie" {
            // 分割された cookie は 1 つにまとめる (Section 8.1.2.5)
            cookies.push(value);
        } else {
            headers.push((name, value));
        }
    }
    if !cookies.is_empty() {
        headers.push(("cookie".to_string(), cookies.join("; ")));
    }

    let method = pseudo.method.ok_or_else(|| malformed(stream_id, "missing :method"))?;
    if method.is_empty() || !is_valid_header_name(method.as_bytes()) {
        return Err(malformed(stream_id, "invalid :method"));
    }

    // :authority と Host は一致しなければならない
    let mut hosts = headers.iter().filter(|(n, _)| n == "host").map(|(_, v)| v.as_str());
    let host = hosts.next().map(str::to_string);
    if hosts.next().is_some() {
        return Err(malformed(stream_id, "duplicate Host header"));
    }
    let authority = match (pseudo.authority, host) {
        (Some(authority), Some(host)) if authority != host => {
            return Err(malformed(stream_id, ":authority and Host header disagree"));
        }
        (Some(authority), _) => Some(authority),
        (None, host) => host,
    };

    let (scheme, target) = if method == "CONNECT" {
        if pseudo.scheme.is_some() || pseudo.path.is_some() {
            return Err(malformed(stream_id, "CONNECT request with :scheme or :path"));
        }
        let authority = authority.clone().ok_or_else(|| malformed(stream_id, "CONNECT request without :authority"))?;
        (
            String::new(),
            RequestTarget { path: String::new(), query_string: String::new(), raw_target: authority },
        )
    } else {
        let scheme = pseudo.scheme.ok_or_else(|| malformed(stream_id, "missing :scheme"))?;
        let path = pseudo.path.ok_or_else(|| malformed(stream_id, "missing :path"))?;
        if path.is_empty() {
            return Err(malformed(stream_id, "empty :path"));
        }
        let target = parse_target(&method, &path).map_err(|e| malformed(stream_id, e.to_string()))?;
        (scheme, target)
    };

    let mut content_length = None;
    for (_, value) in headers.iter().filter(|(n, _)| n == "content-length") {
        let len: u64 = value
            .trim()
            .parse()
            .map_err(|_| malformed(stream_id, format!("invalid content-length '{}'", value)))?;
        if content_length.is_some_and(|prev| prev != len) {
            return Err(malformed(stream_id, "conflicting content-length headers"));
        }
        content_length = Some(len);
    }

    Ok(RequestHead {
        request: Request {
            method,
            scheme,
            authority: authority.unwrap_or_default(),
            path: target.path,
            raw_target: target.raw_target,
            query_string: target.query_string,
            version: HttpVersion::Http2,
            headers,
        },
        content_length,
    })
}

/// トレーラーを検証
///
/// 擬似ヘッダーを含むトレーラーはコネクションエラー。
pub fn validate_trailers(stream_id: u32, fields: Vec<(Vec<u8>, Vec<u8>)>) -> Http2Result<Vec<(String, String)>> {
    let mut trailers = Vec::with_capacity(fields.len());
    for (name, value) in fields {
        if name.first() == Some(&b':') {
            return Err(Http2Error::protocol_error(format!(
                "trailers on stream {} contain a pseudo-header",
                stream_id
            )));
        }
        trailers.push(check_regular_header(stream_id, &name, &value)?);
    }
    Ok(trailers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::body_pipe;

    fn fields(list: &[(&str, &str)]) -> Vec<(Vec<u8>, Vec<u8>)> {
        list.iter().map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec())).collect()
    }

    fn get(path: &str) -> Vec<(Vec<u8>, Vec<u8>)> {
        fields(&[(":method", "GET"), (":scheme", "http"), (":authority", "localhost"), (":path", path)])
    }

    fn open_with_length(len: Option<u64>) -> (Stream, crate::http::RequestBody) {
        let mut stream = Stream::new(1, 65_535);
        let (sender, body) = body_pipe(1024, stream.abort_token().clone());
        stream.open(Some(sender), len).unwrap();
        (stream, body)
    }

    #[test]
    fn test_validate_basic_request() {
        let mut list = get("/a/b/../c?x=%20");
        list.extend(fields(&[("user-agent", "test"), ("cookie", "a=1"), ("cookie", "b=2")]));
        let head = validate_request_headers(1, list).unwrap();
        assert_eq!(head.request.method, "GET");
        assert_eq!(head.request.path, "/a/c");
        assert_eq!(head.request.query_string, "?x=%20");
        assert_eq!(head.request.authority, "localhost");
        assert_eq!(head.request.version, HttpVersion::Http2);
        assert_eq!(head.request.header("cookie"), Some("a=1; b=2"));
        assert_eq!(head.content_length, None);
    }

    #[test]
    fn test_options_asterisk() {
        let list = fields(&[(":method", "OPTIONS"), (":scheme", "http"), (":path", "*"), ("host", "h")]);
        let head = validate_request_headers(1, list).unwrap();
        assert_eq!(head.request.path, "");
        assert_eq!(head.request.raw_target, "*");
        assert_eq!(head.request.authority, "h");
    }

    #[test]
    fn test_connect_rules() {
        let ok = fields(&[(":method", "CONNECT"), (":authority", "example.com:443")]);
        let head = validate_request_headers(1, ok).unwrap();
        assert_eq!(head.request.raw_target, "example.com:443");

        let with_path = fields(&[(":method", "CONNECT"), (":authority", "a:1"), (":path", "/")]);
        assert!(validate_request_headers(1, with_path).is_err());
        let no_authority = fields(&[(":method", "CONNECT")]);
        assert!(validate_request_headers(1, no_authority).is_err());
    }

    #[test]
    fn test_malformed_requests_are_stream_errors() {
        let cases = vec![
            fields(&[(":method", "GET"), (":scheme", "http")]),
            fields(&[(":method", "GET"), (":method", "GET"), (":scheme", "http"), (":path", "/")]),
            fields(&[(":method", "GET"), (":scheme", "http"), (":path", "/"), (":status", "200")]),
            fields(&[(":method", "GET"), (":scheme", "http"), ("x", "1"), (":path", "/")]),
            [get("/"), fields(&[("Upper", "1")])].concat(),
            [get("/"), fields(&[("connection", "keep-alive")])].concat(),
            [get("/"), fields(&[("te", "gzip")])].concat(),
            [get("/"), fields(&[("host", "other")])].concat(),
            [get("/"), fields(&[("content-length", "abc")])].concat(),
            get("no-slash"),
        ];
        for (i, list) in cases.into_iter().enumerate() {
            let err = validate_request_headers(3, list).unwrap_err();
            assert_eq!(err.rst_stream_id(), Some(3), "case {}", i);
            assert_eq!(err.error_code(), Http2ErrorCode::ProtocolError, "case {}", i);
        }

        // TE: trailers は許可
        assert!(validate_request_headers(1, [get("/"), fields(&[("te", "trailers")])].concat()).is_ok());
    }

    #[test]
    fn test_trailers_reject_pseudo_headers() {
        let trailers = validate_trailers(1, fields(&[("grpc-status", "0")])).unwrap();
        assert_eq!(trailers, vec![("grpc-status".to_string(), "0".to_string())]);

        let err = validate_trailers(1, fields(&[(":path", "/")])).unwrap_err();
        assert!(err.should_goaway());
    }

    #[test]
    fn test_content_length_exact() {
        let (mut stream, body) = open_with_length(Some(12));
        stream.recv_data(b"hello ".to_vec(), false).unwrap();
        stream.recv_data(b"world!".to_vec(), true).unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
        assert!(!stream.abort_token().is_aborted());
        drop(body);
    }

    #[test]
    fn test_content_length_too_little() {
        let (mut stream, _body) = open_with_length(Some(12));
        stream.recv_data(b"hello ".to_vec(), false).unwrap();
        let err = stream.recv_data(b"world".to_vec(), true).unwrap_err();
        assert_eq!(err.rst_stream_id(), Some(1));
        assert_eq!(
            stream.abort_token().reason(),
            Some(AbortReason::ContentLength("less data than declared length".into()))
        );
        assert!(stream.state().is_closed());
    }

    #[test]
    fn test_content_length_too_much() {
        let (mut stream, _body) = open_with_length(Some(12));
        let err = stream.recv_data(b"hello world!!".to_vec(), false).unwrap_err();
        assert_eq!(err.error_code(), Http2ErrorCode::ProtocolError);
        assert_eq!(
            stream.abort_token().reason(),
            Some(AbortReason::ContentLength("more data than declared length".into()))
        );
    }

    #[test]
    fn test_end_stream_on_headers_with_declared_length() {
        let mut stream = Stream::new(1, 65_535);
        assert!(stream.open(None, Some(5)).is_err());
        let mut stream = Stream::new(3, 65_535);
        stream.open(None, Some(0)).unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
    }

    #[test]
    fn test_state_transitions() {
        let (mut stream, _body) = open_with_length(None);
        assert_eq!(stream.state(), StreamState::Open);
        stream.send_end_stream();
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
        stream.recv_trailers(vec![("x-sum".into(), "1".into())]).unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.recv_data(b"x".to_vec(), false).is_err());
    }

    #[test]
    fn test_manager_ids() {
        let mut manager = StreamManager::new();
        assert!(manager.accept(2, 100).is_err());
        manager.accept(3, 100).unwrap();
        assert!(manager.accept(1, 100).unwrap_err().should_goaway());
        assert!(manager.is_idle(5));
        manager.skip(7);
        assert!(!manager.is_idle(5));
        assert_eq!(manager.highest_stream_id(), 7);

        let streams = manager.reset_all(AbortReason::GoAway);
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].abort_token().reason(), Some(AbortReason::GoAway));
        assert!(manager.is_empty());
    }
}
