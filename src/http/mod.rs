//! # プロトコル共通のリクエストモデル
//!
//! HTTP/1.1 と HTTP/2 のどちらから来たリクエストも、アプリケーションには
//! 同じ [`HttpContext`] として渡します。
//!
//! - `abort`: ストリーム中断シグナル
//! - `body`: リクエストボディパイプ
//! - `path`: リクエストターゲットの正規化
//! - `response`: レスポンス出力と Content-Length 検証

pub mod abort;
pub mod body;
pub mod path;
pub mod response;

use std::fmt;
use std::future::Future;

use time::OffsetDateTime;

use crate::http2::Http2ErrorCode;
use crate::timeout::TimeoutReason;

pub use abort::AbortToken;
pub use body::{body_pipe, BodyFlowControl, BodySender, RequestBody};
pub use path::{parse_target, InvalidTarget, RequestTarget};
pub use response::{ResponseSink, ResponseWriter};

// ====================
// 中断理由
// ====================

/// ストリームが中断された理由
///
/// どこから中断されても (RST_STREAM、GOAWAY、タイムアウト、アプリケーション)
/// 全ての観測者はこの値を 1 つだけ受け取る。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// ストリームがリセットされた (受信または送信した RST_STREAM)
    Reset(Http2ErrorCode),
    /// GOAWAY によってストリームが打ち切られた
    GoAway,
    /// コネクションが閉じられた
    ConnectionAborted(String),
    /// リクエストボディが Content-Length と一致しない
    ContentLength(String),
    /// タイムアウト
    Timeout(TimeoutReason),
    /// アプリケーションが中断した
    Application,
}

impl AbortReason {
    /// RST_STREAM で送るエラーコード
    pub fn error_code(&self) -> Http2ErrorCode {
        match self {
            Self::Reset(code) => *code,
            Self::GoAway => Http2ErrorCode::Cancel,
            Self::ContentLength(_) => Http2ErrorCode::ProtocolError,
            Self::ConnectionAborted(_) | Self::Timeout(_) | Self::Application => {
                Http2ErrorCode::InternalError
            }
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reset(code) => write!(f, "The HTTP/2 stream was reset ({})", code),
            Self::GoAway => f.write_str("The HTTP/2 connection faulted (GOAWAY)"),
            Self::ConnectionAborted(msg) => write!(f, "The connection was aborted: {}", msg),
            Self::ContentLength(msg) => write!(f, "Content-Length mismatch: {}", msg),
            Self::Timeout(reason) => write!(f, "{}", reason),
            Self::Application => f.write_str("The request was aborted by the application"),
        }
    }
}

impl std::error::Error for AbortReason {}

// ====================
// アプリケーションエラー
// ====================

/// アプリケーションのエラー
#[derive(Debug)]
pub struct AppError(pub Box<dyn std::error::Error>);

impl AppError {
    pub fn msg(msg: impl Into<String>) -> Self {
        let msg: String = msg.into();
        Self(msg.into())
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        Self(Box::new(e))
    }
}

impl From<AbortReason> for AppError {
    fn from(e: AbortReason) -> Self {
        Self(Box::new(e))
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        Self::msg(msg)
    }
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        Self::msg(msg)
    }
}

// ====================
// リクエスト
// ====================

/// HTTP バージョン
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
    Http2,
}

impl HttpVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
            Self::Http2 => "HTTP/2",
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// デコード済みのリクエストヘッダー部
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// HTTP/1.1 では常に `http`
    pub scheme: String,
    /// `:authority` または Host ヘッダー
    pub authority: String,
    /// 正規化済みパス
    pub path: String,
    /// 受信したままのターゲット
    pub raw_target: String,
    /// `?` を含むクエリ文字列
    pub query_string: String,
    pub version: HttpVersion,
    /// 通常ヘッダー (名前は小文字)
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// 最初に一致したヘッダー値 (名前は大文字小文字を区別しない)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Content-Length ヘッダー (不正な値は `None`)
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }
}

// ====================
// アプリケーション境界
// ====================

/// 1 リクエスト分のコンテキスト
pub struct HttpContext {
    pub request: Request,
    pub body: RequestBody,
    pub response: ResponseWriter,
    abort: AbortToken,
}

impl HttpContext {
    pub fn new(request: Request, body: RequestBody, response: ResponseWriter, abort: AbortToken) -> Self {
        Self { request, body, response, abort }
    }

    /// リクエストを中断する (HTTP/2 では RST_STREAM、HTTP/1.1 では切断)
    pub fn abort(&self) {
        self.abort.abort(AbortReason::Application);
    }

    /// 中断シグナル
    pub fn abort_token(&self) -> &AbortToken {
        &self.abort
    }

    /// ボディとレスポンスを破棄してリクエストだけを取り出す
    pub fn into_request(self) -> Request {
        self.request
    }
}

/// リクエストを処理するアプリケーション
///
/// HTTP/2 ではストリームごと、HTTP/1.1 ではメッセージごとに 1 回呼ばれる。
/// ストリームごとに別の monoio タスクで動くので、遅いハンドラが同じ
/// コネクション上の他のストリームを止めることはない。
pub trait Application: 'static {
    fn handle(&self, ctx: &mut HttpContext) -> impl Future<Output = Result<(), AppError>>;
}

// ====================
// ロギング
// ====================

/// アクセスログを出力
pub fn log_access(request: &Request, req_body_size: u64, status: u16, resp_body_size: u64, start_time: OffsetDateTime) {
    let end_time = OffsetDateTime::now_utc();
    let duration_ms = (end_time - start_time).whole_milliseconds();
    let ua = request.header("user-agent").unwrap_or("-");

    ftlog::info!(
        "Access: time={} duration={}ms proto={} method={} path={} ua={} req_body_size={} status={} resp_body_size={}",
        start_time, duration_ms, request.version, request.method, request.raw_target, ua,
        req_body_size, status, resp_body_size
    );
}
