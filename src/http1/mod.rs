//! # HTTP/1.1 メッセージループ
//!
//! httparse でリクエストヘッダーを解析し、ボディを [`crate::http::RequestBody`] に流しながら
//! アプリケーションを呼び出します。タイムアウトとデータレートの判定は
//! HTTP/2 と同じ [`crate::timeout::TimeoutControl`] が行います。
//!
//! - `chunked`: Transfer-Encoding: chunked デコーダ
//! - `sink`: レスポンス出力 (Content-Length または chunked)
//! - `connection`: keep-alive ループ

pub mod chunked;
pub mod connection;
pub mod sink;

pub use chunked::{ChunkedDecoder, ChunkedError};
pub use connection::Http1Connection;
pub use sink::Http1Sink;

// ====================
// 固定エラーレスポンス
// ====================

pub(crate) static ERR_MSG_BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
pub(crate) static ERR_MSG_REQUEST_TIMEOUT: &[u8] =
    b"HTTP/1.1 408 Request Timeout\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
pub(crate) static ERR_MSG_PAYLOAD_TOO_LARGE: &[u8] =
    b"HTTP/1.1 413 Payload Too Large\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
pub(crate) static ERR_MSG_HEADERS_TOO_LARGE: &[u8] =
    b"HTTP/1.1 431 Request Header Fields Too Large\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
pub(crate) static ERR_MSG_NOT_IMPLEMENTED: &[u8] =
    b"HTTP/1.1 501 Not Implemented\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
pub(crate) static MSG_CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// ステータスコードの理由句
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

// ====================
// ヘッダー検証
// ====================

/// ヘッダー名が有効か検証（RFC 7230 token準拠）
///
/// token = 1*tchar
/// tchar = "!" / "#" / "$" / "%" / "&" / "'" / "*" / "+" / "-" / "." /
///         "^" / "_" / "`" / "|" / "~" / DIGIT / ALPHA
#[inline]
pub fn is_valid_header_name(name: &[u8]) -> bool {
    !name.is_empty()
        && name.iter().all(|&b| {
            matches!(b,
                b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
                b'^' | b'_' | b'`' | b'|' | b'~' |
                b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z'
            )
        })
}

/// ヘッダー値が有効か検証
///
/// CR・LF・NUL を含む値は拒否する。obs-fold も許容しない。
#[inline]
pub fn is_valid_header_value(value: &[u8]) -> bool {
    !value.iter().any(|&b| b == b'\r' || b == b'\n' || b == 0)
}

/// Transfer-Encoding の最後のコーディングが chunked か
///
/// chunked 以外が最後にある場合はボディ長を決められない。
#[inline]
pub fn is_chunked_encoding(value: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .last()
        .map(|part| trim_ows(part).eq_ignore_ascii_case(b"chunked"))
        .unwrap_or(false)
}

fn trim_ows(mut s: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = s {
        s = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = s {
        s = rest;
    }
    s
}
