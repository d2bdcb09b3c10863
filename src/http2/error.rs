//! # HTTP/2 エラー
//!
//! エラーはスコープで分かれる。コネクションエラーは GOAWAY を送って閉じ、
//! ストリームエラーは RST_STREAM を送ってコネクションを続ける。

use std::fmt;
use std::io;

use crate::http::AbortReason;
use crate::http2::hpack::HpackError;

/// RST_STREAM / GOAWAY のエラーコード (RFC 7540 Section 7)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Http2ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

/// ワイヤ上の値の順に並べたコードと名前
const CODES: [(Http2ErrorCode, &str); 14] = [
    (Http2ErrorCode::NoError, "NO_ERROR"),
    (Http2ErrorCode::ProtocolError, "PROTOCOL_ERROR"),
    (Http2ErrorCode::InternalError, "INTERNAL_ERROR"),
    (Http2ErrorCode::FlowControlError, "FLOW_CONTROL_ERROR"),
    (Http2ErrorCode::SettingsTimeout, "SETTINGS_TIMEOUT"),
    (Http2ErrorCode::StreamClosed, "STREAM_CLOSED"),
    (Http2ErrorCode::FrameSizeError, "FRAME_SIZE_ERROR"),
    (Http2ErrorCode::RefusedStream, "REFUSED_STREAM"),
    (Http2ErrorCode::Cancel, "CANCEL"),
    (Http2ErrorCode::CompressionError, "COMPRESSION_ERROR"),
    (Http2ErrorCode::ConnectError, "CONNECT_ERROR"),
    (Http2ErrorCode::EnhanceYourCalm, "ENHANCE_YOUR_CALM"),
    (Http2ErrorCode::InadequateSecurity, "INADEQUATE_SECURITY"),
    (Http2ErrorCode::Http11Required, "HTTP_1_1_REQUIRED"),
];

impl Http2ErrorCode {
    /// 受信したコード。未知の値は INTERNAL_ERROR と同じに扱う (Section 7)
    pub fn from_u32(code: u32) -> Self {
        CODES
            .get(code as usize)
            .map(|(code, _)| *code)
            .unwrap_or(Self::InternalError)
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        CODES[self as usize].1
    }
}

impl fmt::Display for Http2ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP/2 処理のエラー
#[derive(Debug)]
pub enum Http2Error {
    /// GOAWAY を送って閉じる
    ConnectionError(Http2ErrorCode, String),
    /// RST_STREAM を送ってストリームだけ閉じる
    StreamError(u32, Http2ErrorCode, String),
    Io(io::Error),
    InvalidPreface,
    /// ピアが接続を閉じた
    ConnectionClosed,
    Aborted(AbortReason),
}

impl fmt::Display for Http2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionError(code, msg) => write!(f, "Connection error {}: {}", code, msg),
            Self::StreamError(stream_id, code, msg) => {
                write!(f, "Stream {} error {}: {}", stream_id, code, msg)
            }
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::InvalidPreface => f.write_str("Invalid connection preface"),
            Self::ConnectionClosed => f.write_str("Connection closed"),
            Self::Aborted(reason) => write!(f, "Aborted: {}", reason),
        }
    }
}

impl std::error::Error for Http2Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Http2Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<HpackError> for Http2Error {
    /// デコーダの動的テーブルが壊れるので常にコネクションエラー
    fn from(e: HpackError) -> Self {
        Self::ConnectionError(Http2ErrorCode::CompressionError, e.to_string())
    }
}

impl From<AbortReason> for Http2Error {
    fn from(reason: AbortReason) -> Self {
        Self::Aborted(reason)
    }
}

impl Http2Error {
    pub fn connection_error<S: Into<String>>(code: Http2ErrorCode, msg: S) -> Self {
        Self::ConnectionError(code, msg.into())
    }

    pub fn stream_error<S: Into<String>>(stream_id: u32, code: Http2ErrorCode, msg: S) -> Self {
        Self::StreamError(stream_id, code, msg.into())
    }

    pub fn protocol_error<S: Into<String>>(msg: S) -> Self {
        Self::connection_error(Http2ErrorCode::ProtocolError, msg)
    }

    pub fn frame_size_error<S: Into<String>>(msg: S) -> Self {
        Self::connection_error(Http2ErrorCode::FrameSizeError, msg)
    }

    pub fn flow_control_error<S: Into<String>>(msg: S) -> Self {
        Self::connection_error(Http2ErrorCode::FlowControlError, msg)
    }

    pub fn stream_closed(stream_id: u32) -> Self {
        Self::stream_error(stream_id, Http2ErrorCode::StreamClosed, format!("stream {} is closed", stream_id))
    }

    /// GOAWAY を送るべきか
    pub fn should_goaway(&self) -> bool {
        matches!(self, Self::ConnectionError(..) | Self::InvalidPreface)
    }

    /// RST_STREAM の宛先
    pub fn rst_stream_id(&self) -> Option<u32> {
        match self {
            Self::StreamError(id, _, _) => Some(*id),
            _ => None,
        }
    }

    pub fn error_code(&self) -> Http2ErrorCode {
        match self {
            Self::ConnectionError(code, _) | Self::StreamError(_, code, _) => *code,
            Self::Io(_) => Http2ErrorCode::InternalError,
            Self::InvalidPreface => Http2ErrorCode::ProtocolError,
            Self::ConnectionClosed => Http2ErrorCode::NoError,
            Self::Aborted(reason) => reason.error_code(),
        }
    }
}

pub type Http2Result<T> = Result<T, Http2Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_table_matches_wire_values() {
        for (i, (code, _)) in CODES.iter().enumerate() {
            assert_eq!(code.as_u32(), i as u32);
            assert_eq!(Http2ErrorCode::from_u32(i as u32), *code);
        }
        assert_eq!(Http2ErrorCode::from_u32(0xff), Http2ErrorCode::InternalError);
        assert_eq!(Http2ErrorCode::EnhanceYourCalm.to_string(), "ENHANCE_YOUR_CALM");
        assert_eq!(Http2ErrorCode::Http11Required.as_str(), "HTTP_1_1_REQUIRED");
    }

    #[test]
    fn test_scope_helpers() {
        let conn = Http2Error::protocol_error("bad");
        assert!(conn.should_goaway());
        assert_eq!(conn.rst_stream_id(), None);

        let stream = Http2Error::stream_closed(3);
        assert!(!stream.should_goaway());
        assert_eq!(stream.rst_stream_id(), Some(3));
        assert_eq!(stream.error_code(), Http2ErrorCode::StreamClosed);

        let closed = Http2Error::ConnectionClosed;
        assert!(!closed.should_goaway());
        assert_eq!(closed.error_code(), Http2ErrorCode::NoError);
    }

    #[test]
    fn test_hpack_error_is_compression_error() {
        let err: Http2Error = HpackError::IntegerOverflow.into();
        assert!(err.should_goaway());
        assert_eq!(err.error_code(), Http2ErrorCode::CompressionError);
    }
}
