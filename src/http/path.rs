//! # リクエストターゲットの正規化
//!
//! `:path` (HTTP/2) またはリクエスト行のターゲット (HTTP/1.1) を
//! パス部分とクエリ文字列に分け、パスのみパーセントデコードと
//! ドットセグメントの除去を行います。
//!
//! - `%2F` はデコードしない (セグメント境界を変えないため)
//! - `..` はルートより上には移動しない
//! - クエリ文字列は受信したまま渡す

use std::fmt;

/// 正規化済みのリクエストターゲット
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    /// デコード・正規化済みのパス (`OPTIONS *` では空)
    pub path: String,
    /// `?` を含むクエリ文字列 (無ければ空)
    pub query_string: String,
    /// 受信したままのターゲット
    pub raw_target: String,
}

/// ターゲットが不正
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTarget(pub String);

impl fmt::Display for InvalidTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "The request target is invalid: '{}'", self.0)
    }
}

impl std::error::Error for InvalidTarget {}

/// メソッドとターゲットから [`RequestTarget`] を作成
pub fn parse_target(method: &str, raw_target: &str) -> Result<RequestTarget, InvalidTarget> {
    if method == "OPTIONS" && raw_target == "*" {
        return Ok(RequestTarget {
            path: String::new(),
            query_string: String::new(),
            raw_target: raw_target.to_string(),
        });
    }

    let (path_part, query_string) = match raw_target.find('?') {
        Some(i) => (&raw_target[..i], &raw_target[i..]),
        None => (raw_target, ""),
    };

    if !path_part.starts_with('/') {
        return Err(InvalidTarget(raw_target.to_string()));
    }

    let decoded = decode_path(path_part.as_bytes());
    let normalized = remove_dot_segments(&decoded);
    let path = String::from_utf8(normalized).map_err(|_| InvalidTarget(raw_target.to_string()))?;

    Ok(RequestTarget {
        path,
        query_string: query_string.to_string(),
        raw_target: raw_target.to_string(),
    })
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// パーセントデコード
///
/// 不正なエスケープはそのまま残し、`%2F` はデコードしない。
pub fn decode_path(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'%' && i + 2 < input.len() {
            if let (Some(hi), Some(lo)) = (hex_value(input[i + 1]), hex_value(input[i + 2])) {
                let byte = (hi << 4) | lo;
                if byte != b'/' {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(input[i]);
        i += 1;
    }
    out
}

/// ドットセグメントの除去 (RFC 3986 Section 5.2.4)
///
/// 入力は `/` で始まること。`..` がルートを越える場合はルートに留まる。
pub fn remove_dot_segments(path: &[u8]) -> Vec<u8> {
    let mut segments: Vec<&[u8]> = Vec::new();
    // 先頭の '/' を除いたセグメント列。末尾が '/' なら最後は空セグメント
    let body = path.strip_prefix(b"/").unwrap_or(path);
    let parts: Vec<&[u8]> = body.split(|&b| b == b'/').collect();
    let last = parts.len().saturating_sub(1);

    for (i, segment) in parts.iter().enumerate() {
        match *segment {
            b"." => {
                // 末尾の "." はディレクトリを指すので空セグメントを残す
                if i == last {
                    segments.push(b"");
                }
            }
            b".." => {
                segments.pop();
                if i == last {
                    segments.push(b"");
                }
            }
            _ => segments.push(segment),
        }
    }

    let mut out = Vec::with_capacity(path.len());
    for segment in segments {
        out.push(b'/');
        out.extend_from_slice(segment);
    }
    if out.is_empty() {
        out.push(b'/');
    }
    out
}
