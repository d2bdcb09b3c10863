//! # プリフェースによるプロトコル判定

use std::rc::Rc;

use crate::config::{Config, ServerLimits};
use crate::http::Application;
use crate::http1::Http1Connection;
use crate::http2::settings::defaults::CONNECTION_PREFACE;
use crate::http2::{Http2Connection, Http2Settings};
use crate::timeout::{Heartbeat, ProcessDebugger};
use crate::transport::{buf_put, TransportRead, TransportWrite};

/// サポートする HTTP プロトコル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpProtocol {
    /// HTTP/1.1
    Http1_1,
    /// HTTP/2
    Http2,
}

impl std::fmt::Display for HttpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpProtocol::Http1_1 => write!(f, "HTTP/1.1"),
            HttpProtocol::Http2 => write!(f, "HTTP/2"),
        }
    }
}

/// コネクションごとに使う設定
#[derive(Debug, Clone, Default)]
pub struct ConnectionSettings {
    pub limits: ServerLimits,
    pub http2: Http2Settings,
}

impl ConnectionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            limits: config.limits.to_limits(),
            http2: config.http2.to_settings(),
        }
    }
}

/// 先頭のバイト列からプロトコルを判定
///
/// プリフェースの途中までしか届いていなければ `None`。
pub fn detect_protocol(buf: &[u8]) -> Option<HttpProtocol> {
    let n = buf.len().min(CONNECTION_PREFACE.len());
    if buf[..n] != CONNECTION_PREFACE[..n] {
        return Some(HttpProtocol::Http1_1);
    }
    if n == CONNECTION_PREFACE.len() {
        Some(HttpProtocol::Http2)
    } else {
        None
    }
}

/// 判定できるまで読み込む。判定前に EOF なら `None`
async fn read_until_detected<R: TransportRead>(reader: &mut R, buf: &mut Vec<u8>) -> Option<HttpProtocol> {
    loop {
        if !buf.is_empty() {
            if let Some(protocol) = detect_protocol(buf) {
                return Some(protocol);
            }
        }
        let (res, chunk) = reader.read(crate::transport::buf_get()).await;
        match res {
            Ok(0) | Err(_) => {
                buf_put(chunk);
                return None;
            }
            Ok(_) => {
                buf.extend_from_slice(&chunk);
                buf_put(chunk);
            }
        }
    }
}

/// 1 コネクションを判定したプロトコルで最後まで処理する
///
/// 判定中の読み込みは RequestHeaders タイムアウトで打ち切る。
pub async fn serve_connection<R, W, A>(
    mut reader: R,
    writer: W,
    app: Rc<A>,
    settings: &ConnectionSettings,
    heartbeat: Option<&Heartbeat>,
) where
    R: TransportRead,
    W: TransportWrite + 'static,
    A: Application,
{
    let mut buf = Vec::new();
    let detected = monoio::time::timeout(
        settings.limits.request_headers_timeout,
        read_until_detected(&mut reader, &mut buf),
    )
    .await;

    let protocol = match detected {
        Ok(Some(protocol)) => protocol,
        Ok(None) => return,
        Err(_) => {
            ftlog::debug!("[Protocol] Timed out before the first request bytes");
            return;
        }
    };
    ftlog::debug!("[Protocol] Detected {}", protocol);

    match protocol {
        HttpProtocol::Http2 => {
            let conn = Http2Connection::with_buffered(
                reader,
                Box::new(writer),
                app,
                settings.http2.clone(),
                settings.limits.clone(),
                ProcessDebugger,
                buf,
            );
            if let Some(heartbeat) = heartbeat {
                conn.register(heartbeat);
            }
            conn.run().await;
        }
        HttpProtocol::Http1_1 => {
            let conn = Http1Connection::with_buffered(
                reader,
                Box::new(writer),
                app,
                settings.limits.clone(),
                ProcessDebugger,
                buf,
            );
            if let Some(heartbeat) = heartbeat {
                conn.register(heartbeat);
            }
            conn.run().await;
        }
    }
}
