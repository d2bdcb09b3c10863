//! # プロトコル判定
//!
//! 平文 TCP 上で HTTP/1.1 と HTTP/2 (prior knowledge) を切り替えます。
//! 最初のバイト列が HTTP/2 のコネクションプリフェースに一致すれば HTTP/2、
//! そうでなければ HTTP/1.1 として処理します。

pub mod detect;

pub use detect::{detect_protocol, serve_connection, ConnectionSettings, HttpProtocol};
